use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    task::JoinHandle,
};

const MAX_READ_BYTES: usize = 1024 * 1024;
/// Unterminated output longer than this is emitted as a line of its own.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[cfg(unix)]
fn file_id(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_id(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Follows a log by name: survives truncation, replacement and late creation.
#[derive(Debug)]
pub struct Follower {
    path: PathBuf,
    offset: u64,
    file_id: Option<u64>,
    seen: bool,
    partial: Vec<u8>,
}

impl Follower {
    /// Start at the current end of `path`, so only lines written from now on are seen.
    pub async fn at_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (offset, file_id, seen) = match tokio::fs::metadata(&path).await {
            Ok(meta) => (meta.len(), file_id(&meta), true),
            Err(_) => (0, None, false),
        };
        Self {
            path,
            offset,
            file_id,
            seen,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Complete new lines since the last poll. Empty lines are skipped.
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let meta = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let id = file_id(&meta);
        let replaced = !self.seen || (id.is_some() && id != self.file_id);
        if replaced || meta.len() < self.offset {
            if self.seen {
                tracing::debug!(path = %self.path.display(), "log replaced or truncated; reading from start");
            }
            self.offset = 0;
            self.partial.clear();
        }
        self.seen = true;
        self.file_id = id;

        if meta.len() == self.offset {
            return Ok(Vec::new());
        }

        let mut f = tokio::fs::File::open(&self.path).await?;
        f.seek(SeekFrom::Start(self.offset)).await?;
        let want = ((meta.len() - self.offset) as usize).min(MAX_READ_BYTES);
        let mut buf = vec![0u8; want];
        let mut read = 0;
        while read < want {
            let n = f.read(&mut buf[read..]).await?;
            if n == 0 {
                break;
            }
            read += n;
        }
        buf.truncate(read);
        self.offset += read as u64;

        Ok(self.take_lines(&buf))
    }

    fn take_lines(&mut self, buf: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(buf);
        let mut complete = match self.partial.iter().rposition(|b| *b == b'\n') {
            Some(last_nl) => {
                let rest = self.partial.split_off(last_nl + 1);
                std::mem::replace(&mut self.partial, rest)
            }
            None => Vec::new(),
        };
        if self.partial.len() >= MAX_LINE_BYTES {
            complete.append(&mut self.partial);
            complete.push(b'\n');
        }

        String::from_utf8_lossy(&complete)
            .split('\n')
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Background task feeding followed lines to `emit` until stopped or `emit` returns false.
pub struct LineSource {
    handle: JoinHandle<()>,
}

impl LineSource {
    /// `follower` is positioned by the caller, so nothing written after that point is missed.
    pub fn spawn<F>(mut follower: Follower, interval: Duration, emit: F) -> Self
    where
        F: Fn(String) -> bool + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tracing::debug!(path = %follower.path().display(), offset = follower.offset(), "line source attached");
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let lines = match follower.poll().await {
                    Ok(lines) => lines,
                    Err(e) => {
                        tracing::warn!(path = %follower.path().display(), error = %e, "failed to read server log");
                        continue;
                    }
                };
                for line in lines {
                    if !emit(line) {
                        return;
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for LineSource {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
