use std::{collections::VecDeque, path::PathBuf};

use lodestone_process::LogLine;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, oneshot},
};

const TAIL_CHUNK_BYTES: u64 = 64 * 1024;

/// Most recent lines, oldest first. Sequence numbers keep increasing across reseeds.
#[derive(Debug)]
pub struct HistoryBuffer {
    next_seq: u64,
    capacity: usize,
    lines: VecDeque<LogLine>,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            capacity: capacity.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn push(&mut self, text: impl Into<String>) -> LogLine {
        let line = LogLine::new(self.next_seq, text);
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
        line
    }

    /// Replace the contents with `texts` (keeping only the last `capacity`).
    pub fn reseed<I>(&mut self, texts: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.lines.clear();
        for text in texts {
            self.push(text);
        }
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }
}

fn split_tail(buf: &[u8], from_start: bool, max_lines: usize) -> Vec<String> {
    // Best-effort UTF-8: replace invalid sequences.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    // A window that does not start at offset 0 begins mid-line.
    if !from_start && !out.is_empty() {
        out.remove(0);
    }
    out.retain(|l| !l.is_empty());
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Last `max_lines` non-empty lines of `path`. A missing file reads as empty.
pub async fn read_tail(path: &std::path::Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let size = f.metadata().await?.len();
    if max_lines == 0 || size == 0 {
        return Ok(Vec::new());
    }

    let mut window = TAIL_CHUNK_BYTES.min(size);
    loop {
        let start = size - window;
        f.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; window as usize];
        f.read_exact(&mut buf).await?;

        let newlines = buf.iter().filter(|b| **b == b'\n').count();
        if start == 0 || newlines > max_lines {
            return Ok(split_tail(&buf, start == 0, max_lines));
        }
        window = (window * 2).min(size);
    }
}

enum WriterMsg {
    Line(String),
    Flush(oneshot::Sender<Durability>),
}

/// How much of what was appended is known to be in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Every append so far reached the file.
    Complete,
    /// Only the last `n` appends are known to be on disk.
    Since(u64),
}

impl Durability {
    /// Whether the file's last `lines` lines match the last `lines` appends.
    pub fn covers(self, lines: usize) -> bool {
        match self {
            Durability::Complete => true,
            Durability::Since(n) => n >= lines as u64,
        }
    }

    fn record(&mut self, ok: bool) {
        *self = match (*self, ok) {
            (_, false) => Durability::Since(0),
            (Durability::Since(n), true) => Durability::Since(n.saturating_add(1)),
            (Durability::Complete, true) => Durability::Complete,
        };
    }
}

/// Append-only durable copy of every line. Writes are fire-and-forget.
#[derive(Clone)]
pub struct DurableLog {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl DurableLog {
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterMsg>();
        tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;
            let mut durability = Durability::Complete;
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Line(mut line) => {
                        line.push('\n');
                        if file.is_none() {
                            file = open_append(&path).await;
                        }
                        let Some(f) = file.as_mut() else {
                            durability.record(false);
                            continue;
                        };
                        match f.write_all(line.as_bytes()).await {
                            Ok(()) => durability.record(true),
                            Err(e) => {
                                tracing::warn!(path = %path.display(), error = %e, "history append failed");
                                durability.record(false);
                                // Reopen on the next line.
                                file = None;
                            }
                        }
                    }
                    WriterMsg::Flush(ack) => {
                        if let Some(f) = file.as_mut()
                            && let Err(e) = f.flush().await
                        {
                            tracing::warn!(path = %path.display(), error = %e, "history flush failed");
                            durability.record(false);
                            file = None;
                        }
                        let _ = ack.send(durability);
                    }
                }
            }
        });
        Self { tx }
    }

    pub fn append(&self, line: impl Into<String>) {
        let _ = self.tx.send(WriterMsg::Line(line.into()));
    }

    /// Resolves once every line appended before this call has been written.
    pub async fn flush(&self) -> Durability {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(ack_tx)).is_err() {
            return Durability::Since(0);
        }
        ack_rx.await.unwrap_or(Durability::Since(0))
    }
}

async fn open_append(path: &std::path::Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to open history file");
            None
        }
    }
}
