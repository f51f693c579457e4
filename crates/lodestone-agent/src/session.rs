use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: &'static str,
        status: String,
        stderr: String,
    },
    #[error("session {0} does not exist")]
    Missing(String),
}

/// Detachable terminal session hosting the game server.
#[async_trait]
pub trait SessionDriver: Send + Sync + 'static {
    /// Launch `command` in a new detached session rooted at `cwd`.
    async fn create(&self, command: &str, cwd: &Path) -> Result<(), SessionError>;

    /// Type `text` followed by a carriage return into the session.
    async fn send(&self, text: &str) -> Result<(), SessionError>;

    async fn exists(&self) -> Result<bool, SessionError>;
}

/// Probe that never fails: errors and timeouts both count as "not found".
pub async fn probe(driver: &dyn SessionDriver, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, driver.exists()).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "session probe failed");
            false
        }
        Err(_) => {
            tracing::debug!(timeout_ms = timeout.as_millis() as u64, "session probe timed out");
            false
        }
    }
}

/// GNU `screen` backed driver.
#[derive(Debug, Clone)]
pub struct ScreenSession {
    name: String,
}

impl ScreenSession {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

async fn run_screen(cmd: &mut Command) -> Result<std::process::Output, SessionError> {
    cmd.kill_on_drop(true)
        .output()
        .await
        .map_err(|source| SessionError::Spawn {
            program: "screen",
            source,
        })
}

fn check_status(out: &std::process::Output) -> Result<(), SessionError> {
    if out.status.success() {
        return Ok(());
    }
    Err(SessionError::Failed {
        program: "screen",
        status: out.status.to_string(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}

#[async_trait]
impl SessionDriver for ScreenSession {
    async fn create(&self, command: &str, cwd: &Path) -> Result<(), SessionError> {
        let out = run_screen(
            Command::new("screen")
                .arg("-dmS")
                .arg(&self.name)
                .arg("bash")
                .arg("-c")
                .arg(command)
                .current_dir(cwd),
        )
        .await?;
        check_status(&out)
    }

    async fn send(&self, text: &str) -> Result<(), SessionError> {
        let out = run_screen(
            Command::new("screen")
                .arg("-S")
                .arg(&self.name)
                .arg("-p")
                .arg("0")
                .arg("-X")
                .arg("stuff")
                .arg(format!("{text}\r")),
        )
        .await?;
        if out.status.success() {
            return Ok(());
        }
        // screen reports an unknown session as "No screen session found."
        let combined = String::from_utf8_lossy(&out.stdout).to_string()
            + &String::from_utf8_lossy(&out.stderr);
        if combined.contains("No screen session found") {
            return Err(SessionError::Missing(self.name.clone()));
        }
        check_status(&out)
    }

    async fn exists(&self) -> Result<bool, SessionError> {
        // `screen -list` exits non-zero when nothing is listed, so only spawn errors matter.
        let out = run_screen(Command::new("screen").arg("-list")).await?;
        let listing = String::from_utf8_lossy(&out.stdout);
        Ok(listing_contains(&listing, &self.name))
    }
}

/// Match `<pid>.<name>` entries exactly, ignoring dead sessions.
pub fn listing_contains(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| {
        let line = line.trim();
        let Some(entry) = line.split_whitespace().next() else {
            return false;
        };
        let Some((pid, session)) = entry.split_once('.') else {
            return false;
        };
        !pid.is_empty()
            && pid.chars().all(|c| c.is_ascii_digit())
            && session == name
            && !line.contains("(Dead")
    })
}

#[derive(Debug, Default)]
struct MemoryState {
    exists: bool,
    created: Vec<(String, PathBuf)>,
    sent: Vec<String>,
    fail_create: Option<String>,
    fail_probe: bool,
    create_delay: Duration,
}

/// In-memory driver for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_exists(&self, exists: bool) {
        self.with_state(|s| s.exists = exists);
    }

    pub fn fail_create(&self, reason: Option<&str>) {
        self.with_state(|s| s.fail_create = reason.map(str::to_string));
    }

    /// Keep `create` pending this long after the session already exists.
    pub fn delay_create(&self, delay: Duration) {
        self.with_state(|s| s.create_delay = delay);
    }

    pub fn fail_probe(&self, fail: bool) {
        self.with_state(|s| s.fail_probe = fail);
    }

    pub fn created(&self) -> Vec<(String, PathBuf)> {
        self.with_state(|s| s.created.clone())
    }

    pub fn sent(&self) -> Vec<String> {
        self.with_state(|s| s.sent.clone())
    }
}

#[async_trait]
impl SessionDriver for MemorySession {
    async fn create(&self, command: &str, cwd: &Path) -> Result<(), SessionError> {
        let delay = self.with_state(|s| {
            if let Some(reason) = &s.fail_create {
                return Err(SessionError::Failed {
                    program: "screen",
                    status: "exit status: 1".to_string(),
                    stderr: reason.clone(),
                });
            }
            s.created.push((command.to_string(), cwd.to_path_buf()));
            s.exists = true;
            Ok(s.create_delay)
        })?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<(), SessionError> {
        self.with_state(|s| {
            if !s.exists {
                return Err(SessionError::Missing("memory".to_string()));
            }
            s.sent.push(text.to_string());
            Ok(())
        })
    }

    async fn exists(&self) -> Result<bool, SessionError> {
        self.with_state(|s| {
            if s.fail_probe {
                return Err(SessionError::Spawn {
                    program: "screen",
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "screen not installed"),
                });
            }
            Ok(s.exists)
        })
    }
}
