use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_SESSION_NAME: &str = "mc_server_session";
const DEFAULT_SERVER_JAR: &str = "server.jar";
const DEFAULT_MIN_RAM: &str = "2G";
const DEFAULT_MAX_RAM: &str = "6G";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_HISTORY_FILE: &str = "server_history.log";
const DEFAULT_HISTORY_MAX_LINES: usize = 500;

pub(crate) fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_bool(name: &str) -> Option<bool> {
    let v = env_string(name)?.to_ascii_lowercase();
    match v.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_millis(name: &str, min: u64, max: u64, default: u64) -> Duration {
    Duration::from_millis(env_u64(name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

/// Runtime settings for the supervisor, read from `LODESTONE_*` variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_dir: PathBuf,
    pub session_name: String,
    pub server_jar: String,
    pub min_ram: String,
    pub max_ram: String,
    /// Lowercase hex SHA-256 of the observer password.
    pub password_sha256: String,
    pub listen_addr: SocketAddr,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub roster_sync_interval: Duration,
    /// Delay between attaching to a session and the first roster query.
    pub attach_query_delay: Duration,
    /// Delay between a confirmed launch and the confirmation probe.
    pub launch_confirm_delay: Duration,
    pub rule_readback_delay: Duration,
    pub list_refresh_delay: Duration,
    pub list_debounce: Duration,
    pub usage_interval: Duration,
    pub tail_poll_interval: Duration,
    pub history_max_lines: usize,
    pub history_file: PathBuf,
    pub auto_start: bool,
    /// `host[:port]` used in resource pack URLs instead of the one the observer sent.
    pub public_host: Option<String>,
}

impl AgentConfig {
    /// Defaults for a server living in `server_dir`. The password digest is left empty.
    pub fn for_dir(server_dir: impl Into<PathBuf>) -> Self {
        let server_dir = server_dir.into();
        let history_file = server_dir.join(DEFAULT_HISTORY_FILE);
        Self {
            server_dir,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            server_jar: DEFAULT_SERVER_JAR.to_string(),
            min_ram: DEFAULT_MIN_RAM.to_string(),
            max_ram: DEFAULT_MAX_RAM.to_string(),
            password_sha256: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            probe_interval: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(5),
            roster_sync_interval: Duration::from_secs(60),
            attach_query_delay: Duration::from_secs(1),
            launch_confirm_delay: Duration::from_secs(1),
            rule_readback_delay: Duration::from_millis(500),
            list_refresh_delay: Duration::from_secs(1),
            list_debounce: Duration::from_secs(5),
            usage_interval: Duration::from_secs(10),
            tail_poll_interval: Duration::from_millis(250),
            history_max_lines: DEFAULT_HISTORY_MAX_LINES,
            history_file,
            auto_start: true,
            public_host: None,
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let raw_dir = env_string("LODESTONE_SERVER_DIR").unwrap_or_else(|| ".".to_string());
        let mut cfg = Self::for_dir(absolute_dir(Path::new(&raw_dir)));

        if let Some(v) = env_string("LODESTONE_SESSION_NAME") {
            cfg.session_name = v;
        }
        if let Some(v) = env_string("LODESTONE_SERVER_JAR") {
            cfg.server_jar = v;
        }
        if let Some(v) = env_string("LODESTONE_MIN_RAM") {
            cfg.min_ram = v;
        }
        if let Some(v) = env_string("LODESTONE_MAX_RAM") {
            cfg.max_ram = v;
        }

        cfg.password_sha256 = env_string("LODESTONE_PASSWORD_SHA256")
            .map(|v| v.to_ascii_lowercase())
            .ok_or_else(|| anyhow::anyhow!("LODESTONE_PASSWORD_SHA256 is required"))?;

        let listen = env_string("LODESTONE_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        cfg.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid LODESTONE_LISTEN_ADDR: {listen}"))?;

        cfg.probe_interval = env_millis("LODESTONE_PROBE_INTERVAL_MS", 500, 60_000, 3000);
        cfg.roster_sync_interval =
            env_millis("LODESTONE_ROSTER_SYNC_INTERVAL_MS", 5000, 60 * 60 * 1000, 60_000);
        cfg.list_debounce = env_millis("LODESTONE_LIST_DEBOUNCE_MS", 100, 60_000, 5000);
        cfg.history_max_lines = env_usize("LODESTONE_HISTORY_MAX_LINES")
            .map(|v| v.clamp(50, 50_000))
            .unwrap_or(DEFAULT_HISTORY_MAX_LINES);
        if let Some(v) = env_string("LODESTONE_HISTORY_FILE") {
            let p = PathBuf::from(v);
            cfg.history_file = if p.is_absolute() { p } else { cfg.server_dir.join(p) };
        }
        cfg.auto_start = env_bool("LODESTONE_AUTO_START").unwrap_or(true);
        cfg.public_host = env_string("LODESTONE_PUBLIC_HOST");

        cfg.validate()?;
        Ok(cfg)
    }

    /// Launch parameters end up inside a `bash -c` string, so keep them boring.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_session_name(&self.session_name) {
            anyhow::bail!(
                "invalid session name {:?}: use letters, digits, '_' or '-'",
                self.session_name
            );
        }
        if !is_ram_size(&self.min_ram) {
            anyhow::bail!("invalid LODESTONE_MIN_RAM {:?} (expected e.g. 2G or 512M)", self.min_ram);
        }
        if !is_ram_size(&self.max_ram) {
            anyhow::bail!("invalid LODESTONE_MAX_RAM {:?} (expected e.g. 6G or 4096M)", self.max_ram);
        }
        if !is_jar_name(&self.server_jar) {
            anyhow::bail!("invalid LODESTONE_SERVER_JAR {:?}", self.server_jar);
        }
        if self.password_sha256.len() != 64
            || !self.password_sha256.chars().all(|c| c.is_ascii_hexdigit())
        {
            anyhow::bail!("LODESTONE_PASSWORD_SHA256 must be 64 hex characters");
        }
        Ok(())
    }

    /// The game server's own log, followed by the line source.
    pub fn server_log_path(&self) -> PathBuf {
        self.server_dir.join("logs").join("latest.log")
    }

    pub fn launch_command(&self) -> String {
        format!(
            "java -Xms{} -Xmx{} -jar {} nogui",
            self.min_ram, self.max_ram, self.server_jar
        )
    }
}

fn absolute_dir(p: &Path) -> PathBuf {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    // Best-effort canonicalization: the directory may not exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

fn is_session_name(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_ram_size(s: &str) -> bool {
    let digits = s.trim_end_matches(['K', 'k', 'M', 'm', 'G', 'g']);
    let suffix_len = s.len() - digits.len();
    !digits.is_empty() && suffix_len <= 1 && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_jar_name(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
}
