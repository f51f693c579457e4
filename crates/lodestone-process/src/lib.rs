use std::collections::BTreeMap;

use specta::Type;

/// Supervisor belief about the game server, confirmed by session probes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Stopped,
    Running,
}

impl ServerState {
    pub fn is_running(self) -> bool {
        matches!(self, ServerState::Running)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Plain,
    Warning,
    Error,
}

impl LogLevel {
    /// Substring heuristic; error markers win over warnings.
    pub fn classify(text: &str) -> Self {
        if text.contains("ERROR") || text.contains("Exception") {
            LogLevel::Error
        } else if text.contains("WARN") {
            LogLevel::Warning
        } else {
            LogLevel::Plain
        }
    }
}

/// A single line that flowed through the log pipeline. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct LogLine {
    pub seq: u64,
    pub text: String,
    pub level: LogLevel,
}

impl LogLine {
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        let text = text.into();
        let level = LogLevel::classify(&text);
        Self { seq, text, level }
    }
}

/// File-backed identity lists maintained by the game server itself.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
    Type,
)]
#[serde(rename_all = "kebab-case")]
pub enum ListKind {
    Ops,
    Banned,
    Whitelist,
    KnownPlayers,
}

impl ListKind {
    pub const ALL: [ListKind; 4] = [
        ListKind::Ops,
        ListKind::Banned,
        ListKind::Whitelist,
        ListKind::KnownPlayers,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            ListKind::Ops => "ops.json",
            ListKind::Banned => "banned-players.json",
            ListKind::Whitelist => "whitelist.json",
            ListKind::KnownPlayers => "usercache.json",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.file_name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ServerVersion {
    pub game_version: String,
    pub loader_type: String,
    pub loader_version: String,
}

impl Default for ServerVersion {
    fn default() -> Self {
        Self {
            game_version: "Unknown".to_string(),
            loader_type: "Vanilla".to_string(),
            loader_version: String::new(),
        }
    }
}

/// Host usage sample. Memory in GiB, network rates in KiB/s.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
pub struct SystemUsage {
    pub cpu_percent: f64,
    pub mem_used_gb: f64,
    pub mem_total_gb: f64,
    pub rx_kib_per_sec: f64,
    pub tx_kib_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct BackupReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_mb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A jar under `mods/`; disabled mods carry a `.disabled` extension instead of `.jar`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
pub struct ModEntry {
    pub name: String,
    pub enabled: bool,
    pub base_name: String,
}

/// Frames pushed to observers.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    LoginSuccess,
    LoginFail,
    StateChanged {
        state: ServerState,
    },
    LogLine {
        line: LogLine,
    },
    LogHistory {
        lines: Vec<LogLine>,
    },
    /// Marks the end of replayed history; everything after is live.
    Live,
    RosterChanged {
        players: Vec<String>,
    },
    RuleValue {
        key: String,
        value: String,
    },
    ExternalListChanged {
        list: ListKind,
        names: Vec<String>,
    },
    Chat {
        speaker: String,
        text: String,
        is_action: bool,
    },
    Whisper {
        from: String,
        to: String,
        text: String,
    },
    ServerVersion {
        version: ServerVersion,
    },
    ServerProperties {
        properties: BTreeMap<String, String>,
    },
    BackupFinished {
        report: BackupReport,
    },
    Usage {
        usage: SystemUsage,
    },
    ModsList {
        mods: Vec<ModEntry>,
    },
    ResourcePacksList {
        packs: Vec<String>,
    },
    Notice {
        message: String,
    },
}

/// Frames accepted from observers. Anything that fails to decode is ignored.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObserverCommand {
    Login { password: String },
    Start,
    Stop,
    SendCommand { command: String },
    QueryRules { keys: Vec<String> },
    SetRule { key: String, value: String },
    Kick { name: String },
    Ban { name: String },
    Pardon { name: String },
    Op { name: String },
    Deop { name: String },
    WhitelistAdd { name: String },
    WhitelistRemove { name: String },
    SetGamemode { name: String, mode: String },
    ClearInventory { name: String },
    CleanItems,
    Backup,
    GetProperties,
    UpdateProperty { key: String, value: String },
    GetMods,
    ToggleMod { name: String, enabled: bool },
    DeleteMod { name: String },
    GetResourcePacks,
    DeleteResourcePack { filename: String },
    /// `host` is used in the download URL unless a public host is configured.
    ApplyResourcePack { filename: String, host: String },
}
