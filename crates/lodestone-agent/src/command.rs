use lodestone_process::ListKind;

pub const STOP: &str = "stop";
pub const LIST: &str = "list";
pub const CLEAN_ITEMS: &str = "kill @e[type=item]";

const GAMEMODES: [&str; 4] = ["survival", "creative", "adventure", "spectator"];

/// Result of a fire-and-forget injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Sent,
    Rejected,
}

/// Strip control characters so one request is exactly one console line.
pub fn sanitize(text: &str) -> Option<String> {
    let cleaned: String = text.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

pub fn is_player_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_rule_token(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 64
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    Kick,
    Ban,
    Pardon,
    Op,
    Deop,
    WhitelistAdd,
    WhitelistRemove,
    ClearInventory,
}

impl PlayerAction {
    pub fn command(self, name: &str) -> Option<String> {
        if !is_player_name(name) {
            return None;
        }
        let verb = match self {
            PlayerAction::Kick => "kick",
            PlayerAction::Ban => "ban",
            PlayerAction::Pardon => "pardon",
            PlayerAction::Op => "op",
            PlayerAction::Deop => "deop",
            PlayerAction::WhitelistAdd => "whitelist add",
            PlayerAction::WhitelistRemove => "whitelist remove",
            PlayerAction::ClearInventory => "clear",
        };
        Some(format!("{verb} {name}"))
    }

    /// The list file the server rewrites after this action, if any.
    pub fn affected_list(self) -> Option<ListKind> {
        match self {
            PlayerAction::Ban | PlayerAction::Pardon => Some(ListKind::Banned),
            PlayerAction::Op | PlayerAction::Deop => Some(ListKind::Ops),
            PlayerAction::WhitelistAdd | PlayerAction::WhitelistRemove => Some(ListKind::Whitelist),
            PlayerAction::Kick | PlayerAction::ClearInventory => None,
        }
    }
}

pub fn gamemode(name: &str, mode: &str) -> Option<String> {
    let mode = mode.trim().to_ascii_lowercase();
    if !is_player_name(name) || !GAMEMODES.contains(&mode.as_str()) {
        return None;
    }
    Some(format!("gamemode {mode} {name}"))
}

pub fn rule_write(key: &str, value: &str) -> Option<String> {
    if !is_rule_token(key) || !is_rule_token(value) {
        return None;
    }
    Some(format!("gamerule {key} {value}"))
}

pub fn rule_read(key: &str) -> Option<String> {
    is_rule_token(key).then(|| format!("gamerule {key}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flattens_to_one_line() {
        assert_eq!(sanitize("  say hi\r\nstop ").as_deref(), Some("say histop"));
        assert_eq!(sanitize("\x1b\x07"), None);
        assert_eq!(sanitize("   "), None);
    }

    #[test]
    fn player_actions() {
        assert_eq!(PlayerAction::Ban.command("Steve").as_deref(), Some("ban Steve"));
        assert_eq!(
            PlayerAction::WhitelistAdd.command("Alex_2").as_deref(),
            Some("whitelist add Alex_2")
        );
        assert_eq!(PlayerAction::Kick.command("Steve; stop"), None);
        assert_eq!(PlayerAction::Op.affected_list(), Some(ListKind::Ops));
        assert_eq!(PlayerAction::Kick.affected_list(), None);
    }

    #[test]
    fn gamemode_validates_mode() {
        assert_eq!(gamemode("Steve", "Creative").as_deref(), Some("gamemode creative Steve"));
        assert_eq!(gamemode("Steve", "god"), None);
    }

    #[test]
    fn gamerule_builders() {
        assert_eq!(rule_write("keepInventory", "true").as_deref(), Some("gamerule keepInventory true"));
        assert_eq!(rule_read("randomTickSpeed").as_deref(), Some("gamerule randomTickSpeed"));
        assert_eq!(rule_write("keepInventory", "true stop"), None);
        assert_eq!(rule_read(""), None);
    }
}
