use std::collections::BTreeSet;

use regex::{Captures, Regex};

/// Identity used for whispers the console itself sends.
pub const SERVER_IDENTITY: &str = "Server";

/// Log header: optional timestamp, then one or more bracketed tags and `: `.
/// Covers vanilla (`[12:00:00] [Server thread/INFO]: `), Forge
/// (`[..] [Server thread/INFO] [minecraft/DedicatedServer]: `) and Paper
/// (`[12:00:00 INFO]: `). Tags are contiguous from the start of the line so
/// player text can never supply its own header.
const HEADER: &str = r"^(?:\[?[^\[\]]*\] )?(?:\[[^\[\]]+\] ?)+: ";

/// Chat needs the main server thread tag; other threads never print chat.
const CHAT_HEADER: &str = r"^(?:\[?[^\[\]]*\] )?\[Server thread/INFO\]: (?:\[Not Secure\] )?";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
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
    Join(String),
    Leave(String),
    /// Authoritative list of connected players; may be empty.
    Roster(BTreeSet<String>),
    RuleValue {
        key: String,
        value: String,
    },
}

/// Rules in different categories all run; within a category the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Chat,
    Whisper,
    Presence,
    Roster,
    Rule,
}

pub type Builder = fn(&Captures<'_>) -> Option<LineEvent>;

#[derive(Debug, Clone)]
pub struct Rule {
    pub category: Category,
    pub pattern: Regex,
    pub build: Builder,
}

impl Rule {
    pub fn new(category: Category, pattern: &str, build: Builder) -> Result<Self, regex::Error> {
        Ok(Self {
            category,
            pattern: Regex::new(pattern)?,
            build,
        })
    }
}

fn cap(c: &Captures<'_>, i: usize) -> Option<String> {
    c.get(i).map(|m| m.as_str().trim_end().to_string())
}

fn chat(c: &Captures<'_>) -> Option<LineEvent> {
    Some(LineEvent::Chat {
        speaker: cap(c, 1)?,
        text: cap(c, 2)?,
        is_action: false,
    })
}

fn action(c: &Captures<'_>) -> Option<LineEvent> {
    Some(LineEvent::Chat {
        speaker: cap(c, 1)?,
        text: cap(c, 2)?,
        is_action: true,
    })
}

fn whisper(c: &Captures<'_>) -> Option<LineEvent> {
    Some(LineEvent::Whisper {
        from: cap(c, 1)?,
        to: cap(c, 2)?,
        text: cap(c, 3)?,
    })
}

fn whisper_from_console(c: &Captures<'_>) -> Option<LineEvent> {
    Some(LineEvent::Whisper {
        from: SERVER_IDENTITY.to_string(),
        to: cap(c, 1)?,
        text: cap(c, 2)?,
    })
}

fn join(c: &Captures<'_>) -> Option<LineEvent> {
    cap(c, 1).map(LineEvent::Join)
}

fn leave(c: &Captures<'_>) -> Option<LineEvent> {
    cap(c, 1).map(LineEvent::Leave)
}

fn roster(c: &Captures<'_>) -> Option<LineEvent> {
    let names = c.get(1).map(|m| m.as_str()).unwrap_or_default();
    Some(LineEvent::Roster(parse_roster_names(names)))
}

fn rule_value(c: &Captures<'_>) -> Option<LineEvent> {
    Some(LineEvent::RuleValue {
        key: cap(c, 1)?,
        value: cap(c, 2)?,
    })
}

/// `a, b,c` -> {a, b, c}; blank input -> {}.
pub fn parse_roster_names(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Extractor {
    rules: Vec<Rule>,
}

impl Extractor {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Rule set for vanilla-family servers and the common mod loaders.
    pub fn minecraft() -> Result<Self, regex::Error> {
        let rules = vec![
            Rule::new(Category::Chat, &format!(r"{CHAT_HEADER}<([^>]+)> (.*)$"), chat)?,
            Rule::new(Category::Chat, &format!(r"{CHAT_HEADER}\* (\w+) (.+)$"), action)?,
            Rule::new(
                Category::Whisper,
                &format!(r"{HEADER}(\w+) whispers to (\w+): (.+)$"),
                whisper,
            )?,
            Rule::new(
                Category::Whisper,
                &format!(r"{HEADER}\[(\w+) -> (\w+)\] (.+)$"),
                whisper,
            )?,
            Rule::new(
                Category::Whisper,
                &format!(r"{HEADER}You whispered to (\w+): (.+)$"),
                whisper_from_console,
            )?,
            Rule::new(Category::Presence, &format!(r"{HEADER}(\w+) joined the game\s*$"), join)?,
            Rule::new(Category::Presence, &format!(r"{HEADER}(\w+) left the game\s*$"), leave)?,
            Rule::new(
                Category::Roster,
                &format!(r"{HEADER}There are \d+ of a max (?:of )?\d+ players online:(.*)$"),
                roster,
            )?,
            Rule::new(
                Category::Rule,
                &format!(r"{HEADER}Gamerule ([\w.:-]+) is currently set to: (.*)$"),
                rule_value,
            )?,
        ];
        Ok(Self::new(rules))
    }

    /// Additional formats are appended after the built-in ones.
    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    /// Never fails; unmatched lines yield nothing.
    pub fn extract(&self, line: &str) -> Vec<LineEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut matched: Vec<Category> = Vec::new();
        let mut out = Vec::new();
        for rule in &self.rules {
            if matched.contains(&rule.category) {
                continue;
            }
            let Some(caps) = rule.pattern.captures(line) else {
                continue;
            };
            if let Some(ev) = (rule.build)(&caps) {
                matched.push(rule.category);
                out.push(ev);
            }
        }
        out
    }
}
