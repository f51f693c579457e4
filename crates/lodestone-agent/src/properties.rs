use std::{collections::BTreeMap, path::Path};

use anyhow::Context;

pub const FILE_NAME: &str = "server.properties";

fn is_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// `key=value` pairs; comments, blank lines and lines without `=` are ignored.
pub fn parse(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Replace the first `key=` line in place (or append one), keeping every other line
/// and each line's terminator as-is.
pub fn rewrite(text: &str, key: &str, value: &str) -> String {
    let eol = if text.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(text.len() + key.len() + value.len() + 2);
    let mut wrote = false;
    for segment in text.split_inclusive('\n') {
        let body = segment.trim_end_matches(['\r', '\n']);
        let terminator = &segment[body.len()..];
        let is_match = !body.trim_start().starts_with('#')
            && body
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
        if is_match && !wrote {
            out.push_str(&format!("{key}={value}{terminator}"));
            wrote = true;
            continue;
        }
        out.push_str(segment);
    }
    if !wrote {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push_str(eol);
        }
        out.push_str(&format!("{key}={value}{eol}"));
    }
    out
}

pub async fn read(server_dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let path = server_dir.join(FILE_NAME);
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse(&text))
}

/// Rewrite one key and return the refreshed map.
pub async fn update(server_dir: &Path, key: &str, value: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let key = key.trim();
    if !is_key(key) {
        anyhow::bail!("invalid property key: {key:?}");
    }
    if value.chars().any(|c| c.is_control()) {
        anyhow::bail!("property values must be a single line");
    }

    let path = server_dir.join(FILE_NAME);
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let updated = rewrite(&text, key, value.trim());

    let tmp = server_dir.join(format!(".{FILE_NAME}.tmp"));
    tokio::fs::write(&tmp, updated.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;

    Ok(parse(&updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#Minecraft server properties\n#Fri Oct 16 12:00:00 UTC 2026\nmotd=A Minecraft Server\nmax-players=20\n\nlevel-seed=\n";

    #[test]
    fn parse_skips_comments() {
        let props = parse(SAMPLE);
        assert_eq!(props.len(), 3);
        assert_eq!(props["motd"], "A Minecraft Server");
        assert_eq!(props["level-seed"], "");
    }

    #[test]
    fn rewrite_in_place_preserves_layout() {
        let out = rewrite(SAMPLE, "max-players", "10");
        assert_eq!(
            out,
            "#Minecraft server properties\n#Fri Oct 16 12:00:00 UTC 2026\nmotd=A Minecraft Server\nmax-players=10\n\nlevel-seed=\n"
        );
    }

    #[test]
    fn rewrite_appends_missing_key() {
        let out = rewrite("motd=hi\n", "pvp", "false");
        assert_eq!(out, "motd=hi\npvp=false\n");
    }

    #[test]
    fn rewrite_keeps_crlf_terminators() {
        let text = "#props\r\nmotd=hi\r\npvp=true\r\n";
        assert_eq!(rewrite(text, "pvp", "false"), "#props\r\nmotd=hi\r\npvp=false\r\n");
        assert_eq!(
            rewrite(text, "difficulty", "hard"),
            "#props\r\nmotd=hi\r\npvp=true\r\ndifficulty=hard\r\n"
        );
        assert_eq!(rewrite("motd=hi", "pvp", "false"), "motd=hi\npvp=false\n");
        assert_eq!(rewrite("motd=hi", "motd", "bye"), "motd=bye");
    }

    #[test]
    fn rewrite_ignores_commented_key() {
        let out = rewrite("#pvp=true\n", "pvp", "false");
        assert_eq!(out, "#pvp=true\npvp=false\n");
    }

    #[tokio::test]
    async fn update_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_NAME), SAMPLE).unwrap();

        let props = update(dir.path(), "motd", "Welcome!").await.unwrap();
        assert_eq!(props["motd"], "Welcome!");
        assert_eq!(read(dir.path()).await.unwrap()["motd"], "Welcome!");
        assert!(!dir.path().join(".server.properties.tmp").exists());
    }

    #[tokio::test]
    async fn update_rejects_bad_input_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(update(dir.path(), "motd", "x").await.is_err());

        std::fs::write(dir.path().join(FILE_NAME), SAMPLE).unwrap();
        assert!(update(dir.path(), "bad key", "x").await.is_err());
        assert!(update(dir.path(), "motd", "a\nop=me").await.is_err());
    }
}
