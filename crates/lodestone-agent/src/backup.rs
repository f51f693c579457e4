use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lodestone_process::BackupReport;
use tokio::process::Command;

pub const BACKUP_DIR: &str = "backups";
const DEFAULT_WORLD: &str = "world";

/// `world_backup_2026-10-18T09-30-00.tar.gz`
pub fn backup_name(now: DateTime<Utc>) -> String {
    format!("world_backup_{}.tar.gz", now.format("%Y-%m-%dT%H-%M-%S"))
}

pub fn size_mb(bytes: u64) -> String {
    format!("{:.2}", bytes as f64 / (1024.0 * 1024.0))
}

/// World directory named by `level-name`, falling back to `world`.
async fn world_dir_name(server_dir: &Path) -> String {
    crate::properties::read(server_dir)
        .await
        .ok()
        .and_then(|p| p.get("level-name").cloned())
        .filter(|n| {
            !n.is_empty()
                && !n.starts_with('-')
                && Path::new(n)
                    .components()
                    .all(|c| matches!(c, std::path::Component::Normal(_)))
        })
        .unwrap_or_else(|| DEFAULT_WORLD.to_string())
}

/// Archive the world into `backups/<name>` with `tar -czf`. Returns the archive size in bytes.
pub async fn archive_world(server_dir: &Path, name: &str) -> anyhow::Result<u64> {
    let world = world_dir_name(server_dir).await;
    if !tokio::fs::metadata(server_dir.join(&world))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        anyhow::bail!("world directory {world:?} not found");
    }

    let dir = server_dir.join(BACKUP_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let archive = dir.join(name);

    let out = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg(format!("{world}/"))
        .current_dir(server_dir)
        .kill_on_drop(true)
        .output()
        .await
        .context("failed to run tar")?;
    if !out.status.success() {
        let _ = tokio::fs::remove_file(&archive).await;
        anyhow::bail!(
            "tar exited with {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }

    let meta = tokio::fs::metadata(&archive)
        .await
        .with_context(|| format!("failed to stat {}", archive.display()))?;
    Ok(meta.len())
}

pub async fn run(server_dir: &Path, name: &str) -> BackupReport {
    match archive_world(server_dir, name).await {
        Ok(bytes) => BackupReport {
            success: true,
            filename: Some(name.to_string()),
            size_mb: Some(size_mb(bytes)),
            error: None,
        },
        Err(e) => BackupReport {
            success: false,
            filename: None,
            size_mb: None,
            error: Some(format!("{e:#}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn names_are_filesystem_safe() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        assert_eq!(backup_name(now), "world_backup_2026-10-18T09-30-00.tar.gz");
    }

    #[test]
    fn size_has_two_decimals() {
        assert_eq!(size_mb(0), "0.00");
        assert_eq!(size_mb(1024 * 1024 * 3 / 2), "1.50");
    }

    #[tokio::test]
    async fn missing_world_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let report = run(dir.path(), "x.tar.gz").await;
        assert!(!report.success);
        assert!(report.error.unwrap().contains("world"));
    }

    #[tokio::test]
    async fn level_name_selects_world_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("server.properties"), "level-name=survival\n").unwrap();
        assert_eq!(world_dir_name(dir.path()).await, "survival");

        std::fs::write(dir.path().join("server.properties"), "level-name=../etc\n").unwrap();
        assert_eq!(world_dir_name(dir.path()).await, "world");
    }
}
