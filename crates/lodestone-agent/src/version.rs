use std::path::Path;

use lodestone_process::ServerVersion;

/// Numeric-aware ordering key: `1.20.10` sorts after `1.20.9`.
fn version_key(v: &str) -> Vec<u64> {
    v.split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>().unwrap_or(u64::MAX))
        .collect()
}

/// Highest-versioned subdirectory name, if any.
async fn newest_subdir(path: &Path) -> Option<String> {
    let mut rd = tokio::fs::read_dir(path).await.ok()?;
    let mut names = Vec::new();
    while let Ok(Some(entry)) = rd.next_entry().await {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.into_iter().max_by(|a, b| version_key(a).cmp(&version_key(b)).then_with(|| a.cmp(b)))
}

/// Infer game and loader versions from the `libraries/` and `versions/` layout
/// the installers leave behind.
pub async fn detect(server_dir: &Path) -> ServerVersion {
    let mut out = ServerVersion::default();
    let libs = server_dir.join("libraries").join("net");

    let fabric = libs.join("fabricmc").join("fabric-loader");
    let forge = libs.join("minecraftforge").join("forge");
    let neoforge = libs.join("neoforged").join("neoforge");

    if tokio::fs::metadata(&fabric).await.is_ok() {
        out.loader_type = "Fabric".to_string();
        out.loader_version = newest_subdir(&fabric).await.unwrap_or_default();
        if let Some(game) = newest_subdir(&libs.join("fabricmc").join("intermediary")).await {
            out.game_version = game;
        }
    } else if tokio::fs::metadata(&forge).await.is_ok() {
        out.loader_type = "Forge".to_string();
        if let Some(dir) = newest_subdir(&forge).await {
            // Forge installs into `<game>-<loader>`.
            match dir.split_once('-') {
                Some((game, loader)) => {
                    out.game_version = game.to_string();
                    out.loader_version = loader.to_string();
                }
                None => out.loader_version = dir,
            }
        }
    } else if tokio::fs::metadata(&neoforge).await.is_ok() {
        out.loader_type = "NeoForge".to_string();
        out.loader_version = newest_subdir(&neoforge).await.unwrap_or_default();
    }

    if out.game_version == "Unknown"
        && let Some(game) = newest_subdir(&server_dir.join("versions")).await
    {
        out.game_version = game;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mkdirs(root: &Path, rel: &str) {
        std::fs::create_dir_all(root.join(rel)).unwrap();
    }

    #[tokio::test]
    async fn empty_dir_is_unknown_vanilla() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect(dir.path()).await, ServerVersion::default());
    }

    #[tokio::test]
    async fn vanilla_from_versions_dir() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), "versions/1.20.9");
        mkdirs(dir.path(), "versions/1.20.10");
        std::fs::write(dir.path().join("versions/readme.txt"), "x").unwrap();
        let v = detect(dir.path()).await;
        assert_eq!(v.game_version, "1.20.10");
        assert_eq!(v.loader_type, "Vanilla");
    }

    #[tokio::test]
    async fn fabric_uses_intermediary_for_game_version() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), "libraries/net/fabricmc/fabric-loader/0.15.11");
        mkdirs(dir.path(), "libraries/net/fabricmc/intermediary/1.21.1");
        let v = detect(dir.path()).await;
        assert_eq!(v.loader_type, "Fabric");
        assert_eq!(v.loader_version, "0.15.11");
        assert_eq!(v.game_version, "1.21.1");
    }

    #[tokio::test]
    async fn forge_splits_combined_dir() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), "libraries/net/minecraftforge/forge/1.20.1-47.2.0");
        let v = detect(dir.path()).await;
        assert_eq!(v.loader_type, "Forge");
        assert_eq!(v.game_version, "1.20.1");
        assert_eq!(v.loader_version, "47.2.0");
    }

    #[tokio::test]
    async fn neoforge_falls_back_to_versions_for_game() {
        let dir = tempfile::tempdir().unwrap();
        mkdirs(dir.path(), "libraries/net/neoforged/neoforge/21.1.72");
        mkdirs(dir.path(), "versions/1.21.1");
        let v = detect(dir.path()).await;
        assert_eq!(v.loader_type, "NeoForge");
        assert_eq!(v.loader_version, "21.1.72");
        assert_eq!(v.game_version, "1.21.1");
    }
}
