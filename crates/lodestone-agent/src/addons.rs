use std::path::{Path, PathBuf};

use anyhow::Context;
use lodestone_process::ModEntry;
use sha1::Digest;

use crate::properties;

pub const MODS_DIR: &str = "mods";
pub const RESOURCE_PACKS_DIR: &str = "serverresourcepacks";

const JAR: &str = ".jar";
const DISABLED: &str = ".disabled";

/// A bare file name inside one directory: no separators, no parent or hidden entries.
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && !name.chars().any(|c| c.is_control())
}

fn resolve(dir: PathBuf, name: &str) -> anyhow::Result<PathBuf> {
    if !is_plain_file_name(name) {
        anyhow::bail!("invalid file name: {name:?}");
    }
    Ok(dir.join(name))
}

fn strip_suffix_ci<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let cut = name.len().checked_sub(suffix.len())?;
    let (base, tail) = (name.get(..cut)?, name.get(cut..)?);
    tail.eq_ignore_ascii_case(suffix).then_some(base)
}

fn mod_entry(name: &str) -> Option<ModEntry> {
    let name = name.trim();
    if let Some(base) = strip_suffix_ci(name, JAR) {
        return Some(ModEntry {
            name: name.to_string(),
            enabled: true,
            base_name: base.to_string(),
        });
    }
    strip_suffix_ci(name, DISABLED).map(|base| ModEntry {
        name: name.to_string(),
        enabled: false,
        base_name: base.to_string(),
    })
}

async fn file_names(dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };
    let mut names = Vec::new();
    while let Some(entry) = rd
        .next_entry()
        .await
        .with_context(|| format!("failed to read {}", dir.display()))?
    {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Jars and disabled jars under `mods/`, sorted by file name. A missing directory is empty.
pub async fn list_mods(server_dir: &Path) -> anyhow::Result<Vec<ModEntry>> {
    let names = file_names(&server_dir.join(MODS_DIR)).await?;
    Ok(names.iter().filter_map(|n| mod_entry(n)).collect())
}

/// File name a mod takes when switched to `enabled`, or `None` when it is already there.
pub fn toggled_name(name: &str, enabled: bool) -> Option<String> {
    let entry = mod_entry(name)?;
    if entry.enabled == enabled {
        return None;
    }
    let suffix = if enabled { JAR } else { DISABLED };
    Some(format!("{}{suffix}", entry.base_name))
}

/// Rename a mod between `.jar` and `.disabled`. Returns the new name, or `None` if unchanged.
pub async fn toggle_mod(server_dir: &Path, name: &str, enabled: bool) -> anyhow::Result<Option<String>> {
    let from = resolve(server_dir.join(MODS_DIR), name)?;
    if mod_entry(name).is_none() {
        anyhow::bail!("not a mod file: {name:?}");
    }
    let Some(new_name) = toggled_name(name, enabled) else {
        return Ok(None);
    };
    let to = server_dir.join(MODS_DIR).join(&new_name);
    if tokio::fs::try_exists(&to).await.unwrap_or(false) {
        anyhow::bail!("{new_name} already exists");
    }
    tokio::fs::rename(&from, &to)
        .await
        .with_context(|| format!("failed to rename {}", from.display()))?;
    Ok(Some(new_name))
}

pub async fn delete_mod(server_dir: &Path, name: &str) -> anyhow::Result<()> {
    if mod_entry(name).is_none() {
        anyhow::bail!("not a mod file: {name:?}");
    }
    let path = resolve(server_dir.join(MODS_DIR), name)?;
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("failed to delete {}", path.display()))
}

/// `.zip` archives under the resource pack directory, which is created when missing.
pub async fn list_resource_packs(server_dir: &Path) -> anyhow::Result<Vec<String>> {
    let dir = server_dir.join(RESOURCE_PACKS_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let names = file_names(&dir).await?;
    Ok(names.into_iter().filter(|n| n.ends_with(".zip")).collect())
}

pub async fn delete_resource_pack(server_dir: &Path, filename: &str) -> anyhow::Result<()> {
    let path = resolve(server_dir.join(RESOURCE_PACKS_DIR), filename)?;
    tokio::fs::remove_file(&path)
        .await
        .with_context(|| format!("failed to delete {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPack {
    pub url: String,
    pub sha1: String,
    pub properties: std::collections::BTreeMap<String, String>,
}

pub fn pack_url(host: &str, filename: &str) -> String {
    format!("http://{}/resourcepacks/{filename}", host.trim().trim_end_matches('/'))
}

/// Point `server.properties` at a pack: `resource-pack` gets its URL, `resource-pack-sha1` its digest.
pub async fn apply_resource_pack(server_dir: &Path, filename: &str, host: &str) -> anyhow::Result<AppliedPack> {
    let path = resolve(server_dir.join(RESOURCE_PACKS_DIR), filename)?;
    let host = host.trim();
    if host.is_empty() || host.contains(['/', ' ']) || host.chars().any(|c| c.is_control()) {
        anyhow::bail!("invalid host: {host:?}");
    }
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let sha1 = hex::encode(sha1::Sha1::digest(&bytes));
    let url = pack_url(host, filename);

    properties::update(server_dir, "resource-pack", &url).await?;
    let properties = properties::update(server_dir, "resource-pack-sha1", &sha1).await?;
    Ok(AppliedPack { url, sha1, properties })
}
