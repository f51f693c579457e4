use std::{collections::BTreeMap, path::Path, time::Duration};

use lodestone_process::ListKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

#[derive(Debug, serde::Deserialize)]
struct NamedEntry {
    name: Option<String>,
}

/// Names from a JSON array of records. Entries without a string `name` are skipped.
pub fn parse_names(raw: &str) -> anyhow::Result<Vec<String>> {
    let entries: Vec<NamedEntry> = serde_json::from_str(raw)?;
    Ok(entries
        .into_iter()
        .filter_map(|e| e.name)
        .filter(|n| !n.is_empty())
        .collect())
}

/// Current contents of one list. Missing or malformed files read as empty.
pub async fn load(server_dir: &Path, kind: ListKind) -> Vec<String> {
    let path = server_dir.join(kind.file_name());
    let raw = match tokio::fs::read_to_string(&path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read list file");
            return Vec::new();
        }
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match parse_names(&raw) {
        Ok(names) => names,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed list file");
            Vec::new()
        }
    }
}

pub async fn load_all(server_dir: &Path) -> BTreeMap<ListKind, Vec<String>> {
    let mut out = BTreeMap::new();
    for kind in ListKind::ALL {
        out.insert(kind, load(server_dir, kind).await);
    }
    out
}

fn kinds_in(event: &Event) -> impl Iterator<Item = ListKind> + '_ {
    event
        .paths
        .iter()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .filter_map(ListKind::from_file_name)
}

/// Watch the server directory (non-recursively) and report which list files changed.
/// The watcher stops when the returned handle is dropped.
pub fn watch(server_dir: &Path, tx: mpsc::UnboundedSender<ListKind>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_access() {
                    return;
                }
                for kind in kinds_in(&event) {
                    let _ = tx.send(kind);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "list watcher error");
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(server_dir, RecursiveMode::NonRecursive)?;
    tracing::info!(path = %server_dir.display(), "list watcher started");
    Ok(watcher)
}

/// Trailing debounce per list: every notification pushes that list's deadline out by
/// `quiet`; `fire` runs once the list has been quiet that long.
pub fn spawn_debouncer<F>(quiet: Duration, mut rx: mpsc::UnboundedReceiver<ListKind>, fire: F) -> JoinHandle<()>
where
    F: Fn(ListKind) + Send + 'static,
{
    tokio::spawn(async move {
        let mut deadlines: BTreeMap<ListKind, Instant> = BTreeMap::new();
        loop {
            let next = deadlines
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(kind, at)| (*kind, *at));
            let wake = next.map(|(_, at)| at).unwrap_or_else(Instant::now);

            tokio::select! {
                msg = rx.recv() => {
                    let Some(kind) = msg else { break };
                    deadlines.insert(kind, Instant::now() + quiet);
                }
                _ = tokio::time::sleep_until(wake), if next.is_some() => {
                    if let Some((kind, _)) = next {
                        deadlines.remove(&kind);
                        fire(kind);
                    }
                }
            }
        }
    })
}
