use std::{collections::BTreeMap, net::SocketAddr};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use lodestone_process::{ListKind, ObserverCommand, ServerEvent, ServerState};
use sha2::{Digest, Sha256};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::{
    addons, backup,
    command::{self, Dispatch, PlayerAction},
    engine::{Attachment, EngineHandle, StartOutcome, StopOutcome},
    monitor::UsageMonitor,
    properties, version,
};

const OUTBOX_CAPACITY: usize = 256;
const NOT_RUNNING: &str = "Server is not running.";

#[derive(Clone)]
pub struct GatewayState {
    pub engine: EngineHandle,
    pub monitor: UsageMonitor,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(observer_ws))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// SHA-256 of `password`, compared in constant time against a lowercase hex digest.
pub fn password_matches(expected_hex: &str, password: &str) -> bool {
    let got = hex::encode(Sha256::digest(password.as_bytes()));
    let expected = expected_hex.trim().to_ascii_lowercase();
    if got.len() != expected.len() {
        return false;
    }
    got.bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, serde::Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    server_state: ServerState,
    players: usize,
    observers: usize,
}

async fn healthz(State(state): State<GatewayState>) -> Json<HealthzResponse> {
    let snapshot = state.engine.snapshot().await;
    Json(HealthzResponse {
        status: if snapshot.is_some() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        server_state: snapshot.as_ref().map(|s| s.state).unwrap_or_default(),
        players: snapshot.map(|s| s.players.len()).unwrap_or(0),
        observers: state.monitor.observers(),
    })
}

async fn observer_ws(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(state, socket, peer))
}

/// Keeps the usage monitor's observer count in step with live connections.
struct ObserverGuard(UsageMonitor);

impl ObserverGuard {
    fn new(monitor: UsageMonitor) -> Self {
        monitor.observer_connected();
        Self(monitor)
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        self.0.observer_disconnected();
    }
}

#[derive(Clone)]
struct Outbox(mpsc::Sender<Message>);

impl Outbox {
    async fn send(&self, event: &ServerEvent) -> bool {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode event");
                return true;
            }
        };
        self.0.send(Message::Text(json)).await.is_ok()
    }

    async fn notice(&self, message: impl Into<String>) {
        self.send(&ServerEvent::Notice {
            message: message.into(),
        })
        .await;
    }
}

struct ObserverSession {
    state: GatewayState,
    outbox: Outbox,
    authorized: bool,
    forward: Option<JoinHandle<()>>,
}

async fn handle_observer(state: GatewayState, socket: WebSocket, peer: SocketAddr) {
    let span = tracing::info_span!("observer", %peer);
    async move {
        tracing::debug!("observer connected");
        let _guard = ObserverGuard::new(state.monitor.clone());
        let (mut sender, mut receiver) = socket.split();

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOX_CAPACITY);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let mut session = ObserverSession {
            state,
            outbox: Outbox(tx),
            authorized: false,
            forward: None,
        };

        while let Some(msg) = receiver.next().await {
            let Ok(msg) = msg else { break };
            match msg {
                Message::Text(text) => {
                    // Frames that do not decode are ignored.
                    let Ok(cmd) = serde_json::from_str::<ObserverCommand>(&text) else {
                        continue;
                    };
                    session.handle(cmd).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        if let Some(forward) = session.forward.take() {
            forward.abort();
        }
        drop(session);
        writer.abort();
        tracing::debug!("observer disconnected");
    }
    .instrument(span)
    .await
}

impl ObserverSession {
    async fn handle(&mut self, cmd: ObserverCommand) {
        if let ObserverCommand::Login { password } = cmd {
            self.login(&password).await;
            return;
        }
        // Unauthorized sessions get nothing back.
        if !self.authorized {
            return;
        }

        let engine = &self.state.engine;
        match cmd {
            ObserverCommand::Login { .. } => {}
            ObserverCommand::Start => {
                let engine = engine.clone();
                let outbox = self.outbox.clone();
                tokio::spawn(async move {
                    match engine.start().await {
                        StartOutcome::Failed(reason) => {
                            outbox.notice(format!("Failed to start server: {reason}")).await
                        }
                        StartOutcome::AlreadyStarting => outbox.notice("Server is already starting.").await,
                        StartOutcome::Launched | StartOutcome::AlreadyRunning => {}
                    }
                });
            }
            ObserverCommand::Stop => {
                if engine.stop().await == StopOutcome::NotRunning {
                    self.outbox.notice(NOT_RUNNING).await;
                }
            }
            ObserverCommand::SendCommand { command } => {
                // Blank input is dropped without a reply.
                if command::sanitize(&command).is_none() {
                    return;
                }
                if engine.command(command, self.authorized).await == Dispatch::Rejected {
                    self.outbox.notice(NOT_RUNNING).await;
                }
            }
            ObserverCommand::QueryRules { keys } => {
                for key in keys {
                    let Some(q) = command::rule_read(key.trim()) else {
                        continue;
                    };
                    if engine.command(q, self.authorized).await == Dispatch::Rejected {
                        self.outbox.notice(NOT_RUNNING).await;
                        break;
                    }
                }
            }
            ObserverCommand::SetRule { key, value } => {
                if engine.set_rule(key, value, self.authorized).await == Dispatch::Rejected {
                    self.outbox.notice("Rule change rejected.").await;
                }
            }
            ObserverCommand::Kick { name } => self.player(PlayerAction::Kick, &name).await,
            ObserverCommand::Ban { name } => self.player(PlayerAction::Ban, &name).await,
            ObserverCommand::Pardon { name } => self.player(PlayerAction::Pardon, &name).await,
            ObserverCommand::Op { name } => self.player(PlayerAction::Op, &name).await,
            ObserverCommand::Deop { name } => self.player(PlayerAction::Deop, &name).await,
            ObserverCommand::WhitelistAdd { name } => {
                self.player(PlayerAction::WhitelistAdd, &name).await
            }
            ObserverCommand::WhitelistRemove { name } => {
                self.player(PlayerAction::WhitelistRemove, &name).await
            }
            ObserverCommand::ClearInventory { name } => {
                self.player(PlayerAction::ClearInventory, &name).await
            }
            ObserverCommand::SetGamemode { name, mode } => match command::gamemode(&name, &mode) {
                Some(cmd) => {
                    if engine.command(cmd, self.authorized).await == Dispatch::Rejected {
                        self.outbox.notice(NOT_RUNNING).await;
                    }
                }
                None => self.outbox.notice("Invalid player name or game mode.").await,
            },
            ObserverCommand::CleanItems => {
                if engine.command(command::CLEAN_ITEMS, self.authorized).await == Dispatch::Sent {
                    engine.system_line("System: Executed clear items command.");
                } else {
                    self.outbox.notice(NOT_RUNNING).await;
                }
            }
            ObserverCommand::Backup => self.backup(),
            ObserverCommand::GetProperties => {
                match properties::read(&engine.config().server_dir).await {
                    Ok(properties) => {
                        self.outbox
                            .send(&ServerEvent::ServerProperties { properties })
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read server.properties");
                        self.outbox.notice(format!("Failed to read server.properties: {e:#}")).await;
                    }
                }
            }
            ObserverCommand::UpdateProperty { key, value } => {
                match properties::update(&engine.config().server_dir, &key, &value).await {
                    Ok(properties) => {
                        tracing::info!(%key, "server.properties updated");
                        engine.system_line(format!("System: Updated server.properties: {key}={value}"));
                        self.outbox
                            .send(&ServerEvent::ServerProperties { properties })
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "failed to update server.properties");
                        self.outbox.notice(format!("Failed to update {key}: {e:#}")).await;
                    }
                }
            }
            ObserverCommand::GetMods => self.send_mods().await,
            ObserverCommand::ToggleMod { name, enabled } => {
                match addons::toggle_mod(&engine.config().server_dir, &name, enabled).await {
                    Ok(Some(new_name)) => {
                        let verb = if enabled { "enabled" } else { "disabled" };
                        tracing::info!(%new_name, enabled, "mod toggled");
                        engine.system_line(format!("System: Mod {verb}: {new_name}"));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(%name, error = %e, "failed to toggle mod");
                        self.outbox.notice(format!("Failed to toggle {name}: {e:#}")).await;
                    }
                }
                self.send_mods().await;
            }
            ObserverCommand::DeleteMod { name } => {
                match addons::delete_mod(&engine.config().server_dir, &name).await {
                    Ok(()) => engine.system_line(format!("System: Mod deleted: {name}")),
                    Err(e) => {
                        tracing::warn!(%name, error = %e, "failed to delete mod");
                        self.outbox.notice(format!("Failed to delete {name}: {e:#}")).await;
                    }
                }
                self.send_mods().await;
            }
            ObserverCommand::GetResourcePacks => self.send_resource_packs().await,
            ObserverCommand::DeleteResourcePack { filename } => {
                match addons::delete_resource_pack(&engine.config().server_dir, &filename).await {
                    Ok(()) => engine.system_line(format!("System: Deleted resource pack: {filename}")),
                    Err(e) => {
                        tracing::warn!(%filename, error = %e, "failed to delete resource pack");
                        self.outbox.notice(format!("Failed to delete {filename}: {e:#}")).await;
                    }
                }
                self.send_resource_packs().await;
            }
            ObserverCommand::ApplyResourcePack { filename, host } => {
                let host = engine.config().public_host.clone().unwrap_or(host);
                match addons::apply_resource_pack(&engine.config().server_dir, &filename, &host).await {
                    Ok(applied) => {
                        tracing::info!(%filename, url = %applied.url, "resource pack applied");
                        engine.system_line(format!("System: Applied resource pack: {filename}"));
                        engine.system_line(format!("System: Resource pack URL: {}", applied.url));
                        engine.system_line(format!("System: Resource pack SHA1: {}", applied.sha1));
                        self.outbox
                            .send(&ServerEvent::ServerProperties {
                                properties: applied.properties,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(%filename, error = %e, "failed to apply resource pack");
                        self.outbox.notice(format!("Failed to apply {filename}: {e:#}")).await;
                    }
                }
            }
        }
    }

    async fn send_mods(&self) {
        match addons::list_mods(&self.state.engine.config().server_dir).await {
            Ok(mods) => {
                self.outbox.send(&ServerEvent::ModsList { mods }).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to list mods");
                self.outbox.notice(format!("Failed to list mods: {e:#}")).await;
            }
        }
    }

    async fn send_resource_packs(&self) {
        match addons::list_resource_packs(&self.state.engine.config().server_dir).await {
            Ok(packs) => {
                self.outbox.send(&ServerEvent::ResourcePacksList { packs }).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to list resource packs");
                self.outbox.notice(format!("Failed to list resource packs: {e:#}")).await;
            }
        }
    }

    async fn login(&mut self, password: &str) {
        if self.authorized {
            return;
        }
        let engine = self.state.engine.clone();
        if !password_matches(&engine.config().password_sha256, password) {
            tracing::info!("observer login rejected");
            self.outbox.send(&ServerEvent::LoginFail).await;
            return;
        }

        let Some(attachment) = engine.attach().await else {
            self.outbox.notice("Supervisor is shutting down.").await;
            return;
        };
        self.authorized = true;
        tracing::info!("observer authorized");

        let server_version = version::detect(&engine.config().server_dir).await;
        let Attachment {
            state,
            players,
            history,
            lists,
            rules,
            events,
        } = attachment;
        let mut initial = vec![
            ServerEvent::LoginSuccess,
            ServerEvent::ServerVersion {
                version: server_version,
            },
        ];
        initial.extend(state_frames(state, players, lists, rules));
        initial.push(ServerEvent::LogHistory { lines: history });
        initial.push(ServerEvent::Live);

        for ev in &initial {
            if !self.outbox.send(ev).await {
                return;
            }
        }

        self.forward = Some(tokio::spawn(
            forward_events(engine, events, self.outbox.clone()).in_current_span(),
        ));
    }

    async fn player(&self, action: PlayerAction, name: &str) {
        let engine = &self.state.engine;
        let Some(cmd) = action.command(name.trim()) else {
            self.outbox.notice(format!("Invalid player name: {name:?}")).await;
            return;
        };
        if engine.command(cmd, self.authorized).await != Dispatch::Sent {
            self.outbox.notice(NOT_RUNNING).await;
            return;
        }
        if let Some(kind) = action.affected_list() {
            engine.refresh_list_later(kind, engine.config().list_refresh_delay);
        }
    }

    fn backup(&self) {
        let engine = self.state.engine.clone();
        let outbox = self.outbox.clone();
        tokio::spawn(
            async move {
                let name = backup::backup_name(chrono::Utc::now());
                engine.system_line(format!("System: Starting background backup to {name}..."));
                let report = backup::run(&engine.config().server_dir, &name).await;
                match (&report.size_mb, &report.error) {
                    (Some(size), _) if report.success => {
                        tracing::info!(%name, size_mb = %size, "world backup finished");
                        engine.system_line(format!("System: Backup completed! Size: {size} MB"));
                    }
                    (_, error) => {
                        let error = error.as_deref().unwrap_or("unknown error");
                        tracing::warn!(%name, %error, "world backup failed");
                        engine.system_line(format!("System Error: Backup failed! {error}"));
                    }
                }
                outbox.send(&ServerEvent::BackupFinished { report }).await;
            }
            .in_current_span(),
        );
    }
}

/// Frames that rebuild an observer's view of state, roster, lists and rules.
fn state_frames(
    state: ServerState,
    players: Vec<String>,
    lists: BTreeMap<ListKind, Vec<String>>,
    rules: BTreeMap<String, String>,
) -> Vec<ServerEvent> {
    let mut frames = vec![
        ServerEvent::StateChanged { state },
        ServerEvent::RosterChanged { players },
    ];
    frames.extend(
        lists
            .into_iter()
            .map(|(list, names)| ServerEvent::ExternalListChanged { list, names }),
    );
    frames.extend(
        rules
            .into_iter()
            .map(|(key, value)| ServerEvent::RuleValue { key, value }),
    );
    frames
}

/// Forward live events. After falling behind, resubscribe and resend current state.
async fn forward_events(
    engine: EngineHandle,
    mut events: broadcast::Receiver<ServerEvent>,
    outbox: Outbox,
) {
    loop {
        match events.recv().await {
            Ok(ev) => {
                if !outbox.send(&ev).await {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "observer lagged; resending state");
                outbox
                    .notice(format!("{n} events were dropped; current state follows."))
                    .await;
                let Some(attachment) = engine.attach().await else {
                    break;
                };
                events = attachment.events;
                let frames = state_frames(
                    attachment.state,
                    attachment.players,
                    attachment.lists,
                    attachment.rules,
                );
                for ev in &frames {
                    if !outbox.send(ev).await {
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
