use std::{collections::BTreeMap, sync::Arc, time::Duration};

use lodestone_process::{ListKind, LogLine, ServerEvent, ServerState};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    command::{self, Dispatch},
    config::AgentConfig,
    extract::{Extractor, LineEvent},
    history::{self, DurableLog, HistoryBuffer},
    line_source::{Follower, LineSource},
    lists,
    roster::{Roster, RosterInput},
    session::{self, SessionDriver},
    supervisor::{LaunchRefusal, Supervisor, Transition},
};

const EVENT_CAPACITY: usize = 1024;

pub const MSG_TAKEOVER: &str = "System: Found existing server process, taking over...";
pub const MSG_LOST: &str = "System: Server process stopped or screen session terminated.";
pub const MSG_ALREADY_RUNNING: &str = "System: Server is already running.";
pub const MSG_STARTING: &str = "System: Starting server...";
pub const MSG_STOPPING: &str = "System: Stopping server...";
pub const MSG_VANISHED: &str = "System Error: Server session exited right after launch. Check the server log.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Launched,
    AlreadyRunning,
    AlreadyStarting,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Sent,
    NotRunning,
}

/// Everything a newly authorized observer needs, taken atomically with its subscription.
#[derive(Debug)]
pub struct Attachment {
    pub state: ServerState,
    pub players: Vec<String>,
    pub history: Vec<LogLine>,
    pub lists: BTreeMap<ListKind, Vec<String>>,
    pub rules: BTreeMap<String, String>,
    pub events: broadcast::Receiver<ServerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: ServerState,
    pub players: Vec<String>,
    pub history_len: usize,
}

type Reply<T> = Option<oneshot::Sender<T>>;

fn reply<T>(tx: Reply<T>, value: T) {
    if let Some(tx) = tx {
        let _ = tx.send(value);
    }
}

/// Inputs to the core actor, processed strictly in arrival order.
pub enum Input {
    Probe(bool),
    Line { generation: u64, text: String },
    System(String),
    Start(Reply<StartOutcome>),
    LaunchSkipped(Reply<StartOutcome>),
    LaunchFinished {
        result: Result<(), String>,
        reply: Reply<StartOutcome>,
    },
    Stop(Reply<StopOutcome>),
    Command {
        text: String,
        authorized: bool,
        reply: Reply<Dispatch>,
    },
    SetRule {
        key: String,
        value: String,
        authorized: bool,
        reply: Reply<Dispatch>,
    },
    RosterSync,
    ListRefreshed { kind: ListKind, names: Vec<String> },
    Attach(oneshot::Sender<Attachment>),
    Snapshot(oneshot::Sender<StatusSnapshot>),
}

/// Owns every piece of mutable supervision state.
pub struct Engine {
    config: Arc<AgentConfig>,
    driver: Arc<dyn SessionDriver>,
    extractor: Extractor,
    supervisor: Supervisor,
    roster: Roster,
    history: HistoryBuffer,
    durable: DurableLog,
    lists: BTreeMap<ListKind, Vec<String>>,
    rules: BTreeMap<String, String>,
    source: Option<LineSource>,
    events: broadcast::Sender<ServerEvent>,
    injector: mpsc::UnboundedSender<String>,
    tx: mpsc::UnboundedSender<Input>,
    rx: mpsc::UnboundedReceiver<Input>,
}

impl Engine {
    /// Seed history from the durable tail and load the external lists.
    pub async fn new(config: AgentConfig, driver: Arc<dyn SessionDriver>) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let extractor = Extractor::minecraft()?;

        let mut history = HistoryBuffer::new(config.history_max_lines);
        match history::read_tail(&config.history_file, history.capacity()).await {
            Ok(lines) => history.reseed(lines),
            Err(e) => {
                tracing::warn!(path = %config.history_file.display(), error = %e, "failed to seed history")
            }
        }
        let durable = DurableLog::spawn(config.history_file.clone());
        let lists = lists::load_all(&config.server_dir).await;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        let injector = spawn_injector(driver.clone());

        Ok(Self {
            config,
            driver,
            extractor,
            supervisor: Supervisor::default(),
            roster: Roster::default(),
            history,
            durable,
            lists,
            rules: BTreeMap::new(),
            source: None,
            events,
            injector,
            tx,
            rx,
        })
    }

    pub fn spawn(self) -> (EngineHandle, JoinHandle<()>) {
        let handle = EngineHandle {
            tx: self.tx.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        };
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    async fn run(mut self) {
        while let Some(input) = self.rx.recv().await {
            self.handle(input).await;
        }
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Probe(found) => self.on_probe(found).await,
            Input::Line { generation, text } => {
                if self.supervisor.is_current(generation) {
                    self.emit(text, true);
                }
            }
            Input::System(text) => self.emit(text, false),
            Input::Start(tx) => self.on_start(tx),
            Input::LaunchSkipped(tx) => {
                self.supervisor.on_launch_skipped();
                self.emit(MSG_ALREADY_RUNNING.to_string(), false);
                reply(tx, StartOutcome::AlreadyRunning);
            }
            Input::LaunchFinished { result, reply: tx } => self.on_launch_finished(result, tx),
            Input::Stop(tx) => self.on_stop(tx),
            Input::Command {
                text,
                authorized,
                reply: tx,
            } => {
                let outcome = self.dispatch(&text, authorized);
                reply(tx, outcome);
            }
            Input::SetRule {
                key,
                value,
                authorized,
                reply: tx,
            } => {
                let outcome = self.set_rule(&key, &value, authorized);
                reply(tx, outcome);
            }
            Input::RosterSync => {
                if self.supervisor.is_running() {
                    self.inject(command::LIST.to_string());
                }
            }
            Input::ListRefreshed { kind, names } => {
                self.lists.insert(kind, names.clone());
                self.publish(ServerEvent::ExternalListChanged { list: kind, names });
            }
            Input::Attach(tx) => {
                let attachment = Attachment {
                    state: self.supervisor.state(),
                    players: self.roster.to_vec(),
                    history: self.history.snapshot(),
                    lists: self.lists.clone(),
                    rules: self.rules.clone(),
                    events: self.events.subscribe(),
                };
                let _ = tx.send(attachment);
            }
            Input::Snapshot(tx) => {
                let _ = tx.send(StatusSnapshot {
                    state: self.supervisor.state(),
                    players: self.roster.to_vec(),
                    history_len: self.history.len(),
                });
            }
        }
    }

    fn publish(&self, event: ServerEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Durable append, ring push and broadcast for one line, then extraction.
    fn emit(&mut self, text: String, extract: bool) {
        self.durable.append(text.clone());
        let line = self.history.push(text);
        let events = if extract {
            self.extractor.extract(&line.text)
        } else {
            Vec::new()
        };
        self.publish(ServerEvent::LogLine { line });
        for ev in events {
            self.apply(ev);
        }
    }

    fn apply(&mut self, event: LineEvent) {
        match event {
            LineEvent::Chat {
                speaker,
                text,
                is_action,
            } => self.publish(ServerEvent::Chat {
                speaker,
                text,
                is_action,
            }),
            LineEvent::Whisper { from, to, text } => {
                self.publish(ServerEvent::Whisper { from, to, text })
            }
            LineEvent::Join(id) => self.apply_roster(RosterInput::Join(id)),
            LineEvent::Leave(id) => self.apply_roster(RosterInput::Leave(id)),
            LineEvent::Roster(ids) => self.apply_roster(RosterInput::Snapshot(ids)),
            LineEvent::RuleValue { key, value } => {
                self.rules.insert(key.clone(), value.clone());
                self.publish(ServerEvent::RuleValue { key, value });
            }
        }
    }

    fn apply_roster(&mut self, input: RosterInput) {
        if self.roster.apply(input) {
            self.publish(ServerEvent::RosterChanged {
                players: self.roster.to_vec(),
            });
        }
    }

    async fn on_probe(&mut self, found: bool) {
        match self.supervisor.on_probe(found) {
            Transition::None => {}
            Transition::Attached {
                generation,
                takeover,
            } => {
                tracing::info!(generation, takeover, session = %self.config.session_name, "server session attached");
                if takeover {
                    self.emit(MSG_TAKEOVER.to_string(), false);
                }
                self.reseed().await;
                self.start_source(generation).await;
                self.publish(ServerEvent::StateChanged {
                    state: ServerState::Running,
                });
                self.schedule(self.config.attach_query_delay, Input::RosterSync);
            }
            Transition::Lost => {
                tracing::info!(session = %self.config.session_name, "server session lost");
                if let Some(source) = self.source.take() {
                    source.stop();
                }
                self.emit(MSG_LOST.to_string(), false);
                self.apply_roster(RosterInput::Snapshot(Default::default()));
                self.publish(ServerEvent::StateChanged {
                    state: ServerState::Stopped,
                });
            }
            Transition::LaunchVanished => {
                tracing::warn!(session = %self.config.session_name, "launched session not found by confirmation probe");
                self.emit(MSG_VANISHED.to_string(), false);
            }
        }
    }

    /// Rebuild the ring from the durable file once pending appends are written.
    /// The ring is kept as-is when recent appends never reached the file.
    async fn reseed(&mut self) {
        let durability = self.durable.flush().await;
        if !durability.covers(self.history.capacity()) {
            tracing::warn!(path = %self.config.history_file.display(), ?durability, "history file is missing recent lines; keeping in-memory history");
            return;
        }
        match history::read_tail(&self.config.history_file, self.history.capacity()).await {
            Ok(lines) => self.history.reseed(lines),
            Err(e) => {
                tracing::warn!(path = %self.config.history_file.display(), error = %e, "failed to reseed history")
            }
        }
    }

    async fn start_source(&mut self, generation: u64) {
        let tx = self.tx.clone();
        let follower = Follower::at_end(self.config.server_log_path()).await;
        let source = LineSource::spawn(
            follower,
            self.config.tail_poll_interval,
            move |text| tx.send(Input::Line { generation, text }).is_ok(),
        );
        if let Some(old) = self.source.replace(source) {
            old.stop();
        }
    }

    fn schedule(&self, delay: Duration, input: Input) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(input);
        });
    }

    fn on_start(&mut self, tx: Reply<StartOutcome>) {
        match self.supervisor.on_launch_requested() {
            Err(LaunchRefusal::AlreadyRunning) => {
                self.emit(MSG_ALREADY_RUNNING.to_string(), false);
                reply(tx, StartOutcome::AlreadyRunning);
                return;
            }
            Err(LaunchRefusal::AlreadyStarting) => {
                reply(tx, StartOutcome::AlreadyStarting);
                return;
            }
            Ok(()) => {}
        }

        let driver = self.driver.clone();
        let config = self.config.clone();
        let input = self.tx.clone();
        tokio::spawn(async move {
            if session::probe(driver.as_ref(), config.probe_timeout).await {
                // Clear the launch first so the attach is reported as a takeover.
                let _ = input.send(Input::LaunchSkipped(tx));
                let _ = input.send(Input::Probe(true));
                return;
            }
            let _ = input.send(Input::System(MSG_STARTING.to_string()));
            let result = driver
                .create(&config.launch_command(), &config.server_dir)
                .await
                .map_err(|e| e.to_string());
            let _ = input.send(Input::LaunchFinished { result, reply: tx });
        });
    }

    fn on_launch_finished(&mut self, result: Result<(), String>, tx: Reply<StartOutcome>) {
        match result {
            Ok(()) => {
                self.supervisor.on_launch_finished(true);
                tracing::info!(session = %self.config.session_name, "server launched");

                let driver = self.driver.clone();
                let config = self.config.clone();
                let input = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(config.launch_confirm_delay).await;
                    let found = session::probe(driver.as_ref(), config.probe_timeout).await;
                    let _ = input.send(Input::Probe(found));
                });
                reply(tx, StartOutcome::Launched);
            }
            Err(reason) => {
                self.supervisor.on_launch_finished(false);
                tracing::error!(error = %reason, "failed to launch server");
                self.emit(format!("System Error: Failed to start server: {reason}"), false);
                reply(tx, StartOutcome::Failed(reason));
            }
        }
    }

    fn on_stop(&mut self, tx: Reply<StopOutcome>) {
        if !self.supervisor.is_running() {
            reply(tx, StopOutcome::NotRunning);
            return;
        }
        self.emit(MSG_STOPPING.to_string(), false);
        self.inject(command::STOP.to_string());
        reply(tx, StopOutcome::Sent);
    }

    /// Gate, sanitize and echo a command as `> text`, then queue it for the session.
    fn dispatch(&mut self, text: &str, authorized: bool) -> Dispatch {
        if !authorized || !self.supervisor.is_running() {
            return Dispatch::Rejected;
        }
        let Some(text) = command::sanitize(text) else {
            return Dispatch::Rejected;
        };
        self.emit(format!("> {text}"), false);
        self.inject(text);
        Dispatch::Sent
    }

    fn set_rule(&mut self, key: &str, value: &str, authorized: bool) -> Dispatch {
        let (Some(write), Some(read)) = (command::rule_write(key, value), command::rule_read(key))
        else {
            return Dispatch::Rejected;
        };
        let outcome = self.dispatch(&write, authorized);
        if outcome == Dispatch::Sent {
            self.schedule(
                self.config.rule_readback_delay,
                Input::Command {
                    text: read,
                    authorized: true,
                    reply: None,
                },
            );
        }
        outcome
    }

    fn inject(&self, text: String) {
        let _ = self.injector.send(text);
    }
}

/// Serializes session input so commands reach the console in dispatch order.
fn spawn_injector(driver: Arc<dyn SessionDriver>) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = driver.send(&text).await {
                tracing::warn!(error = %e, "failed to send command to session");
            }
        }
    });
    tx
}

/// Cheap, cloneable front door to the core actor.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<ServerEvent>,
    config: Arc<AgentConfig>,
}

impl EngineHandle {
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Sender side of the observer event stream, for producers outside the actor.
    pub fn events(&self) -> broadcast::Sender<ServerEvent> {
        self.events.clone()
    }

    fn send(&self, input: Input) {
        let _ = self.tx.send(input);
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Input) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).ok()?;
        rx.await.ok()
    }

    pub fn report_probe(&self, found: bool) {
        self.send(Input::Probe(found));
    }

    pub fn system_line(&self, text: impl Into<String>) {
        self.send(Input::System(text.into()));
    }

    pub fn sync_roster(&self) {
        self.send(Input::RosterSync);
    }

    pub async fn start(&self) -> StartOutcome {
        self.ask(|tx| Input::Start(Some(tx)))
            .await
            .unwrap_or_else(|| StartOutcome::Failed("supervisor is shutting down".to_string()))
    }

    pub async fn stop(&self) -> StopOutcome {
        self.ask(|tx| Input::Stop(Some(tx)))
            .await
            .unwrap_or(StopOutcome::NotRunning)
    }

    /// Echoed into the log as `> text` when accepted.
    pub async fn command(&self, text: impl Into<String>, authorized: bool) -> Dispatch {
        let text = text.into();
        self.ask(|tx| Input::Command {
            text,
            authorized,
            reply: Some(tx),
        })
        .await
        .unwrap_or(Dispatch::Rejected)
    }

    /// Write a rule, then read it back so observers learn the value the server accepted.
    pub async fn set_rule(&self, key: impl Into<String>, value: impl Into<String>, authorized: bool) -> Dispatch {
        let (key, value) = (key.into(), value.into());
        self.ask(|tx| Input::SetRule {
            key,
            value,
            authorized,
            reply: Some(tx),
        })
        .await
        .unwrap_or(Dispatch::Rejected)
    }

    pub async fn attach(&self) -> Option<Attachment> {
        self.ask(Input::Attach).await
    }

    pub async fn snapshot(&self) -> Option<StatusSnapshot> {
        self.ask(Input::Snapshot).await
    }

    /// Re-read one list file and publish it.
    pub fn refresh_list(&self, kind: ListKind) {
        self.refresh_list_later(kind, Duration::ZERO);
    }

    pub fn refresh_list_later(&self, kind: ListKind, delay: Duration) {
        let tx = self.tx.clone();
        let dir = self.config.server_dir.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let names = lists::load(&dir, kind).await;
            let _ = tx.send(Input::ListRefreshed { kind, names });
        });
    }
}

/// Probe and roster-correction timers. Both are idempotent.
pub fn spawn_timers(handle: EngineHandle, driver: Arc<dyn SessionDriver>) -> Vec<JoinHandle<()>> {
    let probe_task = tokio::spawn({
        let handle = handle.clone();
        async move {
            let cfg = handle.config.clone();
            let mut tick = tokio::time::interval(cfg.probe_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let found = session::probe(driver.as_ref(), cfg.probe_timeout).await;
                handle.report_probe(found);
            }
        }
    });

    let roster_task = tokio::spawn(async move {
        let period = handle.config.roster_sync_interval;
        let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            handle.sync_roster();
        }
    });

    vec![probe_task, roster_task]
}
