use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use lodestone_agent::{
    command::Dispatch,
    config::AgentConfig,
    engine::{self, Engine, EngineHandle, StartOutcome, StopOutcome},
    lists,
    session::{MemorySession, SessionDriver},
};
use lodestone_process::{ListKind, ServerEvent, ServerState};
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    dir: TempDir,
    driver: MemorySession,
    handle: EngineHandle,
}

impl Harness {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir).await
    }

    async fn in_dir(dir: TempDir) -> Self {
        Self::configured(dir, |_| {}).await
    }

    async fn configured(dir: TempDir, tweak: impl FnOnce(&mut AgentConfig)) -> Self {
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/latest.log"), "").unwrap();

        let mut cfg = AgentConfig::for_dir(dir.path());
        cfg.password_sha256 = "0".repeat(64);
        cfg.probe_timeout = Duration::from_secs(1);
        cfg.tail_poll_interval = Duration::from_millis(10);
        cfg.attach_query_delay = Duration::from_millis(20);
        cfg.launch_confirm_delay = Duration::from_millis(20);
        cfg.rule_readback_delay = Duration::from_millis(20);
        cfg.list_refresh_delay = Duration::from_millis(10);
        cfg.history_max_lines = 50;
        tweak(&mut cfg);

        let driver = MemorySession::new();
        let engine = Engine::new(cfg, Arc::new(driver.clone())).await.unwrap();
        let (handle, _task) = engine.spawn();
        Self { dir, driver, handle }
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("logs/latest.log")
    }

    fn server_line(&self, text: &str) {
        append(&self.log_path(), &format!("[12:00:00] [Server thread/INFO]: {text}\n"));
    }

    async fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.handle.attach().await.unwrap().events
    }

    async fn state(&self) -> ServerState {
        self.handle.snapshot().await.unwrap().state
    }

    /// Attach to a pre-existing session and wait until lines are being followed.
    async fn running(&self) -> broadcast::Receiver<ServerEvent> {
        let mut events = self.events().await;
        self.driver.set_exists(true);
        self.handle.report_probe(true);
        next_matching(&mut events, |ev| {
            matches!(ev, ServerEvent::StateChanged { state: ServerState::Running })
        })
        .await;
        events
    }

    async fn history(&self) -> Vec<String> {
        self.handle
            .attach()
            .await
            .unwrap()
            .history
            .into_iter()
            .map(|l| l.text)
            .collect()
    }

    fn sent_count(&self, text: &str) -> usize {
        self.driver.sent().iter().filter(|s| *s == text).count()
    }

    async fn wait_sent(&self, text: &str) {
        let driver = self.driver.clone();
        let text = text.to_string();
        let wanted = text.clone();
        tokio::time::timeout(WAIT, async move {
            while !driver.sent().contains(&wanted) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{text:?} never reached the session"));
    }
}

fn append(path: &Path, text: &str) {
    let mut f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

async fn next_matching(
    rx: &mut broadcast::Receiver<ServerEvent>,
    pred: impl Fn(&ServerEvent) -> bool,
) -> ServerEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = rx.recv().await.unwrap();
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

fn is_log_line(ev: &ServerEvent, text: &str) -> bool {
    matches!(ev, ServerEvent::LogLine { line } if line.text == text)
}

fn players(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn takes_over_existing_session_and_queries_roster() {
    let h = Harness::new().await;
    let mut events = h.events().await;

    h.driver.set_exists(true);
    h.handle.report_probe(true);

    next_matching(&mut events, |ev| is_log_line(ev, engine::MSG_TAKEOVER)).await;
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Running })
    })
    .await;
    h.wait_sent("list").await;
    assert!(h.driver.created().is_empty());
}

#[tokio::test]
async fn stop_keeps_running_until_probe_misses() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    assert_eq!(h.handle.stop().await, StopOutcome::Sent);
    h.wait_sent("stop").await;
    assert_eq!(h.state().await, ServerState::Running);

    h.handle.report_probe(true);
    assert_eq!(h.state().await, ServerState::Running);

    h.driver.set_exists(false);
    h.handle.report_probe(false);
    next_matching(&mut events, |ev| is_log_line(ev, engine::MSG_LOST)).await;
    assert_eq!(h.state().await, ServerState::Stopped);
    assert_eq!(h.handle.stop().await, StopOutcome::NotRunning);
}

#[tokio::test]
async fn joins_then_snapshot_correct_roster() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    h.server_line("Steve joined the game");
    h.server_line("Alex joined the game");
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::RosterChanged { players: p } if *p == players(&["Alex", "Steve"]))
    })
    .await;

    h.server_line("There are 1 of a max of 20 players online: Alex");
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::RosterChanged { players: p } if *p == players(&["Alex"]))
    })
    .await;

    h.server_line("There are 0 of a max of 20 players online:");
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::RosterChanged { players: p } if p.is_empty())
    })
    .await;
    assert!(h.handle.snapshot().await.unwrap().players.is_empty());
}

#[tokio::test]
async fn losing_the_session_clears_roster() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    h.server_line("Steve joined the game");
    next_matching(&mut events, |ev| matches!(ev, ServerEvent::RosterChanged { .. })).await;

    h.driver.set_exists(false);
    h.handle.report_probe(false);
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::RosterChanged { players: p } if p.is_empty())
    })
    .await;
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Stopped })
    })
    .await;
}

#[tokio::test]
async fn unmatched_lines_still_reach_history() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    h.server_line("Preparing spawn area: 42%");
    let ev = next_matching(&mut events, |ev| matches!(ev, ServerEvent::LogLine { .. })).await;
    let ServerEvent::LogLine { line } = ev else {
        unreachable!()
    };
    assert!(line.text.ends_with("Preparing spawn area: 42%"));

    let attachment = h.handle.attach().await.unwrap();
    assert!(attachment.players.is_empty());
    assert_eq!(attachment.history.last().map(|l| l.text.clone()), Some(line.text));
}

#[tokio::test]
async fn history_is_seeded_from_durable_file() {
    let dir = tempfile::tempdir().unwrap();
    let body: String = (0..80).map(|i| format!("old line {i}\n")).collect();
    std::fs::write(dir.path().join("server_history.log"), body).unwrap();

    let h = Harness::in_dir(dir).await;
    let history = h.handle.attach().await.unwrap().history;
    assert_eq!(history.len(), 50);
    assert_eq!(history[0].text, "old line 30");
    assert_eq!(history[49].text, "old line 79");
    assert!(history.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[tokio::test]
async fn commands_are_gated_by_state_and_authorization() {
    let h = Harness::new().await;
    assert_eq!(h.handle.command("say hi", true).await, Dispatch::Rejected);
    assert!(h.driver.sent().is_empty());

    let mut events = h.running().await;
    assert_eq!(h.handle.command("say hi", false).await, Dispatch::Rejected);
    assert_eq!(h.handle.command("\r\n", true).await, Dispatch::Rejected);

    assert_eq!(h.handle.command("say hi", true).await, Dispatch::Sent);
    next_matching(&mut events, |ev| is_log_line(ev, "> say hi")).await;
    h.wait_sent("say hi").await;
}

#[tokio::test]
async fn set_rule_writes_then_reads_back() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    assert_eq!(
        h.handle.set_rule("keepInventory", "true", true).await,
        Dispatch::Sent
    );
    h.wait_sent("gamerule keepInventory true").await;
    h.wait_sent("gamerule keepInventory").await;
    let sent = h.driver.sent();
    let write = sent.iter().position(|s| s == "gamerule keepInventory true");
    let read = sent.iter().position(|s| s == "gamerule keepInventory");
    assert!(write < read);
    assert!(h.handle.attach().await.unwrap().rules.is_empty());
    next_matching(&mut events, |ev| is_log_line(ev, "> gamerule keepInventory")).await;
    let history = h.history().await;
    let echo_write = history.iter().position(|l| l == "> gamerule keepInventory true");
    let echo_read = history.iter().position(|l| l == "> gamerule keepInventory");
    assert!(echo_write.is_some() && echo_write < echo_read);

    h.server_line("Gamerule keepInventory is currently set to: true");
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::RuleValue { key, value } if key == "keepInventory" && value == "true")
    })
    .await;
    assert_eq!(
        h.handle.attach().await.unwrap().rules.get("keepInventory").map(String::as_str),
        Some("true")
    );
}

#[tokio::test]
async fn start_launches_and_confirms_by_probe() {
    let h = Harness::new().await;
    let mut events = h.events().await;

    assert_eq!(h.handle.start().await, StartOutcome::Launched);
    let created = h.driver.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].0, "java -Xms2G -Xmx6G -jar server.jar nogui");

    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Running })
    })
    .await;
    assert_eq!(h.handle.start().await, StartOutcome::AlreadyRunning);
    assert_eq!(h.driver.created().len(), 1);

    let history = h.handle.attach().await.unwrap().history;
    assert!(history.iter().any(|l| l.text == engine::MSG_STARTING));
    assert!(!history.iter().any(|l| l.text == engine::MSG_TAKEOVER));
}

#[tokio::test]
async fn start_reports_launch_failure() {
    let h = Harness::new().await;
    h.driver.fail_create(Some("screen: command not found"));

    let outcome = h.handle.start().await;
    assert!(matches!(outcome, StartOutcome::Failed(ref r) if r.contains("command not found")));
    assert_eq!(h.state().await, ServerState::Stopped);

    h.driver.fail_create(None);
    assert_eq!(h.handle.start().await, StartOutcome::Launched);
}

#[tokio::test]
async fn start_finds_session_already_running() {
    let h = Harness::new().await;
    h.driver.set_exists(true);

    assert_eq!(h.handle.start().await, StartOutcome::AlreadyRunning);
    assert!(h.driver.created().is_empty());
    assert_eq!(h.state().await, ServerState::Running);
}

#[tokio::test]
async fn list_refresh_publishes_full_contents() {
    let h = Harness::new().await;
    let mut events = h.events().await;

    std::fs::write(
        h.dir.path().join("whitelist.json"),
        r#"[{"uuid":"a","name":"Steve"},{"uuid":"b","name":"Alex"}]"#,
    )
    .unwrap();
    h.handle.refresh_list(ListKind::Whitelist);

    let ev = next_matching(&mut events, |ev| matches!(ev, ServerEvent::ExternalListChanged { .. })).await;
    assert_eq!(
        ev,
        ServerEvent::ExternalListChanged {
            list: ListKind::Whitelist,
            names: players(&["Steve", "Alex"]),
        }
    );
    assert_eq!(
        h.handle.attach().await.unwrap().lists[&ListKind::Whitelist],
        players(&["Steve", "Alex"])
    );
}

#[tokio::test]
async fn stop_while_stopped_leaves_history_alone() {
    let h = Harness::new().await;
    let before = h.history().await;
    assert_eq!(h.handle.stop().await, StopOutcome::NotRunning);
    assert_eq!(h.history().await, before);
    assert!(h.driver.sent().is_empty());
}

#[tokio::test]
async fn history_survives_attach_when_durable_writes_fail() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the history file's directory should be.
    std::fs::write(dir.path().join("blocker"), "").unwrap();
    let history_file = dir.path().join("blocker").join("server_history.log");
    let h = Harness::configured(dir, |cfg| cfg.history_file = history_file).await;

    h.handle.system_line("System: line A");
    h.handle.system_line("System: line B");
    assert_eq!(h.history().await, vec!["System: line A", "System: line B"]);

    h.running().await;
    assert_eq!(
        h.history().await,
        vec!["System: line A", "System: line B", engine::MSG_TAKEOVER]
    );
}

#[tokio::test]
async fn attach_reseeds_from_durable_file_when_writes_succeed() {
    let h = Harness::new().await;
    h.handle.system_line("System: line A");
    h.running().await;
    assert_eq!(h.history().await, vec!["System: line A", engine::MSG_TAKEOVER]);
}

#[tokio::test]
async fn commands_are_echoed_before_delivery() {
    let h = Harness::new().await;
    let mut events = h.running().await;

    assert_eq!(h.handle.command("gamerule doDaylightCycle", true).await, Dispatch::Sent);
    next_matching(&mut events, |ev| is_log_line(ev, "> gamerule doDaylightCycle")).await;
    h.wait_sent("gamerule doDaylightCycle").await;
}

#[tokio::test]
async fn own_launch_seen_by_session_timer_is_not_a_takeover() {
    let h = Harness::new().await;
    h.driver.delay_create(Duration::from_millis(200));
    let mut events = h.events().await;

    let start = tokio::spawn({
        let handle = h.handle.clone();
        async move { handle.start().await }
    });
    let driver = h.driver.clone();
    tokio::time::timeout(WAIT, async move {
        while driver.created().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    h.handle.report_probe(true);
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Running })
    })
    .await;

    assert_eq!(start.await.unwrap(), StartOutcome::Launched);
    let history = h.history().await;
    assert!(history.iter().any(|l| l == engine::MSG_STARTING));
    assert!(!history.iter().any(|l| l == engine::MSG_TAKEOVER));
}

#[tokio::test]
async fn start_announces_takeover_of_existing_session() {
    let h = Harness::new().await;
    h.driver.set_exists(true);

    assert_eq!(h.handle.start().await, StartOutcome::AlreadyRunning);
    let history = h.history().await;
    assert!(history.iter().any(|l| l == engine::MSG_TAKEOVER));
}

#[tokio::test(start_paused = true)]
async fn session_timer_notices_a_lost_session_within_one_interval() {
    let h = Harness::configured(tempfile::tempdir().unwrap(), |cfg| {
        cfg.probe_interval = Duration::from_secs(3);
        cfg.tail_poll_interval = Duration::from_secs(1);
    })
    .await;
    let mut events = h.events().await;
    h.driver.set_exists(true);
    let driver: Arc<dyn SessionDriver> = Arc::new(h.driver.clone());
    let _timers = engine::spawn_timers(h.handle.clone(), driver);

    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Running })
    })
    .await;

    h.driver.set_exists(false);
    let lost_at = tokio::time::Instant::now();
    next_matching(&mut events, |ev| {
        matches!(ev, ServerEvent::StateChanged { state: ServerState::Stopped })
    })
    .await;
    assert!(lost_at.elapsed() <= h.handle.config().probe_interval);
}

#[tokio::test(start_paused = true)]
async fn roster_timer_queries_list_periodically() {
    let h = Harness::configured(tempfile::tempdir().unwrap(), |cfg| {
        cfg.roster_sync_interval = Duration::from_secs(60);
        cfg.attach_query_delay = Duration::from_secs(1);
        cfg.tail_poll_interval = Duration::from_secs(1);
    })
    .await;
    h.driver.set_exists(true);
    let started = tokio::time::Instant::now();
    let driver: Arc<dyn SessionDriver> = Arc::new(h.driver.clone());
    let _timers = engine::spawn_timers(h.handle.clone(), driver);

    // One query shortly after attaching.
    h.wait_sent("list").await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.sent_count("list"), 1);

    tokio::time::timeout(Duration::from_secs(60), async {
        while h.sent_count("list") < 2 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn whitelist_edits_inside_window_publish_final_content_once() {
    let h = Harness::configured(tempfile::tempdir().unwrap(), |cfg| {
        cfg.list_debounce = Duration::from_secs(5);
    })
    .await;
    let mut events = h.events().await;
    let (tx, rx) = mpsc::unbounded_channel();
    let _debouncer = lists::spawn_debouncer(h.handle.config().list_debounce, rx, {
        let handle = h.handle.clone();
        move |kind| handle.refresh_list(kind)
    });

    let whitelist = h.dir.path().join("whitelist.json");
    std::fs::write(&whitelist, r#"[{"name":"Steve"}]"#).unwrap();
    tx.send(ListKind::Whitelist).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    std::fs::write(&whitelist, r#"[{"name":"Steve"},{"name":"Alex"}]"#).unwrap();
    tx.send(ListKind::Whitelist).unwrap();

    let ev = next_matching(&mut events, |ev| matches!(ev, ServerEvent::ExternalListChanged { .. })).await;
    assert_eq!(
        ev,
        ServerEvent::ExternalListChanged {
            list: ListKind::Whitelist,
            names: players(&["Steve", "Alex"]),
        }
    );

    let again = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if let ServerEvent::ExternalListChanged { .. } = events.recv().await.unwrap() {
                return;
            }
        }
    })
    .await;
    assert!(again.is_err());
}
