use lodestone_process::ServerState;

/// Belief about the session, changed only by probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Stopped,
    /// `attach` identifies the current line source; lines tagged with an older value are stale.
    Running { attach: u64 },
}

/// Progress of a launch this process requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaunchPhase {
    #[default]
    Idle,
    /// Probe/create in flight.
    Launching,
    /// Create succeeded; waiting for a probe to see the session.
    Launched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Session found while stopped. `takeover` is set when this process did not launch it.
    Attached { generation: u64, takeover: bool },
    /// Session disappeared while running.
    Lost,
    /// A launched session was never seen by the confirmation probe.
    LaunchVanished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchRefusal {
    AlreadyRunning,
    AlreadyStarting,
}

#[derive(Debug, Default)]
pub struct Supervisor {
    phase: Phase,
    launch: LaunchPhase,
    generation: u64,
}

impl Supervisor {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn launch_phase(&self) -> LaunchPhase {
        self.launch
    }

    pub fn state(&self) -> ServerState {
        match self.phase {
            Phase::Stopped => ServerState::Stopped,
            Phase::Running { .. } => ServerState::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// Whether a line from the source with `generation` belongs to the current attachment.
    pub fn is_current(&self, generation: u64) -> bool {
        matches!(self.phase, Phase::Running { attach } if attach == generation)
    }

    pub fn on_probe(&mut self, found: bool) -> Transition {
        match (self.phase, found) {
            (Phase::Stopped, true) => {
                self.generation = self.generation.wrapping_add(1);
                // Found while our own launch is in flight or awaiting confirmation.
                let takeover = self.launch == LaunchPhase::Idle;
                self.phase = Phase::Running {
                    attach: self.generation,
                };
                if self.launch == LaunchPhase::Launched {
                    self.launch = LaunchPhase::Idle;
                }
                Transition::Attached {
                    generation: self.generation,
                    takeover,
                }
            }
            (Phase::Running { .. }, false) => {
                self.phase = Phase::Stopped;
                Transition::Lost
            }
            (Phase::Stopped, false) if self.launch == LaunchPhase::Launched => {
                self.launch = LaunchPhase::Idle;
                Transition::LaunchVanished
            }
            _ => Transition::None,
        }
    }

    pub fn on_launch_requested(&mut self) -> Result<(), LaunchRefusal> {
        if self.is_running() {
            return Err(LaunchRefusal::AlreadyRunning);
        }
        if self.launch != LaunchPhase::Idle {
            return Err(LaunchRefusal::AlreadyStarting);
        }
        self.launch = LaunchPhase::Launching;
        Ok(())
    }

    /// The pre-launch probe found a session, so nothing was created.
    pub fn on_launch_skipped(&mut self) {
        if self.launch == LaunchPhase::Launching {
            self.launch = LaunchPhase::Idle;
        }
    }

    pub fn on_launch_finished(&mut self, ok: bool) {
        if self.launch != LaunchPhase::Launching {
            return;
        }
        self.launch = if ok && !self.is_running() {
            LaunchPhase::Launched
        } else {
            LaunchPhase::Idle
        };
    }
}
