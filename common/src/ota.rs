//! Remote firmware update hooks.
//!
//! The updater itself is platform code; this module owns the lifecycle
//! handler it reports to and the contract for polling it from the main loop.

use core::fmt;
use std::collections::VecDeque;

use log::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateError {
    Auth,
    Begin,
    Connect,
    Receive,
    End,
}

impl UpdateError {
    pub fn code(self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::Begin => 1,
            Self::Connect => 2,
            Self::Receive => 3,
            Self::End => 4,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Auth => "Auth Failed",
            Self::Begin => "Begin Failed",
            Self::Connect => "Connect Failed",
            Self::Receive => "Receive Failed",
            Self::End => "End Failed",
        }
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

pub trait UpdateHandler {
    fn on_start(&mut self);
    fn on_progress(&mut self, progress: u64, total: u64);
    fn on_end(&mut self);
    fn on_error(&mut self, error: UpdateError);
}

/// Passive update listener. `handle` must be called every loop iteration;
/// an update session only advances while it is being polled.
pub trait UpdateService {
    type Error: fmt::Display;

    fn begin(&mut self) -> Result<(), Self::Error>;
    fn handle(&mut self, handler: &mut dyn UpdateHandler);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    #[default]
    Idle,
    InProgress {
        percent: u8,
    },
    Finished,
    Failed(UpdateError),
}

/// Reports update lifecycle events to the console.
#[derive(Debug, Default)]
pub struct ConsoleUpdateHandler {
    phase: UpdatePhase,
}

impl ConsoleUpdateHandler {
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }
}

fn percent_of(progress: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = progress.saturating_mul(100) / total;
    u8::try_from(pct.min(100)).unwrap_or(100)
}

impl UpdateHandler for ConsoleUpdateHandler {
    fn on_start(&mut self) {
        info!("Start");
        self.phase = UpdatePhase::InProgress { percent: 0 };
    }

    fn on_progress(&mut self, progress: u64, total: u64) {
        let percent = percent_of(progress, total);
        if self.phase != (UpdatePhase::InProgress { percent }) {
            info!("Progress: {percent}%");
        }
        self.phase = UpdatePhase::InProgress { percent };
    }

    fn on_end(&mut self) {
        info!("End");
        self.phase = UpdatePhase::Finished;
    }

    fn on_error(&mut self, error: UpdateError) {
        error!("Error[{}]: {}", error.code(), error);
        self.phase = UpdatePhase::Failed(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEvent {
    Started,
    Progress { written: u64, total: u64 },
    Finished,
    Failed(UpdateError),
}

/// Update lifecycle recorded by a receiver running off the main loop.
///
/// The receiver records into the journal as the image arrives; the main loop
/// calls [`UpdateJournal::replay`] once per iteration so handler hooks always
/// fire on the loop thread. Progress is recorded once per whole percent.
#[derive(Debug, Default)]
pub struct UpdateJournal {
    in_progress: bool,
    last_percent: Option<u8>,
    events: VecDeque<UpdateEvent>,
}

impl UpdateJournal {
    /// Opens a session. Returns false while another one is still running.
    pub fn try_start(&mut self) -> bool {
        if self.in_progress {
            return false;
        }
        self.in_progress = true;
        self.last_percent = None;
        self.events.push_back(UpdateEvent::Started);
        true
    }

    pub fn progress(&mut self, written: u64, total: u64) {
        let percent = percent_of(written, total);
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        self.events.push_back(UpdateEvent::Progress { written, total });
    }

    pub fn finish(&mut self) {
        self.in_progress = false;
        self.events.push_back(UpdateEvent::Finished);
    }

    pub fn fail(&mut self, error: UpdateError) {
        self.in_progress = false;
        self.events.push_back(UpdateEvent::Failed(error));
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Delivers pending events in order. Returns true when a completed image
    /// was among them.
    pub fn replay(&mut self, handler: &mut dyn UpdateHandler) -> bool {
        let mut finished = false;
        while let Some(event) = self.events.pop_front() {
            match event {
                UpdateEvent::Started => handler.on_start(),
                UpdateEvent::Progress { written, total } => handler.on_progress(written, total),
                UpdateEvent::Finished => {
                    handler.on_end();
                    finished = true;
                }
                UpdateEvent::Failed(error) => handler.on_error(error),
            }
        }
        finished
    }
}
