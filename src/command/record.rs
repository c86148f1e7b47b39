//! Command records and their lifecycle.
//!
//! A record moves through `NoExecute -> Executing -> Completed | Error`. A command
//! rejected before execution can go straight from `NoExecute` to `Error`. The
//! transitions are driven by a [`StateMachine`] whose edge callbacks stamp the
//! record's timestamps, so a record can never be in `Completed` without a
//! completion time.

use super::Command;
use crate::core::elapsed_ms;
use crate::fsm::StateMachine;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Execution status of a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Accepted, waiting for its device worker.
    #[default]
    NoExecute,
    /// Running on the device.
    Executing,
    /// Finished successfully.
    Completed,
    /// Failed, timed out or was abandoned.
    Error,
}

impl CommandStatus {
    /// True for `Completed` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Error)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::NoExecute => "no_execute",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// Tracked state of one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// The command being tracked.
    pub command: Command,
    /// Current status.
    pub status: CommandStatus,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When execution began.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended (Completed or Error only).
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure text for `Error`.
    pub error_message: Option<String>,
}

impl CommandRecord {
    /// New record in `NoExecute`.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            status: CommandStatus::NoExecute,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// Milliseconds between start and completion; `None` until both are set.
    pub fn execution_duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(elapsed_ms(start, end)),
            _ => None,
        }
    }
}

/// A record together with the state machine that drives it.
pub struct TrackedCommand {
    record: Arc<RwLock<CommandRecord>>,
    fsm: StateMachine<CommandStatus>,
}

impl fmt::Debug for TrackedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedCommand")
            .field("record", &*self.record.read())
            .finish()
    }
}

impl TrackedCommand {
    /// Creates the record and registers the lifecycle edges.
    pub fn new(command: Command) -> Self {
        let record = Arc::new(RwLock::new(CommandRecord::new(command)));
        let fsm = StateMachine::named("command", CommandStatus::NoExecute);

        let r = Arc::clone(&record);
        fsm.add_transition_with(CommandStatus::NoExecute, CommandStatus::Executing, move |_, to| {
            let mut record = r.write();
            record.started_at = Some(Utc::now());
            record.status = to;
        });

        for (from, to) in [
            (CommandStatus::Executing, CommandStatus::Completed),
            (CommandStatus::Executing, CommandStatus::Error),
            (CommandStatus::NoExecute, CommandStatus::Error),
        ] {
            let r = Arc::clone(&record);
            fsm.add_transition_with(from, to, move |_, to| {
                let mut record = r.write();
                let now = Utc::now();
                record.completed_at = Some(record.started_at.map_or(now, |start| now.max(start)));
                record.status = to;
            });
        }

        Self { record, fsm }
    }

    /// `NoExecute -> Executing`.
    pub fn begin(&self) -> bool {
        self.fsm.try_transition(CommandStatus::Executing)
    }

    /// `Executing -> Completed`.
    pub fn complete(&self) -> bool {
        self.fsm.try_transition(CommandStatus::Completed)
    }

    /// `Executing | NoExecute -> Error`, storing `message`.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        if !self.fsm.can_transition(CommandStatus::Error) {
            return false;
        }
        self.record.write().error_message = Some(message.into());
        self.fsm.try_transition(CommandStatus::Error)
    }

    /// Current status.
    pub fn status(&self) -> CommandStatus {
        self.fsm.state()
    }

    /// Copy of the record.
    pub fn snapshot(&self) -> CommandRecord {
        self.record.read().clone()
    }

    /// The tracked command.
    pub fn command(&self) -> Command {
        self.record.read().command.clone()
    }
}
