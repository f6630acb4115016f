//! Durable command queue with idempotent enqueue and at-most-once claims.
//!
//! Commands arrive from the dispatcher feed, the staff HTTP surface, and
//! the RFID scan flow; the executor drains them one at a time. The queue
//! is a bounded table: terminal rows are kept for status polling and
//! pruned oldest-first when space runs out.

use heapless::{String, Vec};

pub const MAX_COMMANDS: usize = 32;
pub const MAX_BULK: usize = 64;

pub type CommandId = String<24>;
pub type Actor = String<32>;
pub type ErrorText = String<64>;

/// How an open should leave the locker's ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    /// Reserved -> Owned once the latch opens (scan assignment).
    Assign,
    /// Owned or Reserved -> Free once the latch opens (pickup, end of day).
    Release,
    /// Open without touching ownership (staff inspecting a slot).
    StaffOverride,
}

impl OpenIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenIntent::Assign => "assign",
            OpenIntent::Release => "release",
            OpenIntent::StaffOverride => "staff_override",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    OpenLocker { locker: u16, intent: OpenIntent },
    BulkOpen { lockers: Vec<u16, MAX_BULK> },
    BlockLocker { locker: u16, reason: String<32> },
    UnblockLocker { locker: u16 },
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::OpenLocker { .. } => "open_locker",
            CommandKind::BulkOpen { .. } => "bulk_open",
            CommandKind::BlockLocker { .. } => "block_locker",
            CommandKind::UnblockLocker { .. } => "unblock_locker",
        }
    }

    /// True if every locker this command targets lies within the kiosk's
    /// provisioned range. Ids come from untrusted surfaces (HTTP queries,
    /// the dispatcher feed), so the queue refuses anything out of range.
    pub fn targets_in_range(&self, locker_count: u16) -> bool {
        let in_range = |id: u16| id >= 1 && id <= locker_count;
        match self {
            CommandKind::OpenLocker { locker, .. }
            | CommandKind::BlockLocker { locker, .. }
            | CommandKind::UnblockLocker { locker } => in_range(*locker),
            CommandKind::BulkOpen { lockers } => lockers.iter().copied().all(in_range),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub kind: CommandKind,
    pub actor: Actor,
    pub status: CommandStatus,
    pub retry_count: u32,
    pub next_attempt_at: u64,
    pub last_error: ErrorText,
    pub created_at: u64,
    pub executed_at: Option<u64>,
    pub completed_at: Option<u64>,
    /// Terminal outcome already delivered to the dispatcher.
    pub reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    /// The command targets a locker outside the provisioned range.
    InvalidLocker,
}

/// Terminal status of a command, for the dispatcher sync body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub id: CommandId,
    pub status: CommandStatus,
    pub error: ErrorText,
}

pub struct CommandQueue {
    commands: Vec<Command, MAX_COMMANDS>,
    max_retries: u32,
    locker_count: u16,
}

impl CommandQueue {
    pub fn new(max_retries: u32, locker_count: u16) -> Self {
        Self { commands: Vec::new(), max_retries, locker_count }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.id.as_str() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Replace the table from a persisted snapshot. Rows that were claimed
    /// when power was lost demote to Pending so they are re-claimed; the
    /// locker state machine's versioning keeps the re-run safe.
    pub fn restore(&mut self, rows: Vec<Command, MAX_COMMANDS>) {
        self.commands = rows;
        for cmd in self.commands.iter_mut() {
            if cmd.status == CommandStatus::Executing {
                cmd.status = CommandStatus::Pending;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Command, MAX_COMMANDS> {
        self.commands.clone()
    }

    /// Insert a new Pending command. A second enqueue with an id already in
    /// the table is a no-op returning the existing row's status; a command
    /// targeting a locker outside the provisioned range is refused.
    pub fn enqueue(
        &mut self,
        id: &str,
        kind: CommandKind,
        actor: &str,
        now_ms: u64,
    ) -> Result<CommandStatus, QueueError> {
        if let Some(existing) = self.get(id) {
            return Ok(existing.status);
        }
        if !kind.targets_in_range(self.locker_count) {
            return Err(QueueError::InvalidLocker);
        }
        if self.commands.is_full() {
            self.prune_one_terminal();
        }
        let mut cmd_id = CommandId::new();
        let _ = cmd_id.push_str(id);
        let mut cmd_actor = Actor::new();
        let _ = cmd_actor.push_str(actor);
        let cmd = Command {
            id: cmd_id,
            kind,
            actor: cmd_actor,
            status: CommandStatus::Pending,
            retry_count: 0,
            next_attempt_at: now_ms,
            last_error: ErrorText::new(),
            created_at: now_ms,
            executed_at: None,
            completed_at: None,
            reported: false,
        };
        self.commands.push(cmd).map_err(|_| QueueError::Full)?;
        Ok(CommandStatus::Pending)
    }

    /// Claim one due Pending command: the guarded conditional update that
    /// makes execution at-most-once. Returns a clone; the row transitions
    /// to Executing in place.
    pub fn claim_next(&mut self, now_ms: u64) -> Option<Command> {
        let cmd = self
            .commands
            .iter_mut()
            .filter(|c| c.status == CommandStatus::Pending && c.next_attempt_at <= now_ms)
            .min_by_key(|c| c.next_attempt_at)?;
        cmd.status = CommandStatus::Executing;
        cmd.executed_at = Some(now_ms);
        Some(cmd.clone())
    }

    /// Terminal transition to Completed or Failed. The detail string lands
    /// in `last_error` either way; for a completed bulk open it carries the
    /// per-locker outcome summary. Rows already terminal are left untouched.
    pub fn complete(&mut self, id: &str, outcome: Result<&str, &str>, now_ms: u64) {
        let Some(cmd) = self.commands.iter_mut().find(|c| c.id.as_str() == id) else {
            return;
        };
        if cmd.status.is_terminal() {
            return;
        }
        let detail = match outcome {
            Ok(detail) => {
                cmd.status = CommandStatus::Completed;
                detail
            }
            Err(error) => {
                cmd.status = CommandStatus::Failed;
                error
            }
        };
        cmd.completed_at = Some(now_ms);
        cmd.last_error = ErrorText::new();
        let _ = cmd.last_error.push_str(detail);
    }

    /// Put a claimed command back with a retry delay, or fail it once the
    /// retry budget is spent.
    pub fn reschedule(&mut self, id: &str, error: &str, backoff_ms: u64, now_ms: u64) {
        let Some(cmd) = self.commands.iter_mut().find(|c| c.id.as_str() == id) else {
            return;
        };
        if cmd.status.is_terminal() {
            return;
        }
        if cmd.retry_count >= self.max_retries {
            cmd.status = CommandStatus::Failed;
            cmd.completed_at = Some(now_ms);
            cmd.last_error = ErrorText::new();
            let _ = cmd.last_error.push_str("retry_budget_exhausted: ");
            let _ = cmd.last_error.push_str(error);
            return;
        }
        cmd.retry_count += 1;
        cmd.status = CommandStatus::Pending;
        cmd.next_attempt_at = now_ms + backoff_ms;
        cmd.last_error = ErrorText::new();
        let _ = cmd.last_error.push_str(error);
    }

    /// Pending -> Cancelled. Executing and terminal rows are not touched.
    pub fn cancel(&mut self, id: &str, now_ms: u64) -> bool {
        let Some(cmd) = self.commands.iter_mut().find(|c| c.id.as_str() == id) else {
            return false;
        };
        if cmd.status != CommandStatus::Pending {
            return false;
        }
        cmd.status = CommandStatus::Cancelled;
        cmd.completed_at = Some(now_ms);
        true
    }

    /// Terminal rows whose outcome the dispatcher has not yet acknowledged.
    pub fn unreported(&self) -> Vec<StatusUpdate, MAX_COMMANDS> {
        let mut out = Vec::new();
        for cmd in &self.commands {
            if cmd.status.is_terminal() && !cmd.reported {
                let _ = out.push(StatusUpdate {
                    id: cmd.id.clone(),
                    status: cmd.status,
                    error: cmd.last_error.clone(),
                });
            }
        }
        out
    }

    /// Mark the given updates as delivered.
    pub fn mark_reported(&mut self, updates: &[StatusUpdate]) {
        for update in updates {
            if let Some(cmd) = self
                .commands
                .iter_mut()
                .find(|c| c.id == update.id && c.status == update.status)
            {
                cmd.reported = true;
            }
        }
    }

    /// Drop the oldest reported terminal row, or failing that the oldest
    /// terminal row, to make room for a new command.
    fn prune_one_terminal(&mut self) {
        let pick = |reported_only: bool, commands: &Vec<Command, MAX_COMMANDS>| {
            commands
                .iter()
                .enumerate()
                .filter(|(_, c)| c.status.is_terminal() && (!reported_only || c.reported))
                .min_by_key(|(_, c)| c.completed_at.unwrap_or(0))
                .map(|(i, _)| i)
        };
        if let Some(i) = pick(true, &self.commands).or_else(|| pick(false, &self.commands)) {
            self.commands.swap_remove(i);
        }
    }
}
