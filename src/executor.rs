//! Command executor: drains the queue and orchestrates the state manager
//! and bus controller.
//!
//! One executor per kiosk. A claimed command runs to a terminal outcome or
//! is rescheduled with backoff; the error's classification decides which.
//! State preconditions are checked and the Opening pseudo-state entered
//! under the per-locker mutex before any bus traffic, so a slot can never
//! see two interleaved hardware sequences.

use core::fmt::Write as FmtWrite;

use embassy_time::{Instant, Timer};
use heapless::Vec;

use crate::commands::{Command, CommandKind, ErrorText, OpenIntent, MAX_BULK};
use crate::config::backoff_ms;
use crate::events::{EventKind, LockerEvent};
use crate::lockers::{LockerStatus, OpenOutcome, StateError};
use crate::modbus;
use crate::shared::{in_maintenance, Ctx};

/// Sleep between claim attempts when the queue is empty.
const IDLE_POLL_MS: u64 = 100;
/// Reservation janitor cadence.
const JANITOR_INTERVAL_MS: u64 = 5_000;

/// Why a command did not complete, split the way the reschedule decision
/// needs it.
enum ExecError {
    /// Transient (bus trouble, lost version race): reschedule with backoff.
    Retry(ErrorText),
    /// Contract violation: fail immediately, retrying cannot help.
    Permanent(ErrorText),
}

fn text(prefix: &str, detail: &str) -> ErrorText {
    let mut out = ErrorText::new();
    let _ = out.push_str(prefix);
    let _ = out.push_str(detail);
    out
}

fn state_error(e: StateError) -> ExecError {
    match e {
        StateError::VersionConflict => ExecError::Retry(text("failed_state: ", e.as_str())),
        StateError::NotFound => ExecError::Permanent(text("failed_permanent: ", e.as_str())),
        _ => ExecError::Permanent(text("failed_state: ", e.as_str())),
    }
}

fn bus_error(e: crate::bus::BusError) -> ExecError {
    ExecError::Retry(text("failed_hardware: ", e.as_str()))
}

/// Executor loop. Claims one due command at a time, dispatches it, and
/// records the outcome.
pub async fn run_executor(ctx: Ctx) -> ! {
    log::info!("executor: started for kiosk {}", ctx.config.kiosk_id);
    loop {
        if in_maintenance() {
            Timer::after_millis(IDLE_POLL_MS * 5).await;
            continue;
        }

        let now = Instant::now().as_millis();
        let claimed = ctx.queue.lock().await.claim_next(now);
        let Some(cmd) = claimed else {
            Timer::after_millis(IDLE_POLL_MS).await;
            continue;
        };

        log::info!("executor: {} {} (retry {})", cmd.kind.as_str(), cmd.id, cmd.retry_count);
        let outcome = dispatch(&ctx, &cmd).await;

        let now = Instant::now().as_millis();
        let terminal = {
            let mut queue = ctx.queue.lock().await;
            match outcome {
                Ok(detail) => {
                    queue.complete(&cmd.id, Ok(detail.as_str()), now);
                    true
                }
                Err(ExecError::Permanent(error)) => {
                    log::warn!("executor: {} failed: {}", cmd.id, error);
                    queue.complete(&cmd.id, Err(error.as_str()), now);
                    true
                }
                Err(ExecError::Retry(error)) => {
                    log::warn!("executor: {} rescheduled: {}", cmd.id, error);
                    let mut rng = ctx.rng;
                    queue.reschedule(
                        &cmd.id,
                        error.as_str(),
                        backoff_ms(cmd.retry_count, rng.random()),
                        now,
                    );
                    // The row may still have gone terminal on budget
                    // exhaustion; the periodic sync round reports it.
                    false
                }
            }
        };
        ctx.dirty.signal(());
        if terminal {
            // Let the dispatcher see the outcome without waiting for the
            // next periodic round.
            ctx.sync_now.signal(());
        }
    }
}

async fn dispatch(ctx: &Ctx, cmd: &Command) -> Result<ErrorText, ExecError> {
    match &cmd.kind {
        CommandKind::OpenLocker { locker, intent } => {
            open_one(ctx, *locker, *intent, cmd.actor.as_str()).await?;
            Ok(ErrorText::new())
        }
        CommandKind::BulkOpen { lockers } => bulk_open(ctx, lockers, cmd.actor.as_str()).await,
        CommandKind::BlockLocker { locker, reason } => {
            let result = ctx.lockers.lock().await.block(*locker, reason.as_str());
            match result {
                Ok(_) => {
                    push_event(ctx, EventKind::Block, *locker, cmd.actor.as_str(), reason.as_str())
                        .await;
                    ctx.dirty.signal(());
                    Ok(ErrorText::new())
                }
                Err(e) => Err(state_error(e)),
            }
        }
        CommandKind::UnblockLocker { locker } => {
            let result = ctx.lockers.lock().await.unblock(*locker);
            match result {
                Ok(_) => {
                    push_event(ctx, EventKind::Unblock, *locker, cmd.actor.as_str(), "").await;
                    ctx.dirty.signal(());
                    Ok(ErrorText::new())
                }
                Err(e) => Err(state_error(e)),
            }
        }
    }
}

fn is_staff(actor: &str) -> bool {
    actor.starts_with("staff")
}

/// Open one locker: validate, enter Opening, run the hardware sequence,
/// then land in the state the intent dictates.
async fn open_one(ctx: &Ctx, id: u16, intent: OpenIntent, actor: &str) -> Result<(), ExecError> {
    // The queue refuses out-of-range ids, but a restored flash record
    // predating that check could still carry one; never let it pick a
    // slot mutex or reach the bus.
    if id == 0 || id > ctx.config.locker_count {
        return Err(state_error(StateError::NotFound));
    }
    let _slot = ctx.locks.for_locker(id).lock().await;

    let (version, on_success) = {
        let mut lockers = ctx.lockers.lock().await;
        let locker = lockers.get(id).ok_or_else(|| state_error(StateError::NotFound))?;
        let status = locker.status;
        let version = locker.version;

        let on_success = match intent {
            OpenIntent::Assign => match status {
                LockerStatus::Reserved | LockerStatus::Opening => OpenOutcome::AssignOwned,
                LockerStatus::Blocked => return Err(state_error(StateError::Blocked)),
                _ => return Err(state_error(StateError::NotFree)),
            },
            OpenIntent::Release => match status {
                LockerStatus::Owned | LockerStatus::Reserved | LockerStatus::Opening => {
                    OpenOutcome::ReleaseFree
                }
                LockerStatus::Free if is_staff(actor) => OpenOutcome::RevertPrior,
                LockerStatus::Blocked => return Err(state_error(StateError::Blocked)),
                _ => return Err(state_error(StateError::NotOwned)),
            },
            OpenIntent::StaffOverride => match status {
                LockerStatus::Blocked => return Err(state_error(StateError::Blocked)),
                _ => OpenOutcome::RevertPrior,
            },
        };

        // A row already in Opening is a crash leftover from a previous
        // attempt of this same command; adopt it instead of re-entering.
        let version = if status == LockerStatus::Opening {
            version
        } else {
            lockers.open_start(id, version).map_err(state_error)?
        };
        (version, on_success)
    };

    push_event(ctx, EventKind::OpenAttempt, id, actor, intent.as_str()).await;
    ctx.dirty.signal(());

    let (slave, channel) = modbus::locker_to_channel(id);
    let opened = ctx.bus.open_channel(slave, channel).await;

    let now = Instant::now().as_millis();
    let finish = match &opened {
        Ok(_) => on_success,
        Err(_) => OpenOutcome::RevertPrior,
    };
    {
        let mut lockers = ctx.lockers.lock().await;
        if let Err(e) = lockers.finish_open(id, version, finish, now) {
            // Should not happen while we hold the slot mutex; surface it
            // as a retry so the command refetches fresh state.
            log::error!("executor: finish_open({}) failed: {:?}", id, e);
            return Err(state_error(e));
        }
    }
    ctx.dirty.signal(());

    match opened {
        Ok(_) => {
            push_event(ctx, EventKind::OpenSuccess, id, actor, "").await;
            match on_success {
                OpenOutcome::AssignOwned => {
                    push_event(ctx, EventKind::Assign, id, actor, "").await
                }
                OpenOutcome::ReleaseFree => {
                    push_event(ctx, EventKind::Release, id, actor, "").await
                }
                OpenOutcome::RevertPrior => {}
            }
            Ok(())
        }
        Err(e) => {
            push_event(ctx, EventKind::OpenFailed, id, actor, e.as_str()).await;
            if e == crate::bus::BusError::Unavailable {
                push_event(ctx, EventKind::HardwareUnavailable, id, actor, "").await;
            }
            Err(bus_error(e))
        }
    }
}

/// Sequentially open a list of lockers, skipping VIP and Blocked slots.
/// The command completes if the sweep ran; per-locker results land in the
/// outcome summary.
async fn bulk_open(
    ctx: &Ctx,
    list: &Vec<u16, MAX_BULK>,
    actor: &str,
) -> Result<ErrorText, ExecError> {
    let mut opened = 0u16;
    let mut failed = 0u16;
    let mut skipped: Vec<u16, MAX_BULK> = Vec::new();
    let mut first = true;

    for &id in list {
        if !first {
            Timer::after_millis(ctx.tuning.bulk_interval_ms).await;
        }
        first = false;

        let intent = {
            let lockers = ctx.lockers.lock().await;
            match lockers.get(id) {
                None => {
                    let _ = skipped.push(id);
                    continue;
                }
                Some(l) if l.is_vip || l.status == LockerStatus::Blocked => {
                    let _ = skipped.push(id);
                    continue;
                }
                Some(l) => match l.status {
                    LockerStatus::Owned | LockerStatus::Reserved => OpenIntent::Release,
                    _ => OpenIntent::StaffOverride,
                },
            }
        };

        match open_one(ctx, id, intent, actor).await {
            Ok(()) => opened += 1,
            Err(_) => failed += 1,
        }
    }

    let mut summary = ErrorText::new();
    let _ = write!(summary, "opened={} failed={} skipped=[", opened, failed);
    for (i, id) in skipped.iter().enumerate() {
        if i > 0 {
            let _ = summary.push(',');
        }
        let _ = write!(summary, "{}", id);
    }
    let _ = summary.push(']');
    log::info!("executor: bulk open done: {}", summary);
    Ok(summary)
}

async fn push_event(ctx: &Ctx, kind: EventKind, locker: u16, actor: &str, detail: &str) {
    ctx.events
        .push(LockerEvent::new(Instant::now().as_millis(), kind, locker, actor, detail))
        .await;
}

/// Reservation janitor: returns Reserved slots older than the TTL to Free.
/// Doubles as the liveness task that feeds the watchdog.
pub async fn run_janitor(ctx: Ctx) -> ! {
    loop {
        Timer::after_millis(JANITOR_INTERVAL_MS).await;
        crate::feed_watchdog();

        let now = Instant::now().as_millis();
        let expired = ctx.lockers.lock().await.expire_stale_reservations(now);
        if expired.is_empty() {
            continue;
        }
        log::info!("janitor: expired {} stale reservations", expired.len());
        for &id in &expired {
            push_event(&ctx, EventKind::Expired, id, "janitor", "").await;
        }
        ctx.dirty.signal(());
    }
}
