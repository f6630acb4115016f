//! RFID scan flow: one card, one locker.
//!
//! A scan either opens the locker the card already holds (and releases
//! it), or reserves the first free slot and opens it as an assignment.
//! The flow only mutates state through the State Manager and never drives
//! the bus itself; the hardware sequence runs through the command queue
//! like every other open, so retries and status reporting come for free.

use core::fmt::Write as FmtWrite;

use embassy_time::{Instant, Timer};
use heapless::String;

use crate::commands::{CommandKind, OpenIntent};
use crate::events::{EventKind, LockerEvent};
use crate::lockers::{OwnerType, StateError};
use crate::shared::Ctx;
use crate::wiegand::{CardRead, Wiegand};

/// Ignore re-reads of the same card inside this window; readers repeat
/// the frame while the card sits on the antenna.
const REPEAT_WINDOW_MS: u64 = 2_000;

/// FNV-1a, the credential hash. The raw UID never leaves this module.
fn fnv1a(read: &CardRead) -> u32 {
    let mut hash = 0x811C_9DC5u32;
    for byte in read.value.to_le_bytes().iter().chain(&[read.bits]) {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Owner key for a card: `rfid:` plus the hashed UID.
fn owner_key(read: &CardRead) -> String<32> {
    let mut key = String::new();
    let _ = write!(key, "rfid:{:08x}", fnv1a(read));
    key
}

/// Reader task: poll the Wiegand lines forever and run the scan flow for
/// each validated read.
pub async fn run_reader(mut reader: Wiegand<'static>, ctx: Ctx) -> ! {
    let mut last: Option<(u32, u64)> = None;

    loop {
        let Some(read) = reader.read().await else { continue };
        let now = Instant::now().as_millis();
        let hash = fnv1a(&read);

        if let Some((prev_hash, prev_at)) = last {
            if prev_hash == hash && now.saturating_sub(prev_at) < REPEAT_WINDOW_MS {
                continue;
            }
        }
        last = Some((hash, now));

        log::info!("rfid: scan {:08x} ({} bits)", hash, read.bits);
        handle_scan(&ctx, &read, now).await;

        // Let the executor work the open before the next frame repeats.
        Timer::after_millis(50).await;
    }
}

async fn handle_scan(ctx: &Ctx, read: &CardRead, now: u64) {
    let key = owner_key(read);

    // Holding the table lock across both the lookup and the reserve keeps
    // the one-card-one-locker check atomic against a racing dispatcher.
    let action = {
        let mut lockers = ctx.lockers.lock().await;

        let held = lockers.find_by_owner(OwnerType::Rfid, key.as_str()).map(|l| l.id);
        match held {
            Some(id) => Some((id, OpenIntent::Release, None)),
            None => match lockers.list_available().first() {
                None => None,
                Some(&id) => {
                    let version = lockers.get(id).map(|l| l.version).unwrap_or(0);
                    match lockers.reserve(id, OwnerType::Rfid, key.as_str(), version, now) {
                        Ok(new_version) => Some((id, OpenIntent::Assign, Some(new_version))),
                        Err(StateError::OwnerAlreadyHoldsLocker) => {
                            // Lost a race with our own earlier scan; the
                            // held locker will be found on the next read.
                            log::warn!("rfid: reserve raced, card already holds a locker");
                            None
                        }
                        Err(e) => {
                            log::warn!("rfid: reserve({}) failed: {:?}", id, e);
                            None
                        }
                    }
                }
            },
        }
    };

    let Some((locker, intent, reserved)) = action else {
        log::warn!("rfid: no locker for card {}", key);
        return;
    };

    if reserved.is_some() {
        ctx.events
            .push(LockerEvent::new(now, EventKind::Reserve, locker, key.as_str(), ""))
            .await;
        ctx.dirty.signal(());
    }

    // Command ids only need to be unique; the boot-relative timestamp is
    // enough since scans are human-paced.
    let mut id: String<24> = String::new();
    let _ = write!(id, "rfid-{}-{}", locker, now);
    let kind = CommandKind::OpenLocker { locker, intent };

    let result = ctx.queue.lock().await.enqueue(id.as_str(), kind, key.as_str(), now);
    match result {
        Ok(_) => ctx.dirty.signal(()),
        Err(e) => log::error!("rfid: enqueue failed: {:?}", e),
    }
}
