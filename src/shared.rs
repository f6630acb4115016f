//! State shared between the kiosk tasks.
//!
//! Everything long-lived is behind `&'static` references collected in
//! [`Ctx`]; tasks receive a copy of it at spawn time instead of reaching
//! for globals.

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use esp_hal::rng::Rng;

use crate::bus::BusController;
use crate::commands::CommandQueue;
use crate::config::{KioskConfig, Tuning, MAX_LOCKERS};
use crate::events::EventBuffer;
use crate::lockers::LockerTable;

/// Per-locker mutexes. An open holds its slot's mutex across the whole
/// hardware sequence so two in-flight opens on one slot cannot interleave;
/// the bus mutex below it still serializes the wire itself.
pub struct LockerLocks {
    locks: [Mutex<CriticalSectionRawMutex, ()>; MAX_LOCKERS],
}

impl LockerLocks {
    pub const fn new() -> Self {
        const LOCK: Mutex<CriticalSectionRawMutex, ()> = Mutex::new(());
        Self { locks: [LOCK; MAX_LOCKERS] }
    }

    /// Mutex for a locker id. Every entry surface validates ids against
    /// the provisioned range before they get here; the clamp makes an id
    /// that slipped through alias slot 1 instead of indexing out of
    /// bounds or underflowing on 0.
    pub fn for_locker(&self, id: u16) -> &Mutex<CriticalSectionRawMutex, ()> {
        let slot = id.clamp(1, MAX_LOCKERS as u16) as usize - 1;
        &self.locks[slot]
    }
}

/// Maintenance stop: the executor finishes its in-flight command and then
/// idles, and the bus controller closes the port and parks its health
/// timer, until the flag clears. Set from the staff surface.
pub static MAINTENANCE: AtomicBool = AtomicBool::new(false);

/// Wakes the bus health monitor on every flag change so it reacts
/// without waiting out its health interval.
static MAINTENANCE_CHANGED: Signal<CriticalSectionRawMutex, bool> = Signal::new();

pub fn set_maintenance(on: bool) {
    MAINTENANCE.store(on, Ordering::Release);
    MAINTENANCE_CHANGED.signal(on);
}

pub fn in_maintenance() -> bool {
    MAINTENANCE.load(Ordering::Acquire)
}

/// Wait for the next maintenance flag change. Single waiter: the bus
/// health monitor.
pub async fn maintenance_changed() -> bool {
    MAINTENANCE_CHANGED.wait().await
}

/// Handles every task needs, fixed at boot.
#[derive(Clone, Copy)]
pub struct Ctx {
    pub lockers: &'static Mutex<CriticalSectionRawMutex, LockerTable>,
    pub queue: &'static Mutex<CriticalSectionRawMutex, CommandQueue>,
    pub bus: &'static BusController,
    pub events: &'static EventBuffer,
    pub locks: &'static LockerLocks,
    /// Pulsed after every state mutation; the persistence task drains it.
    pub dirty: &'static Signal<CriticalSectionRawMutex, ()>,
    /// Pulsed to request an immediate dispatcher sync.
    pub sync_now: &'static Signal<CriticalSectionRawMutex, ()>,
    pub config: &'static KioskConfig,
    pub tuning: Tuning,
    pub rng: Rng,
}
