//! Per-locker state machine with optimistic versioning.
//!
//! The table is the single authority on locker state; nothing else mutates
//! it and it never touches the bus. Every mutation is conditional on the
//! caller's `expected_version` and bumps the version on success, so two
//! actors racing on one slot resolve to exactly one winner.
//!
//! Timestamps are milliseconds since boot, passed in by callers; the table
//! itself never reads a clock.

use heapless::{String, Vec};

use crate::config::{in_id_list, MAX_LOCKERS};

pub type OwnerKey = String<32>;
pub type BlockReason = String<32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerStatus {
    Free,
    Reserved,
    Owned,
    Opening,
    Blocked,
}

impl LockerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockerStatus::Free => "free",
            LockerStatus::Reserved => "reserved",
            LockerStatus::Owned => "owned",
            LockerStatus::Opening => "opening",
            LockerStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerType {
    Rfid,
    Device,
    Vip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub kind: OwnerType,
    pub key: OwnerKey,
}

/// One physical slot. Rows are created at provisioning and never removed;
/// only status, owner, timestamps, and version mutate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locker {
    pub id: u16,
    pub status: LockerStatus,
    pub owner: Option<Owner>,
    pub reserved_at: Option<u64>,
    pub owned_at: Option<u64>,
    pub version: u32,
    pub is_vip: bool,
    pub block_reason: BlockReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    NotFound,
    NotFree,
    NotOwned,
    Blocked,
    OwnerAlreadyHoldsLocker,
    VersionConflict,
}

impl StateError {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateError::NotFound => "not_found",
            StateError::NotFree => "not_free",
            StateError::NotOwned => "not_owned",
            StateError::Blocked => "blocked",
            StateError::OwnerAlreadyHoldsLocker => "owner_already_holds_locker",
            StateError::VersionConflict => "version_conflict",
        }
    }
}

/// What the caller wants the slot to look like once an open completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Assign-open succeeded: Reserved becomes Owned.
    AssignOwned,
    /// Release-open succeeded: the slot returns to Free, owner cleared.
    ReleaseFree,
    /// Staff peek or a failed open: fall back to whatever the slot was
    /// before `open_start`.
    RevertPrior,
}

pub struct LockerTable {
    lockers: Vec<Locker, MAX_LOCKERS>,
    reserve_ttl_ms: u64,
}

impl LockerTable {
    /// Provision `count` rows, flagging the ids named in `vip_list`
    /// (comma-separated) as VIP.
    pub fn new(count: u16, vip_list: &str, reserve_ttl_ms: u64) -> Self {
        let mut lockers = Vec::new();
        for id in 1..=count.min(MAX_LOCKERS as u16) {
            let _ = lockers.push(Locker {
                id,
                status: LockerStatus::Free,
                owner: None,
                reserved_at: None,
                owned_at: None,
                version: 0,
                is_vip: in_id_list(vip_list, id),
                block_reason: String::new(),
            });
        }
        Self { lockers, reserve_ttl_ms }
    }

    pub fn len(&self) -> usize {
        self.lockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lockers.is_empty()
    }

    pub fn get(&self, id: u16) -> Option<&Locker> {
        self.lockers.iter().find(|l| l.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Locker> {
        self.lockers.iter()
    }

    /// Replace all rows from a persisted snapshot. Boot-time only.
    pub fn restore(&mut self, rows: Vec<Locker, MAX_LOCKERS>) {
        self.lockers = rows;
    }

    pub fn snapshot(&self) -> Vec<Locker, MAX_LOCKERS> {
        self.lockers.clone()
    }

    /// Free, non-VIP lockers in id order.
    pub fn list_available(&self) -> Vec<u16, MAX_LOCKERS> {
        let mut out = Vec::new();
        for l in &self.lockers {
            if l.status == LockerStatus::Free && !l.is_vip {
                let _ = out.push(l.id);
            }
        }
        out
    }

    /// The locker this owner currently holds (Reserved or Owned), if any.
    /// Backs both the "one card, one locker" check and the scan flow's
    /// "already holds one, open it instead" branch.
    pub fn find_by_owner(&self, kind: OwnerType, key: &str) -> Option<&Locker> {
        self.lockers.iter().find(|l| {
            matches!(l.status, LockerStatus::Reserved | LockerStatus::Owned)
                && l.owner
                    .as_ref()
                    .is_some_and(|o| o.kind == kind && o.key.as_str() == key)
        })
    }

    fn checked(&mut self, id: u16, expected_version: u32) -> Result<&mut Locker, StateError> {
        let locker = self
            .lockers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StateError::NotFound)?;
        if locker.version != expected_version {
            return Err(StateError::VersionConflict);
        }
        Ok(locker)
    }

    /// Free -> Reserved. Rejects VIP slots and enforces that an RFID owner
    /// holds at most one locker in the kiosk.
    pub fn reserve(
        &mut self,
        id: u16,
        kind: OwnerType,
        key: &str,
        expected_version: u32,
        now_ms: u64,
    ) -> Result<u32, StateError> {
        if kind == OwnerType::Rfid && self.find_by_owner(kind, key).is_some() {
            return Err(StateError::OwnerAlreadyHoldsLocker);
        }
        let locker = self.checked(id, expected_version)?;
        match locker.status {
            LockerStatus::Free => {}
            LockerStatus::Blocked => return Err(StateError::Blocked),
            _ => return Err(StateError::NotFree),
        }
        if locker.is_vip {
            return Err(StateError::NotFree);
        }
        let mut owner_key = OwnerKey::new();
        let _ = owner_key.push_str(key);
        locker.status = LockerStatus::Reserved;
        locker.owner = Some(Owner { kind, key: owner_key });
        locker.reserved_at = Some(now_ms);
        locker.owned_at = None;
        locker.version += 1;
        Ok(locker.version)
    }

    /// Reserved -> Owned.
    pub fn confirm_ownership(
        &mut self,
        id: u16,
        expected_version: u32,
        now_ms: u64,
    ) -> Result<u32, StateError> {
        let locker = self.checked(id, expected_version)?;
        match locker.status {
            LockerStatus::Reserved => {}
            LockerStatus::Blocked => return Err(StateError::Blocked),
            _ => return Err(StateError::NotOwned),
        }
        locker.status = LockerStatus::Owned;
        locker.owned_at = Some(now_ms);
        locker.version += 1;
        Ok(locker.version)
    }

    /// Owned or Reserved -> Free, owner fields cleared.
    pub fn release(&mut self, id: u16, expected_version: u32) -> Result<u32, StateError> {
        let locker = self.checked(id, expected_version)?;
        match locker.status {
            LockerStatus::Owned | LockerStatus::Reserved => {}
            LockerStatus::Blocked => return Err(StateError::Blocked),
            _ => return Err(StateError::NotOwned),
        }
        Self::clear_to_free(locker);
        locker.version += 1;
        Ok(locker.version)
    }

    /// Enter the transient Opening state while the bus sequence runs.
    /// Owner fields and timestamps are kept so the prior state can be
    /// reconstructed by [`Self::finish_open`].
    pub fn open_start(&mut self, id: u16, expected_version: u32) -> Result<u32, StateError> {
        let locker = self.checked(id, expected_version)?;
        match locker.status {
            LockerStatus::Reserved | LockerStatus::Owned | LockerStatus::Free => {}
            LockerStatus::Blocked => return Err(StateError::Blocked),
            LockerStatus::Opening => return Err(StateError::NotFree),
        }
        locker.status = LockerStatus::Opening;
        locker.version += 1;
        Ok(locker.version)
    }

    /// Leave Opening for the state the business logic dictates.
    pub fn finish_open(
        &mut self,
        id: u16,
        expected_version: u32,
        outcome: OpenOutcome,
        now_ms: u64,
    ) -> Result<u32, StateError> {
        let locker = self.checked(id, expected_version)?;
        if locker.status != LockerStatus::Opening {
            return Err(StateError::NotOwned);
        }
        match outcome {
            OpenOutcome::AssignOwned => {
                locker.status = LockerStatus::Owned;
                locker.owned_at = Some(now_ms);
            }
            OpenOutcome::ReleaseFree => Self::clear_to_free(locker),
            OpenOutcome::RevertPrior => {
                locker.status = if locker.owned_at.is_some() {
                    LockerStatus::Owned
                } else if locker.reserved_at.is_some() {
                    LockerStatus::Reserved
                } else {
                    LockerStatus::Free
                };
            }
        }
        locker.version += 1;
        Ok(locker.version)
    }

    /// Staff-only: any state -> Blocked. Owner fields are cleared; the
    /// displaced owner, if any, is returned so the caller can log it.
    pub fn block(&mut self, id: u16, reason: &str) -> Result<(u32, Option<Owner>), StateError> {
        let locker = self
            .lockers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StateError::NotFound)?;
        if locker.status == LockerStatus::Blocked {
            return Err(StateError::Blocked);
        }
        let displaced = locker.owner.take();
        Self::clear_to_free(locker);
        locker.status = LockerStatus::Blocked;
        locker.block_reason = String::new();
        let _ = locker.block_reason.push_str(reason);
        locker.version += 1;
        Ok((locker.version, displaced))
    }

    /// Staff-only: Blocked -> Free.
    pub fn unblock(&mut self, id: u16) -> Result<u32, StateError> {
        let locker = self
            .lockers
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or(StateError::NotFound)?;
        if locker.status != LockerStatus::Blocked {
            return Err(StateError::NotFree);
        }
        Self::clear_to_free(locker);
        locker.version += 1;
        Ok(locker.version)
    }

    /// Return Reserved lockers older than the TTL to Free. VIP slots never
    /// reach Reserved, so the sweep cannot touch them.
    pub fn expire_stale_reservations(&mut self, now_ms: u64) -> Vec<u16, MAX_LOCKERS> {
        let mut expired = Vec::new();
        for locker in self.lockers.iter_mut() {
            if locker.status != LockerStatus::Reserved {
                continue;
            }
            let Some(reserved_at) = locker.reserved_at else { continue };
            if now_ms.saturating_sub(reserved_at) > self.reserve_ttl_ms {
                Self::clear_to_free(locker);
                locker.version += 1;
                let _ = expired.push(locker.id);
            }
        }
        expired
    }

    fn clear_to_free(locker: &mut Locker) {
        locker.status = LockerStatus::Free;
        locker.owner = None;
        locker.reserved_at = None;
        locker.owned_at = None;
        locker.block_reason = String::new();
    }
}
