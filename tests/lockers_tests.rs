//! Unit tests for the locker state machine: transitions, optimistic
//! versioning, ownership uniqueness, and the reservation TTL.

#![allow(dead_code)]

#[path = "../src/config.rs"]
mod config;
#[path = "../src/lockers.rs"]
mod lockers;

use lockers::{LockerStatus, LockerTable, OpenOutcome, OwnerType, StateError};

const TTL_MS: u64 = 90_000;

fn table() -> LockerTable {
    // Ten lockers, number 4 is VIP.
    LockerTable::new(10, "4", TTL_MS)
}

fn version_of(t: &LockerTable, id: u16) -> u32 {
    t.get(id).unwrap().version
}

// ============================================================================
// Provisioning
// ============================================================================

#[test]
fn provisions_rows_once_with_vip_flags() {
    let t = table();
    assert_eq!(t.len(), 10);
    assert!(t.get(4).unwrap().is_vip);
    assert!(!t.get(5).unwrap().is_vip);
    for locker in t.iter() {
        assert_eq!(locker.status, LockerStatus::Free);
        assert!(locker.owner.is_none());
        assert_eq!(locker.version, 0);
    }
}

#[test]
fn list_available_excludes_vip_and_non_free() {
    let mut t = table();
    t.reserve(2, OwnerType::Rfid, "rfid:a", 0, 100).unwrap();
    t.block(7, "jammed").unwrap();
    let available: Vec<u16> = t.list_available().iter().copied().collect();
    assert_eq!(available, vec![1, 3, 5, 6, 8, 9, 10]);
}

// ============================================================================
// Reserve
// ============================================================================

#[test]
fn reserve_stamps_owner_and_bumps_version() {
    let mut t = table();
    let v = t.reserve(5, OwnerType::Rfid, "rfid:abc", 0, 1_000).unwrap();
    assert_eq!(v, 1);
    let locker = t.get(5).unwrap();
    assert_eq!(locker.status, LockerStatus::Reserved);
    assert_eq!(locker.owner.as_ref().unwrap().key.as_str(), "rfid:abc");
    assert_eq!(locker.reserved_at, Some(1_000));
    assert_eq!(locker.owned_at, None);
}

#[test]
fn reserve_rejects_unknown_vip_and_taken_lockers() {
    let mut t = table();
    assert_eq!(
        t.reserve(99, OwnerType::Rfid, "rfid:a", 0, 0),
        Err(StateError::NotFound)
    );
    assert_eq!(
        t.reserve(4, OwnerType::Rfid, "rfid:a", 0, 0),
        Err(StateError::NotFree)
    );
    t.reserve(5, OwnerType::Rfid, "rfid:a", 0, 0).unwrap();
    assert_eq!(
        t.reserve(5, OwnerType::Rfid, "rfid:b", 1, 0),
        Err(StateError::NotFree)
    );
}

#[test]
fn one_card_holds_at_most_one_locker() {
    let mut t = table();
    t.reserve(3, OwnerType::Rfid, "rfid:h1", 0, 0).unwrap();
    assert_eq!(
        t.reserve(7, OwnerType::Rfid, "rfid:h1", 0, 0),
        Err(StateError::OwnerAlreadyHoldsLocker)
    );
    // Still holds after confirming ownership.
    let v = version_of(&t, 3);
    t.confirm_ownership(3, v, 10).unwrap();
    assert_eq!(
        t.reserve(7, OwnerType::Rfid, "rfid:h1", 0, 0),
        Err(StateError::OwnerAlreadyHoldsLocker)
    );
    assert_eq!(t.find_by_owner(OwnerType::Rfid, "rfid:h1").unwrap().id, 3);
}

#[test]
fn device_tokens_are_not_subject_to_the_rfid_uniqueness_rule() {
    let mut t = table();
    t.reserve(1, OwnerType::Device, "tok", 0, 0).unwrap();
    assert!(t.reserve(2, OwnerType::Device, "tok", 0, 0).is_ok());
}

#[test]
fn stale_version_loses_the_race() {
    let mut t = table();
    // Two callers both read version 0 and race on locker 2.
    t.reserve(2, OwnerType::Rfid, "rfid:first", 0, 0).unwrap();
    assert_eq!(
        t.reserve(2, OwnerType::Rfid, "rfid:second", 0, 0),
        Err(StateError::VersionConflict)
    );
    // The loser refetches (version 1, Reserved) and now sees NotFree.
    assert_eq!(
        t.reserve(2, OwnerType::Rfid, "rfid:second", 1, 0),
        Err(StateError::NotFree)
    );
}

// ============================================================================
// Confirm / release
// ============================================================================

#[test]
fn confirm_then_release_round_trip() {
    let mut t = table();
    let v1 = t.reserve(5, OwnerType::Rfid, "rfid:a", 0, 1_000).unwrap();
    let v2 = t.confirm_ownership(5, v1, 2_000).unwrap();
    {
        let locker = t.get(5).unwrap();
        assert_eq!(locker.status, LockerStatus::Owned);
        assert_eq!(locker.owned_at, Some(2_000));
    }
    let v3 = t.release(5, v2).unwrap();
    let locker = t.get(5).unwrap();
    assert_eq!(locker.status, LockerStatus::Free);
    assert!(locker.owner.is_none());
    assert_eq!(locker.reserved_at, None);
    assert_eq!(locker.owned_at, None);
    assert_eq!(v3, v2 + 1);
}

#[test]
fn reserve_then_release_increments_version_by_two() {
    let mut t = table();
    let v0 = version_of(&t, 6);
    let v1 = t.reserve(6, OwnerType::Rfid, "rfid:a", v0, 0).unwrap();
    let v2 = t.release(6, v1).unwrap();
    assert_eq!(v2, v0 + 2);
    assert_eq!(t.get(6).unwrap().status, LockerStatus::Free);
}

#[test]
fn confirm_requires_a_reservation() {
    let mut t = table();
    assert_eq!(t.confirm_ownership(5, 0, 0), Err(StateError::NotOwned));
    assert_eq!(t.release(5, 0), Err(StateError::NotOwned));
}

#[test]
fn every_mutation_strictly_increases_version() {
    let mut t = table();
    let mut last = version_of(&t, 8);
    let v = t.reserve(8, OwnerType::Rfid, "rfid:x", last, 0).unwrap();
    assert!(v > last);
    last = v;
    let v = t.confirm_ownership(8, last, 1).unwrap();
    assert!(v > last);
    last = v;
    let v = t.open_start(8, last).unwrap();
    assert!(v > last);
    last = v;
    let v = t.finish_open(8, last, OpenOutcome::ReleaseFree, 2).unwrap();
    assert!(v > last);
}

// ============================================================================
// Opening
// ============================================================================

#[test]
fn assign_open_lands_in_owned() {
    let mut t = table();
    let v1 = t.reserve(9, OwnerType::Rfid, "rfid:a", 0, 100).unwrap();
    let v2 = t.open_start(9, v1).unwrap();
    assert_eq!(t.get(9).unwrap().status, LockerStatus::Opening);
    t.finish_open(9, v2, OpenOutcome::AssignOwned, 500).unwrap();
    let locker = t.get(9).unwrap();
    assert_eq!(locker.status, LockerStatus::Owned);
    assert_eq!(locker.owned_at, Some(500));
}

#[test]
fn release_open_lands_in_free() {
    let mut t = table();
    let v1 = t.reserve(9, OwnerType::Rfid, "rfid:a", 0, 100).unwrap();
    let v2 = t.confirm_ownership(9, v1, 200).unwrap();
    let v3 = t.open_start(9, v2).unwrap();
    t.finish_open(9, v3, OpenOutcome::ReleaseFree, 500).unwrap();
    let locker = t.get(9).unwrap();
    assert_eq!(locker.status, LockerStatus::Free);
    assert!(locker.owner.is_none());
}

#[test]
fn failed_open_reverts_to_the_prior_state() {
    let mut t = table();
    // Reserved slot: a failed open falls back to Reserved.
    let v1 = t.reserve(9, OwnerType::Rfid, "rfid:a", 0, 100).unwrap();
    let v2 = t.open_start(9, v1).unwrap();
    t.finish_open(9, v2, OpenOutcome::RevertPrior, 500).unwrap();
    assert_eq!(t.get(9).unwrap().status, LockerStatus::Reserved);

    // Owned slot: falls back to Owned.
    let v = version_of(&t, 9);
    let v = t.confirm_ownership(9, v, 600).unwrap();
    let v = t.open_start(9, v).unwrap();
    t.finish_open(9, v, OpenOutcome::RevertPrior, 700).unwrap();
    assert_eq!(t.get(9).unwrap().status, LockerStatus::Owned);
}

#[test]
fn staff_peek_on_a_free_locker_returns_to_free() {
    let mut t = table();
    let v = t.open_start(5, 0).unwrap();
    assert_eq!(t.get(5).unwrap().status, LockerStatus::Opening);
    t.finish_open(5, v, OpenOutcome::RevertPrior, 100).unwrap();
    assert_eq!(t.get(5).unwrap().status, LockerStatus::Free);
}

#[test]
fn finish_open_outside_opening_is_rejected() {
    let mut t = table();
    assert_eq!(
        t.finish_open(5, 0, OpenOutcome::ReleaseFree, 0),
        Err(StateError::NotOwned)
    );
}

// ============================================================================
// Block / unblock
// ============================================================================

#[test]
fn block_displaces_the_owner_and_unblock_frees() {
    let mut t = table();
    t.reserve(6, OwnerType::Rfid, "rfid:a", 0, 0).unwrap();
    let (_, displaced) = t.block(6, "water damage").unwrap();
    assert_eq!(displaced.unwrap().key.as_str(), "rfid:a");
    let locker = t.get(6).unwrap();
    assert_eq!(locker.status, LockerStatus::Blocked);
    assert_eq!(locker.block_reason.as_str(), "water damage");

    t.unblock(6).unwrap();
    let locker = t.get(6).unwrap();
    assert_eq!(locker.status, LockerStatus::Free);
    assert!(locker.block_reason.is_empty());
}

#[test]
fn blocked_lockers_reject_everything_but_unblock() {
    let mut t = table();
    t.block(6, "jammed").unwrap();
    let v = version_of(&t, 6);
    assert_eq!(
        t.reserve(6, OwnerType::Rfid, "rfid:a", v, 0),
        Err(StateError::Blocked)
    );
    assert_eq!(t.open_start(6, v), Err(StateError::Blocked));
    assert_eq!(t.block(6, "again"), Err(StateError::Blocked));
}

#[test]
fn unblock_requires_blocked() {
    let mut t = table();
    assert_eq!(t.unblock(5), Err(StateError::NotFree));
}

// ============================================================================
// Reservation TTL
// ============================================================================

#[test]
fn reservations_expire_only_after_the_ttl() {
    let mut t = table();
    t.reserve(1, OwnerType::Rfid, "rfid:a", 0, 10_000).unwrap();

    // One second before the TTL: still Reserved.
    let expired = t.expire_stale_reservations(10_000 + TTL_MS - 1_000);
    assert!(expired.is_empty());
    assert_eq!(t.get(1).unwrap().status, LockerStatus::Reserved);

    // One second past it: returned to Free.
    let expired = t.expire_stale_reservations(10_000 + TTL_MS + 1_000);
    assert_eq!(expired.iter().copied().collect::<Vec<u16>>(), vec![1]);
    let locker = t.get(1).unwrap();
    assert_eq!(locker.status, LockerStatus::Free);
    assert!(locker.owner.is_none());
}

#[test]
fn owned_lockers_never_expire() {
    let mut t = table();
    let v = t.reserve(1, OwnerType::Rfid, "rfid:a", 0, 0).unwrap();
    t.confirm_ownership(1, v, 10).unwrap();
    let expired = t.expire_stale_reservations(TTL_MS * 10);
    assert!(expired.is_empty());
    assert_eq!(t.get(1).unwrap().status, LockerStatus::Owned);
}

#[test]
fn expiry_bumps_the_version() {
    let mut t = table();
    t.reserve(1, OwnerType::Rfid, "rfid:a", 0, 0).unwrap();
    t.expire_stale_reservations(TTL_MS + 1).pop();
    assert_eq!(version_of(&t, 1), 2);
}
