//! Unit tests for the flash record encoding: storage keys, locker rows,
//! and the queue/done records, including corruption rejection.

#![allow(dead_code)]

#[path = "../src/commands.rs"]
mod commands;
#[path = "../src/config.rs"]
mod config;
#[path = "../src/lockers.rs"]
mod lockers;
#[path = "../src/storage.rs"]
mod storage;

use commands::{Command, CommandKind, CommandStatus, OpenIntent};
use lockers::{Locker, LockerStatus, Owner, OwnerType};
use sequential_storage::map::{Key, SerializationError, Value};
use storage::{DoneRecord, LockerRow, QueueRecord, StorageKey, MAX_DONE_IDS, MAX_PERSISTED_PENDING};

fn sample_locker() -> Locker {
    let mut key = heapless::String::new();
    key.push_str("rfid:deadbeef").unwrap();
    let mut reason = heapless::String::new();
    reason.push_str("wet floor").unwrap();
    Locker {
        id: 17,
        status: LockerStatus::Owned,
        owner: Some(Owner { kind: OwnerType::Rfid, key }),
        reserved_at: Some(1_000),
        owned_at: Some(2_000),
        version: 7,
        is_vip: true,
        block_reason: reason,
    }
}

fn sample_command(id: &str, kind: CommandKind, status: CommandStatus) -> Command {
    let mut cmd_id = heapless::String::new();
    cmd_id.push_str(id).unwrap();
    let mut actor = heapless::String::new();
    actor.push_str("dispatcher").unwrap();
    Command {
        id: cmd_id,
        kind,
        actor,
        status,
        retry_count: 1,
        next_attempt_at: 5_000,
        last_error: heapless::String::new(),
        created_at: 4_000,
        executed_at: Some(4_500),
        completed_at: status.is_terminal().then_some(4_900),
        reported: false,
    }
}

// ============================================================================
// Storage keys
// ============================================================================

#[test]
fn storage_keys_round_trip() {
    let keys = [StorageKey::Locker(5), StorageKey::Queue, StorageKey::Done];
    for key in keys {
        let mut buf = [0u8; 4];
        let n = key.serialize_into(&mut buf).unwrap();
        assert_eq!(n, 2);
        let (parsed, consumed) = StorageKey::deserialize_from(&buf).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(consumed, 2);
    }
}

#[test]
fn storage_key_rejects_unknown_tags_and_short_buffers() {
    assert!(matches!(
        StorageKey::deserialize_from(&[9, 0]),
        Err(SerializationError::InvalidFormat)
    ));
    assert!(matches!(
        StorageKey::deserialize_from(&[0]),
        Err(SerializationError::BufferTooSmall)
    ));
    let mut tiny = [0u8; 1];
    assert!(matches!(
        StorageKey::Queue.serialize_into(&mut tiny),
        Err(SerializationError::BufferTooSmall)
    ));
}

// ============================================================================
// Locker rows
// ============================================================================

#[test]
fn locker_row_round_trips() {
    let row = LockerRow(sample_locker());
    let mut buf = [0u8; 256];
    let n = row.serialize_into(&mut buf).unwrap();
    let parsed = LockerRow::deserialize_from(&buf[..n]).unwrap();
    assert_eq!(parsed, row);
}

#[test]
fn locker_row_without_owner_round_trips() {
    let mut locker = sample_locker();
    locker.owner = None;
    locker.reserved_at = None;
    locker.owned_at = None;
    locker.status = LockerStatus::Free;
    locker.block_reason = heapless::String::new();
    let row = LockerRow(locker);
    let mut buf = [0u8; 256];
    let n = row.serialize_into(&mut buf).unwrap();
    assert_eq!(LockerRow::deserialize_from(&buf[..n]).unwrap(), row);
}

#[test]
fn truncated_locker_row_is_rejected() {
    let row = LockerRow(sample_locker());
    let mut buf = [0u8; 256];
    let n = row.serialize_into(&mut buf).unwrap();
    assert!(LockerRow::deserialize_from(&buf[..n - 1]).is_err());
}

#[test]
fn locker_row_with_bad_status_tag_is_rejected() {
    let row = LockerRow(sample_locker());
    let mut buf = [0u8; 256];
    let n = row.serialize_into(&mut buf).unwrap();
    // Layout: version byte, id (2), then the status tag.
    buf[3] = 0xEE;
    assert!(matches!(
        LockerRow::deserialize_from(&buf[..n]),
        Err(SerializationError::InvalidFormat)
    ));
}

#[test]
fn locker_row_with_wrong_format_version_is_rejected() {
    let row = LockerRow(sample_locker());
    let mut buf = [0u8; 256];
    let n = row.serialize_into(&mut buf).unwrap();
    buf[0] = 99;
    assert!(matches!(
        LockerRow::deserialize_from(&buf[..n]),
        Err(SerializationError::InvalidFormat)
    ));
}

// ============================================================================
// Queue record
// ============================================================================

fn one_of_each_kind() -> Vec<Command> {
    let mut bulk = heapless::Vec::new();
    for id in [1u16, 2, 3] {
        bulk.push(id).unwrap();
    }
    let mut reason = heapless::String::new();
    reason.push_str("jammed").unwrap();
    vec![
        sample_command(
            "c1",
            CommandKind::OpenLocker { locker: 5, intent: OpenIntent::Assign },
            CommandStatus::Pending,
        ),
        sample_command("c2", CommandKind::BulkOpen { lockers: bulk }, CommandStatus::Pending),
        sample_command(
            "c3",
            CommandKind::BlockLocker { locker: 7, reason },
            CommandStatus::Pending,
        ),
        sample_command("c4", CommandKind::UnblockLocker { locker: 7 }, CommandStatus::Pending),
    ]
}

#[test]
fn queue_record_round_trips_every_command_kind() {
    let mut rows = heapless::Vec::new();
    for cmd in one_of_each_kind() {
        rows.push(cmd).unwrap();
    }
    let record = QueueRecord(rows);
    let mut buf = [0u8; 2048];
    let n = record.serialize_into(&mut buf).unwrap();
    assert_eq!(QueueRecord::deserialize_from(&buf[..n]).unwrap(), record);
}

#[test]
fn queue_record_capture_skips_terminal_rows() {
    let mut commands = one_of_each_kind();
    commands.push(sample_command(
        "done",
        CommandKind::UnblockLocker { locker: 1 },
        CommandStatus::Completed,
    ));
    commands.push(sample_command(
        "gone",
        CommandKind::UnblockLocker { locker: 2 },
        CommandStatus::Cancelled,
    ));
    let record = QueueRecord::capture(&commands);
    assert_eq!(record.0.len(), 4);
    assert!(record.0.iter().all(|c| !c.status.is_terminal()));
}

#[test]
fn queue_record_with_an_impossible_count_is_rejected() {
    let buf = [1u8, (MAX_PERSISTED_PENDING + 1) as u8];
    assert!(matches!(
        QueueRecord::deserialize_from(&buf),
        Err(SerializationError::InvalidFormat)
    ));
}

// ============================================================================
// Done record
// ============================================================================

#[test]
fn done_record_round_trips() {
    let commands = vec![
        sample_command("a", CommandKind::UnblockLocker { locker: 1 }, CommandStatus::Completed),
        sample_command("b", CommandKind::UnblockLocker { locker: 2 }, CommandStatus::Failed),
    ];
    let record = DoneRecord::capture(&commands);
    assert_eq!(record.0.len(), 2);
    let mut buf = [0u8; 1024];
    let n = record.serialize_into(&mut buf).unwrap();
    assert_eq!(DoneRecord::deserialize_from(&buf[..n]).unwrap(), record);
}

#[test]
fn done_record_keeps_the_newest_outcomes() {
    let mut commands = Vec::new();
    for i in 0..MAX_DONE_IDS + 4 {
        let mut cmd = sample_command(
            &format!("t{}", i),
            CommandKind::UnblockLocker { locker: 1 },
            CommandStatus::Completed,
        );
        cmd.completed_at = Some(i as u64);
        commands.push(cmd);
    }
    let record = DoneRecord::capture(&commands);
    assert_eq!(record.0.len(), MAX_DONE_IDS);
    let ids: Vec<&str> = record.0.iter().map(|(id, _)| id.as_str()).collect();
    // The four oldest outcomes fell off.
    for i in 0..4 {
        assert!(!ids.contains(&format!("t{}", i).as_str()));
    }
    assert!(ids.contains(&format!("t{}", MAX_DONE_IDS + 3).as_str()));
}
