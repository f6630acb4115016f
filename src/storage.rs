//! Flash persistence for the locker table and command queue.
//!
//! State is kept in a `sequential-storage` map over the data partition
//! (append-structured, so a power loss mid-write leaves the previous copy
//! of an item intact). Three kinds of items live in the map:
//!
//! - one item per locker row, keyed by locker id, so a single transition
//!   rewrites ~100 bytes instead of the whole table;
//! - the non-terminal command queue as one item;
//! - a bounded set of terminal command ids, so a dispatcher feed replay
//!   after reboot cannot re-execute a finished command.
//!
//! Record layouts are little-endian with one-byte presence flags; every
//! record starts with a format version byte and malformed payloads are
//! rejected rather than guessed at.

use heapless::Vec;
use sequential_storage::map::{Key, SerializationError, Value};

use crate::commands::{Command, CommandId, CommandKind, CommandQueue, CommandStatus, OpenIntent};
use crate::config::MAX_LOCKERS;
use crate::lockers::{Locker, LockerStatus, LockerTable, Owner, OwnerType};

const FORMAT_VERSION: u8 = 1;

/// Non-terminal commands persisted per flush. Bounded so the queue record
/// always fits one flash page.
pub const MAX_PERSISTED_PENDING: usize = 12;
/// Terminal command ids remembered across reboots.
pub const MAX_DONE_IDS: usize = 16;

/// Storage keys for the map. Two bytes: a kind tag and an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKey {
    /// One locker row; the argument is the locker id.
    Locker(u8),
    /// The non-terminal command queue.
    Queue,
    /// Terminal command ids.
    Done,
}

impl Key for StorageKey {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        if buffer.len() < 2 {
            return Err(SerializationError::BufferTooSmall);
        }
        let (tag, arg) = match self {
            StorageKey::Locker(id) => (0, *id),
            StorageKey::Queue => (1, 0),
            StorageKey::Done => (2, 0),
        };
        buffer[0] = tag;
        buffer[1] = arg;
        Ok(2)
    }

    fn deserialize_from(buffer: &[u8]) -> Result<(Self, usize), SerializationError> {
        match buffer {
            [0, id, ..] => Ok((StorageKey::Locker(*id), 2)),
            [1, _, ..] => Ok((StorageKey::Queue, 2)),
            [2, _, ..] => Ok((StorageKey::Done, 2)),
            [_, _, ..] => Err(SerializationError::InvalidFormat),
            _ => Err(SerializationError::BufferTooSmall),
        }
    }
}

// ============================================================================
// Record encoding
// ============================================================================

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), SerializationError> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(SerializationError::BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn u8(&mut self, v: u8) -> Result<(), SerializationError> {
        self.put(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<(), SerializationError> {
        self.put(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> Result<(), SerializationError> {
        self.put(&v.to_le_bytes())
    }

    fn u64(&mut self, v: u64) -> Result<(), SerializationError> {
        self.put(&v.to_le_bytes())
    }

    fn opt_u64(&mut self, v: Option<u64>) -> Result<(), SerializationError> {
        match v {
            Some(v) => {
                self.u8(1)?;
                self.u64(v)
            }
            None => self.u8(0),
        }
    }

    /// Length-prefixed string, one-byte length.
    fn str(&mut self, s: &str) -> Result<(), SerializationError> {
        self.u8(s.len() as u8)?;
        self.put(s.as_bytes())
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializationError> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or(SerializationError::BufferTooSmall)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, SerializationError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SerializationError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, SerializationError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, SerializationError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn opt_u64(&mut self) -> Result<Option<u64>, SerializationError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u64()?)),
            _ => Err(SerializationError::InvalidFormat),
        }
    }

    fn str<const N: usize>(&mut self) -> Result<heapless::String<N>, SerializationError> {
        let len = self.u8()? as usize;
        if len > N {
            return Err(SerializationError::InvalidFormat);
        }
        let bytes = self.take(len)?;
        let s = core::str::from_utf8(bytes).map_err(|_| SerializationError::InvalidFormat)?;
        let mut out = heapless::String::new();
        let _ = out.push_str(s);
        Ok(out)
    }
}

fn status_tag(status: LockerStatus) -> u8 {
    match status {
        LockerStatus::Free => 0,
        LockerStatus::Reserved => 1,
        LockerStatus::Owned => 2,
        LockerStatus::Opening => 3,
        LockerStatus::Blocked => 4,
    }
}

fn status_from(tag: u8) -> Result<LockerStatus, SerializationError> {
    Ok(match tag {
        0 => LockerStatus::Free,
        1 => LockerStatus::Reserved,
        2 => LockerStatus::Owned,
        // A crash mid-open leaves the row Opening; the executor adopts it
        // when the demoted command is re-claimed.
        3 => LockerStatus::Opening,
        4 => LockerStatus::Blocked,
        _ => return Err(SerializationError::InvalidFormat),
    })
}

/// One persisted locker row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockerRow(pub Locker);

impl<'d> Value<'d> for LockerRow {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let l = &self.0;
        let mut w = Writer::new(buffer);
        w.u8(FORMAT_VERSION)?;
        w.u16(l.id)?;
        w.u8(status_tag(l.status))?;
        match &l.owner {
            Some(owner) => {
                w.u8(match owner.kind {
                    OwnerType::Rfid => 1,
                    OwnerType::Device => 2,
                    OwnerType::Vip => 3,
                })?;
                w.str(owner.key.as_str())?;
            }
            None => w.u8(0)?,
        }
        w.opt_u64(l.reserved_at)?;
        w.opt_u64(l.owned_at)?;
        w.u32(l.version)?;
        w.u8(l.is_vip as u8)?;
        w.str(l.block_reason.as_str())?;
        Ok(w.pos)
    }

    fn deserialize_from(buffer: &'d [u8]) -> Result<Self, SerializationError> {
        let mut r = Reader::new(buffer);
        if r.u8()? != FORMAT_VERSION {
            return Err(SerializationError::InvalidFormat);
        }
        let id = r.u16()?;
        let status = status_from(r.u8()?)?;
        let owner = match r.u8()? {
            0 => None,
            kind => {
                let kind = match kind {
                    1 => OwnerType::Rfid,
                    2 => OwnerType::Device,
                    3 => OwnerType::Vip,
                    _ => return Err(SerializationError::InvalidFormat),
                };
                Some(Owner { kind, key: r.str()? })
            }
        };
        let reserved_at = r.opt_u64()?;
        let owned_at = r.opt_u64()?;
        let version = r.u32()?;
        let is_vip = r.u8()? != 0;
        let block_reason = r.str()?;
        Ok(LockerRow(Locker {
            id,
            status,
            owner,
            reserved_at,
            owned_at,
            version,
            is_vip,
            block_reason,
        }))
    }
}

fn command_status_tag(status: CommandStatus) -> u8 {
    match status {
        CommandStatus::Pending => 0,
        CommandStatus::Executing => 1,
        CommandStatus::Completed => 2,
        CommandStatus::Failed => 3,
        CommandStatus::Cancelled => 4,
    }
}

fn command_status_from(tag: u8) -> Result<CommandStatus, SerializationError> {
    Ok(match tag {
        0 => CommandStatus::Pending,
        1 => CommandStatus::Executing,
        2 => CommandStatus::Completed,
        3 => CommandStatus::Failed,
        4 => CommandStatus::Cancelled,
        _ => return Err(SerializationError::InvalidFormat),
    })
}

fn serialize_command(cmd: &Command, w: &mut Writer<'_>) -> Result<(), SerializationError> {
    w.str(cmd.id.as_str())?;
    w.str(cmd.actor.as_str())?;
    w.u8(command_status_tag(cmd.status))?;
    w.u32(cmd.retry_count)?;
    w.u64(cmd.next_attempt_at)?;
    w.str(cmd.last_error.as_str())?;
    w.u64(cmd.created_at)?;
    w.opt_u64(cmd.executed_at)?;
    w.opt_u64(cmd.completed_at)?;
    w.u8(cmd.reported as u8)?;
    match &cmd.kind {
        CommandKind::OpenLocker { locker, intent } => {
            w.u8(0)?;
            w.u16(*locker)?;
            w.u8(match intent {
                OpenIntent::Assign => 0,
                OpenIntent::Release => 1,
                OpenIntent::StaffOverride => 2,
            })?;
        }
        CommandKind::BulkOpen { lockers } => {
            w.u8(1)?;
            w.u8(lockers.len() as u8)?;
            for id in lockers {
                w.u16(*id)?;
            }
        }
        CommandKind::BlockLocker { locker, reason } => {
            w.u8(2)?;
            w.u16(*locker)?;
            w.str(reason.as_str())?;
        }
        CommandKind::UnblockLocker { locker } => {
            w.u8(3)?;
            w.u16(*locker)?;
        }
    }
    Ok(())
}

fn deserialize_command(r: &mut Reader<'_>) -> Result<Command, SerializationError> {
    let id = r.str()?;
    let actor = r.str()?;
    let status = command_status_from(r.u8()?)?;
    let retry_count = r.u32()?;
    let next_attempt_at = r.u64()?;
    let last_error = r.str()?;
    let created_at = r.u64()?;
    let executed_at = r.opt_u64()?;
    let completed_at = r.opt_u64()?;
    let reported = r.u8()? != 0;
    let kind = match r.u8()? {
        0 => {
            let locker = r.u16()?;
            let intent = match r.u8()? {
                0 => OpenIntent::Assign,
                1 => OpenIntent::Release,
                2 => OpenIntent::StaffOverride,
                _ => return Err(SerializationError::InvalidFormat),
            };
            CommandKind::OpenLocker { locker, intent }
        }
        1 => {
            let count = r.u8()? as usize;
            let mut lockers = Vec::new();
            for _ in 0..count {
                lockers
                    .push(r.u16()?)
                    .map_err(|_| SerializationError::InvalidFormat)?;
            }
            CommandKind::BulkOpen { lockers }
        }
        2 => CommandKind::BlockLocker { locker: r.u16()?, reason: r.str()? },
        3 => CommandKind::UnblockLocker { locker: r.u16()? },
        _ => return Err(SerializationError::InvalidFormat),
    };
    Ok(Command {
        id,
        kind,
        actor,
        status,
        retry_count,
        next_attempt_at,
        last_error,
        created_at,
        executed_at,
        completed_at,
        reported,
    })
}

/// The non-terminal command queue, bounded to fit one flash page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord(pub Vec<Command, MAX_PERSISTED_PENDING>);

impl QueueRecord {
    /// Non-terminal rows of a queue snapshot, oldest first.
    pub fn capture(commands: &[Command]) -> Self {
        let mut rows: Vec<Command, MAX_PERSISTED_PENDING> = Vec::new();
        for cmd in commands {
            if cmd.status.is_terminal() {
                continue;
            }
            if rows.push(cmd.clone()).is_err() {
                log::warn!("storage: pending overflow, not persisting all commands");
                break;
            }
        }
        Self(rows)
    }
}

impl<'d> Value<'d> for QueueRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let mut w = Writer::new(buffer);
        w.u8(FORMAT_VERSION)?;
        w.u8(self.0.len() as u8)?;
        for cmd in &self.0 {
            serialize_command(cmd, &mut w)?;
        }
        Ok(w.pos)
    }

    fn deserialize_from(buffer: &'d [u8]) -> Result<Self, SerializationError> {
        let mut r = Reader::new(buffer);
        if r.u8()? != FORMAT_VERSION {
            return Err(SerializationError::InvalidFormat);
        }
        let count = r.u8()? as usize;
        if count > MAX_PERSISTED_PENDING {
            return Err(SerializationError::InvalidFormat);
        }
        let mut rows = Vec::new();
        for _ in 0..count {
            let _ = rows.push(deserialize_command(&mut r)?);
        }
        Ok(Self(rows))
    }
}

/// Terminal command ids, so feed replays stay idempotent across reboots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneRecord(pub Vec<(CommandId, CommandStatus), MAX_DONE_IDS>);

impl DoneRecord {
    /// The most recent terminal rows of a queue snapshot.
    pub fn capture(commands: &[Command]) -> Self {
        let mut rows: Vec<(u64, CommandId, CommandStatus), MAX_DONE_IDS> = Vec::new();
        for cmd in commands {
            if !cmd.status.is_terminal() {
                continue;
            }
            let at = cmd.completed_at.unwrap_or(0);
            if rows.is_full() {
                // Keep the newest outcomes; evict the oldest captured one.
                let oldest = rows
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, (at, _, _))| *at)
                    .map(|(i, _)| i);
                match oldest {
                    Some(i) if rows[i].0 < at => {
                        rows.swap_remove(i);
                    }
                    _ => continue,
                }
            }
            let _ = rows.push((at, cmd.id.clone(), cmd.status));
        }
        let mut out = Vec::new();
        for (_, id, status) in rows {
            let _ = out.push((id, status));
        }
        Self(out)
    }
}

impl<'d> Value<'d> for DoneRecord {
    fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, SerializationError> {
        let mut w = Writer::new(buffer);
        w.u8(FORMAT_VERSION)?;
        w.u8(self.0.len() as u8)?;
        for (id, status) in &self.0 {
            w.str(id.as_str())?;
            w.u8(command_status_tag(*status))?;
        }
        Ok(w.pos)
    }

    fn deserialize_from(buffer: &'d [u8]) -> Result<Self, SerializationError> {
        let mut r = Reader::new(buffer);
        if r.u8()? != FORMAT_VERSION {
            return Err(SerializationError::InvalidFormat);
        }
        let count = r.u8()? as usize;
        if count > MAX_DONE_IDS {
            return Err(SerializationError::InvalidFormat);
        }
        let mut rows = Vec::new();
        for _ in 0..count {
            let id = r.str()?;
            let status = command_status_from(r.u8()?)?;
            let _ = rows.push((id, status));
        }
        Ok(Self(rows))
    }
}

// ============================================================================
// Flash plumbing
// ============================================================================

/// Flash range for the state map, inside the data partition after the app.
#[cfg(feature = "esp32")]
const STATE_RANGE: core::ops::Range<u32> = 0x3D_0000..0x3E_0000;

#[cfg(feature = "esp32")]
const ITEM_BUFFER: usize = 4096;

/// Flash-backed store. Keeps a mirror of the last-persisted locker rows so
/// a flush only rewrites rows that actually changed.
pub struct Store {
    last_rows: Vec<Locker, MAX_LOCKERS>,
}

impl Store {
    pub fn new() -> Self {
        Self { last_rows: Vec::new() }
    }

    /// Load persisted state into freshly provisioned tables. Missing or
    /// corrupt items leave the provisioned defaults in place.
    #[cfg(feature = "esp32")]
    pub async fn load(&mut self, lockers: &mut LockerTable, queue: &mut CommandQueue) {
        use alloc::vec;
        use embassy_embedded_hal::adapter::BlockingAsync;
        use esp_storage::FlashStorage;
        use sequential_storage::cache::NoCache;
        use sequential_storage::map::fetch_item;

        let mut flash = BlockingAsync::new(FlashStorage::new());
        let mut cache = NoCache::new();
        let mut buf = vec![0u8; ITEM_BUFFER];

        let mut rows: Vec<Locker, MAX_LOCKERS> = lockers.snapshot();
        let mut restored = 0usize;
        for slot in rows.iter_mut() {
            crate::feed_watchdog();
            let key = StorageKey::Locker(slot.id as u8);
            match fetch_item::<StorageKey, LockerRow, _>(
                &mut flash,
                STATE_RANGE,
                &mut cache,
                &mut buf,
                &key,
            )
            .await
            {
                Ok(Some(LockerRow(row))) if row.id == slot.id => {
                    // VIP flags follow the build-time config, not the flash.
                    let is_vip = slot.is_vip;
                    *slot = row;
                    slot.is_vip = is_vip;
                    restored += 1;
                }
                Ok(_) => {}
                Err(e) => log::warn!("storage: locker {} fetch failed: {:?}", slot.id, e),
            }
        }
        if restored > 0 {
            log::info!("storage: restored {} locker rows", restored);
            lockers.restore(rows);
        }

        match fetch_item::<StorageKey, QueueRecord, _>(
            &mut flash,
            STATE_RANGE,
            &mut cache,
            &mut buf,
            &StorageKey::Queue,
        )
        .await
        {
            Ok(Some(QueueRecord(pending))) => {
                let mut table: Vec<Command, { crate::commands::MAX_COMMANDS }> = Vec::new();
                for cmd in pending {
                    let _ = table.push(cmd);
                }
                if let Ok(Some(DoneRecord(done))) = fetch_item::<StorageKey, DoneRecord, _>(
                    &mut flash,
                    STATE_RANGE,
                    &mut cache,
                    &mut buf,
                    &StorageKey::Done,
                )
                .await
                {
                    for (id, status) in done {
                        if table.iter().any(|c| c.id == id) {
                            continue;
                        }
                        let _ = table.push(Command {
                            id,
                            kind: CommandKind::UnblockLocker { locker: 0 },
                            actor: heapless::String::new(),
                            status,
                            retry_count: 0,
                            next_attempt_at: 0,
                            last_error: heapless::String::new(),
                            created_at: 0,
                            executed_at: None,
                            completed_at: Some(0),
                            reported: true,
                        });
                    }
                }
                log::info!("storage: restored {} commands", table.len());
                queue.restore(table);
            }
            Ok(None) => {}
            Err(e) => log::warn!("storage: queue fetch failed: {:?}", e),
        }

        self.last_rows = lockers.snapshot();
    }

    #[cfg(not(feature = "esp32"))]
    pub async fn load(&mut self, _lockers: &mut LockerTable, _queue: &mut CommandQueue) {
        log::warn!("storage: flash not available on this platform");
    }

    /// Persist changed locker rows and the queue records. Flash writes
    /// block the CPU cache, so the watchdog is fed around each item.
    #[cfg(feature = "esp32")]
    pub async fn save(&mut self, rows: &Vec<Locker, MAX_LOCKERS>, commands: &[Command]) {
        use alloc::vec;
        use embassy_embedded_hal::adapter::BlockingAsync;
        use esp_storage::FlashStorage;
        use sequential_storage::cache::NoCache;
        use sequential_storage::map::store_item;

        let mut flash = BlockingAsync::new(FlashStorage::new());
        let mut cache = NoCache::new();
        let mut buf = vec![0u8; ITEM_BUFFER];

        for row in rows {
            let unchanged = self
                .last_rows
                .iter()
                .any(|last| last.id == row.id && last == row);
            if unchanged {
                continue;
            }
            crate::feed_watchdog();
            let result = store_item(
                &mut flash,
                STATE_RANGE,
                &mut cache,
                &mut buf,
                &StorageKey::Locker(row.id as u8),
                &LockerRow(row.clone()),
            )
            .await;
            if let Err(e) = result {
                log::error!("storage: locker {} store failed: {:?}", row.id, e);
            }
        }
        self.last_rows = rows.clone();

        crate::feed_watchdog();
        let pending = QueueRecord::capture(commands);
        if let Err(e) = store_item(
            &mut flash,
            STATE_RANGE,
            &mut cache,
            &mut buf,
            &StorageKey::Queue,
            &pending,
        )
        .await
        {
            log::error!("storage: queue store failed: {:?}", e);
        }

        crate::feed_watchdog();
        let done = DoneRecord::capture(commands);
        if let Err(e) = store_item(
            &mut flash,
            STATE_RANGE,
            &mut cache,
            &mut buf,
            &StorageKey::Done,
            &done,
        )
        .await
        {
            log::error!("storage: done store failed: {:?}", e);
        }
    }

    #[cfg(not(feature = "esp32"))]
    pub async fn save(&mut self, _rows: &Vec<Locker, MAX_LOCKERS>, _commands: &[Command]) {
        log::warn!("storage: flash not available on this platform");
    }
}
