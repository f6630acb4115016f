//! Dispatcher protocol: HTTP response parsing and the hand-rolled JSON for
//! the sync exchange and the staff surface.
//!
//! The payloads are small and flat, so they are scanned by hand instead of
//! pulling a serializer into the firmware. Parsers reject what they do not
//! recognize and never panic on malformed input.

use core::fmt::Write as FmtWrite;

use heapless::{String, Vec};

use crate::commands::{Actor, Command, CommandId, CommandKind, OpenIntent, StatusUpdate, MAX_BULK};
use crate::events::LockerEvent;

/// Upper bound on commands accepted from one feed response.
pub const MAX_FEED: usize = 8;

/// One entry of the dispatcher's command feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEntry {
    Command { id: CommandId, kind: CommandKind, actor: Actor },
    Cancel { target: CommandId },
}

/// Parse HTTP status code from a response.
pub fn parse_status_code(response: &str) -> u16 {
    // Format: "HTTP/1.1 200 OK\r\n..."
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

/// Extract a header value (case-insensitive).
pub fn extract_header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
    for line in response.lines() {
        if line.is_empty() || line == "\r" {
            break; // End of headers
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                return Some(value.trim());
            }
        }
    }
    None
}

/// The body after the header block, if the response has one.
pub fn body_of(response: &str) -> &str {
    response
        .find("\r\n\r\n")
        .map(|i| &response[i + 4..])
        .unwrap_or("")
}

/// Parse a dotted IPv4 address.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut octet_idx = 0;

    for part in s.split('.') {
        if octet_idx >= 4 {
            return None;
        }
        octets[octet_idx] = part.parse().ok()?;
        octet_idx += 1;
    }

    if octet_idx == 4 { Some(octets) } else { None }
}

/// Value of `key` in a request target such as `/open?locker=5&reason=wet`.
pub fn query_param<'a>(target: &'a str, key: &str) -> Option<&'a str> {
    let query = target.split_once('?')?.1;
    for pair in query.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k == key {
            return Some(v);
        }
    }
    None
}

// ============================================================================
// Sync upload body
// ============================================================================

/// Build the sync POST body: pending events plus unacknowledged command
/// outcomes. Truncation on overflow is acceptable; the dispatcher treats
/// the body as best-effort and unacked items retry next round.
pub fn build_sync_body<const N: usize>(
    kiosk_id: &str,
    events: &[LockerEvent],
    updates: &[StatusUpdate],
    out: &mut String<N>,
) {
    let _ = write!(out, r#"{{"kiosk":"{}","events":["#, kiosk_id);
    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            let _ = out.push(',');
        }
        let _ = write!(
            out,
            r#"{{"at":{},"event":"{}","locker":{},"actor":"{}","detail":"{}"}}"#,
            event.at_ms,
            event.kind.as_str(),
            event.locker,
            event.actor,
            event.detail
        );
    }
    let _ = out.push_str(r#"],"commands":["#);
    for (i, update) in updates.iter().enumerate() {
        if i > 0 {
            let _ = out.push(',');
        }
        let _ = write!(
            out,
            r#"{{"id":"{}","status":"{}","error":"{}"}}"#,
            update.id,
            update.status.as_str(),
            update.error
        );
    }
    let _ = out.push_str("]}");
}

/// Status-poll view of a command, served by `GET /command?id=`.
pub fn build_command_json<const N: usize>(cmd: &Command, out: &mut String<N>) {
    let _ = write!(
        out,
        r#"{{"id":"{}","type":"{}","status":"{}","retry_count":{},"last_error":"{}","created_at":{}"#,
        cmd.id,
        cmd.kind.as_str(),
        cmd.status.as_str(),
        cmd.retry_count,
        cmd.last_error,
        cmd.created_at
    );
    match cmd.executed_at {
        Some(at) => {
            let _ = write!(out, r#","executed_at":{}"#, at);
        }
        None => {
            let _ = out.push_str(r#","executed_at":null"#);
        }
    }
    match cmd.completed_at {
        Some(at) => {
            let _ = write!(out, r#","completed_at":{}"#, at);
        }
        None => {
            let _ = out.push_str(r#","completed_at":null"#);
        }
    }
    let _ = out.push_str("}");
}

// ============================================================================
// Command feed
// ============================================================================

/// Parse the dispatcher's command feed: a JSON array of flat objects.
///
/// Unknown entry types and malformed entries are skipped with a warning so
/// one bad row cannot wedge the whole feed; a body that is not an array is
/// rejected outright.
pub fn parse_command_feed(json: &str) -> Result<Vec<FeedEntry, MAX_FEED>, &'static str> {
    let trimmed = json.trim();
    if !trimmed.starts_with('[') || !trimmed.ends_with(']') {
        return Err("not a JSON array");
    }

    let mut entries = Vec::new();
    for object in JsonObjects::new(&trimmed[1..trimmed.len() - 1]) {
        match parse_feed_entry(object) {
            Some(entry) => {
                if entries.push(entry).is_err() {
                    log::warn!("proto: command feed truncated at {}", MAX_FEED);
                    break;
                }
            }
            None => log::warn!("proto: skipping malformed feed entry"),
        }
    }
    Ok(entries)
}

fn parse_feed_entry(object: &str) -> Option<FeedEntry> {
    let id = json_str(object, "id")?;
    let kind = json_str(object, "type")?;

    if kind == "cancel" {
        let mut target = CommandId::new();
        target.push_str(json_str(object, "target")?).ok()?;
        return Some(FeedEntry::Cancel { target });
    }

    let mut cmd_id = CommandId::new();
    cmd_id.push_str(id).ok()?;
    let mut actor = Actor::new();
    actor
        .push_str(json_str(object, "actor").unwrap_or("dispatcher"))
        .ok()?;

    let kind = match kind {
        "open_locker" => CommandKind::OpenLocker {
            locker: json_num(object, "locker")?,
            intent: match json_str(object, "intent").unwrap_or("release") {
                "assign" => OpenIntent::Assign,
                "release" => OpenIntent::Release,
                "staff_override" => OpenIntent::StaffOverride,
                _ => return None,
            },
        },
        "bulk_open" => CommandKind::BulkOpen { lockers: json_num_array(object, "lockers")? },
        "block_locker" => {
            let mut reason = String::new();
            reason.push_str(json_str(object, "reason").unwrap_or("")).ok()?;
            CommandKind::BlockLocker { locker: json_num(object, "locker")?, reason }
        }
        "unblock_locker" => CommandKind::UnblockLocker { locker: json_num(object, "locker")? },
        _ => return None,
    };

    Some(FeedEntry::Command { id: cmd_id, kind, actor })
}

/// Iterator over top-level `{...}` objects in an array body. Quote-aware,
/// so braces inside string values do not confuse the depth count.
struct JsonObjects<'a> {
    rest: &'a str,
}

impl<'a> JsonObjects<'a> {
    fn new(array_body: &'a str) -> Self {
        Self { rest: array_body }
    }
}

impl<'a> Iterator for JsonObjects<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let start = self.rest.find('{')?;
        let bytes = self.rest.as_bytes();
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for i in start..bytes.len() {
            let b = bytes[i];
            if escaped {
                escaped = false;
                continue;
            }
            match b {
                b'\\' if in_string => escaped = true,
                b'"' => in_string = !in_string,
                b'{' if !in_string => depth += 1,
                b'}' if !in_string => {
                    depth -= 1;
                    if depth == 0 {
                        let object = &self.rest[start..=i];
                        self.rest = &self.rest[i + 1..];
                        return Some(object);
                    }
                }
                _ => {}
            }
        }
        self.rest = "";
        None
    }
}

/// Raw value slice after `"key":`, trimmed of leading whitespace.
fn json_value<'a>(object: &'a str, key: &str) -> Option<&'a str> {
    let mut probe: String<24> = String::new();
    write!(probe, "\"{}\"", key).ok()?;
    let at = object.find(probe.as_str())?;
    let after = &object[at + probe.len()..];
    let colon = after.find(':')?;
    Some(after[colon + 1..].trim_start())
}

/// String value of `key`. Escapes are not interpreted; the feed never
/// contains them.
fn json_str<'a>(object: &'a str, key: &str) -> Option<&'a str> {
    let value = json_value(object, key)?;
    let value = value.strip_prefix('"')?;
    let end = value.find('"')?;
    Some(&value[..end])
}

fn json_num(object: &str, key: &str) -> Option<u16> {
    let value = json_value(object, key)?;
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().ok()
}

fn json_num_array(object: &str, key: &str) -> Option<Vec<u16, MAX_BULK>> {
    let value = json_value(object, key)?;
    let value = value.strip_prefix('[')?;
    let end = value.find(']')?;
    let mut out = Vec::new();
    for part in value[..end].split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        out.push(part.parse().ok()?).ok()?;
    }
    Some(out)
}
