//! Unit tests for the dispatcher protocol: HTTP parsing helpers, the
//! command feed parser, and the JSON bodies the kiosk produces.

#![allow(dead_code)]

#[path = "../src/commands.rs"]
mod commands;
#[path = "../src/events.rs"]
mod events;
#[path = "../src/proto.rs"]
mod proto;

use commands::{Command, CommandKind, CommandStatus, OpenIntent, StatusUpdate};
use events::{EventKind, LockerEvent};
use proto::{
    body_of, build_command_json, build_sync_body, extract_header, parse_command_feed,
    parse_ipv4, parse_status_code, query_param, FeedEntry,
};

// ============================================================================
// HTTP plumbing
// ============================================================================

#[test]
fn parses_status_codes() {
    assert_eq!(parse_status_code("HTTP/1.1 200 OK\r\n\r\n"), 200);
    assert_eq!(parse_status_code("HTTP/1.1 304 Not Modified\r\n\r\n"), 304);
    assert_eq!(parse_status_code("garbage"), 0);
    assert_eq!(parse_status_code(""), 0);
}

#[test]
fn extracts_headers_case_insensitively() {
    let response = "HTTP/1.1 200 OK\r\nETag: \"abc123\"\r\nContent-Length: 2\r\n\r\nok";
    assert_eq!(extract_header(response, "etag"), Some("\"abc123\""));
    assert_eq!(extract_header(response, "CONTENT-LENGTH"), Some("2"));
    assert_eq!(extract_header(response, "missing"), None);
}

#[test]
fn header_lookup_stops_at_the_body() {
    let response = "HTTP/1.1 200 OK\r\nReal: yes\r\n\r\nFake: no";
    assert_eq!(extract_header(response, "fake"), None);
}

#[test]
fn body_follows_the_blank_line() {
    assert_eq!(body_of("HTTP/1.1 200 OK\r\nA: b\r\n\r\n[1,2]"), "[1,2]");
    assert_eq!(body_of("no split"), "");
}

#[test]
fn parses_dotted_quads_only() {
    assert_eq!(parse_ipv4("192.168.1.68"), Some([192, 168, 1, 68]));
    assert_eq!(parse_ipv4("10.0.0.1"), Some([10, 0, 0, 1]));
    assert_eq!(parse_ipv4("1.2.3"), None);
    assert_eq!(parse_ipv4("1.2.3.4.5"), None);
    assert_eq!(parse_ipv4("a.b.c.d"), None);
    assert_eq!(parse_ipv4("256.1.1.1"), None);
}

#[test]
fn query_params_come_from_the_request_target() {
    let target = "/open?locker=5&reason=wet&intent=peek";
    assert_eq!(query_param(target, "locker"), Some("5"));
    assert_eq!(query_param(target, "intent"), Some("peek"));
    assert_eq!(query_param(target, "missing"), None);
    assert_eq!(query_param("/open", "locker"), None);
    assert_eq!(query_param("/open?flag", "flag"), Some(""));
}

// ============================================================================
// Command feed
// ============================================================================

#[test]
fn parses_a_full_command_feed() {
    let feed = r#"[
        {"id":"c1","type":"open_locker","locker":5,"intent":"release","actor":"dispatcher"},
        {"id":"c2","type":"bulk_open","lockers":[1,2,3]},
        {"id":"c3","type":"block_locker","locker":7,"reason":"jammed"},
        {"id":"c4","type":"unblock_locker","locker":7},
        {"id":"c5","type":"cancel","target":"c1"}
    ]"#;
    let entries = parse_command_feed(feed).unwrap();
    assert_eq!(entries.len(), 5);

    match &entries[0] {
        FeedEntry::Command { id, kind, actor } => {
            assert_eq!(id.as_str(), "c1");
            assert_eq!(actor.as_str(), "dispatcher");
            assert_eq!(kind, &CommandKind::OpenLocker { locker: 5, intent: OpenIntent::Release });
        }
        other => panic!("unexpected entry: {:?}", other),
    }
    match &entries[1] {
        FeedEntry::Command { kind: CommandKind::BulkOpen { lockers }, .. } => {
            assert_eq!(lockers.as_slice(), &[1, 2, 3]);
        }
        other => panic!("unexpected entry: {:?}", other),
    }
    match &entries[2] {
        FeedEntry::Command { kind: CommandKind::BlockLocker { locker, reason }, .. } => {
            assert_eq!(*locker, 7);
            assert_eq!(reason.as_str(), "jammed");
        }
        other => panic!("unexpected entry: {:?}", other),
    }
    match &entries[3] {
        FeedEntry::Command { kind: CommandKind::UnblockLocker { locker }, .. } => {
            assert_eq!(*locker, 7);
        }
        other => panic!("unexpected entry: {:?}", other),
    }
    match &entries[4] {
        FeedEntry::Cancel { target } => assert_eq!(target.as_str(), "c1"),
        other => panic!("unexpected entry: {:?}", other),
    }
}

#[test]
fn open_intent_defaults_to_release() {
    let feed = r#"[{"id":"c1","type":"open_locker","locker":9}]"#;
    let entries = parse_command_feed(feed).unwrap();
    match &entries[0] {
        FeedEntry::Command { kind, .. } => {
            assert_eq!(kind, &CommandKind::OpenLocker { locker: 9, intent: OpenIntent::Release });
        }
        other => panic!("unexpected entry: {:?}", other),
    }
}

#[test]
fn unknown_entry_types_are_skipped() {
    let feed = r#"[
        {"id":"c1","type":"frobnicate","locker":1},
        {"id":"c2","type":"unblock_locker","locker":3}
    ]"#;
    let entries = parse_command_feed(feed).unwrap();
    assert_eq!(entries.len(), 1);
}

#[test]
fn a_non_array_body_is_rejected() {
    assert!(parse_command_feed(r#"{"id":"c1"}"#).is_err());
    assert!(parse_command_feed("").is_err());
}

#[test]
fn braces_inside_string_values_do_not_split_objects() {
    let feed = r#"[{"id":"we{ird}","type":"cancel","target":"x{y"}]"#;
    let entries = parse_command_feed(feed).unwrap();
    assert_eq!(entries.len(), 1);
    match &entries[0] {
        FeedEntry::Cancel { target } => assert_eq!(target.as_str(), "x{y"),
        other => panic!("unexpected entry: {:?}", other),
    }
}

#[test]
fn an_empty_array_is_an_empty_feed() {
    assert!(parse_command_feed("[]").unwrap().is_empty());
    assert!(parse_command_feed(" [ ] ").unwrap().is_empty());
}

// ============================================================================
// Upload bodies
// ============================================================================

#[test]
fn sync_body_carries_events_and_outcomes() {
    let events = [LockerEvent::new(123, EventKind::Release, 5, "staff", "")];
    let mut id = heapless::String::new();
    id.push_str("c1").unwrap();
    let updates = [StatusUpdate { id, status: CommandStatus::Completed, error: heapless::String::new() }];

    let mut body: heapless::String<512> = heapless::String::new();
    build_sync_body("K1", &events, &updates, &mut body);
    assert_eq!(
        body.as_str(),
        r#"{"kiosk":"K1","events":[{"at":123,"event":"release","locker":5,"actor":"staff","detail":""}],"commands":[{"id":"c1","status":"completed","error":""}]}"#
    );
}

#[test]
fn sync_body_with_nothing_pending_is_still_well_formed() {
    let mut body: heapless::String<512> = heapless::String::new();
    build_sync_body("K1", &[], &[], &mut body);
    assert_eq!(body.as_str(), r#"{"kiosk":"K1","events":[],"commands":[]}"#);
}

#[test]
fn command_status_poll_view() {
    let mut id = heapless::String::new();
    id.push_str("c9").unwrap();
    let cmd = Command {
        id,
        kind: CommandKind::OpenLocker { locker: 5, intent: OpenIntent::Release },
        actor: heapless::String::new(),
        status: CommandStatus::Pending,
        retry_count: 0,
        next_attempt_at: 42,
        last_error: heapless::String::new(),
        created_at: 42,
        executed_at: None,
        completed_at: None,
        reported: false,
    };
    let mut out: heapless::String<384> = heapless::String::new();
    build_command_json(&cmd, &mut out);
    assert_eq!(
        out.as_str(),
        r#"{"id":"c9","type":"open_locker","status":"pending","retry_count":0,"last_error":"","created_at":42,"executed_at":null,"completed_at":null}"#
    );
}
