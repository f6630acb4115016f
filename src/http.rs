//! Staff/admin HTTP surface using raw TCP sockets.
//!
//! Serves the status page and the staff operations. Staff opens, blocks,
//! and bulk sweeps are enqueued as commands rather than driving the bus
//! directly, so they get the same retry, audit, and status-poll treatment
//! as dispatcher traffic.

use core::fmt::Write as FmtWrite;

use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::{Duration, Instant};
use embedded_io_async::Write;
use heapless::{String as HString, Vec};

use crate::commands::{CommandKind, OpenIntent, MAX_BULK};
use crate::modbus;
use crate::proto;
use crate::shared::{in_maintenance, set_maintenance, Ctx};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the HTTP server task.
pub async fn run_server(stack: &'static Stack<'static>, ctx: Ctx) -> ! {
    let mut rx_buf = [0u8; 1024];
    let mut tx_buf = [0u8; 2048];

    loop {
        let mut socket = TcpSocket::new(*stack, &mut rx_buf, &mut tx_buf);
        socket.set_timeout(Some(IO_TIMEOUT));

        if socket.accept(80).await.is_err() {
            socket.abort();
            continue;
        }

        handle_request(&mut socket, &ctx).await;
        socket.abort();
    }
}

async fn handle_request(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    let mut request_buf = [0u8; 512];
    let n = match socket.read(&mut request_buf).await {
        Ok(n) if n > 0 => n,
        _ => return,
    };

    let request = match core::str::from_utf8(&request_buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };

    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let path = target.split('?').next().unwrap_or("");

    match (method, path) {
        ("GET", "/") => handle_index(socket, ctx).await,
        ("GET", "/health") => handle_health(socket, ctx).await,
        ("GET", "/lockers") => handle_lockers(socket, ctx).await,
        ("GET", "/command") => handle_command_poll(socket, ctx, target).await,
        ("GET", "/scan") => handle_scan(socket, ctx).await,
        ("POST", "/open") => handle_open(socket, ctx, target).await,
        ("POST", "/open-all") => handle_open_all(socket, ctx).await,
        ("POST", "/close") => handle_close(socket, ctx, target).await,
        ("POST", "/block") => handle_block(socket, ctx, target, true).await,
        ("POST", "/unblock") => handle_block(socket, ctx, target, false).await,
        ("POST", "/cancel") => handle_cancel(socket, ctx, target).await,
        ("POST", "/maintenance") => handle_maintenance(socket, target).await,
        ("POST", "/degrade") => handle_degrade(socket, ctx, target).await,
        _ => send_response(socket, 404, "Not Found", "text/plain", "Not Found").await,
    }
}

/// Probe every configured relay-card address and report the live ones.
async fn handle_scan(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    let found = ctx.bus.scan_bus(1, ctx.config.card_count()).await;
    let mut body: HString<128> = HString::new();
    let _ = body.push('[');
    for (i, slave) in found.iter().enumerate() {
        if i > 0 {
            let _ = body.push(',');
        }
        let _ = write!(body, "{}", slave);
    }
    let _ = body.push(']');
    send_response(socket, 200, "OK", "application/json", body.as_str()).await;
}

/// Emergency force-off for one coil. Deliberately direct: no queueing, no
/// state transitions, just de-energize the relay now.
async fn handle_close(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str) {
    let Some(locker) = locker_param(ctx, target) else {
        send_response(socket, 400, "Bad Request", "text/plain", "bad locker").await;
        return;
    };
    let (slave, channel) = modbus::locker_to_channel(locker);
    match ctx.bus.close_channel(slave, channel).await {
        Ok(()) => send_response(socket, 200, "OK", "text/plain", "closed").await,
        Err(e) => {
            send_response(socket, 502, "Bad Gateway", "text/plain", e.as_str()).await;
        }
    }
}

async fn handle_index(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    let free = ctx.lockers.lock().await.list_available().len();
    let queued = ctx.queue.lock().await.len();
    let health = ctx.bus.health();

    let mut body: HString<512> = HString::new();
    let _ = write!(
        body,
        "<h1>Kiosk {}</h1>\
         <p>Bus: {}</p>\
         <p>Free lockers: {}</p>\
         <p>Commands in table: {}</p>\
         <p>Maintenance: {}</p>\
         <form action=/open-all method=post>\
         <button>Open all</button></form>",
        ctx.config.kiosk_id,
        health.state.as_str(),
        free,
        queued,
        in_maintenance()
    );

    send_response(socket, 200, "OK", "text/html", body.as_str()).await;
}

async fn handle_health(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    let health = ctx.bus.health();
    let mut body: HString<384> = HString::new();
    let _ = write!(
        body,
        r#"{{"state":"{}","frames_ok":{},"frames_err":{},"error_rate_pct":{},"#,
        health.state.as_str(),
        health.frames_ok,
        health.frames_err,
        health.error_rate_pct
    );
    match health.last_success_age_s {
        Some(age) => {
            let _ = write!(body, r#""last_success_age_s":{},"#, age);
        }
        None => {
            let _ = body.push_str(r#""last_success_age_s":null,"#);
        }
    }
    let _ = write!(
        body,
        r#""reconnects":{},"consecutive_errors":{},"maintenance":{}}}"#,
        health.reconnects,
        health.consecutive_errors,
        in_maintenance()
    );
    send_response(socket, 200, "OK", "application/json", body.as_str()).await;
}

async fn handle_lockers(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    let mut body: HString<1792> = HString::new();
    {
        let lockers = ctx.lockers.lock().await;
        let _ = body.push('[');
        for (i, locker) in lockers.iter().enumerate() {
            if i > 0 {
                let _ = body.push(',');
            }
            let _ = write!(
                body,
                r#"{{"id":{},"status":"{}","version":{},"vip":{},"owner":"{}"}}"#,
                locker.id,
                locker.status.as_str(),
                locker.version,
                locker.is_vip,
                locker.owner.as_ref().map(|o| o.key.as_str()).unwrap_or("")
            );
        }
        let _ = body.push(']');
    }
    send_response(socket, 200, "OK", "application/json", body.as_str()).await;
}

async fn handle_command_poll(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str) {
    let Some(id) = proto::query_param(target, "id") else {
        send_response(socket, 400, "Bad Request", "text/plain", "missing id").await;
        return;
    };
    let mut body: HString<384> = HString::new();
    let found = {
        let queue = ctx.queue.lock().await;
        match queue.get(id) {
            Some(cmd) => {
                proto::build_command_json(cmd, &mut body);
                true
            }
            None => false,
        }
    };
    if found {
        send_response(socket, 200, "OK", "application/json", body.as_str()).await;
    } else {
        send_response(socket, 404, "Not Found", "text/plain", "unknown command").await;
    }
}

/// Generated staff command ids: unique is enough, sortable is nice.
fn staff_id(prefix: &str, now_ms: u64) -> HString<24> {
    let mut id = HString::new();
    let _ = write!(id, "{}-{}", prefix, now_ms);
    id
}

/// Locker id from the query, validated against the provisioned range.
fn locker_param(ctx: &Ctx, target: &str) -> Option<u16> {
    let locker: u16 = proto::query_param(target, "locker")?.parse().ok()?;
    (locker >= 1 && locker <= ctx.config.locker_count).then_some(locker)
}

async fn enqueue_and_reply(socket: &mut TcpSocket<'_>, ctx: &Ctx, id: &str, kind: CommandKind) {
    let now = Instant::now().as_millis();
    let result = ctx.queue.lock().await.enqueue(id, kind, "staff", now);
    match result {
        Ok(_) => {
            ctx.dirty.signal(());
            let mut body: HString<64> = HString::new();
            let _ = write!(body, r#"{{"id":"{}"}}"#, id);
            send_response(socket, 200, "OK", "application/json", body.as_str()).await;
        }
        Err(_) => {
            send_response(socket, 503, "Service Unavailable", "text/plain", "queue full").await;
        }
    }
}

async fn handle_open(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str) {
    let Some(locker) = locker_param(ctx, target) else {
        send_response(socket, 400, "Bad Request", "text/plain", "bad locker").await;
        return;
    };
    // `peek` opens without touching ownership; the default staff open
    // releases whatever the slot holds.
    let intent = match proto::query_param(target, "intent") {
        Some("peek") => OpenIntent::StaffOverride,
        _ => OpenIntent::Release,
    };
    let id = staff_id("staff-open", Instant::now().as_millis());
    enqueue_and_reply(socket, ctx, id.as_str(), CommandKind::OpenLocker { locker, intent }).await;
}

async fn handle_open_all(socket: &mut TcpSocket<'_>, ctx: &Ctx) {
    // The sweep targets every provisioned slot; VIP and Blocked exclusion
    // happens at execution time against current state.
    let lockers: Vec<u16, MAX_BULK> = {
        let table = ctx.lockers.lock().await;
        table.iter().map(|l| l.id).collect()
    };
    let id = staff_id("staff-bulk", Instant::now().as_millis());
    enqueue_and_reply(socket, ctx, id.as_str(), CommandKind::BulkOpen { lockers }).await;
}

async fn handle_block(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str, block: bool) {
    let Some(locker) = locker_param(ctx, target) else {
        send_response(socket, 400, "Bad Request", "text/plain", "bad locker").await;
        return;
    };
    let kind = if block {
        let mut reason = HString::new();
        let _ = reason.push_str(proto::query_param(target, "reason").unwrap_or("staff"));
        CommandKind::BlockLocker { locker, reason }
    } else {
        CommandKind::UnblockLocker { locker }
    };
    let id = staff_id(if block { "staff-block" } else { "staff-unblock" }, Instant::now().as_millis());
    enqueue_and_reply(socket, ctx, id.as_str(), kind).await;
}

async fn handle_cancel(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str) {
    let Some(id) = proto::query_param(target, "id") else {
        send_response(socket, 400, "Bad Request", "text/plain", "missing id").await;
        return;
    };
    let cancelled = ctx.queue.lock().await.cancel(id, Instant::now().as_millis());
    if cancelled {
        ctx.dirty.signal(());
        send_response(socket, 200, "OK", "text/plain", "cancelled").await;
    } else {
        send_response(socket, 409, "Conflict", "text/plain", "not pending").await;
    }
}

async fn handle_maintenance(socket: &mut TcpSocket<'_>, target: &str) {
    let on = proto::query_param(target, "on") != Some("0");
    set_maintenance(on);
    send_response(socket, 200, "OK", "text/plain", if on { "stopped" } else { "running" }).await;
}

async fn handle_degrade(socket: &mut TcpSocket<'_>, ctx: &Ctx, target: &str) {
    let on = proto::query_param(target, "on") != Some("0");
    ctx.bus.set_manual_degrade(on);
    send_response(socket, 200, "OK", "text/plain", if on { "degraded" } else { "cleared" }).await;
}

async fn send_response(
    socket: &mut TcpSocket<'_>,
    status: u16,
    status_text: &str,
    content_type: &str,
    body: &str,
) {
    let mut header: HString<256> = HString::new();
    let _ = write!(
        header,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        status_text,
        content_type,
        body.len()
    );

    let _ = socket.write_all(header.as_bytes()).await;
    let _ = socket.write_all(body.as_bytes()).await;
}
