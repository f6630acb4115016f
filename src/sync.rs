//! Dispatcher sync over its simple HTTP protocol.
//!
//! Every round uploads pending events and unacknowledged command outcomes,
//! and downloads newly dispatched commands. The command feed is etag-gated:
//! the server answers 304 while nothing new is queued for this kiosk.
//! Events and outcome reports are only committed after the server
//! acknowledges the round, so a failed sync retries them.

use core::fmt::Write as FmtWrite;

use embassy_futures::select::select;
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::{Duration, Instant, Timer};
use embedded_io_async::Write;
use heapless::String as HString;
use smoltcp::wire::{IpAddress, IpEndpoint, Ipv4Address};

use crate::events::{LockerEvent, MAX_EVENTS};
use crate::proto::{self, FeedEntry};
use crate::shared::Ctx;

const SYNC_INTERVAL_MS: u64 = 10_000;
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Sync task: periodic rounds, plus immediate ones when something pulses
/// `sync_now` (a completed command, a staff action).
pub async fn run_sync(stack: &'static Stack<'static>, ctx: Ctx) -> ! {
    let mut etag: HString<64> = HString::new();

    loop {
        select(Timer::after_millis(SYNC_INTERVAL_MS), ctx.sync_now.wait()).await;
        if !stack.is_config_up() {
            continue;
        }
        sync_once(stack, &ctx, &mut etag).await;
    }
}

async fn sync_once(stack: &'static Stack<'static>, ctx: &Ctx, etag: &mut HString<64>) {
    // Peek without removing; events leave the ring only after the server
    // acknowledges this round.
    let mut events = [LockerEvent::EMPTY; MAX_EVENTS];
    let (event_count, event_tail) = ctx.events.peek(&mut events).await;
    let updates = ctx.queue.lock().await.unreported();

    let mut body: HString<1536> = HString::new();
    proto::build_sync_body(ctx.config.kiosk_id, &events[..event_count], &updates, &mut body);

    let remote_addr = match proto::parse_ipv4(ctx.config.server_host) {
        Some([a, b, c, d]) => IpAddress::Ipv4(Ipv4Address::new(a, b, c, d)),
        None => {
            log::error!("sync: invalid dispatcher address: {}", ctx.config.server_host);
            return;
        }
    };

    let mut rx_buf = [0u8; 2048];
    let mut tx_buf = [0u8; 1024];
    let mut socket = TcpSocket::new(*stack, &mut rx_buf, &mut tx_buf);
    socket.set_timeout(Some(IO_TIMEOUT));

    let remote = IpEndpoint::new(remote_addr, ctx.config.server_port);
    log::debug!("sync: connecting to {:?}", remote);
    if let Err(e) = socket.connect(remote).await {
        log::warn!("sync: connect failed: {:?}", e);
        socket.abort();
        return;
    }

    let mut request: HString<512> = HString::new();
    let _ = write!(
        request,
        "POST /api/kiosk/{}/sync HTTP/1.1\r\n\
         Host: {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n",
        ctx.config.kiosk_id,
        ctx.config.server_host,
        body.len()
    );
    if !etag.is_empty() {
        let _ = write!(request, "If-None-Match: {}\r\n", etag);
    }
    let _ = request.push_str("\r\n");

    if let Err(e) = socket.write_all(request.as_bytes()).await {
        log::warn!("sync: write headers failed: {:?}", e);
        socket.abort();
        return;
    }
    if let Err(e) = socket.write_all(body.as_bytes()).await {
        log::warn!("sync: write body failed: {:?}", e);
        socket.abort();
        return;
    }

    let mut response_buf = [0u8; 2048];
    let mut total_read = 0;
    loop {
        match socket.read(&mut response_buf[total_read..]).await {
            Ok(0) => break,
            Ok(n) => {
                total_read += n;
                if total_read >= response_buf.len() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("sync: read failed: {:?}", e);
                socket.abort();
                return;
            }
        }
    }
    socket.abort();

    let response = match core::str::from_utf8(&response_buf[..total_read]) {
        Ok(s) => s,
        Err(_) => {
            log::error!("sync: invalid response encoding");
            return;
        }
    };

    let status = proto::parse_status_code(response);
    log::debug!("sync: status {}", status);

    match status {
        304 => {
            // Feed unchanged; the round is acknowledged.
            acknowledge(ctx, event_count, event_tail, &updates).await;
        }
        200 => {
            let feed = match proto::parse_command_feed(proto::body_of(response)) {
                Ok(feed) => feed,
                Err(e) => {
                    log::error!("sync: {}", e);
                    // Events stay queued; they retry next round.
                    return;
                }
            };

            if let Some(new_etag) = proto::extract_header(response, "etag") {
                etag.clear();
                let _ = etag.push_str(new_etag);
            }

            apply_feed(ctx, &feed).await;
            acknowledge(ctx, event_count, event_tail, &updates).await;
        }
        _ => {
            log::warn!("sync: unexpected status: {}", status);
        }
    }
}

async fn acknowledge(
    ctx: &Ctx,
    event_count: usize,
    event_tail: usize,
    updates: &[crate::commands::StatusUpdate],
) {
    ctx.events.commit(event_count, event_tail).await;
    if !updates.is_empty() {
        ctx.queue.lock().await.mark_reported(updates);
        ctx.dirty.signal(());
    }
}

async fn apply_feed(ctx: &Ctx, feed: &[FeedEntry]) {
    if feed.is_empty() {
        return;
    }
    let now = Instant::now().as_millis();
    let mut changed = false;
    {
        let mut queue = ctx.queue.lock().await;
        for entry in feed {
            match entry {
                FeedEntry::Command { id, kind, actor } => {
                    // The queue re-checks this, but a feed entry aimed at a
                    // locker this kiosk does not have is worth its own log
                    // line: it usually means a mis-routed dispatch.
                    if !kind.targets_in_range(ctx.config.locker_count) {
                        log::warn!("sync: rejecting {}: locker out of range", id);
                        continue;
                    }
                    match queue.enqueue(id.as_str(), kind.clone(), actor.as_str(), now) {
                        Ok(status) => {
                            log::info!("sync: command {} -> {}", id, status.as_str());
                            changed = true;
                        }
                        Err(e) => log::error!("sync: enqueue {} failed: {:?}", id, e),
                    }
                }
                FeedEntry::Cancel { target } => {
                    if queue.cancel(target.as_str(), now) {
                        log::info!("sync: cancelled {}", target);
                        changed = true;
                    }
                }
            }
        }
    }
    if changed {
        ctx.dirty.signal(());
    }
}
