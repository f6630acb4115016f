//! RS-485 bus controller for the relay cards.
//!
//! Owns the serial port exclusively. Every frame on the wire goes through
//! one mutex, with a minimum gap between frames so the slowest card's
//! turnaround is absorbed; callers above serialize per locker, this module
//! serializes per wire.
//!
//! An open is a pulse (coil on, dwell, coil off). A latch that refuses to
//! move gets a burst: pulse cycles for a fixed window, then an
//! unconditional close so the relay is never left energized. Failed writes
//! retry with exponential backoff and a per-write fallback from 0x0F to
//! 0x05, since a few relay card firmwares only honor one of the two.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use esp_hal::gpio::Output;
use esp_hal::rng::Rng;
use esp_hal::uart::Uart;
use esp_hal::Async;
use heapless::Vec;

use crate::config::{backoff_ms, Tuning, CHANNELS_PER_CARD};
use crate::events::{EventBuffer, EventKind, LockerEvent};
use crate::modbus::{self, FrameError, EXCEPTION_LEN, MAX_RESPONSE};
use crate::shared::{in_maintenance, maintenance_changed};

/// Consecutive frame failures that trigger a liveness probe at the next
/// health tick even if the windowed error rate looks fine.
const PROBE_AFTER_CONSECUTIVE: u32 = 8;

/// Seconds without a successful frame (while traffic is failing) before
/// the link is considered degraded.
const STALE_SUCCESS_S: u32 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Port not usable: disconnected or still connecting. Not retried.
    Unavailable,
    /// Frame sent, no (complete) response within the timeout.
    Timeout,
    /// CRC mismatch or a response that does not match the request.
    Framing,
    /// The card rejected the request with a Modbus exception.
    Exception(u8),
}

impl BusError {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusError::Unavailable => "hardware_unavailable",
            BusError::Timeout => "bus_timeout",
            BusError::Framing => "bus_framing",
            BusError::Exception(_) => "bus_exception",
        }
    }
}

impl From<FrameError> for BusError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Exception(code) => BusError::Exception(code),
            // A mangled response is indistinguishable from line noise;
            // treat it like a timeout and let the retry ladder handle it.
            FrameError::Truncated | FrameError::Crc | FrameError::Mismatch => BusError::Framing,
        }
    }
}

/// How an open ultimately succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMethod {
    Pulse,
    Burst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Degraded => "degraded",
        }
    }
}

impl From<u8> for LinkState {
    fn from(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Degraded,
            _ => LinkState::Disconnected,
        }
    }
}

/// Read-only view of the controller's counters for the staff surface.
#[derive(Debug, Clone, Copy)]
pub struct HealthSnapshot {
    pub state: LinkState,
    pub frames_ok: u32,
    pub frames_err: u32,
    pub error_rate_pct: u8,
    /// Seconds since the last successful frame; `None` before the first.
    pub last_success_age_s: Option<u32>,
    pub reconnects: u32,
    pub consecutive_errors: u32,
}

/// Everything that must only be touched with the bus mutex held.
struct Wire {
    uart: Uart<'static, Async>,
    /// RS-485 driver-enable: high while transmitting.
    driver_enable: Output<'static>,
    last_frame_done: Instant,
}

pub struct BusController {
    wire: Mutex<CriticalSectionRawMutex, Wire>,
    tuning: Tuning,
    rng: Rng,
    events: &'static EventBuffer,
    card_count: u8,

    state: AtomicU8,
    // Cumulative counters for the snapshot.
    total_ok: AtomicU32,
    total_err: AtomicU32,
    // Window counters, reset by each health tick.
    window_ok: AtomicU32,
    window_err: AtomicU32,
    consecutive_errors: AtomicU32,
    /// Seconds since boot of the last good frame; u32::MAX = never.
    last_success_s: AtomicU32,
    reconnects: AtomicU32,
    ever_connected: AtomicBool,
    manual_degrade: AtomicBool,
}

impl BusController {
    pub fn new(
        uart: Uart<'static, Async>,
        driver_enable: Output<'static>,
        tuning: Tuning,
        rng: Rng,
        events: &'static EventBuffer,
        card_count: u8,
    ) -> Self {
        Self {
            wire: Mutex::new(Wire {
                uart,
                driver_enable,
                last_frame_done: Instant::now(),
            }),
            tuning,
            rng,
            events,
            card_count,
            state: AtomicU8::new(LinkState::Disconnected as u8),
            total_ok: AtomicU32::new(0),
            total_err: AtomicU32::new(0),
            window_ok: AtomicU32::new(0),
            window_err: AtomicU32::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_success_s: AtomicU32::new(u32::MAX),
            reconnects: AtomicU32::new(0),
            ever_connected: AtomicBool::new(false),
            manual_degrade: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Staff override: force or clear the Degraded flag.
    pub fn set_manual_degrade(&self, on: bool) {
        self.manual_degrade.store(on, Ordering::Release);
    }

    /// Close the port: every operation fails with `Unavailable` until a
    /// probe brings the link back. Used by the maintenance stop.
    pub fn close(&self) {
        self.set_state(LinkState::Disconnected);
        log::info!("bus: port closed");
    }

    pub fn health(&self) -> HealthSnapshot {
        let ok = self.window_ok.load(Ordering::Relaxed);
        let err = self.window_err.load(Ordering::Relaxed);
        let total = ok + err;
        let last = self.last_success_s.load(Ordering::Relaxed);
        HealthSnapshot {
            state: self.state(),
            frames_ok: self.total_ok.load(Ordering::Relaxed),
            frames_err: self.total_err.load(Ordering::Relaxed),
            error_rate_pct: if total > 0 { (err * 100 / total) as u8 } else { 0 },
            last_success_age_s: (last != u32::MAX)
                .then(|| (Instant::now().as_secs() as u32).saturating_sub(last)),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
        }
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        match self.state() {
            LinkState::Connected | LinkState::Degraded => Ok(()),
            LinkState::Disconnected | LinkState::Connecting => Err(BusError::Unavailable),
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Unlock one latch. Tries pulses first, escalates to bursts, with
    /// backoff between attempts. Returns how the latch finally opened.
    pub async fn open_channel(&self, slave: u8, channel: u16) -> Result<OpenMethod, BusError> {
        self.ensure_available()?;
        let mut rng = self.rng;
        let mut last = BusError::Timeout;

        for attempt in 0..=self.tuning.max_retries {
            if attempt > 0 {
                Timer::after_millis(backoff_ms(attempt - 1, rng.random())).await;
            }
            match self.pulse(slave, channel).await {
                Ok(()) => return Ok(OpenMethod::Pulse),
                Err(BusError::Unavailable) => return Err(BusError::Unavailable),
                Err(e) => last = e,
            }
        }

        log::warn!(
            "bus: pulses exhausted for slave {} channel {}, escalating to burst",
            slave,
            channel
        );
        self.events
            .push(LockerEvent::new(
                Instant::now().as_millis(),
                EventKind::BurstRequired,
                modbus::channel_to_locker(slave, channel),
                "bus",
                last.as_str(),
            ))
            .await;

        for attempt in 0..=self.tuning.max_retries {
            if attempt > 0 {
                Timer::after_millis(backoff_ms(attempt - 1, rng.random())).await;
            }
            match self.burst(slave, channel).await {
                Ok(()) => return Ok(OpenMethod::Burst),
                Err(BusError::Unavailable) => return Err(BusError::Unavailable),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Force a coil off. Used by burst cleanup and as the emergency staff
    /// primitive; single attempt, the caller decides about retries.
    pub async fn close_channel(&self, slave: u8, channel: u16) -> Result<(), BusError> {
        self.ensure_available()?;
        self.write_coil(slave, channel, false).await
    }

    /// Probe a span of slave addresses for liveness.
    pub async fn scan_bus(&self, first: u8, last: u8) -> Vec<u8, 16> {
        let mut found = Vec::new();
        for slave in first..=last {
            if self.probe(slave).await.is_ok() {
                let _ = found.push(slave);
            }
        }
        found
    }

    /// One energize/de-energize cycle. The bus mutex is held per frame,
    /// not across the dwell, so other slots can interleave on the wire.
    async fn pulse(&self, slave: u8, channel: u16) -> Result<(), BusError> {
        self.write_coil(slave, channel, true).await?;
        Timer::after_millis(self.tuning.open_pulse_ms).await;
        self.write_coil(slave, channel, false).await
    }

    /// Pulse cycles for the whole burst window, then an unconditional
    /// close. Success means at least one pulse went through.
    async fn burst(&self, slave: u8, channel: u16) -> Result<(), BusError> {
        let deadline = Instant::now() + Duration::from_millis(self.tuning.open_burst_ms);
        let mut any_ok = false;
        let mut last = BusError::Timeout;

        loop {
            match self.pulse(slave, channel).await {
                Ok(()) => any_ok = true,
                Err(BusError::Unavailable) => {
                    last = BusError::Unavailable;
                    break;
                }
                Err(e) => last = e,
            }
            if Instant::now() >= deadline {
                break;
            }
            Timer::after_millis(self.tuning.open_burst_interval_ms).await;
            if Instant::now() >= deadline {
                break;
            }
        }

        // The relay must not stay energized even if every pulse above was
        // cut short, so the close goes out regardless of the outcome.
        if let Err(e) = self.write_coil(slave, channel, false).await {
            log::warn!("bus: burst cleanup close failed: {:?}", e);
        }

        if any_ok { Ok(()) } else { Err(last) }
    }

    /// Write one coil, preferring 0x0F with a per-write fallback to 0x05.
    async fn write_coil(&self, slave: u8, channel: u16, on: bool) -> Result<(), BusError> {
        let mut wire = self.wire.lock().await;
        let coil = modbus::coil_address(channel);

        let result = if self.tuning.use_multiple_coils {
            let frame = modbus::write_multiple_coils(slave, coil, on);
            match self
                .request(&mut wire, &frame, modbus::response_len(modbus::WRITE_MULTIPLE_COILS, 1))
                .await
            {
                Ok(()) => Ok(()),
                Err(e) => {
                    log::debug!(
                        "bus: 0x0F failed ({:?}), falling back to 0x05 for slave {} coil {}",
                        e,
                        slave,
                        coil
                    );
                    let frame = modbus::write_single_coil(slave, coil, on);
                    self.request(&mut wire, &frame, modbus::response_len(modbus::WRITE_SINGLE_COIL, 1))
                        .await
                }
            }
        } else {
            let frame = modbus::write_single_coil(slave, coil, on);
            self.request(&mut wire, &frame, modbus::response_len(modbus::WRITE_SINGLE_COIL, 1))
                .await
        };

        if result.is_ok() && self.tuning.verify_writes {
            self.verify_coil(&mut wire, slave, coil, on).await;
        }
        result
    }

    /// Send a write frame and validate its response.
    async fn request(&self, wire: &mut Wire, frame: &[u8], expect: usize) -> Result<(), BusError> {
        let mut response = [0u8; MAX_RESPONSE];
        let result = match self.exchange(wire, frame, &mut response, expect).await {
            Ok(n) => modbus::check_write_response(frame, &response[..n]).map_err(BusError::from),
            Err(e) => Err(e),
        };
        self.record(&result);
        result
    }

    /// Optional read-back after a write. Never fails the operation; an
    /// unexpected coil state is only worth a warning.
    async fn verify_coil(&self, wire: &mut Wire, slave: u8, coil: u16, expect_on: bool) {
        let frame = modbus::read_coils(slave, coil, 1);
        let mut response = [0u8; MAX_RESPONSE];
        let result = match self
            .exchange(wire, &frame, &mut response, modbus::response_len(modbus::READ_COILS, 1))
            .await
        {
            Ok(n) => modbus::parse_read_coils(&frame, 1, &response[..n]).map_err(BusError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(bits) => {
                let is_on = bits & 1 != 0;
                if is_on != expect_on {
                    log::warn!(
                        "bus: verify mismatch on slave {} coil {}: expected {}, read {}",
                        slave,
                        coil,
                        expect_on,
                        is_on
                    );
                }
                self.record::<()>(&Ok(()));
            }
            Err(e) => {
                log::warn!("bus: verify read failed on slave {} coil {}: {:?}", slave, coil, e);
                self.record::<()>(&Err(e));
            }
        }
    }

    /// Liveness probe: read the first card's coil block. Bypasses the
    /// availability gate so the reconnect path can use it.
    async fn probe(&self, slave: u8) -> Result<(), BusError> {
        let mut wire = self.wire.lock().await;
        let frame = modbus::read_coils(slave, 0, CHANNELS_PER_CARD);
        let expect = modbus::response_len(modbus::READ_COILS, CHANNELS_PER_CARD);
        let mut response = [0u8; MAX_RESPONSE];
        let result = match self.exchange(&mut wire, &frame, &mut response, expect).await {
            Ok(n) => modbus::parse_read_coils(&frame, CHANNELS_PER_CARD, &response[..n])
                .map(|_| ())
                .map_err(BusError::from),
            Err(e) => Err(e),
        };
        self.record(&result);
        result
    }

    async fn probe_any(&self) -> Result<(), BusError> {
        let mut last = BusError::Timeout;
        for slave in 1..=self.card_count.max(1) {
            match self.probe(slave).await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    // ========================================================================
    // Wire access
    // ========================================================================

    /// One request/response exchange under the bus mutex: pace the
    /// inter-frame gap, drain stale bytes, transmit with the driver-enable
    /// pin raised, then collect the expected response within the timeout.
    async fn exchange(
        &self,
        wire: &mut Wire,
        frame: &[u8],
        response: &mut [u8],
        expect: usize,
    ) -> Result<usize, BusError> {
        let gap = Duration::from_millis(self.tuning.command_interval_ms);
        let since = wire.last_frame_done.elapsed();
        if since < gap {
            Timer::after(gap - since).await;
        }

        let timeout = Duration::from_millis(self.tuning.timeout_ms);
        let result = self.exchange_inner(wire, frame, response, expect, timeout).await;
        wire.last_frame_done = Instant::now();
        result
    }

    async fn exchange_inner(
        &self,
        wire: &mut Wire,
        frame: &[u8],
        response: &mut [u8],
        expect: usize,
        timeout: Duration,
    ) -> Result<usize, BusError> {
        // Stale bytes from a late or aborted earlier response would shift
        // this frame's response; drop them first.
        let mut scratch = [0u8; MAX_RESPONSE];
        while let Ok(n) = wire.uart.read_buffered(&mut scratch) {
            if n == 0 {
                break;
            }
            log::debug!("bus: drained {} stale bytes", n);
        }

        wire.driver_enable.set_high();
        let sent = with_timeout(timeout, async {
            let mut sent = 0;
            while sent < frame.len() {
                sent += wire
                    .uart
                    .write_async(&frame[sent..])
                    .await
                    .map_err(|_| BusError::Framing)?;
            }
            wire.uart.flush_async().await.map_err(|_| BusError::Framing)
        })
        .await;
        wire.driver_enable.set_low();
        match sent {
            Err(_) => return Err(BusError::Timeout),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }

        let read = with_timeout(timeout, async {
            let mut got = 0usize;
            let mut target = expect.min(response.len());
            loop {
                let n = wire
                    .uart
                    .read_async(&mut response[got..target])
                    .await
                    .map_err(|_| BusError::Framing)?;
                got += n;
                // An exception reply is shorter than any normal response.
                if got >= 2 && response[1] & 0x80 != 0 {
                    target = EXCEPTION_LEN;
                }
                if got >= target {
                    return Ok(got);
                }
            }
        })
        .await;
        match read {
            Err(_) => Err(BusError::Timeout),
            Ok(result) => result,
        }
    }

    fn record<T>(&self, result: &Result<T, BusError>) {
        match result {
            Ok(_) => {
                self.total_ok.fetch_add(1, Ordering::Relaxed);
                self.window_ok.fetch_add(1, Ordering::Relaxed);
                self.consecutive_errors.store(0, Ordering::Relaxed);
                self.last_success_s
                    .store(Instant::now().as_secs() as u32, Ordering::Relaxed);
            }
            Err(e) => {
                self.total_err.fetch_add(1, Ordering::Relaxed);
                self.window_err.fetch_add(1, Ordering::Relaxed);
                self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                log::debug!("bus: frame error: {:?}", e);
            }
        }
    }

    // ========================================================================
    // Health and reconnection
    // ========================================================================

    /// Long-lived task: initial connect, periodic health evaluation, and
    /// background reconnection. A maintenance stop closes the port and
    /// parks this timer until the flag clears.
    pub async fn run_health_monitor(&'static self) -> ! {
        self.connect().await;

        loop {
            if in_maintenance() {
                log::info!("bus: maintenance stop");
                self.close();
                while in_maintenance() {
                    maintenance_changed().await;
                }
                log::info!("bus: maintenance cleared, reopening");
                self.connect().await;
                continue;
            }

            // Wake early on a maintenance change so the port closes
            // without waiting out the health interval.
            let tick = select(
                Timer::after_millis(self.tuning.health_check_interval_ms),
                maintenance_changed(),
            )
            .await;
            if let Either::Second(_) = tick {
                continue;
            }

            if self.state() == LinkState::Disconnected {
                self.connect().await;
                continue;
            }

            let ok = self.window_ok.swap(0, Ordering::Relaxed);
            let err = self.window_err.swap(0, Ordering::Relaxed);
            let total = ok + err;
            // Too few samples say nothing; don't flap on a single frame.
            let rate = if total >= 4 { (err * 100 / total) as u8 } else { 0 };

            if rate >= 50
                || self.consecutive_errors.load(Ordering::Relaxed) >= PROBE_AFTER_CONSECUTIVE
            {
                log::warn!("bus: error rate {}% in window, probing", rate);
                if self.probe_any().await.is_err() {
                    log::error!("bus: probe failed, link is down");
                    self.set_state(LinkState::Disconnected);
                    self.push_health_event(EventKind::HardwareUnavailable, "probe_failed").await;
                    self.connect().await;
                    continue;
                }
            }

            let stale = self
                .health()
                .last_success_age_s
                .is_some_and(|age| age >= STALE_SUCCESS_S)
                && self.consecutive_errors.load(Ordering::Relaxed) > 0;
            let degraded = (25..50).contains(&rate)
                || stale
                || self.manual_degrade.load(Ordering::Acquire);

            match (self.state(), degraded) {
                (LinkState::Connected, true) => {
                    log::warn!("bus: degraded (rate={}%, stale={})", rate, stale);
                    self.set_state(LinkState::Degraded);
                    self.push_health_event(EventKind::HealthDegraded, "").await;
                }
                (LinkState::Degraded, false) => {
                    log::info!("bus: healthy again");
                    self.set_state(LinkState::Connected);
                }
                _ => {}
            }
        }
    }

    /// Probe for any relay card, with backoff, up to the configured
    /// attempt ceiling. Leaves the link Connected or Disconnected.
    async fn connect(&self) -> bool {
        self.set_state(LinkState::Connecting);
        let mut rng = self.rng;

        for attempt in 0..=self.tuning.connection_retry_attempts {
            if attempt > 0 {
                Timer::after_millis(backoff_ms(attempt - 1, rng.random())).await;
            }
            if self.probe_any().await.is_ok() {
                self.set_state(LinkState::Connected);
                if self.ever_connected.swap(true, Ordering::AcqRel) {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::info!("bus: reconnected");
                    self.push_health_event(EventKind::Reconnected, "").await;
                } else {
                    log::info!("bus: connected");
                }
                return true;
            }
        }

        self.set_state(LinkState::Disconnected);
        log::error!(
            "bus: no relay card answered after {} attempts",
            self.tuning.connection_retry_attempts + 1
        );
        self.push_health_event(EventKind::ReconnectionFailed, "").await;
        false
    }

    async fn push_health_event(&self, kind: EventKind, detail: &str) {
        self.events
            .push(LockerEvent::new(Instant::now().as_millis(), kind, 0, "bus", detail))
            .await;
    }
}
