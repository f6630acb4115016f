//! Kiosk identity, relay topology, and runtime tuning.
//!
//! Identity and network configuration is embedded at compile time via
//! environment variables (see build.rs):
//!
//!   KIOSK_ID=K1 \
//!   KIOSK_LOCKERS=30 \
//!   KIOSK_VIP=4,12 \
//!   KIOSK_SSID=MyWiFi \
//!   KIOSK_PASSWORD=secret \
//!   KIOSK_HOST=192.168.1.68 \
//!   KIOSK_PORT=8080 \
//!   cargo build --release
//!
//! Timing and retry knobs live in [`Tuning`], threaded through the bus
//! controller and executor constructors so tests can shrink the windows.

/// Capacity of the locker table. KIOSK_LOCKERS must not exceed this.
pub const MAX_LOCKERS: usize = 64;

/// Channels per relay card. Fixed by the card hardware; the locker-id
/// mapping in `modbus` assumes it.
pub const CHANNELS_PER_CARD: u16 = 16;

/// Kiosk configuration, embedded at compile time.
#[derive(Clone)]
pub struct KioskConfig {
    pub kiosk_id: &'static str,
    pub locker_count: u16,
    /// Comma-separated locker ids excluded from the free pool and bulk sweeps.
    pub vip_lockers: &'static str,
    pub ssid: &'static str,
    pub password: &'static str,
    pub server_host: &'static str,
    pub server_port: u16,
    pub baud_rate: u32,
}

impl KioskConfig {
    /// Get the compile-time configuration.
    pub fn get() -> Self {
        Self {
            kiosk_id: option_env!("KIOSK_ID").unwrap_or("unconfigured"),
            locker_count: match option_env!("KIOSK_LOCKERS") {
                Some(s) => clamp_lockers(parse_num(s, 30)),
                None => 30,
            },
            vip_lockers: option_env!("KIOSK_VIP").unwrap_or(""),
            ssid: option_env!("KIOSK_SSID").unwrap_or("unconfigured"),
            password: option_env!("KIOSK_PASSWORD").unwrap_or(""),
            server_host: option_env!("KIOSK_HOST").unwrap_or("192.168.1.1"),
            server_port: match option_env!("KIOSK_PORT") {
                Some(s) => parse_num(s, 8080),
                None => 8080,
            },
            baud_rate: match option_env!("KIOSK_BAUD") {
                Some(s) => parse_num(s, 9600) as u32,
                None => 9600,
            },
        }
    }

    /// Number of relay cards needed to cover all lockers.
    pub fn card_count(&self) -> u8 {
        (self.locker_count.div_ceil(CHANNELS_PER_CARD)) as u8
    }
}

/// Parse a decimal number at compile time (const fn compatible).
/// Non-digit characters are skipped; an all-garbage string yields `default`.
const fn parse_num(s: &str, default: u16) -> u16 {
    let bytes = s.as_bytes();
    let mut result: u16 = 0;
    let mut any = false;
    let mut i = 0;
    while i < bytes.len() {
        let digit = bytes[i];
        if digit >= b'0' && digit <= b'9' {
            result = result.wrapping_mul(10).wrapping_add((digit - b'0') as u16);
            any = true;
        }
        i += 1;
    }
    if any { result } else { default }
}

const fn clamp_lockers(n: u16) -> u16 {
    if n == 0 {
        30
    } else if n > MAX_LOCKERS as u16 {
        MAX_LOCKERS as u16
    } else {
        n
    }
}

/// True if `locker` appears in a comma-separated id list such as "4,12".
pub fn in_id_list(list: &str, locker: u16) -> bool {
    list.split(',')
        .filter_map(|part| part.trim().parse::<u16>().ok())
        .any(|id| id == locker)
}

/// Timing and retry knobs. Defaults match the deployed kiosk fleet.
#[derive(Clone, Copy)]
pub struct Tuning {
    /// Pacing between bulk-open iterations.
    pub bulk_interval_ms: u64,
    /// Reservation lifetime before the janitor returns a locker to Free.
    pub reserve_ttl_ms: u64,
    /// Single-pulse energize duration.
    pub open_pulse_ms: u64,
    /// Burst window length.
    pub open_burst_ms: u64,
    /// Inter-pulse spacing inside a burst.
    pub open_burst_interval_ms: u64,
    /// Minimum spacing between two frames on the wire, measured from the
    /// completion of the previous frame.
    pub command_interval_ms: u64,
    /// Per-frame wire timeout.
    pub timeout_ms: u64,
    /// Extra tries after the first, for pulses, bursts, and queued commands.
    pub max_retries: u32,
    /// Bus reconnect probe ceiling per recovery round.
    pub connection_retry_attempts: u32,
    /// Health check cadence.
    pub health_check_interval_ms: u64,
    /// Prefer 0x0F Write Multiple Coils; fall back to 0x05 per write.
    pub use_multiple_coils: bool,
    /// Read the coil back after each write and warn on unexpected state.
    pub verify_writes: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            bulk_interval_ms: 300,
            reserve_ttl_ms: 90_000,
            open_pulse_ms: 400,
            open_burst_ms: 10_000,
            open_burst_interval_ms: 2_000,
            command_interval_ms: 300,
            timeout_ms: 1_000,
            max_retries: 3,
            connection_retry_attempts: 3,
            health_check_interval_ms: 30_000,
            use_multiple_coils: true,
            verify_writes: false,
        }
    }
}

/// Exponential backoff base and cap, shared by the bus retry loop and the
/// command queue reschedule path.
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_CAP_MS: u64 = 30_000;

/// `min(base * 2^attempt, cap)` plus a jitter in `[0, delay/10]` derived
/// from `entropy`.
pub fn backoff_ms(attempt: u32, entropy: u32) -> u64 {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    let delay = exp.min(BACKOFF_CAP_MS);
    delay + (entropy as u64) % (delay / 10 + 1)
}
