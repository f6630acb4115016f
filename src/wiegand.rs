//! Async Wiegand 26/34-bit card reader using Embassy GPIO edge detection.
//!
//! The kiosk's RFID scanner clocks bits out on two lines: a pulse on D0 is
//! a zero, on D1 a one. A transmission is over when no edge arrives within
//! the bit timeout. Both standard frame lengths carry split parity, which
//! is checked here; everything above this module only ever sees a validated
//! credential.

use embassy_time::{with_timeout, Duration, Instant};
use esp_hal::gpio::Input;

// Debounce covers optocoupler propagation delay and edge ringing. Wiegand
// pulses are 50-100us with 1-2ms between bits, so 500us is safe.
const DEBOUNCE: Duration = Duration::from_micros(500);
const BIT_TIMEOUT: Duration = Duration::from_millis(25);

/// A parity-checked card read. `value` holds the payload bits (24 or 32),
/// `bits` the frame length they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardRead {
    pub value: u32,
    pub bits: u8,
}

/// Async Wiegand reader on a D0/D1 pin pair.
pub struct Wiegand<'a> {
    d0: Input<'a>,
    d1: Input<'a>,
}

impl<'a> Wiegand<'a> {
    pub fn new(d0: Input<'a>, d1: Input<'a>) -> Self {
        Self { d0, d1 }
    }

    /// Read one complete transmission. Returns `None` for frames of an
    /// unknown length or with bad parity.
    pub async fn read(&mut self) -> Option<CardRead> {
        let first_bit = self.wait_for_bit().await;

        let mut last_bit = Instant::now();
        let mut raw: u64 = first_bit as u64;
        let mut count: u32 = 1;

        loop {
            match with_timeout(BIT_TIMEOUT, self.wait_for_bit()).await {
                Ok(bit) => {
                    let now = Instant::now();
                    if now.duration_since(last_bit) < DEBOUNCE {
                        continue;
                    }
                    last_bit = now;

                    if count >= 64 {
                        break;
                    }
                    raw = (raw << 1) | (bit as u64);
                    count += 1;
                }
                Err(_) => break, // Transmission complete
            }
        }

        match count {
            26 | 34 => decode(raw, count as u8),
            _ => {
                log::warn!("wiegand: unknown frame length ({} bits)", count);
                None
            }
        }
    }

    /// Wait for an edge on either data line and return the bit it encodes.
    ///
    /// The optocouplers invert the reader's open-collector pulses, so the
    /// interesting edge on the MCU side is the rising one.
    async fn wait_for_bit(&mut self) -> u8 {
        use embassy_futures::select::{select, Either};

        match select(self.d0.wait_for_rising_edge(), self.d1.wait_for_rising_edge()).await {
            Either::First(()) => 0,
            Either::Second(()) => 1,
        }
    }
}

/// Strip and verify the parity envelope of a 26- or 34-bit frame: leading
/// even parity over the upper half of the payload, trailing odd parity
/// over the lower half.
fn decode(raw: u64, bits: u8) -> Option<CardRead> {
    let payload_bits = bits as u32 - 2;
    let leading = ((raw >> (bits - 1)) & 1) as u32;
    let trailing = (raw & 1) as u32;
    let payload = ((raw >> 1) & ((1u64 << payload_bits) - 1)) as u32;

    let half = payload_bits / 2;
    let upper = payload >> half;
    let lower = payload & ((1 << half) - 1);
    let even_ok = (upper.count_ones() % 2) == leading;
    let odd_ok = (lower.count_ones() % 2) != trailing;
    if !even_ok || !odd_ok {
        log::warn!("wiegand: {}-bit parity failed", bits);
        return None;
    }

    Some(CardRead { value: payload, bits })
}
