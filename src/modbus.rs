//! Modbus-RTU framing for the relay-card bus.
//!
//! Only the subset the relay cards speak: 0x01 Read Coils, 0x05 Write
//! Single Coil, 0x0F Write Multiple Coils. Frames are
//! `[slave][function][payload][crc lo][crc hi]` with the CRC-16 computed
//! over everything before it.
//!
//! This module is hardware-free; the serial plumbing lives in `bus`.

use crate::config::CHANNELS_PER_CARD;

pub const READ_COILS: u8 = 0x01;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Length of a Modbus exception response: slave, function|0x80, code, CRC.
pub const EXCEPTION_LEN: usize = 5;

/// Largest response we ever expect (read of a full 16-channel card).
pub const MAX_RESPONSE: usize = 16;

/// Frame-level decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Response shorter than its fixed layout allows.
    Truncated,
    /// CRC-16 mismatch.
    Crc,
    /// The card answered with an exception frame carrying this code.
    Exception(u8),
    /// Well-formed response that does not match the request.
    Mismatch,
}

/// CRC-16 with the Modbus polynomial (0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
    }
    crc
}

fn seal(frame: &mut [u8]) {
    let body = frame.len() - 2;
    let crc = crc16(&frame[..body]);
    frame[body] = (crc & 0xFF) as u8;
    frame[body + 1] = (crc >> 8) as u8;
}

/// Verify the trailing CRC of a received frame.
pub fn check_crc(frame: &[u8]) -> Result<(), FrameError> {
    if frame.len() < 4 {
        return Err(FrameError::Truncated);
    }
    let body = frame.len() - 2;
    let crc = crc16(&frame[..body]);
    let got = frame[body] as u16 | ((frame[body + 1] as u16) << 8);
    if crc == got { Ok(()) } else { Err(FrameError::Crc) }
}

/// 0x05 Write Single Coil. `on` maps to 0xFF00, off to 0x0000.
pub fn write_single_coil(slave: u8, coil: u16, on: bool) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = slave;
    frame[1] = WRITE_SINGLE_COIL;
    frame[2..4].copy_from_slice(&coil.to_be_bytes());
    frame[4] = if on { 0xFF } else { 0x00 };
    frame[5] = 0x00;
    seal(&mut frame);
    frame
}

/// 0x0F Write Multiple Coils for a single coil (quantity 1, one data byte).
pub fn write_multiple_coils(slave: u8, coil: u16, on: bool) -> [u8; 10] {
    let mut frame = [0u8; 10];
    frame[0] = slave;
    frame[1] = WRITE_MULTIPLE_COILS;
    frame[2..4].copy_from_slice(&coil.to_be_bytes());
    frame[4..6].copy_from_slice(&1u16.to_be_bytes());
    frame[6] = 1; // byte count
    frame[7] = if on { 0x01 } else { 0x00 };
    seal(&mut frame);
    frame
}

/// 0x01 Read Coils.
pub fn read_coils(slave: u8, start: u16, count: u16) -> [u8; 8] {
    let mut frame = [0u8; 8];
    frame[0] = slave;
    frame[1] = READ_COILS;
    frame[2..4].copy_from_slice(&start.to_be_bytes());
    frame[4..6].copy_from_slice(&count.to_be_bytes());
    seal(&mut frame);
    frame
}

/// Expected response length for a request, exception frames aside.
pub fn response_len(function: u8, count: u16) -> usize {
    match function {
        // Echo of the request.
        WRITE_SINGLE_COIL => 8,
        // slave, function, address, quantity, CRC.
        WRITE_MULTIPLE_COILS => 8,
        // slave, function, byte count, data, CRC.
        READ_COILS => 5 + count.div_ceil(8) as usize,
        _ => EXCEPTION_LEN,
    }
}

/// Common response validation: CRC, exception detection, and header match
/// against the request's slave and function bytes.
fn check_header(request: &[u8], response: &[u8]) -> Result<(), FrameError> {
    if response.len() >= EXCEPTION_LEN && response[1] == (request[1] | 0x80) {
        check_crc(&response[..EXCEPTION_LEN])?;
        return Err(FrameError::Exception(response[2]));
    }
    check_crc(response)?;
    if response[0] != request[0] || response[1] != request[1] {
        return Err(FrameError::Mismatch);
    }
    Ok(())
}

/// Validate the response to a coil write (either function code).
///
/// 0x05 answers with a byte-for-byte echo; 0x0F answers with the address
/// and quantity. Anything else well-formed is a `Mismatch`.
pub fn check_write_response(request: &[u8], response: &[u8]) -> Result<(), FrameError> {
    check_header(request, response)?;
    match request[1] {
        WRITE_SINGLE_COIL => {
            if response != request {
                return Err(FrameError::Mismatch);
            }
        }
        WRITE_MULTIPLE_COILS => {
            if response.len() != 8 || response[2..6] != request[2..6] {
                return Err(FrameError::Mismatch);
            }
        }
        _ => return Err(FrameError::Mismatch),
    }
    Ok(())
}

/// Decode a 0x01 Read Coils response into a bitmask, coil `start` in bit 0.
pub fn parse_read_coils(request: &[u8], count: u16, response: &[u8]) -> Result<u16, FrameError> {
    check_header(request, response)?;
    let expect = response_len(READ_COILS, count);
    if response.len() != expect || response[2] as usize != expect - 5 {
        return Err(FrameError::Mismatch);
    }
    let mut bits = 0u16;
    for i in 0..count.min(16) {
        let byte = response[3 + (i / 8) as usize];
        if byte >> (i % 8) & 1 != 0 {
            bits |= 1 << i;
        }
    }
    Ok(bits)
}

/// Physical address of a logical locker: `(slave, channel)`, both 1-based.
///
/// Card 1 carries lockers 1..=16, card 2 lockers 17..=32, and so on. The
/// mapping is fixed per kiosk; only this module and `bus` ever see it.
pub fn locker_to_channel(locker: u16) -> (u8, u16) {
    let slave = ((locker - 1) / CHANNELS_PER_CARD + 1) as u8;
    let channel = (locker - 1) % CHANNELS_PER_CARD + 1;
    (slave, channel)
}

/// Inverse of [`locker_to_channel`].
pub fn channel_to_locker(slave: u8, channel: u16) -> u16 {
    (slave as u16 - 1) * CHANNELS_PER_CARD + channel
}

/// Zero-based coil address for a 1-based channel.
pub fn coil_address(channel: u16) -> u16 {
    channel - 1
}
