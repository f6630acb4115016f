//! Unit tests for Modbus-RTU framing and the locker/channel mapping.

#![allow(dead_code)]

#[path = "../src/config.rs"]
mod config;
#[path = "../src/modbus.rs"]
mod modbus;

use modbus::{
    channel_to_locker, check_crc, check_write_response, coil_address, crc16, locker_to_channel,
    parse_read_coils, read_coils, response_len, write_multiple_coils, write_single_coil,
    FrameError, READ_COILS, WRITE_MULTIPLE_COILS, WRITE_SINGLE_COIL,
};

/// Append a freshly computed CRC to a hand-built frame.
fn seal(frame: &mut [u8]) {
    let body = frame.len() - 2;
    let crc = crc16(&frame[..body]);
    frame[body] = (crc & 0xFF) as u8;
    frame[body + 1] = (crc >> 8) as u8;
}

// ============================================================================
// CRC-16
// ============================================================================

#[test]
fn crc16_matches_the_modbus_check_value() {
    // The standard check value for CRC-16/MODBUS.
    assert_eq!(crc16(b"123456789"), 0x4B37);
}

#[test]
fn crc16_trails_little_endian_in_frames() {
    let frame = write_single_coil(1, 0, true);
    let crc = crc16(&frame[..6]);
    assert_eq!(frame[6], (crc & 0xFF) as u8);
    assert_eq!(frame[7], (crc >> 8) as u8);
}

#[test]
fn sealed_frames_pass_crc_check() {
    assert_eq!(check_crc(&write_single_coil(3, 7, false)), Ok(()));
    assert_eq!(check_crc(&write_multiple_coils(2, 15, true)), Ok(()));
    assert_eq!(check_crc(&read_coils(1, 0, 16)), Ok(()));
}

#[test]
fn any_single_bit_flip_is_rejected() {
    let frame = write_multiple_coils(1, 4, true);
    for byte in 0..frame.len() {
        for bit in 0..8 {
            let mut corrupted = frame;
            corrupted[byte] ^= 1 << bit;
            assert_eq!(
                check_crc(&corrupted),
                Err(FrameError::Crc),
                "flip of byte {} bit {} was not caught",
                byte,
                bit
            );
        }
    }
}

#[test]
fn short_frames_are_truncated_not_crc_errors() {
    assert_eq!(check_crc(&[0x01, 0x05, 0x00]), Err(FrameError::Truncated));
}

// ============================================================================
// Frame layouts
// ============================================================================

#[test]
fn write_single_coil_layout() {
    let on = write_single_coil(1, 4, true);
    assert_eq!(&on[..6], &[0x01, 0x05, 0x00, 0x04, 0xFF, 0x00]);
    let off = write_single_coil(1, 4, false);
    assert_eq!(&off[..6], &[0x01, 0x05, 0x00, 0x04, 0x00, 0x00]);
}

#[test]
fn write_multiple_coils_layout_for_locker_five() {
    // Locker 5 sits on card 1, channel 5, coil address 4.
    let (slave, channel) = locker_to_channel(5);
    assert_eq!((slave, channel), (1, 5));
    let frame = write_multiple_coils(slave, coil_address(channel), true);
    assert_eq!(&frame[..8], &[0x01, 0x0F, 0x00, 0x04, 0x00, 0x01, 0x01, 0x01]);
}

#[test]
fn read_coils_layout() {
    let frame = read_coils(2, 0, 16);
    assert_eq!(&frame[..6], &[0x02, 0x01, 0x00, 0x00, 0x00, 0x10]);
}

#[test]
fn expected_response_lengths() {
    assert_eq!(response_len(WRITE_SINGLE_COIL, 1), 8);
    assert_eq!(response_len(WRITE_MULTIPLE_COILS, 1), 8);
    assert_eq!(response_len(READ_COILS, 1), 6);
    assert_eq!(response_len(READ_COILS, 16), 7);
}

// ============================================================================
// Response validation
// ============================================================================

#[test]
fn write_single_coil_accepts_its_echo() {
    let request = write_single_coil(1, 4, true);
    assert_eq!(check_write_response(&request, &request), Ok(()));
}

#[test]
fn write_single_coil_rejects_a_modified_echo() {
    let request = write_single_coil(1, 4, true);
    let mut echo = request;
    echo[3] = 0x05; // different coil
    seal(&mut echo);
    assert_eq!(check_write_response(&request, &echo), Err(FrameError::Mismatch));
}

#[test]
fn write_multiple_coils_accepts_the_ack() {
    let request = write_multiple_coils(1, 4, true);
    // Ack: slave, function, address, quantity, CRC.
    let mut ack = [0x01, 0x0F, 0x00, 0x04, 0x00, 0x01, 0, 0];
    seal(&mut ack);
    assert_eq!(check_write_response(&request, &ack), Ok(()));
}

#[test]
fn write_multiple_coils_rejects_wrong_address_ack() {
    let request = write_multiple_coils(1, 4, true);
    let mut ack = [0x01, 0x0F, 0x00, 0x05, 0x00, 0x01, 0, 0];
    seal(&mut ack);
    assert_eq!(check_write_response(&request, &ack), Err(FrameError::Mismatch));
}

#[test]
fn exception_responses_carry_their_code() {
    let request = write_single_coil(1, 4, true);
    let mut exception = [0x01, 0x85, 0x02, 0, 0];
    seal(&mut exception);
    assert_eq!(
        check_write_response(&request, &exception),
        Err(FrameError::Exception(0x02))
    );
}

#[test]
fn corrupted_exception_is_a_crc_error() {
    let request = write_single_coil(1, 4, true);
    let mut exception = [0x01, 0x85, 0x02, 0, 0];
    seal(&mut exception);
    exception[2] ^= 0x01; // flip a bit in the exception code
    assert_eq!(check_write_response(&request, &exception), Err(FrameError::Crc));
}

#[test]
fn read_coils_response_decodes_to_a_bitmask() {
    let request = read_coils(1, 0, 3);
    let mut response = [0x01, 0x01, 0x01, 0b0000_0101, 0, 0];
    seal(&mut response);
    assert_eq!(parse_read_coils(&request, 3, &response), Ok(0b101));
}

#[test]
fn read_coils_response_with_wrong_byte_count_is_a_mismatch() {
    let request = read_coils(1, 0, 3);
    let mut response = [0x01, 0x01, 0x02, 0b0000_0101, 0x00, 0, 0];
    seal(&mut response);
    assert_eq!(
        parse_read_coils(&request, 3, &response),
        Err(FrameError::Mismatch)
    );
}

// ============================================================================
// Locker mapping
// ============================================================================

#[test]
fn mapping_round_trips_for_all_valid_lockers() {
    for locker in 1..=64u16 {
        let (slave, channel) = locker_to_channel(locker);
        assert_eq!(channel_to_locker(slave, channel), locker);
        assert!((1..=16).contains(&channel));
    }
}

#[test]
fn mapping_boundaries() {
    assert_eq!(locker_to_channel(1), (1, 1));
    assert_eq!(locker_to_channel(16), (1, 16));
    assert_eq!(locker_to_channel(17), (2, 1));
    assert_eq!(locker_to_channel(32), (2, 16));
    assert_eq!(locker_to_channel(33), (3, 1));
}

#[test]
fn coil_addresses_are_zero_based() {
    assert_eq!(coil_address(1), 0);
    assert_eq!(coil_address(16), 15);
}
