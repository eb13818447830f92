//! Framing, checksum validation and field decoding for the telemetry
//! stream the BMS broadcasts on its serial line.
//!
//! The frame format is:
//!
//! ```text
//! Offset | Width | Meaning
//! 0      | 1     | Start marker, constant 0xAA
//! 1      | 1     | Cell count
//! 2      | 2     | Lowest cell voltage in mV
//! 4      | 1     | Lowest-voltage cell number (1-based)
//! 5      | 2     | Highest cell voltage in mV
//! 7      | 1     | Highest-voltage cell number (1-based)
//! 8      | 2     | Balance target voltage in mV
//! 10     | 1     | State of charge in %
//! 11     | 2     | Pack voltage in 0.1V
//! 13     | 2     | Pack current in 0.1A, two's complement, charging positive
//! 15     | 2     | Charge current limit in 0.1A
//! 17     | 2     | Discharge current limit in 0.1A
//! 19     | 2     | Pack capacity in 0.01kWh
//! 21     | 2     | Remaining energy in 0.01kWh
//! 23     | 1     | Lowest cell temperature in °C, offset by +40
//! 24     | 1     | Lowest-temperature cell number (1-based)
//! 25     | 1     | Highest cell temperature in °C, offset by +40
//! 26     | 1     | Highest-temperature cell number (1-based)
//! 27     | 1     | Permission bits: bit0 charge allowed, bit1 discharge allowed
//! 28     | 1     | Alarm bits: bit0 communication error, bit1 min voltage,
//!        |       |   bit2 max voltage, bit3 min temperature, bit4 max temperature
//! 29     | 1     | Reserved, not covered by the checksum
//! 30     | 1     | Checksum: sum of bytes 0..=28, modulo 256
//! ```
//!
//! Multi-byte fields are big-endian. Retargeting the decoder to a
//! different frame layout is an edit confined to this module.

use crate::Error;
use serde::{Deserialize, Serialize};

pub const START_BYTE: u8 = 0xaa;
pub const FRAME_LENGTH: usize = 31;
// The trailing reserved byte is not part of the checksum.
const CHECKSUM_COVERAGE: usize = 29;

/// One complete, length-checked candidate frame.
pub type Frame = [u8; FRAME_LENGTH];

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

fn calc_checksum(frame: &[u8]) -> u8 {
    let mut checksum: u8 = 0;
    for b in &frame[0..CHECKSUM_COVERAGE] {
        checksum = checksum.wrapping_add(*b);
    }
    checksum
}

fn validate_len(frame: &[u8]) -> std::result::Result<(), Error> {
    if frame.len() < FRAME_LENGTH {
        log::warn!(
            "Invalid frame length - required={} received={}",
            FRAME_LENGTH,
            frame.len()
        );
        return Err(Error::FrameLength {
            required: FRAME_LENGTH,
            received: frame.len(),
        });
    }
    Ok(())
}

/// Recompute the frame checksum and compare it against the transmitted one.
///
/// Pure; the frame is never modified. Any mismatch, however small, is
/// rejected.
pub fn validate_checksum(frame: &[u8]) -> std::result::Result<(), Error> {
    validate_len(frame)?;
    let checksum = calc_checksum(frame);
    if frame[FRAME_LENGTH - 1] != checksum {
        log::warn!(
            "Invalid checksum - calculated={:02X?} received={:02X?} frame={:02X?}",
            checksum,
            frame[FRAME_LENGTH - 1],
            frame
        );
        return Err(Error::Checksum {
            calculated: checksum,
            received: frame[FRAME_LENGTH - 1],
        });
    }
    Ok(())
}

/// The classified result of one read or decode attempt.
///
/// A fresh outcome is produced on every invocation; a snapshot is only
/// ever present when a complete frame passed checksum validation.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete, checksum-valid frame was decoded.
    Snapshot(BatterySnapshot),
    /// No complete frame was assembled within the allotted time.
    Timeout,
    /// A complete frame arrived but failed integrity validation.
    ChecksumInvalid,
    /// The transport itself could not be read.
    StreamError(std::io::Error),
}

/// One decoded telemetry reading.
///
/// Snapshots are only ever built from length-checked, checksum-valid
/// frames; there is no partially populated variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    /// Number of series cells in the pack
    pub cell_count: u8,
    /// Lowest cell voltage in V
    pub lowest_cell_voltage: f32,
    /// 1-based number of the cell with the lowest voltage
    pub lowest_cell_voltage_cell: u8,
    /// Highest cell voltage in V
    pub highest_cell_voltage: f32,
    /// 1-based number of the cell with the highest voltage
    pub highest_cell_voltage_cell: u8,
    /// Balance target voltage in V
    pub balance_voltage: f32,
    /// State of charge in percent
    pub pack_soc: u8,
    /// Pack voltage in V
    pub pack_voltage: f32,
    pub pack_current: f32, // positive=charging, negative=discharging
    /// Charge current limit in A
    pub charge_current_limit: f32,
    /// Discharge current limit in A
    pub discharge_current_limit: f32,
    /// Pack capacity in kWh
    pub pack_capacity: f32,
    /// Remaining energy in kWh
    pub remaining_energy: f32,
    /// Lowest cell temperature in °C
    pub lowest_cell_temperature: i8,
    pub lowest_cell_temperature_cell: u8,
    /// Highest cell temperature in °C
    pub highest_cell_temperature: i8,
    pub highest_cell_temperature_cell: u8,
    pub allowed_to_charge: bool,
    pub allowed_to_discharge: bool,
    pub alarm_communication_error: bool,
    pub alarm_min_voltage: bool,
    pub alarm_max_voltage: bool,
    pub alarm_min_temperature: bool,
    pub alarm_max_temperature: bool,
}

impl BatterySnapshot {
    /// Decode a candidate frame into a snapshot.
    ///
    /// The frame length and checksum are validated before any field is
    /// extracted, so a snapshot never carries data from a frame that
    /// failed either check.
    pub fn decode(frame: &[u8]) -> std::result::Result<Self, Error> {
        validate_len(frame)?;
        validate_checksum(frame)?;
        Ok(Self {
            cell_count: frame[1],
            lowest_cell_voltage: u16::from_be_bytes([frame[2], frame[3]]) as f32 / 1000.0,
            lowest_cell_voltage_cell: frame[4],
            highest_cell_voltage: u16::from_be_bytes([frame[5], frame[6]]) as f32 / 1000.0,
            highest_cell_voltage_cell: frame[7],
            balance_voltage: u16::from_be_bytes([frame[8], frame[9]]) as f32 / 1000.0,
            pack_soc: frame[10],
            pack_voltage: u16::from_be_bytes([frame[11], frame[12]]) as f32 / 10.0,
            pack_current: i16::from_be_bytes([frame[13], frame[14]]) as f32 / 10.0,
            charge_current_limit: u16::from_be_bytes([frame[15], frame[16]]) as f32 / 10.0,
            discharge_current_limit: u16::from_be_bytes([frame[17], frame[18]]) as f32 / 10.0,
            pack_capacity: u16::from_be_bytes([frame[19], frame[20]]) as f32 / 100.0,
            remaining_energy: u16::from_be_bytes([frame[21], frame[22]]) as f32 / 100.0,
            // An offset of 40 is added by the BMS to avoid having to deal with negative numbers
            lowest_cell_temperature: ((frame[23] as i16) - 40) as i8,
            lowest_cell_temperature_cell: frame[24],
            highest_cell_temperature: ((frame[25] as i16) - 40) as i8,
            highest_cell_temperature_cell: frame[26],
            allowed_to_charge: read_bit!(frame[27], 0),
            allowed_to_discharge: read_bit!(frame[27], 1),
            alarm_communication_error: read_bit!(frame[28], 0),
            alarm_min_voltage: read_bit!(frame[28], 1),
            alarm_max_voltage: read_bit!(frame[28], 2),
            alarm_min_temperature: read_bit!(frame[28], 3),
            alarm_max_temperature: read_bit!(frame[28], 4),
        })
    }

    /// Encode the snapshot into a correctly checksummed frame.
    ///
    /// Inverse of [`BatterySnapshot::decode`] up to the protocol's native
    /// resolution; used to drive the decoder in tests and simulations.
    pub fn encode(&self) -> Frame {
        let mut frame: Frame = [0; FRAME_LENGTH];
        frame[0] = START_BYTE;
        frame[1] = self.cell_count;
        frame[2..4].copy_from_slice(&millivolts(self.lowest_cell_voltage).to_be_bytes());
        frame[4] = self.lowest_cell_voltage_cell;
        frame[5..7].copy_from_slice(&millivolts(self.highest_cell_voltage).to_be_bytes());
        frame[7] = self.highest_cell_voltage_cell;
        frame[8..10].copy_from_slice(&millivolts(self.balance_voltage).to_be_bytes());
        frame[10] = self.pack_soc;
        frame[11..13].copy_from_slice(&((self.pack_voltage * 10.0).round() as u16).to_be_bytes());
        frame[13..15].copy_from_slice(&((self.pack_current * 10.0).round() as i16).to_be_bytes());
        frame[15..17]
            .copy_from_slice(&((self.charge_current_limit * 10.0).round() as u16).to_be_bytes());
        frame[17..19]
            .copy_from_slice(&((self.discharge_current_limit * 10.0).round() as u16).to_be_bytes());
        frame[19..21].copy_from_slice(&((self.pack_capacity * 100.0).round() as u16).to_be_bytes());
        frame[21..23]
            .copy_from_slice(&((self.remaining_energy * 100.0).round() as u16).to_be_bytes());
        frame[23] = (self.lowest_cell_temperature as i16 + 40) as u8;
        frame[24] = self.lowest_cell_temperature_cell;
        frame[25] = (self.highest_cell_temperature as i16 + 40) as u8;
        frame[26] = self.highest_cell_temperature_cell;
        frame[27] = (self.allowed_to_charge as u8) | (self.allowed_to_discharge as u8) << 1;
        frame[28] = (self.alarm_communication_error as u8)
            | (self.alarm_min_voltage as u8) << 1
            | (self.alarm_max_voltage as u8) << 2
            | (self.alarm_min_temperature as u8) << 3
            | (self.alarm_max_temperature as u8) << 4;
        frame[FRAME_LENGTH - 1] = calc_checksum(&frame);
        frame
    }
}

fn millivolts(volts: f32) -> u16 {
    (volts * 1000.0).round() as u16
}

/// Assembles raw serial bytes into fixed-length candidate frames.
///
/// Bytes are fed one at a time. Anything received before a start marker
/// is discarded, and a start marker seen mid-frame restarts the
/// accumulation at that byte. A completed frame is handed out by value
/// and the buffer starts over, so partial data never outlives the frame
/// it belongs to.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(FRAME_LENGTH),
        }
    }

    /// Feed one byte; yields a frame once the fixed length is reached.
    pub fn feed(&mut self, byte: u8) -> Option<Frame> {
        if byte == START_BYTE {
            if !self.buffer.is_empty() {
                log::trace!("Restarting frame sync - dropped={}", self.buffer.len());
            }
            self.buffer.clear();
        } else if self.buffer.is_empty() {
            // noise between frames
            return None;
        }
        self.buffer.push(byte);
        if self.buffer.len() < FRAME_LENGTH {
            return None;
        }
        let mut frame: Frame = [0; FRAME_LENGTH];
        frame.copy_from_slice(&self.buffer);
        self.buffer.clear();
        Some(frame)
    }

    /// Drop any partially accumulated frame.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            log::trace!("Discarding partial frame - dropped={}", self.buffer.len());
            self.buffer.clear();
        }
    }
}
