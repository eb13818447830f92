//! Asynchronous reader for the BMS telemetry stream, built on Tokio and
//! the `tokio-serial` crate.
//!
//! This module is suitable for applications built on the Tokio runtime.
//!
//! # Example
//!
//! ```no_run
//! use bmsmon_lib::protocol::DecodeOutcome;
//! use bmsmon_lib::tokio_serial_async::BmsReader;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tokio_serial::Error> {
//!     let mut bms = BmsReader::new("/dev/ttyUSB0")?;
//!     match bms.read(Duration::from_secs(1)).await {
//!         DecodeOutcome::Snapshot(snapshot) => {
//!             println!("Pack voltage: {:.1}V", snapshot.pack_voltage)
//!         }
//!         other => println!("No reading: {other:?}"),
//!     }
//!     Ok(())
//! }
//! ```

use crate::protocol::{BatterySnapshot, DecodeOutcome, FrameAccumulator, FRAME_LENGTH};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_serial::SerialPortBuilderExt;

const BAUD_RATE: u32 = 9600;

/// Asynchronous reader decoding the broadcast telemetry stream.
///
/// One instance owns one byte stream; see the synchronous sibling for the
/// aliasing rules, which apply unchanged.
#[derive(Debug)]
pub struct BmsReader<R = tokio_serial::SerialStream> {
    serial: R,
    accumulator: FrameAccumulator,
}

impl BmsReader {
    /// Open `port` and bind a reader to it.
    ///
    /// The BMS side of the line is fixed at 9600 baud, 8 data bits, no
    /// parity, one stop bit.
    pub fn new(port: &str) -> Result<Self, tokio_serial::Error> {
        Ok(Self::from_stream(
            tokio_serial::new(port, BAUD_RATE)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()?,
        ))
    }
}

impl<R: AsyncRead + Unpin> BmsReader<R> {
    /// Bind a reader to an already opened byte stream.
    pub fn from_stream(serial: R) -> Self {
        Self {
            serial,
            accumulator: FrameAccumulator::new(),
        }
    }

    /// Wait up to `timeout` for one complete frame and classify the result.
    ///
    /// Returns as soon as a frame completes. If the window closes first,
    /// the partial accumulation is discarded so the next call starts
    /// clean.
    pub async fn read(&mut self, timeout: Duration) -> DecodeOutcome {
        let deadline = Instant::now() + timeout;
        // Chunks are capped at one frame length: the accumulator holds at
        // most FRAME_LENGTH - 1 bytes, so no chunk completes two frames.
        let mut chunk = [0u8; FRAME_LENGTH];
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                self.accumulator.reset();
                return DecodeOutcome::Timeout;
            };
            match tokio::time::timeout(remaining, self.serial.read(&mut chunk)).await {
                Err(_elapsed) => {
                    self.accumulator.reset();
                    return DecodeOutcome::Timeout;
                }
                Ok(Err(err)) => {
                    self.accumulator.reset();
                    return DecodeOutcome::StreamError(err);
                }
                Ok(Ok(0)) => {
                    self.accumulator.reset();
                    return DecodeOutcome::StreamError(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "serial stream closed",
                    ));
                }
                Ok(Ok(received)) => {
                    log::trace!("receive_bytes: {:02X?}", &chunk[..received]);
                    let mut completed = None;
                    for &byte in &chunk[..received] {
                        if let Some(frame) = self.accumulator.feed(byte) {
                            completed = Some(frame);
                        }
                    }
                    if let Some(frame) = completed {
                        return match BatterySnapshot::decode(&frame) {
                            Ok(snapshot) => DecodeOutcome::Snapshot(snapshot),
                            Err(err) => {
                                log::warn!("Discarding corrupt frame: {err}");
                                DecodeOutcome::ChecksumInvalid
                            }
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testdata;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_decodes_streamed_frame() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = BmsReader::from_stream(rx);
        tx.write_all(&[0x13, 0x37]).await.unwrap();
        tx.write_all(&testdata::snapshot().encode()).await.unwrap();
        match reader.read(Duration::from_secs(1)).await {
            DecodeOutcome::Snapshot(snapshot) => assert_eq!(snapshot, testdata::snapshot()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_frame_times_out() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = BmsReader::from_stream(rx);
        let frame = testdata::snapshot().encode();
        tx.write_all(&frame[..15]).await.unwrap();
        assert!(matches!(
            reader.read(Duration::from_millis(50)).await,
            DecodeOutcome::Timeout
        ));
    }

    #[tokio::test]
    async fn corrupted_checksum_is_rejected() {
        let (mut tx, rx) = tokio::io::duplex(256);
        let mut reader = BmsReader::from_stream(rx);
        let mut frame = testdata::snapshot().encode();
        frame[30] = frame[30].wrapping_add(1);
        tx.write_all(&frame).await.unwrap();
        assert!(matches!(
            reader.read(Duration::from_millis(100)).await,
            DecodeOutcome::ChecksumInvalid
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_a_stream_error() {
        let (tx, rx) = tokio::io::duplex(256);
        drop(tx);
        let mut reader = BmsReader::from_stream(rx);
        assert!(matches!(
            reader.read(Duration::from_millis(50)).await,
            DecodeOutcome::StreamError(_)
        ));
    }
}
