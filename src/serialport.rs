//! Synchronous reader for the BMS telemetry stream, built on the
//! `serialport` crate.
//!
//! The BMS broadcasts unsolicited frames at its own rate; [`BmsReader`]
//! owns the port and the accumulation buffer and offers two equivalent
//! call shapes: a blocking [`BmsReader::read`] bounded by a timeout, and a
//! non-blocking [`BmsReader::is_ready`]/[`BmsReader::decode`] pair for
//! cooperative loops that must keep servicing other periodic work.
//!
//! # Example
//!
//! ```no_run
//! use bmsmon_lib::protocol::DecodeOutcome;
//! use bmsmon_lib::serialport::BmsReader;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), serialport::Error> {
//!     let mut bms = BmsReader::new("/dev/ttyUSB0")?;
//!     loop {
//!         match bms.read(Duration::from_secs(1)) {
//!             DecodeOutcome::Snapshot(snapshot) => println!("SOC: {}%", snapshot.pack_soc),
//!             DecodeOutcome::Timeout => println!("no data yet"),
//!             DecodeOutcome::ChecksumInvalid => println!("corrupt frame dropped"),
//!             DecodeOutcome::StreamError(err) => eprintln!("serial fault: {err}"),
//!         }
//!     }
//! }
//! ```

use crate::protocol::{BatterySnapshot, DecodeOutcome, Frame, FrameAccumulator, FRAME_LENGTH};
use std::time::{Duration, Instant};

const BAUD_RATE: u32 = 9600;

/// Pause between polls of the receive buffer while a blocking read waits
/// for more bytes.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Byte source driven by a [`BmsReader`].
///
/// Covers exactly what the decoder needs from a serial line: how many
/// bytes can be read without blocking, and reading up to a requested
/// amount. Line parameters (baud rate, parity, pin mapping) are the
/// business of whoever constructs the transport.
pub trait Transport {
    /// Number of bytes ready to be read without blocking.
    fn bytes_available(&mut self) -> std::io::Result<usize>;
    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn bytes_available(&mut self) -> std::io::Result<usize> {
        self.bytes_to_read()
            .map(|pending| pending as usize)
            .map_err(Into::into)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        std::io::Read::read(&mut **self, buf)
    }
}

/// Synchronous reader decoding the broadcast telemetry stream.
///
/// One instance owns one transport. The accumulation buffer is not
/// internally synchronized; concurrent callers must serialize the whole
/// read (or poll-then-decode) sequence themselves.
#[derive(Debug)]
pub struct BmsReader<T = Box<dyn serialport::SerialPort>> {
    transport: T,
    accumulator: FrameAccumulator,
    pending: Option<Frame>,
    stream_error: Option<std::io::Error>,
}

impl BmsReader {
    /// Open `port` and bind a reader to it.
    ///
    /// The BMS side of the line is fixed at 9600 baud, 8 data bits, no
    /// parity, one stop bit.
    pub fn new(port: &str) -> Result<Self, serialport::Error> {
        Ok(Self::with_transport(
            serialport::new(port, BAUD_RATE)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(POLL_INTERVAL)
                .open()?,
        ))
    }
}

impl<T: Transport> BmsReader<T> {
    /// Bind a reader to an already configured transport.
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            accumulator: FrameAccumulator::new(),
            pending: None,
            stream_error: None,
        }
    }

    /// Wait up to `timeout` for one complete frame and classify the result.
    ///
    /// Returns as soon as a frame completes. If the window closes first,
    /// the partial accumulation is discarded so the next call starts
    /// clean.
    pub fn read(&mut self, timeout: Duration) -> DecodeOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_ready() {
                return self.decode();
            }
            if Instant::now() >= deadline {
                self.accumulator.reset();
                return DecodeOutcome::Timeout;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Non-blocking poll: drain whatever the transport has buffered and
    /// report whether [`BmsReader::decode`] has an outcome to hand out
    /// (a complete frame, or a transport fault).
    pub fn is_ready(&mut self) -> bool {
        if self.pending.is_none() && self.stream_error.is_none() {
            if let Err(err) = self.pump() {
                log::warn!("Cannot read from transport: {err}");
                self.accumulator.reset();
                self.stream_error = Some(err);
            }
        }
        self.pending.is_some() || self.stream_error.is_some()
    }

    /// Consume the buffered frame and classify it.
    ///
    /// Calling this without a ready frame is answered with
    /// [`DecodeOutcome::Timeout`], never with stale or default data.
    pub fn decode(&mut self) -> DecodeOutcome {
        if let Some(err) = self.stream_error.take() {
            return DecodeOutcome::StreamError(err);
        }
        match self.pending.take() {
            Some(frame) => match BatterySnapshot::decode(&frame) {
                Ok(snapshot) => DecodeOutcome::Snapshot(snapshot),
                Err(err) => {
                    log::warn!("Discarding corrupt frame: {err}");
                    DecodeOutcome::ChecksumInvalid
                }
            },
            None => {
                self.accumulator.reset();
                DecodeOutcome::Timeout
            }
        }
    }

    /// Move available bytes into the accumulator until a frame completes
    /// or the transport runs dry.
    fn pump(&mut self) -> std::io::Result<()> {
        while self.pending.is_none() {
            let available = self.transport.bytes_available()?;
            if available == 0 {
                return Ok(());
            }
            // Chunks are capped at one frame length: the accumulator holds
            // at most FRAME_LENGTH - 1 bytes, so no chunk can complete two
            // frames before `pending` is re-checked.
            let mut chunk = [0u8; FRAME_LENGTH];
            let want = available.min(FRAME_LENGTH);
            let received = self.transport.read_bytes(&mut chunk[..want])?;
            if received == 0 {
                return Ok(());
            }
            log::trace!("receive_bytes: {:02X?}", &chunk[..received]);
            for &byte in &chunk[..received] {
                if let Some(frame) = self.accumulator.feed(byte) {
                    self.pending = Some(frame);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testdata;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io;
    use std::rc::Rc;

    /// In-memory transport handing out queued byte chunks.
    #[derive(Debug, Clone, Default)]
    struct MockTransport {
        chunks: Rc<RefCell<VecDeque<Vec<u8>>>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self::default()
        }

        fn push(&self, bytes: Vec<u8>) {
            self.chunks.borrow_mut().push_back(bytes);
        }
    }

    impl Transport for MockTransport {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.chunks.borrow().front().map_or(0, Vec::len))
        }

        fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut chunks = self.chunks.borrow_mut();
            let Some(chunk) = chunks.front_mut() else {
                return Ok(0);
            };
            let n = buf.len().min(chunk.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                chunks.pop_front();
            }
            Ok(n)
        }
    }

    #[derive(Debug)]
    struct BrokenTransport;

    impl Transport for BrokenTransport {
        fn bytes_available(&mut self) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))
        }

        fn read_bytes(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "device detached"))
        }
    }

    #[test]
    fn read_decodes_frame_behind_noise() {
        let transport = MockTransport::new();
        let mut stream = vec![0x00, 0x5a, 0x21];
        stream.extend_from_slice(&testdata::snapshot().encode());
        transport.push(stream);
        let mut reader = BmsReader::with_transport(transport);
        match reader.read(Duration::from_millis(100)) {
            DecodeOutcome::Snapshot(snapshot) => assert_eq!(snapshot, testdata::snapshot()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn read_times_out_when_sender_is_silent() {
        let mut reader = BmsReader::with_transport(MockTransport::new());
        assert!(matches!(
            reader.read(Duration::from_millis(50)),
            DecodeOutcome::Timeout
        ));
    }

    #[test]
    fn partial_frame_times_out_and_does_not_leak() {
        let transport = MockTransport::new();
        let frame = testdata::snapshot().encode();
        transport.push(frame[..15].to_vec());
        let mut reader = BmsReader::with_transport(transport.clone());
        assert!(matches!(
            reader.read(Duration::from_millis(50)),
            DecodeOutcome::Timeout
        ));

        // The tail of the aborted frame arrives late, immediately followed
        // by a good frame.
        let mut stream = frame[15..].to_vec();
        stream.extend_from_slice(&frame);
        transport.push(stream);
        match reader.read(Duration::from_millis(100)) {
            DecodeOutcome::Snapshot(snapshot) => assert_eq!(snapshot, testdata::snapshot()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn corrupt_frame_does_not_leak_into_the_next() {
        let transport = MockTransport::new();
        let frame = testdata::snapshot().encode();
        let mut corrupt = frame;
        corrupt[11] ^= 0x01;
        let mut stream = corrupt.to_vec();
        stream.extend_from_slice(&frame);
        transport.push(stream);
        let mut reader = BmsReader::with_transport(transport);
        assert!(matches!(
            reader.read(Duration::from_millis(100)),
            DecodeOutcome::ChecksumInvalid
        ));
        match reader.read(Duration::from_millis(100)) {
            DecodeOutcome::Snapshot(snapshot) => assert_eq!(snapshot, testdata::snapshot()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn poll_then_decode_shape() {
        let transport = MockTransport::new();
        let mut reader = BmsReader::with_transport(transport.clone());
        assert!(!reader.is_ready());
        assert!(matches!(reader.decode(), DecodeOutcome::Timeout));

        transport.push(testdata::snapshot().encode().to_vec());
        assert!(reader.is_ready());
        match reader.decode() {
            DecodeOutcome::Snapshot(snapshot) => assert_eq!(snapshot, testdata::snapshot()),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!reader.is_ready());
    }

    #[test]
    fn transport_fault_is_classified_as_stream_error() {
        let mut reader = BmsReader::with_transport(BrokenTransport);
        assert!(matches!(
            reader.read(Duration::from_millis(50)),
            DecodeOutcome::StreamError(_)
        ));
    }
}
