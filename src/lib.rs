#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bmsmon_lib
//!
//! This crate decodes the framed binary telemetry a BMS (Battery
//! Management System) broadcasts over its serial line, and exposes each
//! reading as a typed [`protocol::BatterySnapshot`]. The device is
//! listen-only: nothing is ever written to it.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the client you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `bmsmon` command-line tool and pulls in `serialport`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** reader using the
//!   `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** reader using
//!   `tokio` and `tokio-serial`.

/// Contains error types for the library.
mod error;
/// Framing, checksum validation and field decoding for the telemetry stream.
pub mod protocol;

pub use error::Error;

/// Synchronous reader for the telemetry stream.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous reader for the telemetry stream.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
