/// Errors raised while validating a candidate telemetry frame.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The candidate frame holds fewer bytes than one full telemetry frame.
    #[error("Invalid frame length - required={required} received={received}")]
    FrameLength { required: usize, received: usize },
    /// The recomputed checksum does not match the transmitted one.
    #[error("Invalid checksum - calculated={calculated:02X} received={received:02X}")]
    Checksum { calculated: u8, received: u8 },
}
