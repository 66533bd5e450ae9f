use thiserror::Error;

/// The error taxonomy surfaced across the device, IP, and TCP layers.
///
/// Wire-layer malformations are normally dropped silently rather than
/// raised here (RFC behavior); `Malformed`/`Checksum` exist for the few
/// call sites, mostly in tests, that need to observe a rejected packet
/// rather than have it vanish.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] tidy_tuntap::error::Error),

    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free socket slot in the connection table")]
    NoFreeSocket,

    #[error("port {0} already in use")]
    PortInUse(u16),

    #[error("no free ephemeral port available")]
    NoFreePort,

    #[error("fragment reassembly table is full")]
    ReassemblyTableFull,

    #[error("socket is not in a valid state for this operation")]
    IllegalState,

    #[error("connection is closing")]
    ConnectionClosing,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("checksum mismatch")]
    Checksum,
}
