use std::io;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("bad frame: {0}")]
    Frame(String),

    #[error("zone {zone}: port pool exhausted")]
    PortPoolExhausted { zone: u16 },

    #[error("cipher id {0} not supported")]
    UnsupportedCipher(u8),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("link {0} closed")]
    LinkClosed(String),

    #[error("buffer overflow: need {need} bytes, {avail} available")]
    BufferOverflow { need: usize, avail: usize },

    #[error("zone {zone}: no free reply tuple for SNAT")]
    TupleExhausted { zone: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;
