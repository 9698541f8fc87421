use std::io;

#[derive(Debug, Eq, PartialEq)]
pub enum Error {
    /// Datagram too short to hold the packet header.
    Truncated,
    /// Datagram length does not match the expected size for its declared type.
    LengthMismatch,
    /// Unknown packet type code.
    UnknownKind,
    /// Payload does not fit in the destination buffer.
    BufferTooSmall,
    NotConnected,
    AlreadyConnected,
    Config(String),
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(io_error: io::Error) -> Self {
        Error::Io(io_error.kind())
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
