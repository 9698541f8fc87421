//! Wire codec for the synchronization protocol.
//!
//! Every datagram is a `SyncPacket`: a 32-bit big-endian sequence number, a
//! one-byte packet type and a fixed-layout payload. All multi-byte fields are
//! network byte order.

use crate::result::{Error, Result};
use crate::{ClientId, PeriodId, SeqNr};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Cursor, Read, Write};

/// Sequence number plus packet type code.
pub const HEADER_SIZE: usize = 5;
/// Fixed length of the client description field.
pub const DESCRIPTION_SIZE: usize = 100;

pub const REGISTER_SIZE: usize = HEADER_SIZE + 3 + DESCRIPTION_SIZE;
pub const UNREGISTER_SIZE: usize = HEADER_SIZE + 3;
pub const RUN_PERMISSION_SIZE: usize = HEADER_SIZE + 8;
pub const FINISHED_SIZE: usize = HEADER_SIZE + 14;

/// Largest datagram the protocol can produce. Receive buffers are sized for
/// this so malformed inputs cannot overflow.
pub const MAX_PACKET_SIZE: usize = REGISTER_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    Register = 0,
    Unregister = 1,
    RunPermission = 2,
    Finished = 3,
}

impl Kind {
    #[inline]
    pub fn from_code(code: u8) -> Option<Kind> {
        match code {
            0 => Some(Kind::Register),
            1 => Some(Kind::Unregister),
            2 => Some(Kind::RunPermission),
            3 => Some(Kind::Finished),
            _ => None,
        }
    }

    /// Exact datagram length for a packet of this kind.
    #[inline]
    pub fn packet_size(self) -> usize {
        match self {
            Kind::Register => REGISTER_SIZE,
            Kind::Unregister => UNREGISTER_SIZE,
            Kind::RunPermission => RUN_PERMISSION_SIZE,
            Kind::Finished => FINISHED_SIZE,
        }
    }
}

impl From<Kind> for u8 {
    #[inline]
    fn from(kind: Kind) -> Self {
        kind as u8
    }
}

/// Participant classification carried in the register message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ClientKind {
    LocalVm = 0,
    RemoteVm = 1,
    RemoteSimulation = 2,
    Test = 133,
    Other = 254,
    Unknown = 255,
}

impl From<u8> for ClientKind {
    #[inline]
    fn from(code: u8) -> Self {
        match code {
            0 => ClientKind::LocalVm,
            1 => ClientKind::RemoteVm,
            2 => ClientKind::RemoteSimulation,
            133 => ClientKind::Test,
            254 => ClientKind::Other,
            _ => ClientKind::Unknown,
        }
    }
}

impl From<ClientKind> for u8 {
    #[inline]
    fn from(kind: ClientKind) -> Self {
        kind as u8
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnregisterReason {
    Regular = 0,
    OutOfSync = 1,
    Other = 2,
}

impl From<u8> for UnregisterReason {
    #[inline]
    fn from(code: u8) -> Self {
        match code {
            0 => UnregisterReason::Regular,
            1 => UnregisterReason::OutOfSync,
            _ => UnregisterReason::Other,
        }
    }
}

impl From<UnregisterReason> for u8 {
    #[inline]
    fn from(reason: UnregisterReason) -> Self {
        reason as u8
    }
}

/// Registration request. The description is a fixed 100-byte field, NUL
/// padded on the wire but with no terminator guarantee.
#[derive(Clone, Eq, PartialEq)]
pub struct Register {
    pub client_id: ClientId,
    pub kind: ClientKind,
    pub description: [u8; DESCRIPTION_SIZE],
}

impl Register {
    #[inline]
    pub fn new(client_id: ClientId, kind: ClientKind, description: &str) -> Register {
        let mut bytes = [0u8; DESCRIPTION_SIZE];
        let text = description.as_bytes();
        let len = text.len().min(DESCRIPTION_SIZE);
        bytes[..len].copy_from_slice(&text[..len]);

        Register {
            client_id,
            kind,
            description: bytes,
        }
    }

    /// Decodes the description as length-bounded bytes, stopping at the first
    /// NUL if one is present.
    pub fn description(&self) -> String {
        let end = self
            .description
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DESCRIPTION_SIZE);
        String::from_utf8_lossy(&self.description[..end]).into_owned()
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Register")
            .field("client_id", &self.client_id)
            .field("kind", &self.kind)
            .field("description", &self.description())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unregister {
    pub client_id: ClientId,
    pub reason: UnregisterReason,
}

/// Grant of one slice: all clients may simulate `run_time` microseconds.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RunPermission {
    pub period: PeriodId,
    pub run_time: u32,
}

/// Completion report for one slice. `real_time` is wall-clock statistics
/// only; nothing may be gated on it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Finished {
    pub period: PeriodId,
    pub run_time: u32,
    pub real_time: u32,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Register(Register),
    Unregister(Unregister),
    RunPermission(RunPermission),
    Finished(Finished),
}

impl Payload {
    #[inline]
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Register(_) => Kind::Register,
            Payload::Unregister(_) => Kind::Unregister,
            Payload::RunPermission(_) => Kind::RunPermission,
            Payload::Finished(_) => Kind::Finished,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncPacket {
    pub seq: SeqNr,
    pub payload: Payload,
}

impl SyncPacket {
    /// Parse one datagram. The whole datagram must be exactly the size the
    /// declared type mandates, otherwise it is rejected.
    pub fn read(buf: &[u8]) -> Result<SyncPacket> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Truncated);
        }

        let mut stream = buf;
        let seq = stream.read_u32::<BigEndian>()?;
        let code = stream.read_u8()?;
        let kind = Kind::from_code(code).ok_or(Error::UnknownKind)?;

        if buf.len() != kind.packet_size() {
            return Err(Error::LengthMismatch);
        }

        let payload = match kind {
            Kind::Register => {
                let client_id = stream.read_u16::<BigEndian>()?;
                let client_kind = ClientKind::from(stream.read_u8()?);
                let mut description = [0u8; DESCRIPTION_SIZE];
                stream.read_exact(&mut description)?;
                Payload::Register(Register {
                    client_id,
                    kind: client_kind,
                    description,
                })
            }
            Kind::Unregister => {
                let client_id = stream.read_u16::<BigEndian>()?;
                let reason = UnregisterReason::from(stream.read_u8()?);
                Payload::Unregister(Unregister { client_id, reason })
            }
            Kind::RunPermission => {
                let period = stream.read_u32::<BigEndian>()?;
                let run_time = stream.read_u32::<BigEndian>()?;
                Payload::RunPermission(RunPermission { period, run_time })
            }
            Kind::Finished => {
                let period = stream.read_u32::<BigEndian>()?;
                let run_time = stream.read_u32::<BigEndian>()?;
                let real_time = stream.read_u32::<BigEndian>()?;
                let client_id = stream.read_u16::<BigEndian>()?;
                Payload::Finished(Finished {
                    period,
                    run_time,
                    real_time,
                    client_id,
                })
            }
        };

        Ok(SyncPacket { seq, payload })
    }

    /// Serialize into `buf` and return the number of bytes written.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize> {
        let kind = self.payload.kind();

        if buf.len() < kind.packet_size() {
            return Err(Error::BufferTooSmall);
        }

        let mut stream = Cursor::new(buf);
        stream.write_u32::<BigEndian>(self.seq)?;
        stream.write_u8(kind.into())?;

        match &self.payload {
            Payload::Register(reg) => {
                stream.write_u16::<BigEndian>(reg.client_id)?;
                stream.write_u8(reg.kind.into())?;
                stream.write_all(&reg.description)?;
            }
            Payload::Unregister(unreg) => {
                stream.write_u16::<BigEndian>(unreg.client_id)?;
                stream.write_u8(unreg.reason.into())?;
            }
            Payload::RunPermission(perm) => {
                stream.write_u32::<BigEndian>(perm.period)?;
                stream.write_u32::<BigEndian>(perm.run_time)?;
            }
            Payload::Finished(fin) => {
                stream.write_u32::<BigEndian>(fin.period)?;
                stream.write_u32::<BigEndian>(fin.run_time)?;
                stream.write_u32::<BigEndian>(fin.real_time)?;
                stream.write_u16::<BigEndian>(fin.client_id)?;
            }
        }

        Ok(stream.position() as usize)
    }
}
