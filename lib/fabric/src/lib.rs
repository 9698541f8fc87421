#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub const DEFAULT_SERVER_PORT: u16 = 17543;
pub const DEFAULT_CLIENT_PORT: u16 = 17544;

/// Identity of a participant, unique within one coordinator session.
pub type ClientId = u16;
/// Monotonic counter naming one granted slice. 0 means "not yet synchronized".
pub type PeriodId = u32;
/// Advisory datagram sequence number.
pub type SeqNr = u32;

pub mod config;
pub mod coordinator;
pub mod frame;
pub mod logging;
pub mod result;
pub mod session;
pub mod time;
