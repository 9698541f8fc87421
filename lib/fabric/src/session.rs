//! Participant-side synchronization session.
//!
//! A `Session` owns the datagram socket a client uses to talk to the
//! coordinator. Its lifetime spans one register/unregister cycle; after
//! `unregister_and_disconnect` the sequence and period counters are reset and
//! the session can be connected again.

use crate::config::ClientConfig;
use crate::frame::{
    Finished, Payload, Register, SyncPacket, Unregister, UnregisterReason, MAX_PACKET_SIZE,
};
use crate::logging;
use crate::result::{Error, Result};
use crate::{ClientId, PeriodId, SeqNr};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

const SOCK_TOKEN: Token = Token(0);

pub struct Session {
    sock: Option<UdpSocket>,
    poll: Poll,
    events: Events,

    dest: SocketAddr,
    bind_addr: SocketAddr,
    recv_timeout: Option<Duration>,

    client_id: ClientId,
    kind: crate::frame::ClientKind,
    description: String,

    seq: SeqNr,
    period: PeriodId,

    // Last outbound datagram, kept verbatim for retransmission.
    last_packet: [u8; MAX_PACKET_SIZE],
    last_len: usize,

    recv_buf: [u8; MAX_PACKET_SIZE],

    log: logging::Logger,
}

impl Session {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &ClientConfig,
        kind: crate::frame::ClientKind,
        log: L,
    ) -> Result<Session> {
        let session_log = match log.into() {
            Some(log) => log.new(logging::o!("client_id" => config.client_id)),
            _ => logging::null(),
        };

        let recv_timeout = match config.recv_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Session {
            sock: None,
            poll: Poll::new()?,
            events: Events::with_capacity(8),
            dest: SocketAddr::new(config.server_address, config.server_port),
            bind_addr: SocketAddr::new(config.client_address, config.client_port),
            recv_timeout,
            client_id: config.client_id,
            kind,
            description: config.description.clone(),
            seq: 0,
            period: 0,
            last_packet: [0u8; MAX_PACKET_SIZE],
            last_len: 0,
            recv_buf: [0u8; MAX_PACKET_SIZE],
            log: session_log,
        })
    }

    /// The period of the most recently accepted run permission.
    #[inline]
    pub fn period(&self) -> PeriodId {
        self.period
    }

    /// Address the receive socket is actually bound to. Only meaningful while
    /// connected.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;
        sock.local_addr().map_err(Into::into)
    }

    /// Opens the receive socket and announces this client to the coordinator.
    ///
    /// Address reuse is enabled so co-hosted clients can share a broadcast
    /// receive address.
    pub fn connect_and_register(&mut self) -> Result<()> {
        if self.sock.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.bind(&self.bind_addr.into())?;
        raw.set_nonblocking(true)?;

        let mut sock = UdpSocket::from_std(raw.into());
        self.poll
            .registry()
            .register(&mut sock, SOCK_TOKEN, Interest::READABLE)?;
        self.sock = Some(sock);

        logging::debug!(self.log, "socket bound, registering at coordinator";
                        "bind" => %self.bind_addr,
                        "coordinator" => %self.dest);

        let register = Register::new(self.client_id, self.kind, &self.description);
        self.send(Payload::Register(register))
    }

    /// Reports completion of the current period.
    pub fn send_finished(&mut self, run_time: u32, real_time: u32) -> Result<()> {
        logging::trace!(self.log, "sending finished";
                        "period" => self.period,
                        "run_time" => run_time,
                        "real_time" => real_time);

        let finished = Finished {
            period: self.period,
            run_time,
            real_time,
            client_id: self.client_id,
        };
        self.send(Payload::Finished(finished))
    }

    /// Blocks until a fresh run permission arrives and returns its run-time
    /// in microseconds.
    ///
    /// A permission is fresh iff its period is strictly greater than the
    /// current one; retransmitted grants are dropped here, which is the sole
    /// guard against double-advancing the virtual clock. With a nonzero
    /// receive timeout the last outbound datagram is resent whenever the wait
    /// times out, compensating for lost datagrams in either direction.
    pub fn wait_for_run_permission(&mut self) -> Result<u32> {
        if self.sock.is_none() {
            return Err(Error::NotConnected);
        }

        loop {
            // Drain before polling: the socket is edge-triggered, and a
            // previous wait may have returned with datagrams still queued.
            if let Some(run_time) = self.drain_permissions()? {
                return Ok(run_time);
            }

            self.poll.poll(&mut self.events, self.recv_timeout)?;

            if self.events.is_empty() && self.recv_timeout.is_some() && self.last_len > 0 {
                logging::debug!(self.log, "timed out waiting for run permission, resending";
                                "period" => self.period);
                let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;
                sock.send_to(&self.last_packet[..self.last_len], self.dest)?;
            }
        }
    }

    /// Sends the unregister notice and closes the socket. Sequence and period
    /// counters are reset so the session can be reused.
    pub fn unregister_and_disconnect(&mut self) -> Result<()> {
        let unregister = Unregister {
            client_id: self.client_id,
            reason: UnregisterReason::Regular,
        };
        self.send(Payload::Unregister(unregister))?;

        let mut sock = self.sock.take().ok_or(Error::NotConnected)?;
        self.poll.registry().deregister(&mut sock)?;
        drop(sock);

        logging::debug!(self.log, "disconnected from coordinator";
                        "last_seq" => self.seq,
                        "last_period" => self.period);

        self.seq = 0;
        self.period = 0;
        self.last_len = 0;

        Ok(())
    }

    /// Reads queued datagrams until a fresh permission is found or the socket
    /// runs dry. Datagrams left queued after an acceptance are picked up by
    /// the next wait.
    fn drain_permissions(&mut self) -> Result<Option<u32>> {
        loop {
            let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;

            let len = match sock.recv_from(&mut self.recv_buf) {
                Ok((len, _from)) => len,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            };

            let packet = match SyncPacket::read(&self.recv_buf[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    logging::warn!(self.log, "discarding malformed datagram";
                                   "len" => len,
                                   "error" => ?err);
                    continue;
                }
            };

            match packet.payload {
                Payload::RunPermission(perm) => {
                    if perm.period > self.period {
                        logging::trace!(self.log, "run permission accepted";
                                        "period" => perm.period,
                                        "run_time" => perm.run_time);
                        self.period = perm.period;
                        return Ok(Some(perm.run_time));
                    }
                    logging::debug!(self.log, "stale run permission dropped";
                                    "received" => perm.period,
                                    "current" => self.period);
                }
                other => {
                    logging::debug!(self.log, "unexpected packet while waiting for permission";
                                    "kind" => ?other.kind());
                }
            }
        }
    }

    /// Stamps a fresh sequence number, transmits the packet and saves the
    /// bytes for potential retransmission.
    fn send(&mut self, payload: Payload) -> Result<()> {
        let sock = self.sock.as_ref().ok_or(Error::NotConnected)?;

        self.seq += 1;
        let packet = SyncPacket {
            seq: self.seq,
            payload,
        };

        let len = packet.write(&mut self.last_packet)?;
        self.last_len = len;

        sock.send_to(&self.last_packet[..len], self.dest)?;

        logging::trace!(self.log, "sent packet";
                        "seq" => self.seq,
                        "kind" => ?packet.payload.kind(),
                        "len" => len);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ClientKind, Kind, RunPermission};
    use std::net::{IpAddr, Ipv4Addr, UdpSocket as StdUdpSocket};

    fn test_config(server: SocketAddr) -> ClientConfig {
        ClientConfig {
            server_address: server.ip(),
            server_port: server.port(),
            client_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            client_port: 0,
            client_id: 7,
            description: String::from("test client"),
            recv_timeout: 0,
        }
    }

    fn coordinator_sock() -> (StdUdpSocket, SocketAddr) {
        let sock = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    fn send_permission(sock: &StdUdpSocket, to: SocketAddr, seq: SeqNr, period: PeriodId, run_time: u32) {
        let packet = SyncPacket {
            seq,
            payload: Payload::RunPermission(RunPermission { period, run_time }),
        };
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let len = packet.write(&mut buf).unwrap();
        sock.send_to(&buf[..len], to).unwrap();
    }

    #[test]
    fn test_register_packet_on_the_wire() {
        let (server, server_addr) = coordinator_sock();

        let mut session = Session::new(&test_config(server_addr), ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = server.recv_from(&mut buf).unwrap();
        let packet = SyncPacket::read(&buf[..len]).unwrap();

        assert_eq!(from, session.local_addr().unwrap());
        assert_eq!(packet.seq, 1);
        match packet.payload {
            Payload::Register(reg) => {
                assert_eq!(reg.client_id, 7);
                assert_eq!(reg.kind, ClientKind::Test);
                assert_eq!(reg.description(), "test client");
            }
            other => panic!("Unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_wait_accepts_fresh_permission() {
        let (server, server_addr) = coordinator_sock();

        let mut session = Session::new(&test_config(server_addr), ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();
        let client_addr = session.local_addr().unwrap();

        send_permission(&server, client_addr, 1, 1, 1000);

        assert_eq!(session.wait_for_run_permission().unwrap(), 1000);
        assert_eq!(session.period(), 1);
    }

    #[test]
    fn test_wait_drops_duplicate_grant() {
        let (server, server_addr) = coordinator_sock();

        let mut session = Session::new(&test_config(server_addr), ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();
        let client_addr = session.local_addr().unwrap();

        // A retransmitted grant for period 5 followed by the real period 6.
        send_permission(&server, client_addr, 1, 5, 1000);
        send_permission(&server, client_addr, 2, 5, 1000);
        send_permission(&server, client_addr, 3, 6, 2000);

        assert_eq!(session.wait_for_run_permission().unwrap(), 1000);
        assert_eq!(session.period(), 5);

        // The duplicate must be skipped; the next wait returns period 6.
        assert_eq!(session.wait_for_run_permission().unwrap(), 2000);
        assert_eq!(session.period(), 6);
    }

    #[test]
    fn test_wait_ignores_malformed_and_foreign_packets() {
        let (server, server_addr) = coordinator_sock();

        let mut session = Session::new(&test_config(server_addr), ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();
        let client_addr = session.local_addr().unwrap();

        // Truncated run permission.
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let packet = SyncPacket {
            seq: 1,
            payload: Payload::RunPermission(RunPermission { period: 1, run_time: 9 }),
        };
        let len = packet.write(&mut buf).unwrap();
        server.send_to(&buf[..len - 2], client_addr).unwrap();

        // Wrong packet type in the wait state.
        let finished = SyncPacket {
            seq: 2,
            payload: Payload::Finished(Finished {
                period: 1,
                run_time: 1,
                real_time: 1,
                client_id: 7,
            }),
        };
        let len = finished.write(&mut buf).unwrap();
        server.send_to(&buf[..len], client_addr).unwrap();

        send_permission(&server, client_addr, 3, 1, 1234);

        assert_eq!(session.wait_for_run_permission().unwrap(), 1234);
    }

    #[test]
    fn test_timeout_resends_last_packet_verbatim() {
        let (server, server_addr) = coordinator_sock();

        let mut config = test_config(server_addr);
        config.recv_timeout = 1;
        let mut session = Session::new(&config, ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();

        let mut first = [0u8; MAX_PACKET_SIZE];
        let (first_len, _) = server.recv_from(&mut first).unwrap();

        // Let the client time out once, then release it.
        let waiter = std::thread::spawn(move || {
            let mut second = [0u8; MAX_PACKET_SIZE];
            let (second_len, from) = server.recv_from(&mut second).unwrap();
            send_permission(&server, from, 1, 1, 500);
            (second_len, second)
        });

        assert_eq!(session.wait_for_run_permission().unwrap(), 500);

        let (second_len, second) = waiter.join().unwrap();

        // The retransmission is byte-identical, including the sequence number.
        assert_eq!(second_len, first_len);
        assert_eq!(&second[..second_len], &first[..first_len]);
    }

    #[test]
    fn test_unregister_resets_counters() {
        let (server, server_addr) = coordinator_sock();

        let mut session = Session::new(&test_config(server_addr), ClientKind::Test, None).unwrap();
        session.connect_and_register().unwrap();
        let client_addr = session.local_addr().unwrap();

        send_permission(&server, client_addr, 1, 1, 1000);
        session.wait_for_run_permission().unwrap();
        assert_eq!(session.period(), 1);

        session.unregister_and_disconnect().unwrap();
        assert_eq!(session.period(), 0);

        // Drain the register packet, then check the unregister notice.
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(SyncPacket::read(&buf[..len]).unwrap().payload.kind(), Kind::Register);

        let (len, _) = server.recv_from(&mut buf).unwrap();
        let packet = SyncPacket::read(&buf[..len]).unwrap();
        match packet.payload {
            Payload::Unregister(unreg) => {
                assert_eq!(unreg.client_id, 7);
                assert_eq!(unreg.reason, UnregisterReason::Regular);
            }
            other => panic!("Unexpected payload {:?}", other),
        }

        // Reconnect restarts the sequence from 1.
        session.connect_and_register().unwrap();
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(SyncPacket::read(&buf[..len]).unwrap().seq, 1);
    }
}
