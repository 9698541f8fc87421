//! Central barrier coordinator.
//!
//! `Barrier` is the pure registration/period state machine; `Coordinator`
//! wraps it in a single-threaded blocking UDP serve loop. No state is shared
//! with any other thread.

use crate::config::ServerConfig;
use crate::frame::{
    Finished, Payload, Register, RunPermission, SyncPacket, Unregister, MAX_PACKET_SIZE,
};
use crate::logging;
use crate::result::Result;
use crate::{ClientId, PeriodId, SeqNr};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

const SOCK_TOKEN: Token = Token(0);

/// Size of the participant table. Client ids at or above this are refused.
pub const MAX_CLIENTS: usize = 256;

struct Participant {
    kind: crate::frame::ClientKind,
    description: String,
    /// Last period this client reported finished. Joining during period P
    /// records P-1: the client is caught up through every earlier period.
    period: PeriodId,
    /// Source endpoint observed on the register datagram; grants are
    /// unicast back to it.
    endpoint: SocketAddr,
}

/// Outcome of feeding one packet into the barrier state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Verdict {
    /// Nothing to send.
    Quiet,
    /// The current grant must be (re)broadcast.
    Announce,
}

pub struct Barrier {
    slots: Vec<Option<Participant>>,
    registered: usize,
    current_period: PeriodId,
    slice_us: u32,
    min_clients: usize,
    log: logging::Logger,
}

impl Barrier {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        slice_us: u32,
        min_clients: usize,
        log: L,
    ) -> Barrier {
        let barrier_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let mut slots = Vec::with_capacity(MAX_CLIENTS);
        slots.resize_with(MAX_CLIENTS, || None);

        Barrier {
            slots,
            registered: 0,
            current_period: 1,
            slice_us,
            min_clients,
            log: barrier_log,
        }
    }

    #[inline]
    pub fn current_period(&self) -> PeriodId {
        self.current_period
    }

    #[inline]
    pub fn registered(&self) -> usize {
        self.registered
    }

    #[inline]
    pub fn is_registered(&self, client_id: ClientId) -> bool {
        usize::from(client_id) < MAX_CLIENTS && self.slots[usize::from(client_id)].is_some()
    }

    /// The grant for the current period.
    #[inline]
    pub fn grant(&self) -> RunPermission {
        RunPermission {
            period: self.current_period,
            run_time: self.slice_us,
        }
    }

    /// Observed source endpoints of all registered clients, in slot order.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.slots
            .iter()
            .flatten()
            .map(|participant| participant.endpoint)
            .collect()
    }

    pub fn register(&mut self, reg: &Register, from: SocketAddr) -> Verdict {
        let cid = usize::from(reg.client_id);

        if cid >= MAX_CLIENTS {
            logging::warn!(self.log, "register refused, client id out of range";
                           "client_id" => reg.client_id);
            return Verdict::Quiet;
        }

        if self.slots[cid].is_some() {
            logging::warn!(self.log, "register refused, client id already registered";
                           "client_id" => reg.client_id);
            return Verdict::Quiet;
        }

        // A new client joins at the current period: it is treated as caught
        // up through every earlier period and owes a finish only for the
        // slice it is about to execute.
        self.slots[cid] = Some(Participant {
            kind: reg.kind,
            description: reg.description(),
            period: self.current_period - 1,
            endpoint: from,
        });
        self.registered += 1;

        logging::info!(self.log, "client registered";
                       "client_id" => reg.client_id,
                       "kind" => ?reg.kind,
                       "description" => reg.description(),
                       "endpoint" => %from,
                       "registered" => self.registered);

        // Announce the current grant so the new joiner starts (and returning
        // joiners resume), but only once the quorum has been reached.
        if self.registered >= self.min_clients {
            Verdict::Announce
        } else {
            Verdict::Quiet
        }
    }

    pub fn unregister(&mut self, unreg: &Unregister) {
        let cid = usize::from(unreg.client_id);

        if cid >= MAX_CLIENTS || self.slots[cid].is_none() {
            logging::warn!(self.log, "unregister for unknown client id dropped";
                           "client_id" => unreg.client_id);
            return;
        }

        let departed = self.slots[cid].take().expect("slot checked above");
        self.registered -= 1;

        logging::info!(self.log, "client unregistered";
                       "client_id" => unreg.client_id,
                       "kind" => ?departed.kind,
                       "description" => departed.description,
                       "reason" => ?unreg.reason,
                       "registered" => self.registered);
    }

    pub fn finished(&mut self, fin: &Finished) -> Verdict {
        logging::debug!(self.log, "finished report";
                        "client_id" => fin.client_id,
                        "period" => fin.period,
                        "run_time" => fin.run_time,
                        "real_time" => fin.real_time);

        if fin.period > self.current_period {
            logging::warn!(self.log, "finished for a future period dropped";
                           "client_id" => fin.client_id,
                           "reported" => fin.period,
                           "current" => self.current_period);
            return Verdict::Quiet;
        }

        let cid = usize::from(fin.client_id);
        if cid >= MAX_CLIENTS {
            logging::warn!(self.log, "finished with client id out of range dropped";
                           "client_id" => fin.client_id);
            return Verdict::Quiet;
        }

        let participant = match &mut self.slots[cid] {
            Some(participant) => participant,
            None => {
                logging::warn!(self.log, "finished from unregistered client dropped";
                               "client_id" => fin.client_id);
                return Verdict::Quiet;
            }
        };

        if fin.period < participant.period {
            logging::debug!(self.log, "late duplicate finished dropped";
                            "client_id" => fin.client_id,
                            "reported" => fin.period,
                            "recorded" => participant.period);
            return Verdict::Quiet;
        }

        participant.period = fin.period;

        if !self.all_finished() {
            return Verdict::Quiet;
        }

        self.current_period += 1;

        logging::info!(self.log, "all clients finished, advancing period";
                       "period" => self.current_period,
                       "run_time" => self.slice_us);

        if self.registered >= self.min_clients {
            Verdict::Announce
        } else {
            // Below quorum the period still advances, but the grant is held
            // back until enough clients have (re)registered.
            Verdict::Quiet
        }
    }

    fn all_finished(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .all(|participant| participant.period == self.current_period)
    }
}

pub struct Coordinator {
    sock: UdpSocket,
    poll: Poll,
    events: Events,

    barrier: Barrier,
    seq: SeqNr,

    client_port: u16,
    broadcast: Option<Ipv4Addr>,
    max_period: PeriodId,

    recv_buf: [u8; MAX_PACKET_SIZE],
    send_buf: [u8; MAX_PACKET_SIZE],

    log: logging::Logger,
}

impl Coordinator {
    /// Binds the serve socket. Broadcasting is enabled so grants can be
    /// delivered over a shared segment when configured.
    pub fn bind<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &ServerConfig,
        log: L,
    ) -> Result<Coordinator> {
        let coordinator_log = match log.into() {
            Some(log) => log.new(logging::o!("listen_port" => config.server_port)),
            _ => logging::null(),
        };

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_broadcast(true)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.server_port);
        raw.bind(&bind_addr.into())?;
        raw.set_nonblocking(true)?;

        let poll = Poll::new()?;
        let mut sock = UdpSocket::from_std(raw.into());
        poll.registry()
            .register(&mut sock, SOCK_TOKEN, Interest::READABLE)?;

        logging::info!(coordinator_log, "coordinator listening";
                       "port" => config.server_port,
                       "slice_us" => config.barrier_interval,
                       "min_clients" => config.min_clients,
                       "max_period" => config.max_period);

        Ok(Coordinator {
            sock,
            poll,
            events: Events::with_capacity(8),
            barrier: Barrier::new(
                config.barrier_interval,
                config.min_clients,
                Some(&coordinator_log),
            ),
            seq: 0,
            client_port: config.client_port,
            broadcast: config.broadcast_address,
            max_period: config.max_period,
            recv_buf: [0u8; MAX_PACKET_SIZE],
            send_buf: [0u8; MAX_PACKET_SIZE],
            log: coordinator_log,
        })
    }

    /// Address the serve socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.sock.local_addr().map_err(Into::into)
    }

    /// Blocking serve loop. Returns once `max_period` is reached, or runs
    /// forever when it is zero.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.poll.poll(&mut self.events, None)?;

            loop {
                let (len, from) = match self.sock.recv_from(&mut self.recv_buf) {
                    Ok(received) => received,
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => return Err(err.into()),
                };

                let packet = match SyncPacket::read(&self.recv_buf[..len]) {
                    Ok(packet) => packet,
                    Err(err) => {
                        logging::warn!(self.log, "discarding malformed datagram";
                                       "from" => %from,
                                       "len" => len,
                                       "error" => ?err);
                        continue;
                    }
                };

                self.dispatch(packet, from);

                if self.max_period > 0 && self.barrier.current_period() >= self.max_period {
                    logging::info!(self.log, "maximum period reached, stopping";
                                   "period" => self.barrier.current_period());
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&mut self, packet: SyncPacket, from: SocketAddr) {
        logging::trace!(self.log, "packet received";
                        "from" => %from,
                        "seq" => packet.seq,
                        "kind" => ?packet.payload.kind());

        let verdict = match packet.payload {
            Payload::Register(reg) => self.barrier.register(&reg, from),
            Payload::Unregister(unreg) => {
                self.barrier.unregister(&unreg);
                Verdict::Quiet
            }
            Payload::Finished(fin) => self.barrier.finished(&fin),
            Payload::RunPermission(_) => {
                logging::warn!(self.log, "run permission sent to coordinator dropped";
                               "from" => %from);
                Verdict::Quiet
            }
        };

        if verdict == Verdict::Announce {
            self.send_grant();
        }
    }

    /// Emits the current grant: one datagram to the broadcast address when
    /// configured, otherwise one unicast per observed client endpoint.
    fn send_grant(&mut self) {
        let grant = self.barrier.grant();

        self.seq += 1;
        let packet = SyncPacket {
            seq: self.seq,
            payload: Payload::RunPermission(grant),
        };

        let len = match packet.write(&mut self.send_buf) {
            Ok(len) => len,
            Err(err) => {
                logging::error!(self.log, "failed to encode grant"; "error" => ?err);
                return;
            }
        };

        let destinations: Vec<SocketAddr> = match self.broadcast {
            Some(addr) => vec![SocketAddr::new(IpAddr::V4(addr), self.client_port)],
            None => self.barrier.endpoints(),
        };

        for dest in destinations {
            logging::debug!(self.log, "sending run permission";
                            "period" => grant.period,
                            "run_time" => grant.run_time,
                            "seq" => self.seq,
                            "dest" => %dest);

            if let Err(err) = self.sock.send_to(&self.send_buf[..len], dest) {
                // A failed send must not take the barrier down; the client
                // side retransmit recovers from the lost grant.
                logging::warn!(self.log, "failed to send run permission";
                               "dest" => %dest,
                               "error" => ?err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ClientKind, UnregisterReason};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn register(barrier: &mut Barrier, cid: ClientId, port: u16) -> Verdict {
        barrier.register(
            &Register::new(cid, ClientKind::Test, "test"),
            addr(port),
        )
    }

    fn finished(barrier: &mut Barrier, cid: ClientId, period: PeriodId) -> Verdict {
        barrier.finished(&Finished {
            period,
            run_time: 1000,
            real_time: 0,
            client_id: cid,
        })
    }

    #[test]
    fn test_single_client_advances() {
        let mut barrier = Barrier::new(1000, 1, None);

        assert_eq!(register(&mut barrier, 7, 4000), Verdict::Announce);
        assert_eq!(barrier.grant(), RunPermission { period: 1, run_time: 1000 });

        assert_eq!(finished(&mut barrier, 7, 1), Verdict::Announce);
        assert_eq!(barrier.current_period(), 2);
        assert_eq!(barrier.grant(), RunPermission { period: 2, run_time: 1000 });
    }

    #[test]
    fn test_quorum_holds_first_grant() {
        let mut barrier = Barrier::new(1000, 2, None);

        // One client is not enough for a grant.
        assert_eq!(register(&mut barrier, 1, 4001), Verdict::Quiet);
        assert_eq!(barrier.registered(), 1);

        // The second registration releases the current grant.
        assert_eq!(register(&mut barrier, 2, 4002), Verdict::Announce);
        assert_eq!(barrier.grant().period, 1);
    }

    #[test]
    fn test_completion_requires_all_clients() {
        let mut barrier = Barrier::new(1000, 2, None);
        register(&mut barrier, 1, 4001);
        register(&mut barrier, 2, 4002);

        assert_eq!(finished(&mut barrier, 1, 1), Verdict::Quiet);
        assert_eq!(barrier.current_period(), 1);

        assert_eq!(finished(&mut barrier, 2, 1), Verdict::Announce);
        assert_eq!(barrier.current_period(), 2);
    }

    #[test]
    fn test_duplicate_finished_is_noop() {
        let mut barrier = Barrier::new(1000, 2, None);
        register(&mut barrier, 1, 4001);
        register(&mut barrier, 2, 4002);

        finished(&mut barrier, 1, 1);
        finished(&mut barrier, 2, 1);
        assert_eq!(barrier.current_period(), 2);

        // A retransmitted finished for period 1 must not advance anything.
        assert_eq!(finished(&mut barrier, 1, 1), Verdict::Quiet);
        assert_eq!(barrier.current_period(), 2);
    }

    #[test]
    fn test_finished_from_the_future_dropped() {
        let mut barrier = Barrier::new(1000, 1, None);
        register(&mut barrier, 3, 4003);

        assert_eq!(finished(&mut barrier, 3, 12), Verdict::Quiet);
        assert_eq!(barrier.current_period(), 1);
    }

    #[test]
    fn test_finished_from_unregistered_dropped() {
        let mut barrier = Barrier::new(1000, 1, None);
        register(&mut barrier, 1, 4001);

        assert_eq!(finished(&mut barrier, 2, 1), Verdict::Quiet);
        assert_eq!(barrier.current_period(), 1);
    }

    #[test]
    fn test_double_register_refused() {
        let mut barrier = Barrier::new(1000, 1, None);

        assert_eq!(register(&mut barrier, 1, 4001), Verdict::Announce);
        assert_eq!(register(&mut barrier, 1, 4009), Verdict::Quiet);
        assert_eq!(barrier.registered(), 1);
        assert!(barrier.is_registered(1));
        assert!(!barrier.is_registered(2));

        // The original endpoint must be kept.
        assert_eq!(barrier.endpoints(), vec![addr(4001)]);
    }

    #[test]
    fn test_register_out_of_range_refused() {
        let mut barrier = Barrier::new(1000, 1, None);

        assert_eq!(register(&mut barrier, MAX_CLIENTS as ClientId, 4001), Verdict::Quiet);
        assert_eq!(barrier.registered(), 0);
    }

    #[test]
    fn test_late_joiner_starts_at_current_period() {
        let mut barrier = Barrier::new(1000, 1, None);
        register(&mut barrier, 1, 4001);

        // Client 1 pushes the barrier forward a few periods.
        for period in 1..=3 {
            assert_eq!(finished(&mut barrier, 1, period), Verdict::Announce);
        }
        assert_eq!(barrier.current_period(), 4);

        // A late joiner is treated as caught up: it does not owe finishes
        // for periods it never saw.
        assert_eq!(register(&mut barrier, 2, 4002), Verdict::Announce);
        assert_eq!(finished(&mut barrier, 1, 4), Verdict::Quiet);
        assert_eq!(finished(&mut barrier, 2, 4), Verdict::Announce);
        assert_eq!(barrier.current_period(), 5);
    }

    #[test]
    fn test_unregister_releases_the_barrier() {
        let mut barrier = Barrier::new(1000, 1, None);
        register(&mut barrier, 1, 4001);
        register(&mut barrier, 2, 4002);

        finished(&mut barrier, 1, 1);
        assert_eq!(barrier.current_period(), 1);

        // The slow client leaves; the remaining one is now complete.
        barrier.unregister(&Unregister {
            client_id: 2,
            reason: UnregisterReason::Regular,
        });
        assert_eq!(finished(&mut barrier, 1, 1), Verdict::Announce);
        assert_eq!(barrier.current_period(), 2);
    }

    #[test]
    fn test_endpoints_follow_registration() {
        let mut barrier = Barrier::new(1000, 1, None);
        register(&mut barrier, 5, 4005);
        register(&mut barrier, 2, 4002);

        assert_eq!(barrier.endpoints(), vec![addr(4002), addr(4005)]);

        barrier.unregister(&Unregister {
            client_id: 2,
            reason: UnregisterReason::Regular,
        });
        assert_eq!(barrier.endpoints(), vec![addr(4005)]);
    }
}
