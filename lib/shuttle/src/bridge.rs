//! Ingress tunnel bridge.
//!
//! External systems deliver raw frames as UDP datagrams of the form
//! `{ i32 flow-id, i32 length, payload }`. A dedicated thread decodes them
//! and schedules one event per packet into the currently authorized slice,
//! so observed latency is bounded by the slice length.

use crate::event::ContextId;
use crate::scheduler::SchedulerHandle;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use fabric::logging;
use fabric::result::{Error, Result};
use hashbrown::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Flow id plus payload length.
pub const TUNNEL_HEADER_SIZE: usize = 8;

// Tunnel frames carry ethernet-sized payloads.
const RECV_BUF_SIZE: usize = 2048;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TunnelPacket {
    pub flow_id: i32,
    pub payload: Vec<u8>,
}

impl TunnelPacket {
    /// Parse one tunnel datagram. The declared length must match the bytes
    /// actually present.
    pub fn read(buf: &[u8]) -> Result<TunnelPacket> {
        if buf.len() < TUNNEL_HEADER_SIZE {
            return Err(Error::Truncated);
        }

        let mut stream = buf;
        let flow_id = stream.read_i32::<BigEndian>()?;
        let length = stream.read_i32::<BigEndian>()?;

        if length < 0 || stream.len() != length as usize {
            return Err(Error::LengthMismatch);
        }

        Ok(TunnelPacket {
            flow_id,
            payload: stream.to_vec(),
        })
    }

    /// Appends the encoded datagram to `buf`.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_i32::<BigEndian>(self.flow_id)?;
        buf.write_i32::<BigEndian>(self.payload.len() as i32)?;
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Invoked inside the simulation, at the timestamp the scheduler assigned to
/// the packet.
pub type FlowHandler = Arc<dyn Fn(TunnelPacket) + Send + Sync>;

/// Routing entry: packets for `flow_id` become events in `context`.
pub struct FlowBinding {
    pub flow_id: i32,
    pub context: ContextId,
    pub handler: FlowHandler,
}

/// Owns the ingress socket and its reader thread.
pub struct TunnelBridge {
    thread: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl TunnelBridge {
    /// Binds the tunnel socket and starts the ingress thread.
    pub fn spawn<'a, L: Into<Option<&'a logging::Logger>>>(
        bind: SocketAddr,
        scheduler: SchedulerHandle,
        flows: Vec<FlowBinding>,
        log: L,
    ) -> Result<TunnelBridge> {
        let bridge_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let sock = UdpSocket::bind(bind)?;
        let local_addr = sock.local_addr()?;

        let table: HashMap<i32, (ContextId, FlowHandler)> = flows
            .into_iter()
            .map(|binding| (binding.flow_id, (binding.context, binding.handler)))
            .collect();

        logging::info!(bridge_log, "tunnel bridge listening";
                       "addr" => %local_addr,
                       "flows" => table.len());

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = shutdown.clone();
        let thread_log = bridge_log.clone();

        let thread = thread::Builder::new()
            .name(String::from("sync-tunnel-ingress"))
            .spawn(move || {
                Self::read_loop(sock, scheduler, table, thread_shutdown, thread_log);
            })?;

        Ok(TunnelBridge {
            thread: Some(thread),
            shutdown,
            local_addr,
        })
    }

    /// Address the tunnel socket is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the ingress thread and closes the socket. The blocking receive
    /// is woken with an empty datagram to the bridge's own address.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let waker = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        waker.send_to(&[], self.wake_addr())?;

        if let Some(thread) = self.thread.take() {
            thread.join().expect("ingress thread panicked");
        }

        Ok(())
    }

    fn wake_addr(&self) -> SocketAddr {
        match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => {
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.local_addr.port())
            }
            _ => self.local_addr,
        }
    }

    fn read_loop(
        sock: UdpSocket,
        scheduler: SchedulerHandle,
        table: HashMap<i32, (ContextId, FlowHandler)>,
        shutdown: Arc<AtomicBool>,
        log: logging::Logger,
    ) {
        let mut buf = [0u8; RECV_BUF_SIZE];

        loop {
            let (len, from) = match sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) => {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    logging::warn!(log, "tunnel receive failed"; "error" => ?err);
                    continue;
                }
            };

            if shutdown.load(Ordering::Acquire) {
                break;
            }

            let packet = match TunnelPacket::read(&buf[..len]) {
                Ok(packet) => packet,
                Err(err) => {
                    logging::warn!(log, "discarding malformed tunnel datagram";
                                   "from" => %from,
                                   "len" => len,
                                   "error" => ?err);
                    continue;
                }
            };

            let (context, handler) = match table.get(&packet.flow_id) {
                Some(entry) => entry,
                None => {
                    logging::debug!(log, "discarding tunnel packet for unknown flow";
                                    "flow_id" => packet.flow_id);
                    continue;
                }
            };

            logging::trace!(log, "tunnel packet received";
                            "flow_id" => packet.flow_id,
                            "payload_len" => packet.payload.len());

            let handler = handler.clone();
            scheduler.schedule_in_current_slice_with_context(*context, move || handler(packet));
        }

        logging::debug!(log, "ingress thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{SyncLink, SyncScheduler};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct GrantLink {
        grants: VecDeque<u32>,
    }

    impl SyncLink for GrantLink {
        fn connect_and_register(&mut self) -> Result<()> {
            Ok(())
        }

        fn send_finished(&mut self, _run_time: u32, _real_time: u32) -> Result<()> {
            Ok(())
        }

        fn wait_for_run_permission(&mut self) -> Result<u32> {
            self.grants.pop_front().ok_or(Error::NotConnected)
        }

        fn unregister_and_disconnect(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn tunnel_bytes(flow_id: i32, payload: &[u8]) -> Vec<u8> {
        let packet = TunnelPacket {
            flow_id,
            payload: payload.to_vec(),
        };
        let mut buf = Vec::new();
        packet.write(&mut buf).unwrap();
        buf
    }

    fn wait_for_pending(handle: &SchedulerHandle, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.pending() < count {
            assert!(Instant::now() < deadline, "timed out waiting for ingress event");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_tunnel_roundtrip() {
        let bytes = tunnel_bytes(42, b"hello tunnel");
        let packet = TunnelPacket::read(&bytes).unwrap();

        assert_eq!(packet.flow_id, 42);
        assert_eq!(packet.payload, b"hello tunnel");
    }

    #[test]
    fn test_tunnel_read_err_truncated() {
        assert_eq!(
            TunnelPacket::read(&[0u8; TUNNEL_HEADER_SIZE - 1]).unwrap_err(),
            Error::Truncated
        );
    }

    #[test]
    fn test_tunnel_read_err_length_mismatch() {
        let mut bytes = tunnel_bytes(1, b"abcdef");

        // Declared length no longer matches the actual payload.
        bytes.truncate(bytes.len() - 2);
        assert_eq!(TunnelPacket::read(&bytes).unwrap_err(), Error::LengthMismatch);
    }

    #[test]
    fn test_tunnel_read_err_negative_length() {
        let mut bytes = Vec::new();
        bytes.write_i32::<BigEndian>(1).unwrap();
        bytes.write_i32::<BigEndian>(-4).unwrap();

        assert_eq!(TunnelPacket::read(&bytes).unwrap_err(), Error::LengthMismatch);
    }

    #[test]
    fn test_ingress_packet_is_delivered_in_slice() {
        let mut scheduler = SyncScheduler::new(
            GrantLink {
                grants: vec![1000].into_iter().collect(),
            },
            None,
        );
        let handle = scheduler.handle();

        let received = Arc::new(Mutex::new(Vec::new()));
        let handler_received = received.clone();
        let handler_handle = handle.clone();

        let bridge = TunnelBridge::spawn(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            handle.clone(),
            vec![FlowBinding {
                flow_id: 5,
                context: 9,
                handler: Arc::new(move |packet: TunnelPacket| {
                    handler_received
                        .lock()
                        .unwrap()
                        .push((packet.payload.clone(), handler_handle.now()));
                }),
            }],
            None,
        )
        .unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        // Unknown flow ids are dropped before reaching the scheduler.
        sender
            .send_to(&tunnel_bytes(99, b"dropped"), bridge.local_addr())
            .unwrap();
        sender
            .send_to(&tunnel_bytes(5, b"frame one"), bridge.local_addr())
            .unwrap();

        wait_for_pending(&handle, 1);
        assert_eq!(handle.pending(), 1);

        scheduler.run().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, b"frame one".to_vec());
        // Scheduled before the first grant: start of the first slice.
        assert_eq!(received[0].1, 0);

        bridge.shutdown().unwrap();
    }
}
