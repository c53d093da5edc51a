use crate::net::addr::PeerAddress;
use crate::net::reactor::{EventHandler, Interest, Ops, Readiness};
use crate::net::socket::Listener;
use crate::net::support::{NetworkError, NetworkResult};
use grout::logging;
use indexmap::IndexMap;
use mio::event::Source;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DATAGRAM_MAX: usize = 65536;

/// Protocol state materialized per datagram peer, so the connection-centric
/// model applies to connectionless transports too.
pub trait PeerProtocol {
    /// One inbound datagram; the return value is sent back to the peer.
    fn on_datagram(&mut self, data: &[u8]) -> Option<Vec<u8>>;
}

struct PeerSlot {
    protocol: Box<dyn PeerProtocol>,
    backlog: VecDeque<Vec<u8>>,
    last_seen: Instant,
}

/// Datagram listener host: owns the socket and an ephemeral pseudo
/// connection per peer address, evicted after an idle period.
pub struct DatagramEndpoint {
    listener: Listener,
    factory: Box<dyn FnMut() -> Box<dyn PeerProtocol>>,
    peers: IndexMap<PeerAddress, PeerSlot>,
    idle_timeout: Duration,
    log: logging::Logger,
}

impl DatagramEndpoint {
    pub fn new(
        listener: Listener,
        factory: Box<dyn FnMut() -> Box<dyn PeerProtocol>>,
        idle_timeout: Duration,
        log: logging::Logger,
    ) -> DatagramEndpoint {
        DatagramEndpoint {
            listener,
            factory,
            peers: IndexMap::new(),
            idle_timeout,
            log,
        }
    }

    #[inline]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn receive_pass(&mut self, now: Instant) -> NetworkResult<()> {
        let mut datagram = [0u8; DATAGRAM_MAX];

        loop {
            let (count, peer) = match self.listener.recv_from(&mut datagram) {
                Ok(pair) => pair,
                Err(NetworkError::Wait) => return Ok(()),
                Err(err) => return Err(err),
            };

            let factory = &mut self.factory;
            let log = &self.log;
            let slot = self.peers.entry(peer.clone()).or_insert_with(|| {
                logging::debug!(log, "datagram peer materialized";
                                "context" => "receive",
                                "peer" => %peer);

                PeerSlot {
                    protocol: factory(),
                    backlog: VecDeque::new(),
                    last_seen: now,
                }
            });

            slot.last_seen = now;

            if let Some(reply) = slot.protocol.on_datagram(&datagram[..count]) {
                slot.backlog.push_back(reply);
            }
        }
    }

    fn send_pass(&mut self) -> NetworkResult<()> {
        for (peer, slot) in self.peers.iter_mut() {
            while let Some(reply) = slot.backlog.front() {
                match self.listener.send_to(reply, peer) {
                    Ok(_) => {
                        slot.backlog.pop_front();
                    }
                    Err(NetworkError::Wait) => return Ok(()),
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(())
    }
}

impl EventHandler for DatagramEndpoint {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn interest(&self) -> Interest {
        Interest::Both
    }

    fn ready(&mut self, readiness: Readiness, _ops: &mut Ops) -> NetworkResult<()> {
        let now = Instant::now();

        if readiness.readable {
            self.receive_pass(now)?;
        }

        self.send_pass()
    }

    fn tick(&mut self, now: Instant, _ops: &mut Ops) -> NetworkResult<()> {
        let timeout = self.idle_timeout;
        let log = &self.log;

        self.peers.retain(|peer, slot| {
            let keep = now.duration_since(slot.last_seen) < timeout;

            if !keep {
                logging::debug!(log, "datagram peer evicted";
                                "context" => "tick",
                                "peer" => %peer);
            }

            keep
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::{BindAddress, SocketKind};

    struct Upper;

    impl PeerProtocol for Upper {
        fn on_datagram(&mut self, data: &[u8]) -> Option<Vec<u8>> {
            Some(data.to_ascii_uppercase())
        }
    }

    fn endpoint() -> (DatagramEndpoint, u16) {
        let addr: BindAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Listener::bind(&addr, SocketKind::Datagram).unwrap();
        let port = listener.local_addr().unwrap().port();

        let endpoint = DatagramEndpoint::new(
            listener,
            Box::new(|| Box::new(Upper)),
            Duration::from_secs(60),
            grout::logging::discard(),
        );

        (endpoint, port)
    }

    #[test]
    fn test_per_peer_reply() {
        let (mut endpoint, port) = endpoint();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        client.send_to(b"hello", ("127.0.0.1", port)).unwrap();

        let mut ops = Ops::new();
        let ready = Readiness {
            readable: true,
            writable: true,
        };

        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        let mut reply = [0u8; 16];
        let count = loop {
            endpoint.ready(ready, &mut ops).unwrap();

            match client.recv_from(&mut reply) {
                Ok((count, _)) => break count,
                Err(_) => continue,
            }
        };

        assert_eq!(&reply[..count], b"HELLO");
        assert_eq!(endpoint.peer_count(), 1);
    }

    #[test]
    fn test_idle_peer_eviction() {
        let (mut endpoint, port) = endpoint();
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        client.send_to(b"x", ("127.0.0.1", port)).unwrap();

        let mut ops = Ops::new();
        let ready = Readiness {
            readable: true,
            writable: true,
        };

        loop {
            endpoint.ready(ready, &mut ops).unwrap();

            if endpoint.peer_count() == 1 {
                break;
            }
        }

        let later = Instant::now() + Duration::from_secs(120);
        endpoint.tick(later, &mut ops).unwrap();

        assert_eq!(endpoint.peer_count(), 0);
    }
}
