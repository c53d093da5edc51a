//! Raw reactor smoke test: echoes whatever connected clients send until
//! interrupted. `cargo run --bin echo_listen [host:port]`.

use grout::logging;
use mio::event::Source;
use mortar::net::addr::{PeerAddress, SocketKind};
use mortar::net::conn::{Connection, ReadOutcome};
use mortar::net::reactor::{EventHandler, Interest, Ops, Reactor, ReactorConfig, Readiness};
use mortar::net::socket::{Listener, Stream};
use mortar::net::support::{ErrorType, NetworkError, NetworkResult};
use mortar::BindAddress;
use std::env;
use std::time::Instant;

const BUFFER_SIZE: usize = 65536;

struct EchoConn {
    conn: Connection,
    eof: bool,
}

impl EventHandler for EchoConn {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.stream_mut()
    }

    fn ready(&mut self, readiness: Readiness, _ops: &mut Ops) -> NetworkResult<()> {
        let now = Instant::now();

        if readiness.readable && !self.eof {
            loop {
                let outcome = self.conn.receive(now)?;

                let pending = self.conn.read_buffer.data().to_vec();
                self.conn.read_buffer.consume(pending.len());

                if !pending.is_empty() {
                    self.conn.queue(&pending)?;
                }

                match outcome {
                    ReadOutcome::WouldBlock(_) => break,
                    ReadOutcome::Full(_) => continue,
                    ReadOutcome::Eof(_) => {
                        self.eof = true;
                        break;
                    }
                }
            }
        }

        self.conn.flush(now)?;

        if self.eof && !self.conn.has_egress() {
            return Err(NetworkError::Fatal(ErrorType::PeerClosed));
        }

        Ok(())
    }
}

struct EchoAcceptor {
    listener: Listener,
    log: logging::Logger,
}

impl EventHandler for EchoAcceptor {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn interest(&self) -> Interest {
        Interest::Read
    }

    fn ready(&mut self, _readiness: Readiness, ops: &mut Ops) -> NetworkResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    logging::info!(self.log, "client connected"; "peer" => %peer);
                    ops.spawn(Box::new(echo_conn(stream, peer, &self.log)));
                }
                Err(NetworkError::Wait) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }
}

fn echo_conn(stream: Stream, peer: PeerAddress, log: &logging::Logger) -> EchoConn {
    EchoConn {
        conn: Connection::new(
            stream,
            peer,
            BUFFER_SIZE,
            BUFFER_SIZE,
            log.new(logging::o!()),
        ),
        eof: false,
    }
}

pub fn main() {
    let address: BindAddress = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:28008".to_string())
        .parse()
        .expect("Error parsing the listen address");

    let log = logging::init();
    let listener = Listener::bind(&address, SocketKind::Stream).expect("Error binding the listener");

    logging::info!(log, "echo listener ready"; "address" => %address);

    let mut reactor =
        Reactor::new(ReactorConfig::default(), log.new(logging::o!())).expect("Error creating the reactor");

    reactor
        .register(
            Box::new(EchoAcceptor {
                listener,
                log: log.new(logging::o!()),
            }),
            Interest::Read,
        )
        .expect("Error registering the listener");

    reactor.run().expect("Reactor failed");
}
