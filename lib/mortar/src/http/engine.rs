use crate::http::limits::HttpLimits;
use crate::http::request::{HttpRequest, Parser};
use crate::http::response::{self, Body, HttpResponse};
use crate::http::router::{allow_header, RouteHandler, RouteMatch, Router};
use crate::http::types::{HttpError, Method, Status};
use crate::middleware::auth::AuthChain;
use crate::middleware::compress::{self, Codec, CodecRegistry};
use crate::middleware::proxy::{self, TrustPolicy};
use crate::net::addr::PeerAddress;
use crate::net::conn::{Connection, ReadOutcome};
use crate::net::reactor::{
    ChunkProducer, Completion, ConnHandle, Delivery, EventHandler, Interest, Ops, Readiness,
};
use crate::net::socket::{Listener, Stream};
use crate::net::state::ConnState;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use crate::pool::{Task, WorkerPool};
use grout::logging;
use mio::event::Source;
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub limits: HttpLimits,
    /// Soft ceiling on concurrent connections; beyond it accepts are
    /// refused with a 503.
    pub max_connections: usize,
    /// Write buffer capacity per connection.
    pub write_capacity: usize,
    pub compress_min_size: usize,
    pub compress_level: u32,
    pub trust: TrustPolicy,
    pub auth: AuthChain,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            limits: HttpLimits::default(),
            max_connections: 10_000,
            write_capacity: 4 * 1024 * 1024,
            compress_min_size: 500,
            compress_level: 6,
            trust: TrustPolicy::None,
            auth: AuthChain::new(),
        }
    }
}

/// Reactor-thread housekeeping hook for state layered on the server, e.g.
/// session tables. Driven from the acceptor's tick.
pub trait Housekeeper {
    fn tick(&self, now: Instant, ops: &mut Ops);
}

/// Shared server state: routing table, middleware configuration, codecs and
/// the optional worker pool. One instance per server, shared by every
/// connection handler on the reactor thread.
pub struct ServerCore {
    pub config: ServerConfig,
    pub router: Router,
    pub codecs: CodecRegistry,
    pool: Option<WorkerPool>,
    housekeepers: RefCell<Vec<Rc<dyn Housekeeper>>>,
    connections: Cell<usize>,
    log: logging::Logger,
}

impl ServerCore {
    pub fn new(
        config: ServerConfig,
        router: Router,
        pool: Option<WorkerPool>,
        log: logging::Logger,
    ) -> Rc<ServerCore> {
        Rc::new(ServerCore {
            config,
            router,
            codecs: CodecRegistry::standard(),
            pool,
            housekeepers: RefCell::new(Vec::new()),
            connections: Cell::new(0),
            log,
        })
    }

    pub fn add_housekeeper(&self, housekeeper: Rc<dyn Housekeeper>) {
        self.housekeepers.borrow_mut().push(housekeeper);
    }

    #[inline]
    pub fn connection_count(&self) -> usize {
        self.connections.get()
    }

    fn housekeeping(&self, now: Instant, ops: &mut Ops) {
        for housekeeper in self.housekeepers.borrow().iter() {
            housekeeper.tick(now, ops);
        }
    }
}

/// Engine access granted to inline handlers: the current connection handle
/// and deferred operations against other connections (SSE pushes).
pub struct EngineCtx<'a> {
    handle: ConnHandle,
    ops: &'a mut Ops,
}

impl<'a> EngineCtx<'a> {
    pub fn new(handle: ConnHandle, ops: &'a mut Ops) -> EngineCtx<'a> {
        EngineCtx { handle, ops }
    }

    /// Handle of the connection carrying the current request.
    #[inline]
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    /// Appends pre-framed bytes to another connection's write path.
    pub fn push(&mut self, to: ConnHandle, bytes: Vec<u8>) {
        self.ops.send(to, bytes);
    }

    pub fn close(&mut self, handle: ConnHandle) {
        self.ops.close(handle);
    }

    /// Requests reactor shutdown (the `shutdown` RPC uses this).
    pub fn stop(&mut self) {
        self.ops.stop();
    }
}

enum Streaming {
    Pull(ChunkProducer),
    Push,
}

/// A response reduced to bytes plus its continuation mode.
struct Finalized {
    bytes: Vec<u8>,
    keep_alive: bool,
    stream: Option<ChunkProducer>,
    push: bool,
}

/// Serializes a response, compressing fixed bodies when negotiation and
/// policy allow. Runs on the reactor thread or a worker, whichever executed
/// the handler.
fn finalize(
    mut response: HttpResponse,
    codec: Option<Codec>,
    min_size: usize,
    level: u32,
    keep_alive: bool,
) -> Finalized {
    if let Some(codec) = codec {
        compress::apply(&mut response, &codec, min_size, level);
    }

    let mut bytes = Vec::with_capacity(256 + response.body_len().unwrap_or(0));

    response::encode_head(&response, keep_alive, &mut bytes);

    match mem::replace(&mut response.body, Body::Bytes(Vec::new())) {
        Body::Bytes(body) => {
            bytes.extend_from_slice(&body);

            Finalized {
                bytes,
                keep_alive,
                stream: None,
                push: false,
            }
        }
        Body::Stream(producer) => Finalized {
            bytes,
            keep_alive,
            stream: Some(producer),
            push: false,
        },
        Body::Push(preamble) => {
            if !preamble.is_empty() {
                bytes.extend_from_slice(&response::encode_chunk(&preamble));
            }

            Finalized {
                bytes,
                keep_alive,
                stream: None,
                push: true,
            }
        }
    }
}

/// Per-connection protocol driver: parses requests off the read buffer,
/// walks the middleware chain and the router, and writes responses back,
/// honoring keep-alive, streaming and worker hand-off.
pub struct HttpConnection {
    conn: Connection,
    parser: Parser,
    core: Rc<ServerCore>,
    peer: PeerAddress,
    handle: ConnHandle,
    requests_served: usize,
    keep_alive: bool,
    pending_async: bool,
    streaming: Option<Streaming>,
    peer_eof: bool,
    read_full: bool,
    log: logging::Logger,
}

impl HttpConnection {
    pub fn new(stream: Stream, peer: PeerAddress, core: Rc<ServerCore>) -> HttpConnection {
        let log = core.log.new(logging::o!("peer" => peer.to_string()));
        let conn = Connection::new(
            stream,
            peer.clone(),
            core.config.limits.read_capacity(),
            core.config.write_capacity,
            log.clone(),
        );
        let parser = Parser::new(core.config.limits.clone());

        core.connections.set(core.connections.get() + 1);

        HttpConnection {
            conn,
            parser,
            core,
            peer,
            handle: ConnHandle {
                token: 0,
                generation: 0,
            },
            requests_served: 0,
            keep_alive: true,
            pending_async: false,
            streaming: None,
            peer_eof: false,
            read_full: false,
            log,
        }
    }

    /// Parses and dispatches as many buffered requests as the connection
    /// state allows. Never reads past a request while one is outstanding on
    /// the pool.
    fn process(&mut self, ops: &mut Ops) -> NetworkResult<()> {
        loop {
            if self.pending_async
                || self.streaming.is_some()
                || self.conn.state.contains(ConnState::CLOSING)
                || self.conn.state.contains(ConnState::CLOSED)
            {
                break;
            }

            match self.parser.advance(&mut self.conn.read_buffer, &self.peer) {
                Ok(Some(request)) => {
                    self.conn
                        .state
                        .shift(ConnState::READING, ConnState::PROCESSING);
                    self.handle_request(request, ops)?;
                }
                Ok(None) => {
                    if self.read_full && !self.conn.read_buffer.is_empty() {
                        let status = self.parser.overflow_status();

                        self.error_close(HttpError::new(status, "request too large"), ops)?;
                    }

                    break;
                }
                Err(error) => {
                    self.error_close(error, ops)?;
                    break;
                }
            }
        }

        self.read_full = false;

        if self.peer_eof
            && !self.pending_async
            && self.streaming.is_none()
            && !self.conn.state.contains(ConnState::CLOSED)
        {
            self.conn.state.insert(ConnState::CLOSING);
        }

        Ok(())
    }

    fn handle_request(&mut self, mut request: HttpRequest, ops: &mut Ops) -> NetworkResult<()> {
        let core = self.core.clone();

        self.requests_served += 1;

        proxy::apply(&mut request, &core.config.trust);
        request.principal = core.config.auth.evaluate(&request);

        self.keep_alive = request.keep_alive()
            && self.requests_served < core.config.limits.max_requests_per_connection
            && !self.peer_eof;

        logging::debug!(self.log, "request";
                        "context" => "handle",
                        "method" => request.method.as_str(),
                        "path" => request.path.as_str(),
                        "keep_alive" => self.keep_alive);

        let route = match core.router.lookup(request.method, &request.path) {
            RouteMatch::NotFound => {
                return self.finish_with(&request, HttpResponse::text(Status::NOT_FOUND, "not found"), ops);
            }
            RouteMatch::MethodMissing(allowed) => {
                let allow = allow_header(&allowed);

                let response = if request.method == Method::Options {
                    HttpResponse::new(Status::NO_CONTENT).with_header("Allow", allow)
                } else {
                    HttpResponse::text(Status::METHOD_NOT_ALLOWED, "method not allowed")
                        .with_header("Allow", allow)
                };

                return self.finish_with(&request, response, ops);
            }
            RouteMatch::Found(route) => (route.handler.clone(), route.protected),
        };

        let (handler, protected) = route;

        if protected && request.principal.is_none() {
            let mut response = HttpResponse::text(Status::UNAUTHORIZED, "authentication required");

            if let Some(challenge) = core.config.auth.challenge() {
                response.headers.set("WWW-Authenticate", challenge);
            }

            return self.finish_with(&request, response, ops);
        }

        match handler {
            RouteHandler::Inline(inline) => {
                let response = {
                    let mut ctx = EngineCtx {
                        handle: self.handle,
                        ops,
                    };

                    match catch_unwind(AssertUnwindSafe(|| inline(&request, &mut ctx))) {
                        Ok(response) => response,
                        Err(_) => {
                            logging::error!(self.log, "handler panicked";
                                            "context" => "handle",
                                            "path" => request.path.as_str());

                            HttpResponse::text(Status::INTERNAL_SERVER_ERROR, "internal error")
                        }
                    }
                };

                self.finish_with(&request, response, ops)
            }
            RouteHandler::Pooled(pooled) => match &core.pool {
                Some(pool) => {
                    let codec = core
                        .codecs
                        .negotiate(request.header("accept-encoding"))
                        .copied();
                    let min_size = core.config.compress_min_size;
                    let level = core.config.compress_level;
                    let keep_alive = self.keep_alive;

                    let job = Box::new(move || {
                        let response =
                            match catch_unwind(AssertUnwindSafe(|| pooled(&request))) {
                                Ok(response) => response,
                                Err(_) => HttpResponse::text(
                                    Status::INTERNAL_SERVER_ERROR,
                                    "internal error",
                                ),
                            };

                        let done = finalize(response, codec, min_size, level, keep_alive);

                        Delivery::Done(Completion {
                            bytes: done.bytes,
                            keep_alive: done.keep_alive,
                            stream: done.stream,
                            push: done.push,
                        })
                    });

                    let task = Task {
                        handle: self.handle,
                        job,
                        on_purge: response::canned(Status::SERVICE_UNAVAILABLE, "shutting down"),
                    };

                    match pool.submit(task) {
                        Ok(()) => {
                            self.pending_async = true;
                            self.conn
                                .state
                                .shift(ConnState::PROCESSING, ConnState::PROCESSING_ASYNC);
                            Ok(())
                        }
                        Err(_) => {
                            // The request moved into the refused task; answer
                            // without it.
                            self.keep_alive = false;

                            let refusal = finalize(
                                HttpResponse::text(Status::SERVICE_UNAVAILABLE, "shutting down"),
                                None,
                                min_size,
                                level,
                                false,
                            );

                            self.apply_finalized(refusal, ops)
                        }
                    }
                }
                None => {
                    let response = match catch_unwind(AssertUnwindSafe(|| pooled(&request))) {
                        Ok(response) => response,
                        Err(_) => {
                            logging::error!(self.log, "handler panicked";
                                            "context" => "handle",
                                            "path" => request.path.as_str());

                            HttpResponse::text(Status::INTERNAL_SERVER_ERROR, "internal error")
                        }
                    };

                    self.finish_with(&request, response, ops)
                }
            },
        }
    }

    fn finish_with(
        &mut self,
        request: &HttpRequest,
        response: HttpResponse,
        ops: &mut Ops,
    ) -> NetworkResult<()> {
        let codec = if response.is_streaming() {
            None
        } else {
            self.core
                .codecs
                .negotiate(request.header("accept-encoding"))
                .copied()
        };

        let done = finalize(
            response,
            codec,
            self.core.config.compress_min_size,
            self.core.config.compress_level,
            self.keep_alive,
        );

        self.apply_finalized(done, ops)
    }

    fn apply_finalized(&mut self, done: Finalized, ops: &mut Ops) -> NetworkResult<()> {
        self.keep_alive = done.keep_alive;

        self.conn
            .state
            .shift(ConnState::PROCESSING, ConnState::RESPONDING);
        self.conn.state.insert(ConnState::SENDING_HEADERS);

        self.conn.queue(&done.bytes)?;

        self.streaming = match (done.stream, done.push) {
            (Some(producer), _) => Some(Streaming::Pull(producer)),
            (None, true) => Some(Streaming::Push),
            (None, false) => None,
        };

        self.pump(Instant::now(), ops)
    }

    /// Flushes the write buffer and, once drained, advances whatever the
    /// response still owes: the next pulled chunk, the chunked terminator,
    /// or the keep-alive / close transition.
    fn pump(&mut self, now: Instant, ops: &mut Ops) -> NetworkResult<()> {
        enum Next {
            Chunk(Vec<u8>),
            End,
            Wait,
            Done,
        }

        loop {
            let sent = self.conn.flush(now)?;

            if sent > 0 && self.conn.state.contains(ConnState::SENDING_HEADERS) {
                self.conn
                    .state
                    .shift(ConnState::SENDING_HEADERS, ConnState::SENDING_BODY);
            }

            if self.conn.has_egress() {
                break;
            }

            let next = match &mut self.streaming {
                Some(Streaming::Pull(producer)) => match producer() {
                    Some(chunk) if !chunk.is_empty() => Next::Chunk(chunk),
                    _ => Next::End,
                },
                Some(Streaming::Push) => Next::Wait,
                None => Next::Done,
            };

            match next {
                Next::Chunk(chunk) => {
                    self.conn.queue(&response::encode_chunk(&chunk))?;
                }
                Next::End => {
                    self.conn.queue(response::CHUNK_END)?;
                    self.streaming = None;
                    self.end_of_response();
                }
                Next::Wait => break,
                Next::Done => {
                    self.end_of_response();
                    break;
                }
            }
        }

        self.maybe_close(ops);
        Ok(())
    }

    fn end_of_response(&mut self) {
        if !self.conn.state.contains(ConnState::RESPONDING) {
            return;
        }

        self.conn.state.remove(ConnState::RESPONDING);
        self.conn.state.remove(ConnState::SENDING_HEADERS);
        self.conn.state.remove(ConnState::SENDING_BODY);

        if self.keep_alive && !self.peer_eof {
            self.conn.state.insert(ConnState::IDLE);
        } else {
            self.conn.state.insert(ConnState::CLOSING);
        }
    }

    /// Protocol errors answer once and close regardless of keep-alive.
    fn error_close(&mut self, error: HttpError, ops: &mut Ops) -> NetworkResult<()> {
        logging::debug!(self.log, "protocol error";
                        "context" => "handle",
                        "status" => error.status.0,
                        "detail" => error.detail);

        self.keep_alive = false;
        self.parser.reset();

        let response = HttpResponse::text(error.status, error.detail);
        let _ = self.conn.queue(&response::encode(&response, false));

        self.conn.state.insert(ConnState::CLOSING);
        self.pump(Instant::now(), ops)
    }

    fn maybe_close(&mut self, ops: &mut Ops) {
        if self.conn.state.contains(ConnState::CLOSING)
            && !self.conn.has_egress()
            && !self.pending_async
        {
            ops.close_self();
        }
    }
}

impl EventHandler for HttpConnection {
    fn source(&mut self) -> &mut dyn Source {
        self.conn.stream_mut()
    }

    fn interest(&self) -> Interest {
        Interest::Both
    }

    fn attach(&mut self, handle: ConnHandle) {
        self.handle = handle;
    }

    fn ready(&mut self, readiness: Readiness, ops: &mut Ops) -> NetworkResult<()> {
        let now = Instant::now();

        if readiness.readable && !self.peer_eof {
            self.conn.state.insert(ConnState::READING);

            match self.conn.receive(now)? {
                ReadOutcome::Eof(_) => self.peer_eof = true,
                ReadOutcome::Full(_) => self.read_full = true,
                ReadOutcome::WouldBlock(_) => {}
            }

            self.process(ops)?;
        }

        self.pump(now, ops)?;

        // A stream may have just finished; pick up any request that was
        // already buffered behind it.
        self.process(ops)?;
        self.pump(now, ops)
    }

    fn deliver(&mut self, delivery: Delivery, ops: &mut Ops) -> NetworkResult<()> {
        match delivery {
            Delivery::Bytes(bytes) => {
                // Push-mode frames from the reactor thread (SSE).
                self.conn.queue(&bytes)?;
                self.pump(Instant::now(), ops)
            }
            Delivery::Done(completion) => {
                if !self.pending_async {
                    return Ok(());
                }

                self.pending_async = false;
                self.conn
                    .state
                    .shift(ConnState::PROCESSING_ASYNC, ConnState::RESPONDING);
                self.conn.state.insert(ConnState::SENDING_HEADERS);

                let done = Finalized {
                    bytes: completion.bytes,
                    keep_alive: completion.keep_alive,
                    stream: completion.stream,
                    push: completion.push,
                };

                self.keep_alive = done.keep_alive;
                self.conn.queue(&done.bytes)?;
                self.streaming = match (done.stream, done.push) {
                    (Some(producer), _) => Some(Streaming::Pull(producer)),
                    (None, true) => Some(Streaming::Push),
                    (None, false) => None,
                };

                self.pump(Instant::now(), ops)?;

                // A pipelined request may already be buffered.
                self.process(ops)?;
                self.pump(Instant::now(), ops)
            }
        }
    }

    fn tick(&mut self, now: Instant, ops: &mut Ops) -> NetworkResult<()> {
        // Push channels (SSE) idle legitimately; everyone else gets reaped.
        if self.pending_async || matches!(self.streaming, Some(Streaming::Push)) {
            return Ok(());
        }

        if self.conn.idle_for(now) >= self.core.config.limits.idle_timeout {
            logging::debug!(self.log, "idle connection reaped"; "context" => "tick");
            ops.close_self();
        }

        Ok(())
    }

    fn drained(&self) -> bool {
        !self.pending_async && !self.conn.has_egress()
    }

    fn abandon(&mut self) {
        let _ = self
            .conn
            .queue(&response::canned(Status::SERVICE_UNAVAILABLE, "shutting down"));
        let _ = self.conn.flush(Instant::now());
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.core.connections.set(self.core.connections.get() - 1);
    }
}

/// Accepts connections until the backlog would block and spawns an
/// `HttpConnection` per client; also drives server-level housekeeping.
pub struct Acceptor {
    listener: Listener,
    core: Rc<ServerCore>,
    log: logging::Logger,
}

impl Acceptor {
    pub fn new(listener: Listener, core: Rc<ServerCore>) -> Acceptor {
        let log = core.log.new(logging::o!());

        Acceptor {
            listener,
            core,
            log,
        }
    }
}

impl EventHandler for Acceptor {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn interest(&self) -> Interest {
        Interest::Read
    }

    fn ready(&mut self, _readiness: Readiness, ops: &mut Ops) -> NetworkResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if self.core.connection_count() >= self.core.config.max_connections {
                        logging::warn!(self.log, "connection ceiling hit, refusing";
                                       "context" => "accept",
                                       "peer" => %peer);

                        let refusal =
                            response::canned(Status::SERVICE_UNAVAILABLE, "server full");
                        let _ = stream.write(&refusal);
                        continue;
                    }

                    logging::debug!(self.log, "connection accepted";
                                    "context" => "accept",
                                    "peer" => %peer);

                    ops.spawn(Box::new(HttpConnection::new(
                        stream,
                        peer,
                        self.core.clone(),
                    )));
                }
                Err(NetworkError::Wait) => return Ok(()),
                Err(NetworkError::Fatal(ErrorType::Io(kind)))
                    if kind == std::io::ErrorKind::ConnectionAborted =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn tick(&mut self, now: Instant, ops: &mut Ops) -> NetworkResult<()> {
        self.core.housekeeping(now, ops);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::addr::{BindAddress, SocketKind};
    use crate::net::reactor::{Reactor, ReactorConfig, StopHandle};
    use crate::pool::PoolConfig;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    struct TestServer {
        port: u16,
        stop: StopHandle,
        runner: Option<thread::JoinHandle<NetworkResult<()>>>,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop.stop();

            if let Some(runner) = self.runner.take() {
                let _ = runner.join();
            }
        }
    }

    fn spawn_server<F>(use_pool: bool, configure: F) -> TestServer
    where
        F: FnOnce(&mut Router, &mut ServerConfig) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();

        let runner = thread::spawn(move || {
            let mut router = Router::new();
            let mut config = ServerConfig::default();

            configure(&mut router, &mut config);

            let reactor_config = ReactorConfig {
                poll_timeout: Duration::from_millis(20),
                housekeeping_interval: Duration::from_millis(100),
                drain_timeout: Duration::from_millis(500),
                event_capacity: 64,
            };

            let mut reactor = Reactor::new(reactor_config, grout::logging::discard()).unwrap();

            let pool = if use_pool {
                Some(WorkerPool::start(
                    PoolConfig {
                        workers: 2,
                        purge_on_shutdown: false,
                    },
                    reactor.wakeup(),
                    grout::logging::discard(),
                ))
            } else {
                None
            };

            let core = ServerCore::new(config, router, pool, grout::logging::discard());

            let addr: BindAddress = "127.0.0.1:0".parse().unwrap();
            let listener = Listener::bind(&addr, SocketKind::Stream).unwrap();
            let port = listener.local_addr().unwrap().port();

            reactor
                .register(
                    Box::new(Acceptor::new(listener, core)),
                    Interest::Read,
                )
                .unwrap();

            tx.send((port, reactor.stop_handle())).unwrap();
            reactor.run()
        });

        let (port, stop) = rx.recv().unwrap();

        TestServer {
            port,
            stop,
            runner: Some(runner),
        }
    }

    struct Reply {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Reply {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }
    }

    fn read_reply<R: Read>(reader: &mut BufReader<R>) -> Reply {
        let mut line = String::new();

        reader.read_line(&mut line).unwrap();

        let status: u16 = line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let mut headers = Vec::new();

        loop {
            let mut header = String::new();

            reader.read_line(&mut header).unwrap();

            let header = header.trim_end();

            if header.is_empty() {
                break;
            }

            let mut parts = header.splitn(2, ':');

            headers.push((
                parts.next().unwrap().trim().to_string(),
                parts.next().unwrap_or("").trim().to_string(),
            ));
        }

        let reply = Reply {
            status,
            headers,
            body: Vec::new(),
        };

        let body = if let Some(length) = reply.header("content-length") {
            let length: usize = length.parse().unwrap();
            let mut body = vec![0u8; length];

            reader.read_exact(&mut body).unwrap();
            body
        } else if reply.header("transfer-encoding") == Some("chunked") {
            read_chunked(reader)
        } else {
            Vec::new()
        };

        Reply { body, ..reply }
    }

    fn read_chunked<R: Read>(reader: &mut BufReader<R>) -> Vec<u8> {
        let mut body = Vec::new();

        loop {
            let mut size_line = String::new();

            reader.read_line(&mut size_line).unwrap();

            let size = usize::from_str_radix(size_line.trim(), 16).unwrap();

            if size == 0 {
                let mut terminator = String::new();
                reader.read_line(&mut terminator).unwrap();
                return body;
            }

            let mut chunk = vec![0u8; size + 2];
            reader.read_exact(&mut chunk).unwrap();
            body.extend_from_slice(&chunk[..size]);
        }
    }

    #[test]
    fn test_keepalive_pipelined_gets_then_close() {
        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/a", |_| HttpResponse::text(Status::OK, "alpha"));
            router.route(Method::Get, "/b", |_| HttpResponse::text(Status::OK, "bravo"));
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(
                b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());

        let first = read_reply(&mut reader);
        assert_eq!(first.status, 200);
        assert_eq!(first.body, b"alpha");

        let second = read_reply(&mut reader);
        assert_eq!(second.status, 200);
        assert_eq!(second.body, b"bravo");
        assert_eq!(second.header("connection"), Some("close"));

        // Server closes after the second response.
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_not_found_and_method_not_allowed() {
        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/only-get", |_| {
                HttpResponse::text(Status::OK, "ok")
            });
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 404);
        assert_eq!(reply.header("content-type"), Some("text/plain"));

        client
            .write_all(b"POST /only-get HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
            .unwrap();

        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 405);
        assert_eq!(reply.header("allow"), Some("GET"));
    }

    #[test]
    fn test_options_synthesized() {
        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/thing", |_| HttpResponse::text(Status::OK, "x"));
            router.route(Method::Put, "/thing", |_| HttpResponse::text(Status::OK, "y"));
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(b"OPTIONS /thing HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 204);
        assert_eq!(reply.header("allow"), Some("GET, PUT"));
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let server = spawn_server(false, |_, _| {});

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client.write_all(b"GET / HTTP/9.9\r\n\r\n").unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 400);
        assert_eq!(reply.header("connection"), Some("close"));

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_chunked_sse_stream() {
        use crate::http::sse::SseEvent;

        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/events", |_| {
                let mut pending: Vec<Vec<u8>> = vec![
                    SseEvent::data("one").with_id(1).serialize(),
                    SseEvent::data("two").with_id(2).serialize(),
                    SseEvent::data("three").with_id(3).serialize(),
                ];

                pending.reverse();

                let producer: ChunkProducer = Box::new(move || pending.pop());
                let mut response = HttpResponse::stream("text/event-stream", producer);

                response.headers.set("Cache-Control", "no-cache");
                response
            });
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(b"GET /events HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("transfer-encoding"), Some("chunked"));
        assert_eq!(reply.header("content-type"), Some("text/event-stream"));
        assert_eq!(
            String::from_utf8(reply.body).unwrap(),
            "id: 1\ndata: one\n\nid: 2\ndata: two\n\nid: 3\ndata: three\n\n"
        );
    }

    #[test]
    fn test_worker_pool_preserves_order() {
        let server = spawn_server(true, |router, _| {
            router.route(Method::Get, "/slow", |_| {
                thread::sleep(Duration::from_millis(80));
                HttpResponse::text(Status::OK, "slow")
            });
            router.route(Method::Get, "/fast", |_| HttpResponse::text(Status::OK, "fast"));
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(
                b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n\
                  GET /fast HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());

        let first = read_reply(&mut reader);
        let second = read_reply(&mut reader);

        assert_eq!(first.body, b"slow");
        assert_eq!(second.body, b"fast");
    }

    #[test]
    fn test_compression_end_to_end() {
        use crate::middleware::compress::CodecRegistry;

        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/page", |_| {
                HttpResponse::text(Status::OK, &"lorem ipsum ".repeat(100))
            });
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(
                b"GET /page HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\nConnection: close\r\n\r\n",
            )
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 200);
        assert_eq!(reply.header("content-encoding"), Some("gzip"));
        assert_eq!(reply.header("vary"), Some("Accept-Encoding"));

        let registry = CodecRegistry::standard();
        let codec = registry.get("gzip").unwrap();
        let unpacked = (codec.decompress)(&reply.body).unwrap();

        assert_eq!(unpacked, "lorem ipsum ".repeat(100).into_bytes());
    }

    #[test]
    fn test_protected_route_requires_auth() {
        use crate::middleware::auth::Strategy;

        let server = spawn_server(false, |router, config| {
            router.route(Method::Get, "/secret", |_| {
                HttpResponse::text(Status::OK, "classified")
            });
            router.protect("/secret");
            config.auth.push(Strategy::bearer("letmein"));
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(b"GET /secret HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 401);
        assert_eq!(reply.header("www-authenticate"), Some("Bearer"));

        client
            .write_all(
                b"GET /secret HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer letmein\r\n\
                  Connection: close\r\n\r\n",
            )
            .unwrap();

        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"classified");
    }

    #[test]
    fn test_proxy_trust_end_to_end() {
        let server = spawn_server(false, |router, config| {
            config.trust = TrustPolicy::addresses(vec!["127.0.0.1".parse().unwrap()]);
            router.route(Method::Get, "/whoami", |request: &HttpRequest| {
                let ip = request
                    .effective_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default();

                HttpResponse::text(Status::OK, &ip)
            });
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(
                b"GET /whoami HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 203.0.113.42\r\n\
                  Connection: close\r\n\r\n",
            )
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.body, b"203.0.113.42");
    }

    #[test]
    fn test_handler_panic_becomes_500() {
        let server = spawn_server(false, |router, _| {
            router.route(Method::Get, "/boom", |_| panic!("kaboom"));
        });

        let mut client = TcpStream::connect(("127.0.0.1", server.port)).unwrap();

        client
            .write_all(b"GET /boom HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut reader = BufReader::new(client.try_clone().unwrap());
        let reply = read_reply(&mut reader);

        assert_eq!(reply.status, 500);
    }
}
