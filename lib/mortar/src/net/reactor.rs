use crate::net::support::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crossbeam_channel::{unbounded, Receiver, Sender};
use grout::logging;
use mio::event::Source;
use mio::{Events, Poll, Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Token reserved for the cross-thread waker.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Pull-style byte stream: returns successive chunks, `None` ends it.
pub type ChunkProducer = Box<dyn FnMut() -> Option<Vec<u8>> + Send>;

/// Finished work posted back by a worker thread.
pub struct Completion {
    pub bytes: Vec<u8>,
    pub keep_alive: bool,
    /// Continues the response chunk by chunk after `bytes`.
    pub stream: Option<ChunkProducer>,
    /// Keeps the connection open in push mode (SSE) after `bytes`.
    pub push: bool,
}

/// Payload routed to a handler from outside its own readiness events.
pub enum Delivery {
    /// Raw bytes to splice into the connection's write buffer.
    Bytes(Vec<u8>),
    /// A worker-pool completion.
    Done(Completion),
}

/// Capability value identifying a registered handler. The generation guards
/// against a slot being reused while the handle is still held elsewhere.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConnHandle {
    pub token: usize,
    pub generation: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interest {
    Read,
    Write,
    Both,
}

impl Interest {
    fn to_mio(self) -> mio::Interest {
        match self {
            Interest::Read => mio::Interest::READABLE,
            Interest::Write => mio::Interest::WRITABLE,
            Interest::Both => mio::Interest::READABLE | mio::Interest::WRITABLE,
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

/// A registered descriptor's behavior. All callbacks run on the reactor
/// thread; readiness is edge-style, so `ready` must drain until `Wait`.
pub trait EventHandler {
    /// The descriptor to (de)register with the poll.
    fn source(&mut self) -> &mut dyn Source;

    /// Interest requested at registration time.
    fn interest(&self) -> Interest {
        Interest::Both
    }

    /// Receives the handle assigned at registration.
    fn attach(&mut self, handle: ConnHandle) {
        let _ = handle;
    }

    fn ready(&mut self, readiness: Readiness, ops: &mut Ops) -> NetworkResult<()>;

    /// Bytes or completions routed to this handler from the completion
    /// queue or another handler.
    fn deliver(&mut self, delivery: Delivery, ops: &mut Ops) -> NetworkResult<()> {
        let _ = (delivery, ops);
        Ok(())
    }

    /// Housekeeping pass, driven by the poll timeout tick.
    fn tick(&mut self, now: Instant, ops: &mut Ops) -> NetworkResult<()> {
        let _ = (now, ops);
        Ok(())
    }

    /// During shutdown, false keeps the handler alive until its pending
    /// work drains or the drain deadline passes.
    fn drained(&self) -> bool {
        true
    }

    /// Last call before the reactor abandons the handler at the deadline.
    fn abandon(&mut self) {}
}

enum Op {
    Spawn(Box<dyn EventHandler>),
    Modify(usize, Interest),
    Close(usize),
    CloseHandle(ConnHandle),
    Send(ConnHandle, Vec<u8>),
    Stop,
}

/// Deferred reactor operations collected during a callback and applied once
/// the callback returns, so handlers never alias the slot table.
pub struct Ops {
    token: usize,
    queue: VecDeque<Op>,
}

impl Ops {
    /// Standalone op sink, for driving handlers outside a running reactor.
    /// Collected ops are dropped unless handed to a reactor pass.
    pub fn new() -> Ops {
        Ops {
            token: 0,
            queue: VecDeque::new(),
        }
    }

    /// Token of the handler currently being called.
    #[inline]
    pub fn token(&self) -> usize {
        self.token
    }

    pub fn spawn(&mut self, handler: Box<dyn EventHandler>) {
        self.queue.push_back(Op::Spawn(handler));
    }

    pub fn modify_self(&mut self, interest: Interest) {
        self.queue.push_back(Op::Modify(self.token, interest));
    }

    pub fn close_self(&mut self) {
        self.queue.push_back(Op::Close(self.token));
    }

    pub fn close(&mut self, handle: ConnHandle) {
        self.queue.push_back(Op::CloseHandle(handle));
    }

    /// Appends bytes to another handler's write path (validated against the
    /// handle generation when applied).
    pub fn send(&mut self, handle: ConnHandle, bytes: Vec<u8>) {
        self.queue.push_back(Op::Send(handle, bytes));
    }

    pub fn stop(&mut self) {
        self.queue.push_back(Op::Stop);
    }
}

/// Requests reactor shutdown; safe from any thread.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.flag.store(true, Ordering::Relaxed);
        let _ = self.waker.wake();
    }
}

/// Cross-thread entry into the reactor: enqueue a delivery and wake the
/// poll. Cloned into worker threads.
#[derive(Clone)]
pub struct Wakeup {
    queue: Sender<(ConnHandle, Delivery)>,
    waker: Arc<Waker>,
}

impl Wakeup {
    pub fn deliver(&self, handle: ConnHandle, delivery: Delivery) -> NetworkResult<()> {
        self.queue
            .send((handle, delivery))
            .map_err(|_| NetworkError::Fatal(ErrorType::PoolClosed))?;
        self.waker.wake().map_err(Into::into)
    }
}

#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Upper bound on one poll call; also bounds stop latency and drives
    /// the housekeeping tick.
    pub poll_timeout: Duration,
    pub housekeeping_interval: Duration,
    /// How long ProcessingAsync connections may hold up shutdown.
    pub drain_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ReactorConfig {
    fn default() -> ReactorConfig {
        ReactorConfig {
            poll_timeout: Duration::from_millis(500),
            housekeeping_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            event_capacity: 1024,
        }
    }
}

struct Slot {
    handler: Option<Box<dyn EventHandler>>,
    generation: u64,
    open: bool,
}

/// Single-threaded readiness reactor: a poll set, a slot table of handlers
/// and a waker-drained completion queue.
pub struct Reactor {
    poll: Poll,
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    waker: Arc<Waker>,
    completions_tx: Sender<(ConnHandle, Delivery)>,
    completions_rx: Receiver<(ConnHandle, Delivery)>,
    stop: Arc<AtomicBool>,
    config: ReactorConfig,
    log: logging::Logger,
}

impl Reactor {
    pub fn new(config: ReactorConfig, log: logging::Logger) -> NetworkResult<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (completions_tx, completions_rx) = unbounded();

        Ok(Reactor {
            poll,
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            waker,
            completions_tx,
            completions_rx,
            stop: Arc::new(AtomicBool::new(false)),
            config,
            log,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn wakeup(&self) -> Wakeup {
        Wakeup {
            queue: self.completions_tx.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Registers a handler for the given interest and returns its handle.
    pub fn register(
        &mut self,
        mut handler: Box<dyn EventHandler>,
        interest: Interest,
    ) -> NetworkResult<ConnHandle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    handler: None,
                    generation: 0,
                    open: false,
                });
                self.slots.len() - 1
            }
        };

        self.slots[index].generation += 1;

        let handle = ConnHandle {
            token: index,
            generation: self.slots[index].generation,
        };

        if let Err(err) = self
            .poll
            .registry()
            .register(handler.source(), Token(index), interest.to_mio())
        {
            self.free.push(index);
            return Err(err.into());
        }

        handler.attach(handle);

        let slot = &mut self.slots[index];
        slot.handler = Some(handler);
        slot.open = true;
        self.live += 1;

        logging::trace!(self.log, "handler registered";
                        "context" => "register",
                        "token" => index,
                        "generation" => handle.generation);

        Ok(handle)
    }

    /// Replaces the readiness interest of a registered handler.
    pub fn modify(&mut self, token: usize, interest: Interest) -> NetworkResult<()> {
        let slot = match self.slots.get_mut(token) {
            Some(slot) if slot.open => slot,
            _ => return Err(NetworkError::Fatal(ErrorType::PeerClosed)),
        };

        let handler = slot.handler.as_mut().expect("open slot without handler");

        self.poll
            .registry()
            .reregister(handler.source(), Token(token), interest.to_mio())
            .map_err(Into::into)
    }

    /// Removes a handler; no further callbacks fire for its token.
    pub fn unregister(&mut self, token: usize) {
        self.close_slot(token);
    }

    #[inline]
    pub fn registered(&self) -> usize {
        self.live
    }

    /// Pumps events until `stop()` is observed and every handler has been
    /// drained or abandoned.
    pub fn run(&mut self) -> NetworkResult<()> {
        let mut events = Events::with_capacity(self.config.event_capacity);
        let mut ready = Vec::with_capacity(self.config.event_capacity);
        let mut ops = Ops::new();
        let mut last_tick = Instant::now();
        let mut drain_deadline: Option<Instant> = None;

        logging::info!(self.log, "reactor running";
                       "context" => "run",
                       "poll_timeout_ms" => self.config.poll_timeout.as_millis() as u64);

        loop {
            if let Err(err) = self.poll.poll(&mut events, Some(self.config.poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                logging::error!(self.log, "poll failed"; "context" => "run", "error" => %err);
                return Err(err.into());
            }

            ready.clear();

            let mut wake = false;

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    wake = true;
                    continue;
                }

                ready.push((
                    event.token().0,
                    Readiness {
                        readable: event.is_readable() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                    },
                ));
            }

            if wake {
                self.drain_completions(&mut ops);
                self.apply(&mut ops);
            }

            for (token, readiness) in ready.drain(..) {
                self.dispatch_ready(token, readiness, &mut ops);
                self.apply(&mut ops);
            }

            if self.stop.load(Ordering::Relaxed) {
                if drain_deadline.is_none() {
                    drain_deadline = Some(Instant::now() + self.config.drain_timeout);
                    logging::info!(self.log, "reactor stopping";
                                   "context" => "run",
                                   "registered" => self.live);
                }

                self.shutdown_pass(&mut ops);
                self.apply(&mut ops);

                if self.live == 0 {
                    logging::info!(self.log, "reactor stopped"; "context" => "run");
                    return Ok(());
                }

                if Instant::now() >= drain_deadline.expect("deadline set above") {
                    logging::warn!(self.log, "drain deadline passed, abandoning";
                                   "context" => "run",
                                   "registered" => self.live);
                    self.abandon_all();
                    return Ok(());
                }
            }

            let now = Instant::now();

            if now.duration_since(last_tick) >= self.config.housekeeping_interval {
                last_tick = now;
                self.tick_all(now, &mut ops);
                self.apply(&mut ops);
            }
        }
    }

    fn dispatch_ready(&mut self, index: usize, readiness: Readiness, ops: &mut Ops) {
        let mut handler = {
            let slot = match self.slots.get_mut(index) {
                Some(slot) if slot.open => slot,
                _ => return,
            };

            match slot.handler.take() {
                Some(handler) => handler,
                None => return,
            }
        };

        ops.token = index;
        let result = handler.ready(readiness, ops);

        if let Some(slot) = self.slots.get_mut(index) {
            if slot.open {
                slot.handler = Some(handler);
            }
        }

        if result.has_failed() {
            logging::debug!(self.log, "handler error, closing slot";
                            "context" => "dispatch",
                            "token" => index,
                            "error" => ?result.err());
            self.close_slot(index);
        }
    }

    fn drain_completions(&mut self, ops: &mut Ops) {
        while let Ok((handle, delivery)) = self.completions_rx.try_recv() {
            self.deliver_to(handle, delivery, ops);
        }
    }

    fn deliver_to(&mut self, handle: ConnHandle, delivery: Delivery, ops: &mut Ops) {
        let index = handle.token;
        let valid = self
            .slots
            .get(index)
            .map_or(false, |slot| slot.open && slot.generation == handle.generation);

        if !valid {
            logging::trace!(self.log, "stale delivery dropped";
                            "context" => "deliver",
                            "token" => index);
            return;
        }

        let mut handler = match self.slots[index].handler.take() {
            Some(handler) => handler,
            None => return,
        };

        ops.token = index;
        let result = handler.deliver(delivery, ops);

        if let Some(slot) = self.slots.get_mut(index) {
            if slot.open {
                slot.handler = Some(handler);
            }
        }

        if result.has_failed() {
            self.close_slot(index);
        }
    }

    fn tick_all(&mut self, now: Instant, ops: &mut Ops) {
        for index in 0..self.slots.len() {
            if !self.slots[index].open {
                continue;
            }

            let mut handler = match self.slots[index].handler.take() {
                Some(handler) => handler,
                None => continue,
            };

            ops.token = index;
            let result = handler.tick(now, ops);

            if let Some(slot) = self.slots.get_mut(index) {
                if slot.open {
                    slot.handler = Some(handler);
                }
            }

            if result.has_failed() {
                self.close_slot(index);
            }
        }
    }

    fn shutdown_pass(&mut self, ops: &mut Ops) {
        let _ = ops;

        for index in 0..self.slots.len() {
            let done = {
                let slot = &self.slots[index];

                slot.open
                    && slot
                        .handler
                        .as_ref()
                        .map_or(true, |handler| handler.drained())
            };

            if done {
                self.close_slot(index);
            }
        }
    }

    fn abandon_all(&mut self) {
        for index in 0..self.slots.len() {
            if !self.slots[index].open {
                continue;
            }

            if let Some(handler) = self.slots[index].handler.as_mut() {
                handler.abandon();
            }

            self.close_slot(index);
        }
    }

    fn apply(&mut self, ops: &mut Ops) {
        while let Some(op) = ops.queue.pop_front() {
            match op {
                Op::Spawn(handler) => {
                    let interest = handler.interest();

                    if let Err(err) = self.register(handler, interest) {
                        logging::warn!(self.log, "spawn failed";
                                       "context" => "apply",
                                       "error" => ?err);
                    }
                }
                Op::Modify(token, interest) => {
                    let _ = self.modify(token, interest);
                }
                Op::Close(token) => self.close_slot(token),
                Op::CloseHandle(handle) => {
                    let valid = self.slots.get(handle.token).map_or(false, |slot| {
                        slot.open && slot.generation == handle.generation
                    });

                    if valid {
                        self.close_slot(handle.token);
                    }
                }
                Op::Send(handle, bytes) => {
                    self.deliver_to(handle, Delivery::Bytes(bytes), ops);
                }
                Op::Stop => self.stop.store(true, Ordering::Relaxed),
            }
        }
    }

    fn close_slot(&mut self, index: usize) {
        let open = self.slots.get(index).map_or(false, |slot| slot.open);

        if !open {
            return;
        }

        let mut handler = self.slots[index].handler.take();

        if let Some(handler) = handler.as_mut() {
            let _ = self.poll.registry().deregister(handler.source());
        }

        drop(handler);

        let slot = &mut self.slots[index];
        slot.open = false;
        slot.generation += 1;
        self.live -= 1;
        self.free.push(index);

        logging::trace!(self.log, "slot closed"; "context" => "close", "token" => index);
    }
}
