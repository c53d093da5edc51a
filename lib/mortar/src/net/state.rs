use std::fmt;

/// One lifecycle flag of a connection. Several orthogonal flags may be held
/// at once (e.g. `READING | PROCESSING` while a pipelined request is parsed
/// behind one still being handled).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ConnState(u16);

impl ConnState {
    pub const IDLE: ConnState = ConnState(1);
    pub const READABLE: ConnState = ConnState(1 << 1);
    pub const READING: ConnState = ConnState(1 << 2);
    pub const PROCESSING: ConnState = ConnState(1 << 3);
    pub const PROCESSING_ASYNC: ConnState = ConnState(1 << 4);
    pub const RESPONDING: ConnState = ConnState(1 << 5);
    pub const SENDING_HEADERS: ConnState = ConnState(1 << 6);
    pub const SENDING_BODY: ConnState = ConnState(1 << 7);
    pub const CLOSING: ConnState = ConnState(1 << 8);
    pub const CLOSED: ConnState = ConnState(1 << 9);

    fn name(self) -> &'static str {
        match self {
            ConnState::IDLE => "Idle",
            ConnState::READABLE => "Readable",
            ConnState::READING => "Reading",
            ConnState::PROCESSING => "Processing",
            ConnState::PROCESSING_ASYNC => "ProcessingAsync",
            ConnState::RESPONDING => "Responding",
            ConnState::SENDING_HEADERS => "SendingHeaders",
            ConnState::SENDING_BODY => "SendingBody",
            ConnState::CLOSING => "Closing",
            ConnState::CLOSED => "Closed",
            _ => "?",
        }
    }

    const ALL: [ConnState; 10] = [
        ConnState::IDLE,
        ConnState::READABLE,
        ConnState::READING,
        ConnState::PROCESSING,
        ConnState::PROCESSING_ASYNC,
        ConnState::RESPONDING,
        ConnState::SENDING_HEADERS,
        ConnState::SENDING_BODY,
        ConnState::CLOSING,
        ConnState::CLOSED,
    ];
}

impl fmt::Debug for ConnState {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Set of `ConnState` flags held by a connection.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct StateSet(u16);

impl StateSet {
    #[inline]
    pub fn new() -> StateSet {
        StateSet(0)
    }

    #[inline]
    pub fn insert(&mut self, state: ConnState) {
        self.0 |= state.0;
    }

    #[inline]
    pub fn remove(&mut self, state: ConnState) {
        self.0 &= !state.0;
    }

    #[inline]
    pub fn contains(self, state: ConnState) -> bool {
        self.0 & state.0 != 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Replaces `from` with `to` in one step.
    #[inline]
    pub fn shift(&mut self, from: ConnState, to: ConnState) {
        self.remove(from);
        self.insert(to);
    }
}

impl fmt::Debug for StateSet {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        let mut list = formatter.debug_list();

        for state in ConnState::ALL.iter() {
            if self.contains(*state) {
                list.entry(state);
            }
        }

        list.finish()
    }
}
