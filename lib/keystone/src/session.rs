use grout::{encoding, logging};
use indexmap::IndexMap;
use mortar::ConnHandle;
use rand::Rng;
use std::collections::VecDeque;

/// One retained notification, addressable by its monotonically increasing
/// id for `Last-Event-ID` replay.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: u64,
    pub payload: String,
    stamped_millis: u64,
}

/// Bounded, time-windowed ring of notifications. Entries are evicted FIFO
/// when older than the window or beyond the entry cap, whichever bites
/// first.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<EventRecord>,
    next_id: u64,
    window_millis: u64,
    max_entries: usize,
}

impl EventLog {
    pub fn new(window_millis: u64, max_entries: usize) -> EventLog {
        EventLog {
            entries: VecDeque::new(),
            next_id: 1,
            window_millis,
            max_entries,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a payload and returns its id.
    pub fn append(&mut self, payload: String, now_millis: u64) -> u64 {
        let id = self.next_id;

        self.next_id += 1;
        self.entries.push_back(EventRecord {
            id,
            payload,
            stamped_millis: now_millis,
        });
        self.evict(now_millis);

        id
    }

    /// Retained events with id greater than `last_id`, oldest first.
    pub fn replay_after(&mut self, last_id: u64, now_millis: u64) -> Vec<EventRecord> {
        self.evict(now_millis);

        self.entries
            .iter()
            .filter(|record| record.id > last_id)
            .cloned()
            .collect()
    }

    fn evict(&mut self, now_millis: u64) {
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }

        while let Some(front) = self.entries.front() {
            if front.stamped_millis + self.window_millis > now_millis {
                break;
            }

            self.entries.pop_front();
        }
    }
}

/// Server-side session record keyed by the `Mcp-Session-Id` header.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: u64,
    pub last_seen: u64,
    pub log: EventLog,
    /// Connection currently holding the session's SSE channel.
    pub subscriber: Option<ConnHandle>,
}

/// In-memory session registry. Touched only from the reactor thread, so no
/// locking is involved anywhere in here.
pub struct SessionTable {
    sessions: IndexMap<String, Session>,
    timeout_secs: u64,
    max_sessions: usize,
    window_millis: u64,
    max_events: usize,
    log: logging::Logger,
}

impl SessionTable {
    pub fn new(
        timeout_secs: u64,
        max_sessions: usize,
        window_millis: u64,
        max_events: usize,
        log: logging::Logger,
    ) -> SessionTable {
        SessionTable {
            sessions: IndexMap::new(),
            timeout_secs,
            max_sessions,
            window_millis,
            max_events,
            log,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Creates a session with a fresh random id; `None` when the table is
    /// at capacity.
    pub fn create(&mut self, now_secs: u64) -> Option<&mut Session> {
        if self.sessions.len() >= self.max_sessions {
            logging::warn!(self.log, "session table full";
                           "context" => "create",
                           "sessions" => self.sessions.len());

            return None;
        }

        let mut raw = [0u8; 16];

        rand::thread_rng().fill(&mut raw);

        let id = encoding::hex(&raw);

        logging::info!(self.log, "session created"; "context" => "create", "session" => id.as_str());

        let session = Session {
            id: id.clone(),
            created_at: now_secs,
            last_seen: now_secs,
            log: EventLog::new(self.window_millis, self.max_events),
            subscriber: None,
        };

        Some(self.sessions.entry(id).or_insert(session))
    }

    /// Looks a session up and refreshes its idle clock.
    pub fn get(&mut self, id: &str, now_secs: u64) -> Option<&mut Session> {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_seen = now_secs;
                Some(session)
            }
            None => None,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let removed = self.sessions.shift_remove(id);

        if removed.is_some() {
            logging::info!(self.log, "session removed"; "context" => "remove", "session" => id);
        }

        removed
    }

    /// Drops sessions idle past the timeout; returns the SSE subscribers
    /// they held so the caller can close those connections.
    pub fn sweep(&mut self, now_secs: u64) -> Vec<ConnHandle> {
        let timeout = self.timeout_secs;
        let log = &self.log;
        let mut dropped = Vec::new();

        self.sessions.retain(|id, session| {
            let keep = now_secs.saturating_sub(session.last_seen) < timeout;

            if !keep {
                logging::info!(log, "session expired";
                               "context" => "sweep",
                               "session" => id.as_str());

                if let Some(handle) = session.subscriber {
                    dropped.push(handle);
                }
            }

            keep
        });

        dropped
    }
}
