/// One server-sent event. Serialized as `id:`/`event:`/`retry:` fields,
/// one `data:` line per line of payload, and a terminating blank line.
#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub id: Option<u64>,
    pub event: Option<String>,
    pub retry: Option<u64>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: &str) -> SseEvent {
        SseEvent {
            data: data.to_string(),
            ..SseEvent::default()
        }
    }

    pub fn with_id(mut self, id: u64) -> SseEvent {
        self.id = Some(id);
        self
    }

    pub fn with_event(mut self, name: &str) -> SseEvent {
        self.event = Some(name.to_string());
        self
    }

    pub fn with_retry(mut self, millis: u64) -> SseEvent {
        self.retry = Some(millis);
        self
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + 32);

        if let Some(id) = self.id {
            out.extend_from_slice(format!("id: {}\n", id).as_bytes());
        }

        if let Some(event) = &self.event {
            out.extend_from_slice(format!("event: {}\n", event).as_bytes());
        }

        if let Some(retry) = self.retry {
            out.extend_from_slice(format!("retry: {}\n", retry).as_bytes());
        }

        for line in self.data.split('\n') {
            out.extend_from_slice(b"data: ");
            out.extend_from_slice(line.as_bytes());
            out.push(b'\n');
        }

        out.push(b'\n');
        out
    }
}
