//! The bounded chat ring.
//!
//! The log keeps the most recent [`CHAT_CAPACITY`] messages. Command
//! detection lives here (a body starting with `/` is a command); command
//! *dispatch* belongs to the session layer, which knows about roles.

use atrium_protocol::messages::ChatMessageWire;
use atrium_protocol::EntityId;

/// Maximum number of retained messages.
pub const CHAT_CAPACITY: usize = 50;

/// Bounded ring of chat messages.
#[derive(Debug, Default)]
pub struct ChatLog {
    messages: Vec<ChatMessageWire>,
    next_id: u64,
}

impl ChatLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, evicting the oldest beyond capacity. Returns the
    /// stored message (with its assigned id).
    pub fn add(
        &mut self,
        from_entity: Option<EntityId>,
        author: Option<String>,
        body: String,
        timestamp: f64,
    ) -> ChatMessageWire {
        self.next_id += 1;
        let message = ChatMessageWire {
            id: self.next_id,
            from_entity,
            author,
            body,
            timestamp,
        };
        self.messages.push(message.clone());
        if self.messages.len() > CHAT_CAPACITY {
            let excess = self.messages.len() - CHAT_CAPACITY;
            self.messages.drain(..excess);
        }
        message
    }

    /// Insert an already-shaped message (snapshot replay path). Keeps the
    /// id counter ahead of everything seen.
    pub fn add_existing(&mut self, message: ChatMessageWire) {
        self.next_id = self.next_id.max(message.id);
        self.messages.push(message);
        if self.messages.len() > CHAT_CAPACITY {
            let excess = self.messages.len() - CHAT_CAPACITY;
            self.messages.drain(..excess);
        }
    }

    /// The retained messages, oldest first.
    pub fn messages(&self) -> &[ChatMessageWire] {
        &self.messages
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Whether `body` is a command rather than visible chat.
    pub fn is_command(body: &str) -> bool {
        body.starts_with('/')
    }

    /// Split a command body into (name, rest). `None` for non-commands.
    pub fn parse_command(body: &str) -> Option<(&str, &str)> {
        let stripped = body.strip_prefix('/')?;
        let mut parts = stripped.splitn(2, ' ');
        let name = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or_default().trim();
        Some((name, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_never_exceeds_capacity() {
        let mut log = ChatLog::new();
        for i in 0..(CHAT_CAPACITY + 25) {
            log.add(None, None, format!("msg {i}"), i as f64);
        }
        assert_eq!(log.len(), CHAT_CAPACITY);
        // The oldest survivors are the most recent CHAT_CAPACITY messages.
        assert_eq!(log.messages()[0].body, "msg 25");
        assert_eq!(
            log.messages().last().unwrap().body,
            format!("msg {}", CHAT_CAPACITY + 24)
        );
    }

    #[test]
    fn ids_are_monotone() {
        let mut log = ChatLog::new();
        let a = log.add(None, None, "a".to_owned(), 0.0);
        let b = log.add(None, None, "b".to_owned(), 0.0);
        assert!(b.id > a.id);
    }

    #[test]
    fn add_existing_keeps_counter_ahead() {
        let mut log = ChatLog::new();
        log.add_existing(ChatMessageWire {
            id: 40,
            from_entity: None,
            author: None,
            body: "replayed".to_owned(),
            timestamp: 0.0,
        });
        let next = log.add(None, None, "fresh".to_owned(), 1.0);
        assert!(next.id > 40);
    }

    #[test]
    fn command_parsing() {
        assert!(ChatLog::is_command("/name ada"));
        assert!(!ChatLog::is_command("hello /world"));

        assert_eq!(ChatLog::parse_command("/name ada"), Some(("name", "ada")));
        assert_eq!(
            ChatLog::parse_command("/spawn set"),
            Some(("spawn", "set"))
        );
        assert_eq!(ChatLog::parse_command("/admin"), Some(("admin", "")));
        assert_eq!(ChatLog::parse_command("plain text"), None);
    }
}
