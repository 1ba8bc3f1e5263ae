use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use confab_core::{BotId, MessageId, ProcessId, ProcessName, ThreadUri, UserId};
use confab_process::ProcessResult;

/// Lightweight metadata about a thread. Does NOT contain messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub uri: ThreadUri,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: u32,
}

impl ThreadInfo {
    pub fn new(uri: ThreadUri) -> Self {
        let now = Utc::now();
        Self {
            uri,
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }

    /// Bump `updated_at` and the message count.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.message_count += 1;
    }
}

/// One piece of a bot reply: prose or a tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BotMessagePart {
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        think: Option<String>,
        text: String,
    },
    Tool {
        process_id: ProcessId,
        name: ProcessName,
        arguments: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<ProcessResult>,
    },
}

/// A message in a thread, tagged by sender role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ThreadMessage {
    User {
        timestamp: DateTime<Utc>,
        message_id: MessageId,
        sender: UserId,
        content: String,
    },
    Bot {
        timestamp: DateTime<Utc>,
        message_id: MessageId,
        sender: BotId,
        content: Vec<BotMessagePart>,
    },
}

impl ThreadMessage {
    pub fn user(sender: UserId, content: impl Into<String>) -> Self {
        ThreadMessage::User {
            timestamp: Utc::now(),
            message_id: MessageId::generate(),
            sender,
            content: content.into(),
        }
    }

    pub fn bot(sender: BotId, content: Vec<BotMessagePart>) -> Self {
        ThreadMessage::Bot {
            timestamp: Utc::now(),
            message_id: MessageId::generate(),
            sender,
            content,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ThreadMessage::User { timestamp, .. } | ThreadMessage::Bot { timestamp, .. } => {
                *timestamp
            }
        }
    }

    pub fn message_id(&self) -> &MessageId {
        match self {
            ThreadMessage::User { message_id, .. } | ThreadMessage::Bot { message_id, .. } => {
                message_id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_tag_by_role() {
        let message = ThreadMessage::user(UserId::generate(), "hello");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");

        let parsed: ThreadMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn touch_increments_and_bumps() {
        let uri: ThreadUri = "nkt://internal/default-unit-test/thread-9e7xc0000123456789abcdef"
            .parse()
            .unwrap();
        let mut info = ThreadInfo::new(uri);
        let before = info.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        info.touch();
        assert_eq!(info.message_count, 1);
        assert!(info.updated_at > before);
    }
}
