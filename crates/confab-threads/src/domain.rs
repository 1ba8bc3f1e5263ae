//! Thread domain logic: merged listings with cursors, bot message saves.

use tracing::warn;

use confab_core::{BotId, ThreadCursor, ThreadUri};

use crate::service::ThreadService;
use crate::types::{BotMessagePart, ThreadMessage};
use crate::ThreadError;

/// Where to start reading a thread: from the beginning, or after a cursor.
#[derive(Debug, Clone)]
pub enum ThreadSource {
    Uri(ThreadUri),
    Cursor(ThreadCursor),
}

impl ThreadSource {
    fn thread_uri(&self) -> ThreadUri {
        match self {
            ThreadSource::Uri(uri) => uri.clone(),
            ThreadSource::Cursor(cursor) => cursor.thread_uri(),
        }
    }
}

/// List new messages across several sources.
///
/// Returns the advanced cursors (sorted lexicographically) and the messages
/// merged into a stable `(timestamp, message_id)` order.
pub async fn list_messages(
    threads: &ThreadService,
    sources: &[ThreadSource],
) -> Result<(Vec<ThreadCursor>, Vec<ThreadMessage>), ThreadError> {
    let mut new_cursors: Vec<ThreadCursor> = Vec::new();
    let mut new_messages: Vec<ThreadMessage> = Vec::new();

    for source in sources {
        let messages = list_messages_once(threads, source).await?;

        if let Some(last) = messages.last() {
            let cursor = source.thread_uri().cursor(last.message_id().clone());
            let key = cursor.to_string();
            let index = new_cursors
                .binary_search_by(|existing| existing.to_string().cmp(&key))
                .unwrap_or_else(|index| index);
            new_cursors.insert(index, cursor);
        }

        for message in messages {
            let key = (message.timestamp(), message.message_id().clone());
            let index = new_messages
                .binary_search_by(|existing| {
                    (existing.timestamp(), existing.message_id().clone()).cmp(&key)
                })
                .unwrap_or_else(|index| index);
            new_messages.insert(index, message);
        }
    }

    Ok((new_cursors, new_messages))
}

async fn list_messages_once(
    threads: &ThreadService,
    source: &ThreadSource,
) -> Result<Vec<ThreadMessage>, ThreadError> {
    let messages = threads.load_messages(&source.thread_uri(), false).await?;
    let ThreadSource::Cursor(cursor) = source else {
        return Ok(messages);
    };
    if messages.is_empty() {
        return Ok(messages);
    }

    // Skip messages until the cursor is found; the matching message itself is
    // also discarded.
    if let Some(position) = messages
        .iter()
        .position(|message| *message.message_id() == cursor.last_message_id)
    {
        return Ok(messages[position + 1..].to_vec());
    }

    // Cursor not in the log (the history expired): fall back to every message
    // with a strictly greater id, since ids are time-ordered.
    warn!(cursor = %cursor, "cursor not found in thread");
    Ok(messages
        .into_iter()
        .filter(|message| *message.message_id() > cursor.last_message_id)
        .collect())
}

/// Append a bot reply to a thread.
pub async fn save_bot_message(
    threads: &ThreadService,
    thread_uri: &ThreadUri,
    sender: BotId,
    content: Vec<BotMessagePart>,
) -> Result<(), ThreadError> {
    threads
        .push_message(thread_uri, ThreadMessage::bot(sender, content))
        .await
}
