//! Minimal SSE line reader over a reqwest byte stream.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::LlmError;

pub(crate) struct SseLines {
    stream: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    buffer: String,
}

impl SseLines {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: response.bytes_stream().boxed(),
            buffer: String::new(),
        }
    }

    /// Next line, without the trailing newline. `None` at end of stream.
    pub async fn next_line(&mut self) -> Result<Option<String>, LlmError> {
        loop {
            if let Some(index) = self.buffer.find('\n') {
                let line = self.buffer[..index].trim_end_matches('\r').to_string();
                self.buffer.drain(..=index);
                return Ok(Some(line));
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Some(Err(err)) => return Err(LlmError::from(err)),
                None => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let line = std::mem::take(&mut self.buffer);
                    return Ok(Some(line.trim_end_matches('\r').to_string()));
                }
            }
        }
    }

    /// Next `data:` payload, tracking the preceding `event:` name when one
    /// is present. `None` at end of stream.
    pub async fn next_data(&mut self) -> Result<Option<(String, String)>, LlmError> {
        let mut event = String::new();
        while let Some(line) = self.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix("event:") {
                event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                return Ok(Some((event.clone(), data.trim().to_string())));
            }
        }
        Ok(None)
    }
}
