//! Server-sent-events framing for the agent's chat and service-output
//! streams.
//!
//! The client exposes streams as lazy finite sequences of raw `data:`
//! payloads; a `data: [DONE]` line yields the `Done` sentinel and closes
//! the sequence. Blank lines and `:` comments are ignored. Wire order is
//! preserved.

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One item of an SSE sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseEvent {
    /// Raw payload of a `data:` line, unparsed JSON.
    Data(String),
    /// The `data: [DONE]` terminator.
    Done,
}

pub const DONE_SENTINEL: &str = "[DONE]";

/// Incremental SSE line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning the events it completed. The returned
    /// vector stops at the first `Done`; callers drop the parser there.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            // Only data fields matter; blanks, comments, and other SSE
            // fields (event:, id:, retry:) are skipped.
            let Some(rest) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = rest.strip_prefix(' ').unwrap_or(rest);
            if payload == DONE_SENTINEL {
                events.push(SseEvent::Done);
                return events;
            }
            events.push(SseEvent::Data(payload.to_string()));
        }
        events
    }
}

/// Pump a streaming response into a bounded channel of SSE events.
///
/// The receiver closes after `Done`, on EOF, on a mid-stream transport
/// error, or promptly when `cancel` fires.
pub fn spawn_sse_pump(
    response: reqwest::Response,
    cancel: CancellationToken,
) -> mpsc::Receiver<SseEvent> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk: Option<reqwest::Result<Bytes>> = tokio::select! {
                _ = cancel.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                return; // EOF closes the sequence
            };
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("sse stream aborted: {err}");
                    return;
                }
            };
            for event in parser.feed(&bytes) {
                let done = event == SseEvent::Done;
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
                if done {
                    return;
                }
            }
        }
    });
    rx
}

/// An already-closed, empty sequence, which is what a 204 from `GET /chat`
/// maps to.
pub fn empty_stream() -> mpsc::Receiver<SseEvent> {
    mpsc::channel(1).1
}

/// Drain a stream to completion, discarding data. Returns once the
/// sequence closes or `cancel` fires.
pub async fn drain(mut rx: mpsc::Receiver<SseEvent>, cancel: &CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(SseEvent::Done) | None => return,
                Some(SseEvent::Data(_)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_lines_in_order() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
        assert_eq!(
            events,
            vec![
                SseEvent::Data("{\"a\":1}".into()),
                SseEvent::Data("{\"b\":2}".into()),
            ]
        );
    }

    #[test]
    fn done_only_stream_yields_single_sentinel() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\n");
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keepalive\n\nretry: 500\ndata: x\n");
        assert_eq!(events, vec![SseEvent::Data("x".into())]);
    }

    #[test]
    fn handles_split_lines_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: par").is_empty());
        let events = parser.feed(b"tial\n");
        assert_eq!(events, vec![SseEvent::Data("partial".into())]);
    }

    #[test]
    fn handles_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: a\r\ndata: [DONE]\r\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("a".into()), SseEvent::Done]
        );
    }

    #[test]
    fn stops_at_done_even_with_trailing_data() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: [DONE]\ndata: late\n");
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[tokio::test]
    async fn empty_stream_is_closed() {
        let mut rx = empty_stream();
        assert!(rx.recv().await.is_none());
    }
}
