use futures::stream::{Stream, StreamExt};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;

/// Payload of the final frame on every completed stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Serializes `event` into an SSE data block.
pub fn encode_event<T: Serialize>(event: &T) -> String {
    match serde_json::to_string(event) {
        Ok(json) => format!("data: {}\n\n", json),
        Err(err) => {
            warn!("Failed to serialize SSE event: {}", err);
            String::new()
        }
    }
}

/// The end-of-stream block.
pub fn encode_done() -> String {
    format!("data: {}\n\n", DONE_SENTINEL)
}

/// Incremental SSE parser.
///
/// Feed raw chunks in whatever boundaries the transport produced; complete
/// `\n\n`-terminated blocks come back as frames. Comment lines (leading `:`)
/// and blank lines are skipped per the SSE grammar.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser {
            buffer: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            for line in block.lines() {
                let line = line.trim_end_matches('\r');
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let Some(payload) = line.strip_prefix("data:") else {
                    debug!("Skipping non-data SSE line: {}", line);
                    continue;
                };
                let payload = payload.strip_prefix(' ').unwrap_or(payload);
                if payload == DONE_SENTINEL {
                    frames.push(SseFrame::Done);
                } else {
                    frames.push(SseFrame::Data(payload.to_string()));
                }
            }
        }

        frames
    }
}

/// Decodes data frames into `T`, tolerating malformed JSON (log + drop).
pub fn decode_frames<T: DeserializeOwned>(frames: &[SseFrame]) -> Vec<T> {
    let mut out = Vec::new();
    for frame in frames {
        if let SseFrame::Data(payload) = frame {
            match serde_json::from_str::<T>(payload) {
                Ok(value) => out.push(value),
                Err(err) => warn!("Dropping malformed SSE payload ({}): {}", err, payload),
            }
        }
    }
    out
}

/// Adapts a finite event stream into a warp SSE reply, appending the
/// `[DONE]` sentinel after the last event.
pub fn reply_with<S, T>(events: S) -> impl warp::Reply
where
    S: Stream<Item = T> + Send + Sync + 'static,
    T: Serialize + Send + 'static,
{
    let data = events
        .map(|event| {
            let json = serde_json::to_string(&event).unwrap_or_else(|err| {
                warn!("Failed to serialize SSE event: {}", err);
                "null".to_string()
            });
            Ok::<_, Infallible>(warp::sse::Event::default().data(json))
        })
        .chain(futures::stream::once(async {
            Ok(warp::sse::Event::default().data(DONE_SENTINEL))
        }));
    warp::sse::reply(data)
}

/// Reads a streaming HTTP response to completion, parsing SSE frames.
///
/// Cancellable: dropping a message into `abort` stops reading and releases
/// the response body on the way out. Frames parsed so far are returned.
pub async fn read_response_frames(
    mut response: reqwest::Response,
    mut abort: tokio::sync::oneshot::Receiver<()>,
) -> Result<Vec<SseFrame>, reqwest::Error> {
    let mut parser = SseParser::new();
    let mut frames = Vec::new();

    loop {
        tokio::select! {
            chunk = response.chunk() => {
                match chunk? {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(&bytes);
                        frames.extend(parser.push(&text));
                        if frames.iter().any(|f| *f == SseFrame::Done) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = &mut abort => {
                debug!("SSE read aborted by caller");
                break;
            }
        }
    }

    Ok(frames)
}
