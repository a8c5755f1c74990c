use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::OllamaStreamChunk;
use crate::providers::types::StreamEvent;

/// Translate one NDJSON line into stream events. A line usually carries a
/// content fragment or the `done` marker; an `error` field ends the stream.
/// Thinking fragments are dropped here, only assistant content flows on.
pub(crate) fn line_events(line: &str) -> Vec<StreamEvent> {
    let chunk = match serde_json::from_str::<OllamaStreamChunk>(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!("Failed to parse chat stream line: {}", e);
            return Vec::new();
        }
    };

    if let Some(error) = chunk.error {
        return vec![StreamEvent::Error(error)];
    }

    let mut events = Vec::new();
    if let Some(content) = chunk.message.and_then(|m| m.content) {
        if !content.is_empty() {
            events.push(StreamEvent::Token(content));
        }
    }
    if chunk.done {
        events.push(StreamEvent::Done);
    }
    events
}

pub async fn parse_ndjson_stream(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = response.bytes_stream();
    let mut byte_buf: Vec<u8> = Vec::new();
    let mut buffer = String::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        byte_buf.extend_from_slice(&bytes);

        // Decode as much valid UTF-8 as possible from the byte buffer
        let decoded = match std::str::from_utf8(&byte_buf) {
            Ok(s) => {
                let decoded = s.to_string();
                byte_buf.clear();
                decoded
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to == 0 {
                    continue;
                }
                let decoded = std::str::from_utf8(&byte_buf[..valid_up_to])
                    .unwrap()
                    .to_string();
                byte_buf.drain(..valid_up_to);
                decoded
            }
        };

        buffer.push_str(&decoded);

        // Each complete line is one JSON chunk
        while let Some(line_end) = buffer.find('\n') {
            let line = buffer[..line_end].trim().to_string();
            buffer.drain(..line_end + 1);
            if line.is_empty() {
                continue;
            }

            for event in line_events(&line) {
                let terminal = matches!(event, StreamEvent::Done | StreamEvent::Error(_));
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
                if terminal {
                    return;
                }
            }
        }
    }

    // Flush a trailing line the server sent without a newline
    let line = buffer.trim();
    if !line.is_empty() {
        for event in line_events(line) {
            let terminal = matches!(event, StreamEvent::Done | StreamEvent::Error(_));
            if tx.send(event).await.is_err() {
                return;
            }
            if terminal {
                return;
            }
        }
    }

    // The connection closed without a done marker
    let _ = tx.send(StreamEvent::Done).await;
}
