//! Upstream event-stream to caller event-stream transform.
//!
//! Upstream bytes are cut into lines, each line is parsed as one fragment and
//! every fragment carrying delta content becomes one outgoing SSE event. No
//! batching happens between fragments.

use std::convert::Infallible;

use async_stream::stream;
use axum::response::sse::Event;
use tokio_stream::{Stream, StreamExt};

use crate::models::OutputEvent;

const DATA_PREFIX: &str = "data:";

/// Longest line kept before the splitter gives up on it.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Accumulates raw chunks and hands back complete lines.
///
/// Bytes already searched for a newline are not searched again. A line that
/// outgrows the limit is dropped up to its terminating newline.
pub struct LineSplitter {
  buffer: Vec<u8>,
  scanned: usize,
  max_line: usize,
  discarding: bool,
}

impl Default for LineSplitter {
  fn default() -> Self {
    Self::with_max_line(MAX_LINE_BYTES)
  }
}

impl LineSplitter {
  pub fn with_max_line(max_line: usize) -> Self {
    Self {
      buffer: Vec::new(),
      scanned: 0,
      max_line,
      discarding: false,
    }
  }

  pub fn push(&mut self, chunk: &[u8]) {
    self.buffer.extend_from_slice(chunk);
  }

  /// Next complete line without its terminator, if one is buffered.
  pub fn next_line(&mut self) -> Option<Vec<u8>> {
    loop {
      let Some(offset) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') else {
        self.scanned = self.buffer.len();
        if self.buffer.len() > self.max_line {
          tracing::warn!(bytes = self.buffer.len(), "dropping oversized upstream line");
          self.buffer.clear();
          self.scanned = 0;
          self.discarding = true;
        }
        return None;
      };

      let pos = self.scanned + offset;
      let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
      self.scanned = 0;
      if std::mem::take(&mut self.discarding) {
        continue;
      }
      line.pop();
      if line.last() == Some(&b'\r') {
        line.pop();
      }
      return Some(line);
    }
  }

  /// Whatever is left once the upstream has closed.
  pub fn finish(&mut self) -> Option<Vec<u8>> {
    self.scanned = 0;
    if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
      self.buffer.clear();
      return None;
    }
    let mut line = std::mem::take(&mut self.buffer);
    if line.last() == Some(&b'\r') {
      line.pop();
    }
    Some(line)
  }
}

/// Extracts `choices[0].delta.content` from one upstream line.
///
/// Returns `None` for blank lines, non-JSON payloads (including `[DONE]`) and
/// objects without a non-empty content delta.
pub fn parse_fragment(line: &str) -> Option<String> {
  let line = line.trim();
  if line.is_empty() {
    return None;
  }
  let data = line
    .strip_prefix(DATA_PREFIX)
    .map(str::trim_start)
    .unwrap_or(line);

  let value: serde_json::Value = match serde_json::from_str(data) {
    Ok(v) => v,
    Err(err) => {
      tracing::trace!(error = %err, "skipping non-JSON fragment");
      return None;
    }
  };

  match value["choices"][0]["delta"]["content"].as_str() {
    Some(content) if !content.is_empty() => Some(content.to_string()),
    _ => None,
  }
}

fn to_event(content: String) -> Option<Event> {
  match Event::default().json_data(OutputEvent { content }) {
    Ok(event) => Some(event),
    Err(err) => {
      tracing::warn!(error = %err, "failed to encode output event");
      None
    }
  }
}

fn decode_line(line: &[u8]) -> Option<&str> {
  match std::str::from_utf8(line) {
    Ok(s) => Some(s),
    Err(err) => {
      tracing::warn!(error = %err, "skipping non UTF-8 fragment");
      None
    }
  }
}

/// Turns an upstream body into caller-facing SSE events.
///
/// The returned stream owns the upstream body; dropping it (caller went away)
/// releases the upstream connection.
pub fn relay_events<S, B, E>(upstream: S) -> impl Stream<Item = Result<Event, Infallible>>
where
  S: Stream<Item = Result<B, E>>,
  B: AsRef<[u8]>,
  E: std::fmt::Display,
{
  stream! {
    let mut upstream = Box::pin(upstream);
    let mut lines = LineSplitter::default();
    let mut relayed = 0usize;

    while let Some(chunk) = upstream.next().await {
      let chunk = match chunk {
        Ok(c) => c,
        Err(err) => {
          tracing::warn!(error = %err, relayed, "upstream stream broke off");
          return;
        }
      };

      lines.push(chunk.as_ref());
      while let Some(line) = lines.next_line() {
        let Some(content) = decode_line(&line).and_then(parse_fragment) else {
          continue;
        };
        if let Some(event) = to_event(content) {
          relayed += 1;
          yield Ok(event);
        }
      }
    }

    if let Some(line) = lines.finish() {
      if let Some(event) = decode_line(&line).and_then(parse_fragment).and_then(to_event) {
        relayed += 1;
        yield Ok(event);
      }
    }

    tracing::debug!(relayed, "upstream stream finished");
  }
}
