use anyhow::Result;
use serde_json::Value;
use std::io::{BufRead, Lines};
use tamer_core::{StreamFrame, TokenUsage};
use tamer_errors::ApiError;

/// Decodes an OpenAI-style server-sent event body into frames.
///
/// Only `data:` lines are considered; `[DONE]` ends the stream and lines that
/// are not valid JSON are skipped. An `{"error": ...}` payload ends the stream
/// with a classified [`ApiError`].
pub struct SseFrames<R> {
    lines: Lines<R>,
    done: bool,
}

impl<R: BufRead> SseFrames<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseFrames<R> {
    type Item = Result<StreamFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(
                        ApiError::connection(format!("stream read error: {e}")).into()
                    ));
                }
            };
            let trimmed = line.trim();
            let Some(data) = trimmed.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                return None;
            }
            let value: Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if let Some(error) = value.get("error") {
                self.done = true;
                return Some(Err(ApiError::from_stream_error(error).into()));
            }
            return Some(Ok(parse_frame(&value)));
        }
    }
}

/// Extract `choices[0].delta.content` and `usage` from one chunk.
pub fn parse_frame(value: &Value) -> StreamFrame {
    let content = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"))
        .and_then(|v| v.as_str())
        .filter(|text| !text.is_empty())
        .map(ToString::to_string);
    let usage = value
        .get("usage")
        .filter(|u| u.is_object())
        .map(|usage| TokenUsage {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        });
    StreamFrame { content, usage }
}
