//! Shared types for the tamer terminal assistant: configuration, the
//! conversation transcript, stream frames, and the seams (`ChatTransport`,
//! `Screen`, `SessionRecorder`) the other crates plug into.

mod config;
mod transcript;

pub use config::{
    AppConfig, CONFIG_DIR_ENV, GenerationConfig, PlaybackConfig, ProviderConfig, UiConfig,
    config_dir, demo_dir, history_path,
};
pub use transcript::{ChatMessage, Transcript};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Token counts reported by a single usage frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Cumulative counters kept for the end-of-session report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageCounters {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_requests: u64,
}

impl UsageCounters {
    pub fn record_request(&mut self) {
        self.total_requests = self.total_requests.saturating_add(1);
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.total_prompt_tokens = self.total_prompt_tokens.saturating_add(usage.prompt_tokens);
        self.total_completion_tokens = self
            .total_completion_tokens
            .saturating_add(usage.completion_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_prompt_tokens
            .saturating_add(self.total_completion_tokens)
    }
}

/// Rate limit counters some providers expose as response headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub limit_requests: Option<u64>,
    pub limit_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub remaining_tokens: Option<u64>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.limit_requests.is_none()
            && self.limit_tokens.is_none()
            && self.remaining_requests.is_none()
            && self.remaining_tokens.is_none()
    }
}

/// One decoded unit of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFrame {
    pub content: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl StreamFrame {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            usage: None,
        }
    }

    pub fn usage(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            content: None,
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }),
        }
    }
}

/// A streaming chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub generation: GenerationConfig,
}

pub type FrameStream = Box<dyn Iterator<Item = Result<StreamFrame>>>;

/// A response stream that has been accepted by the endpoint.
pub struct OpenStream {
    pub rate_limits: RateLimitSnapshot,
    pub frames: FrameStream,
}

pub trait ChatTransport {
    /// Issue the request and return the frame iterator once the endpoint has
    /// answered with a success status. Frames are pulled lazily; each `next`
    /// may block on the network.
    fn open_stream(&self, request: &ChatRequest) -> Result<OpenStream>;
}

/// Terminal surface used by the streaming pipeline and demo playback.
pub trait Screen {
    /// Show a spinner with `message` until [`Screen::stop_status`] is called
    /// or `interrupt` is raised.
    fn start_status(&mut self, message: &str, interrupt: &InterruptFlag);
    fn set_status(&mut self, message: &str);
    fn stop_status(&mut self);

    /// Open a region that [`Screen::update_live`] replaces in place.
    fn begin_live(&mut self);
    /// Replace the live region with `markdown`, rendered in full.
    fn update_live(&mut self, markdown: &str);
    fn end_live(&mut self);

    fn print(&mut self, text: &str);
    fn println(&mut self, text: &str);
    fn print_markdown(&mut self, markdown: &str);
    fn warn(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// Observer of a live session. Every method is safe to call when recording
/// is disabled.
pub trait SessionRecorder {
    fn is_recording(&self) -> bool;
    fn record_user_input(&mut self, text: &str);
    fn record_assistant_chunk(&mut self, text: &str);
    fn finalize_assistant_output(&mut self);
    /// Drop an accumulated reply that never completed.
    fn discard_assistant_output(&mut self);
    fn start_command(&mut self, command: &str);
    fn record_command_chunk(&mut self, text: &str);
    fn finalize_command(&mut self, exit_code: Option<i32>, stderr: &str, interrupted: bool);
    /// Persist the session. Returns the written file, if any.
    fn finish(&mut self) -> Result<Option<PathBuf>>;
}

/// Shared cancellation flag raised by Ctrl+C.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// The underlying atomic, for registration with a signal handler.
    pub fn handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}
