//! Test doubles shared by the tamer crates.

mod http;

pub use http::{MockHttpResponse, MockHttpServer, sse_body};

use anyhow::Result;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;
use tamer_core::{
    ChatRequest, ChatTransport, InterruptFlag, OpenStream, RateLimitSnapshot, Screen,
    SessionRecorder, StreamFrame,
};
use tamer_errors::ApiError;

/// Everything a [`RecordingScreen`] was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenEvent {
    StartStatus(String),
    SetStatus(String),
    StopStatus,
    BeginLive,
    UpdateLive(String),
    EndLive,
    Print(String),
    Println(String),
    Markdown(String),
    Warn(String),
    Error(String),
}

#[derive(Debug, Default)]
pub struct RecordingScreen {
    events: Vec<(Instant, ScreenEvent)>,
}

impl RecordingScreen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ScreenEvent> {
        self.events.iter().map(|(_, event)| event.clone()).collect()
    }

    pub fn timed_events(&self) -> &[(Instant, ScreenEvent)] {
        &self.events
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                ScreenEvent::Warn(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                ScreenEvent::Error(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live_updates(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                ScreenEvent::UpdateLive(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated plain output from `print` and `println`.
    pub fn output(&self) -> String {
        let mut out = String::new();
        for (_, event) in &self.events {
            match event {
                ScreenEvent::Print(text) => out.push_str(text),
                ScreenEvent::Println(text) => {
                    out.push_str(text);
                    out.push('\n');
                }
                _ => {}
            }
        }
        out
    }

    fn push(&mut self, event: ScreenEvent) {
        self.events.push((Instant::now(), event));
    }
}

impl Screen for RecordingScreen {
    fn start_status(&mut self, message: &str, _interrupt: &InterruptFlag) {
        self.push(ScreenEvent::StartStatus(message.to_string()));
    }

    fn set_status(&mut self, message: &str) {
        self.push(ScreenEvent::SetStatus(message.to_string()));
    }

    fn stop_status(&mut self) {
        self.push(ScreenEvent::StopStatus);
    }

    fn begin_live(&mut self) {
        self.push(ScreenEvent::BeginLive);
    }

    fn update_live(&mut self, markdown: &str) {
        self.push(ScreenEvent::UpdateLive(markdown.to_string()));
    }

    fn end_live(&mut self) {
        self.push(ScreenEvent::EndLive);
    }

    fn print(&mut self, text: &str) {
        self.push(ScreenEvent::Print(text.to_string()));
    }

    fn println(&mut self, text: &str) {
        self.push(ScreenEvent::Println(text.to_string()));
    }

    fn print_markdown(&mut self, markdown: &str) {
        self.push(ScreenEvent::Markdown(markdown.to_string()));
    }

    fn warn(&mut self, message: &str) {
        self.push(ScreenEvent::Warn(message.to_string()));
    }

    fn error(&mut self, message: &str) {
        self.push(ScreenEvent::Error(message.to_string()));
    }
}

/// One step of a scripted response stream.
#[derive(Debug, Clone)]
pub enum ScriptedFrame {
    Content(String),
    Usage { prompt: u64, completion: u64 },
    /// Yields a failed frame.
    Fail(ApiError),
    /// Raises the flag, then yields an empty frame.
    Interrupt(InterruptFlag),
}

impl ScriptedFrame {
    pub fn content(text: &str) -> Self {
        Self::Content(text.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Stream {
        rate_limits: RateLimitSnapshot,
        frames: Vec<ScriptedFrame>,
    },
    Refuse(ApiError),
}

#[derive(Debug, Default)]
struct TransportState {
    scripts: VecDeque<Script>,
    requests: Vec<ChatRequest>,
}

/// In-memory [`ChatTransport`]. Clones share the script queue and the
/// request log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Rc<RefCell<TransportState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(self, frames: Vec<ScriptedFrame>) -> Self {
        self.push(Script::Stream {
            rate_limits: RateLimitSnapshot::default(),
            frames,
        })
    }

    pub fn stream_with_limits(
        self,
        rate_limits: RateLimitSnapshot,
        frames: Vec<ScriptedFrame>,
    ) -> Self {
        self.push(Script::Stream {
            rate_limits,
            frames,
        })
    }

    pub fn refuse(self, error: ApiError) -> Self {
        self.push(Script::Refuse(error))
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.state.borrow().requests.clone()
    }

    fn push(self, script: Script) -> Self {
        self.state.borrow_mut().scripts.push_back(script);
        self
    }
}

impl ChatTransport for ScriptedTransport {
    fn open_stream(&self, request: &ChatRequest) -> Result<OpenStream> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        let script = state.scripts.pop_front().unwrap_or(Script::Stream {
            rate_limits: RateLimitSnapshot::default(),
            frames: Vec::new(),
        });
        match script {
            Script::Refuse(error) => Err(error.into()),
            Script::Stream {
                rate_limits,
                frames,
            } => {
                let frames = frames.into_iter().map(|frame| match frame {
                    ScriptedFrame::Content(text) => Ok(StreamFrame::content(text)),
                    ScriptedFrame::Usage { prompt, completion } => {
                        Ok(StreamFrame::usage(prompt, completion))
                    }
                    ScriptedFrame::Fail(error) => Err(error.into()),
                    ScriptedFrame::Interrupt(flag) => {
                        flag.set();
                        Ok(StreamFrame::default())
                    }
                });
                Ok(OpenStream {
                    rate_limits,
                    frames: Box::new(frames),
                })
            }
        }
    }
}

/// A recorder call, as captured by [`CallLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderCall {
    UserInput(String),
    AssistantChunk(String),
    FinalizeOutput,
    DiscardOutput,
    StartCommand(String),
    CommandChunk(String),
    FinalizeCommand {
        exit_code: Option<i32>,
        stderr: String,
        interrupted: bool,
    },
    Finish,
}

/// [`SessionRecorder`] that logs every call.
#[derive(Debug, Default)]
pub struct CallLog {
    pub calls: Vec<RecorderCall>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionRecorder for CallLog {
    fn is_recording(&self) -> bool {
        true
    }

    fn record_user_input(&mut self, text: &str) {
        self.calls.push(RecorderCall::UserInput(text.to_string()));
    }

    fn record_assistant_chunk(&mut self, text: &str) {
        self.calls
            .push(RecorderCall::AssistantChunk(text.to_string()));
    }

    fn finalize_assistant_output(&mut self) {
        self.calls.push(RecorderCall::FinalizeOutput);
    }

    fn discard_assistant_output(&mut self) {
        self.calls.push(RecorderCall::DiscardOutput);
    }

    fn start_command(&mut self, command: &str) {
        self.calls
            .push(RecorderCall::StartCommand(command.to_string()));
    }

    fn record_command_chunk(&mut self, text: &str) {
        self.calls.push(RecorderCall::CommandChunk(text.to_string()));
    }

    fn finalize_command(&mut self, exit_code: Option<i32>, stderr: &str, interrupted: bool) {
        self.calls.push(RecorderCall::FinalizeCommand {
            exit_code,
            stderr: stderr.to_string(),
            interrupted,
        });
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        self.calls.push(RecorderCall::Finish);
        Ok(None)
    }
}
