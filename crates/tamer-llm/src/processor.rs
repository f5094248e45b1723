use anyhow::Result;
use std::thread;
use std::time::Duration;
use tamer_core::{
    ChatRequest, ChatTransport, FrameStream, GenerationConfig, InterruptFlag, RateLimitSnapshot,
    Screen, SessionRecorder, StreamFrame, Transcript, UsageCounters,
};
use tamer_errors::{ErrorHandler, Interrupted, is_interrupted};
use tracing::{debug, warn};

const CONNECTING_STATUS: &str = "Connecting...";
const THINKING_STATUS: &str = "AI thinking...";
const EMPTY_REPLY_WARNING: &str = "The model returned an empty response.";

/// Conversation data owned by one client and mutated by each request.
#[derive(Debug, Clone)]
pub struct ConversationState {
    pub transcript: Transcript,
    pub usage: UsageCounters,
    pub rate_limits: Option<RateLimitSnapshot>,
}

impl ConversationState {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            transcript: Transcript::new(system_prompt),
            usage: UsageCounters::default(),
            rate_limits: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    WaitingFirstChunk,
    Streaming,
    Done,
}

/// Per-request bookkeeping, dropped when the request resolves.
#[derive(Debug)]
struct StreamState {
    phase: Phase,
    interrupted: bool,
    parts: Vec<String>,
    status: &'static str,
}

impl StreamState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            interrupted: false,
            parts: Vec::new(),
            status: "",
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "stream phase");
        self.phase = phase;
    }

    fn text(&self) -> String {
        self.parts.concat()
    }
}

/// Drives one streaming request from connection to committed reply.
pub struct StreamProcessor<'a> {
    screen: &'a mut dyn Screen,
    recorder: &'a mut dyn SessionRecorder,
    interrupt: InterruptFlag,
    refresh_delay: Duration,
    errors: ErrorHandler,
}

impl<'a> StreamProcessor<'a> {
    pub fn new(
        screen: &'a mut dyn Screen,
        recorder: &'a mut dyn SessionRecorder,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            screen,
            recorder,
            interrupt,
            refresh_delay: Duration::ZERO,
            errors: ErrorHandler::new(),
        }
    }

    /// Pause after each live redraw.
    pub fn refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn error_handler(mut self, errors: ErrorHandler) -> Self {
        self.errors = errors;
        self
    }

    /// Send `user_input` with the committed history and stream the reply.
    ///
    /// Returns the reply once it is committed to the transcript. Failures
    /// before the first fragment are shown on the screen and yield an empty
    /// string, as does a reply with no visible text. Interruption and
    /// failures after the first fragment are returned as errors. In every
    /// case except success the transcript is left as it was.
    pub fn run(
        &mut self,
        transport: &dyn ChatTransport,
        state: &mut ConversationState,
        model: &str,
        generation: &GenerationConfig,
        user_input: &str,
    ) -> Result<String> {
        let mut stream = StreamState::new();
        stream.enter(Phase::Connecting);
        stream.status = CONNECTING_STATUS;
        self.screen.start_status(stream.status, &self.interrupt);

        let request = ChatRequest {
            model: model.to_string(),
            messages: state.transcript.with_pending_user(user_input),
            generation: generation.clone(),
        };

        let connected = self.connect(transport, &request, state, &mut stream);
        self.screen.stop_status();
        let (frames, first) = match connected {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                self.recorder.discard_assistant_output();
                self.screen.warn(EMPTY_REPLY_WARNING);
                return Ok(String::new());
            }
            Err(err) if is_interrupted(&err) => {
                debug!(phase = ?stream.phase, interrupted = stream.interrupted, "stream cancelled");
                self.recorder.discard_assistant_output();
                return Err(err);
            }
            Err(err) => {
                warn!(error = %err, "chat request failed before the first chunk");
                self.recorder.discard_assistant_output();
                self.screen.error(&self.errors.handle(&err));
                return Ok(String::new());
            }
        };

        stream.enter(Phase::Streaming);
        self.screen.begin_live();
        self.append(&mut stream, first);
        let streamed = self.stream_rest(frames, state, &mut stream);
        self.screen.end_live();
        if let Err(err) = streamed {
            debug!(
                interrupted = stream.interrupted,
                received = stream.parts.len(),
                "stream aborted"
            );
            self.recorder.discard_assistant_output();
            return Err(err);
        }

        stream.enter(Phase::Done);
        let reply = stream.text();
        if reply.trim().is_empty() {
            self.recorder.discard_assistant_output();
            self.screen.warn(EMPTY_REPLY_WARNING);
            return Ok(String::new());
        }
        state.transcript.push_exchange(user_input, reply.as_str());
        self.recorder.finalize_assistant_output();
        Ok(reply)
    }

    /// Open the stream and pull frames until one carries text.
    fn connect(
        &mut self,
        transport: &dyn ChatTransport,
        request: &ChatRequest,
        state: &mut ConversationState,
        stream: &mut StreamState,
    ) -> Result<Option<(FrameStream, String)>> {
        let opened = match transport.open_stream(request) {
            Ok(opened) => opened,
            Err(err) if self.interrupt.is_set() && !is_interrupted(&err) => {
                debug!(error = %err, "connection failed after interrupt");
                stream.interrupted = true;
                return Err(Interrupted.into());
            }
            Err(err) => {
                stream.interrupted = is_interrupted(&err);
                return Err(err);
            }
        };
        state.usage.record_request();
        if !opened.rate_limits.is_empty() {
            state.rate_limits = Some(opened.rate_limits);
        }

        stream.enter(Phase::WaitingFirstChunk);
        stream.status = THINKING_STATUS;
        self.screen.set_status(stream.status);

        let mut frames = opened.frames;
        loop {
            if self.interrupt.is_set() {
                stream.interrupted = true;
                return Err(Interrupted.into());
            }
            let Some(frame) = frames.next() else {
                return Ok(None);
            };
            if let Some(content) = absorb(frame?, state) {
                return Ok(Some((frames, content)));
            }
        }
    }

    fn stream_rest(
        &mut self,
        frames: FrameStream,
        state: &mut ConversationState,
        stream: &mut StreamState,
    ) -> Result<()> {
        for frame in frames {
            if self.interrupt.is_set() {
                stream.interrupted = true;
                return Err(Interrupted.into());
            }
            if let Some(content) = absorb(frame?, state) {
                self.append(stream, content);
            }
        }
        if self.interrupt.is_set() {
            stream.interrupted = true;
            return Err(Interrupted.into());
        }
        Ok(())
    }

    /// Add a fragment and redraw the whole reply.
    fn append(&mut self, stream: &mut StreamState, content: String) {
        self.recorder.record_assistant_chunk(&content);
        stream.parts.push(content);
        self.screen.update_live(&stream.text());
        if !self.refresh_delay.is_zero() {
            thread::sleep(self.refresh_delay);
        }
    }
}

/// Fold usage into the counters and return any text the frame carries.
fn absorb(frame: StreamFrame, state: &mut ConversationState) -> Option<String> {
    if let Some(usage) = frame.usage {
        state.usage.record_usage(&usage);
    }
    frame.content.filter(|content| !content.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamer_errors::{ApiError, ApiErrorKind};
    use tamer_testkit::{
        CallLog, RecorderCall, RecordingScreen, ScreenEvent, ScriptedFrame, ScriptedTransport,
    };

    fn run(
        transport: &ScriptedTransport,
        state: &mut ConversationState,
        screen: &mut RecordingScreen,
        recorder: &mut CallLog,
        interrupt: InterruptFlag,
    ) -> Result<String> {
        StreamProcessor::new(screen, recorder, interrupt).run(
            transport,
            state,
            "test-model",
            &GenerationConfig::default(),
            "what is up",
        )
    }

    #[test]
    fn successful_stream_commits_one_exchange() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("Hello"),
            ScriptedFrame::content(", "),
            ScriptedFrame::content("world"),
            ScriptedFrame::Usage {
                prompt: 12,
                completion: 3,
            },
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let mut recorder = CallLog::new();

        let reply = run(&transport, &mut state, &mut screen, &mut recorder, InterruptFlag::new())
            .expect("reply");

        assert_eq!(reply, "Hello, world");
        let messages = state.transcript.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].role(), "user");
        assert_eq!(messages[1].content(), "what is up");
        assert_eq!(messages[2].role(), "assistant");
        assert_eq!(messages[2].content(), "Hello, world");
        assert_eq!(state.usage.total_requests, 1);
        assert_eq!(state.usage.total_prompt_tokens, 12);
        assert_eq!(state.usage.total_completion_tokens, 3);
        assert_eq!(recorder.calls.last(), Some(&RecorderCall::FinalizeOutput));
    }

    #[test]
    fn request_carries_pending_user_turn() {
        let transport = ScriptedTransport::new().stream(vec![ScriptedFrame::content("ok")]);
        let mut state = ConversationState::new("sys");
        run(
            &transport,
            &mut state,
            &mut RecordingScreen::new(),
            &mut CallLog::new(),
            InterruptFlag::new(),
        )
        .expect("reply");
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[1].content(), "what is up");
        assert_eq!(requests[0].model, "test-model");
    }

    #[test]
    fn live_view_is_redrawn_with_the_full_reply() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("**bo"),
            ScriptedFrame::Usage {
                prompt: 1,
                completion: 1,
            },
            ScriptedFrame::content("ld**"),
            ScriptedFrame::content(" text"),
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        run(&transport, &mut state, &mut screen, &mut CallLog::new(), InterruptFlag::new())
            .expect("reply");

        assert_eq!(
            screen.live_updates(),
            vec!["**bo", "**bold**", "**bold** text"]
        );
        let events = screen.events();
        let stop = events
            .iter()
            .position(|e| *e == ScreenEvent::StopStatus)
            .expect("spinner stopped");
        let begin = events
            .iter()
            .position(|e| *e == ScreenEvent::BeginLive)
            .expect("live opened");
        assert!(stop < begin);
        assert_eq!(events.first(), Some(&ScreenEvent::StartStatus("Connecting...".to_string())));
        assert!(events.contains(&ScreenEvent::SetStatus("AI thinking...".to_string())));
        assert_eq!(events.last(), Some(&ScreenEvent::EndLive));
    }

    #[test]
    fn usage_only_frames_before_content_are_counted() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::Usage {
                prompt: 5,
                completion: 0,
            },
            ScriptedFrame::content("hi"),
        ]);
        let mut state = ConversationState::new("sys");
        let reply = run(
            &transport,
            &mut state,
            &mut RecordingScreen::new(),
            &mut CallLog::new(),
            InterruptFlag::new(),
        )
        .expect("reply");
        assert_eq!(reply, "hi");
        assert_eq!(state.usage.total_prompt_tokens, 5);
    }

    #[test]
    fn stream_without_content_warns_once_and_commits_nothing() {
        let transport = ScriptedTransport::new().stream(vec![ScriptedFrame::Usage {
            prompt: 4,
            completion: 0,
        }]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let mut recorder = CallLog::new();

        let reply = run(&transport, &mut state, &mut screen, &mut recorder, InterruptFlag::new())
            .expect("empty reply is not an error");

        assert_eq!(reply, "");
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(screen.warnings().len(), 1);
        assert!(screen.errors().is_empty());
        assert!(screen.live_updates().is_empty());
        assert_eq!(state.usage.total_prompt_tokens, 4);
        assert_eq!(recorder.calls, vec![RecorderCall::DiscardOutput]);
    }

    #[test]
    fn whitespace_reply_is_discarded() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("\n"),
            ScriptedFrame::content("  "),
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let reply = run(&transport, &mut state, &mut screen, &mut CallLog::new(), InterruptFlag::new())
            .expect("whitespace reply");
        assert_eq!(reply, "");
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(screen.warnings().len(), 1);
    }

    #[test]
    fn connection_errors_are_displayed_and_swallowed() {
        let transport =
            ScriptedTransport::new().refuse(ApiError::from_response(401, r#"{"error":"bad key"}"#));
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();

        let reply = run(&transport, &mut state, &mut screen, &mut CallLog::new(), InterruptFlag::new())
            .expect("api errors are recovered");

        assert_eq!(reply, "");
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.usage.total_requests, 0);
        let errors = screen.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Authentication Failed"));
        assert!(screen.events().contains(&ScreenEvent::StopStatus));
    }

    #[test]
    fn failure_while_waiting_for_first_chunk_is_swallowed() {
        let transport = ScriptedTransport::new().stream(vec![ScriptedFrame::Fail(ApiError::new(
            ApiErrorKind::RateLimited,
            "slow down",
        ))]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let reply = run(&transport, &mut state, &mut screen, &mut CallLog::new(), InterruptFlag::new())
            .expect("recovered");
        assert_eq!(reply, "");
        assert!(screen.errors()[0].contains("Rate Limit Exceeded"));
        assert_eq!(state.transcript.len(), 1);
    }

    #[test]
    fn failure_after_first_chunk_propagates_without_commit() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("partial"),
            ScriptedFrame::Fail(ApiError::connection("reset by peer")),
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let mut recorder = CallLog::new();

        let err = run(&transport, &mut state, &mut screen, &mut recorder, InterruptFlag::new())
            .expect_err("mid-stream failure propagates");

        assert!(err.downcast_ref::<ApiError>().is_some());
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(screen.events().last(), Some(&ScreenEvent::EndLive));
        assert_eq!(recorder.calls.last(), Some(&RecorderCall::DiscardOutput));
    }

    #[test]
    fn interruption_while_streaming_raises_and_commits_nothing() {
        let interrupt = InterruptFlag::new();
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("one"),
            ScriptedFrame::Interrupt(interrupt.clone()),
            ScriptedFrame::content("two"),
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let mut recorder = CallLog::new();

        let err = run(&transport, &mut state, &mut screen, &mut recorder, interrupt)
            .expect_err("interrupt propagates");

        assert!(is_interrupted(&err));
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(screen.live_updates(), vec!["one"]);
        assert_eq!(recorder.calls.last(), Some(&RecorderCall::DiscardOutput));
    }

    #[test]
    fn interruption_before_first_chunk_raises() {
        let interrupt = InterruptFlag::new();
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::Interrupt(interrupt.clone()),
            ScriptedFrame::content("never shown"),
        ]);
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let err = run(&transport, &mut state, &mut screen, &mut CallLog::new(), interrupt)
            .expect_err("interrupt propagates");
        assert!(is_interrupted(&err));
        assert!(screen.live_updates().is_empty());
        assert!(screen.events().contains(&ScreenEvent::StopStatus));
        assert_eq!(state.transcript.len(), 1);
    }

    #[test]
    fn rate_limits_are_replaced_only_when_present() {
        let snapshot = RateLimitSnapshot {
            remaining_requests: Some(10),
            ..RateLimitSnapshot::default()
        };
        let transport = ScriptedTransport::new()
            .stream_with_limits(snapshot.clone(), vec![ScriptedFrame::content("a")])
            .stream(vec![ScriptedFrame::content("b")]);
        let mut state = ConversationState::new("sys");
        for _ in 0..2 {
            run(
                &transport,
                &mut state,
                &mut RecordingScreen::new(),
                &mut CallLog::new(),
                InterruptFlag::new(),
            )
            .expect("reply");
        }
        assert_eq!(state.rate_limits, Some(snapshot));
        assert_eq!(state.transcript.len(), 5);
        assert_eq!(state.usage.total_requests, 2);
    }

    #[test]
    fn recorder_sees_every_fragment_then_finalize() {
        let transport = ScriptedTransport::new().stream(vec![
            ScriptedFrame::content("a"),
            ScriptedFrame::content("b"),
        ]);
        let mut recorder = CallLog::new();
        run(
            &transport,
            &mut ConversationState::new("sys"),
            &mut RecordingScreen::new(),
            &mut recorder,
            InterruptFlag::new(),
        )
        .expect("reply");
        assert_eq!(
            recorder.calls,
            vec![
                RecorderCall::AssistantChunk("a".to_string()),
                RecorderCall::AssistantChunk("b".to_string()),
                RecorderCall::FinalizeOutput,
            ]
        );
    }

    #[test]
    fn failure_while_connecting_after_ctrl_c_is_a_cancellation() {
        let transport = ScriptedTransport::new()
            .refuse(ApiError::connection("operation timed out"));
        let interrupt = InterruptFlag::new();
        interrupt.set();
        let mut state = ConversationState::new("sys");
        let mut screen = RecordingScreen::new();
        let err = run(&transport, &mut state, &mut screen, &mut CallLog::new(), interrupt)
            .expect_err("cancelled");
        assert!(is_interrupted(&err));
        assert!(screen.errors().is_empty());
        assert_eq!(state.transcript.len(), 1);
        assert_eq!(state.usage.total_requests, 0);
    }
}
