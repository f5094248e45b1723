use anyhow::Result;
use once_cell::unsync::OnceCell;
use std::time::Duration;
use tamer_core::{
    AppConfig, ChatTransport, GenerationConfig, InterruptFlag, ProviderConfig, RateLimitSnapshot,
    Screen, SessionRecorder, Transcript, UsageCounters,
};
use tamer_errors::{ErrorHandler, is_interrupted};
use tracing::{debug, warn};

use crate::models::{ModelInfo, fetch_models};
use crate::processor::{ConversationState, StreamProcessor};
use crate::transport::HttpTransport;

pub const PERSONA: &str = "Your name is Tamer, a sysadmin assistant. \
You and the user always work in a terminal. \
Respond based on the user's environment and commands.";

pub const EDUCATIONAL_PROMPT: &str = "ALWAYS number code blocks in your replies so the user can \
reference them. Numbering format: [Code #1]\n```bash ... ```, [Code #2]\n```bash ... ```. \
In each new reply, start numbering from 1 again. Do not discuss numbering; just do it automatically.";

pub const EDUCATIONAL_ACK: &str = "Understood. I will number every code block as [Code #N], \
starting again from 1 in each reply.";

/// System message: the user's own instructions followed by the persona.
pub fn system_prompt(user_content: &str) -> String {
    let user_content = user_content.trim();
    if user_content.is_empty() {
        PERSONA.to_string()
    } else {
        format!("{user_content}\n\n{PERSONA}")
    }
}

/// Chat client owning the provider settings, the transcript and the
/// counters. The HTTP transport is built on first use.
pub struct LlmClient {
    provider: ProviderConfig,
    generation: GenerationConfig,
    refresh_delay: Duration,
    debug: bool,
    educational_prompt: bool,
    interrupt: InterruptFlag,
    errors: ErrorHandler,
    transport: OnceCell<Box<dyn ChatTransport>>,
    state: ConversationState,
}

impl LlmClient {
    pub fn new(cfg: &AppConfig, interrupt: InterruptFlag) -> Result<Self> {
        let provider = cfg.current_provider()?.clone();
        Ok(Self {
            provider,
            generation: cfg.llm.clone(),
            refresh_delay: Duration::from_millis(cfg.ui.refresh_delay_ms),
            debug: cfg.ui.debug,
            educational_prompt: cfg.educational_prompt,
            interrupt,
            errors: ErrorHandler::new().verbose(cfg.ui.debug),
            transport: OnceCell::new(),
            state: ConversationState::new(system_prompt(&cfg.user_content)),
        })
    }

    /// Use `transport` instead of building an HTTP transport.
    pub fn with_transport(mut self, transport: Box<dyn ChatTransport>) -> Self {
        self.transport = OnceCell::from(transport);
        self
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn model(&self) -> &str {
        &self.provider.model
    }

    pub fn transcript(&self) -> &Transcript {
        &self.state.transcript
    }

    pub fn usage(&self) -> &UsageCounters {
        &self.state.usage
    }

    pub fn rate_limits(&self) -> Option<&RateLimitSnapshot> {
        self.state.rate_limits.as_ref()
    }

    pub fn transport_initialized(&self) -> bool {
        self.transport.get().is_some()
    }

    /// Queue the code block numbering instruction. It is committed with the
    /// first successful exchange; only the first call has an effect.
    pub fn seed_educational_prompt(&mut self) -> bool {
        self.state
            .transcript
            .seed_educational(EDUCATIONAL_PROMPT, EDUCATIONAL_ACK)
    }

    /// Forget all exchanges, keeping the system message.
    pub fn reset(&mut self) {
        self.state.transcript.reset();
    }

    /// Send `user_input` and stream the reply onto `screen`.
    ///
    /// Provider and network failures are displayed and produce an empty
    /// string. The only error returned is [`tamer_errors::Interrupted`].
    pub fn ask_stream(
        &mut self,
        user_input: &str,
        screen: &mut dyn Screen,
        recorder: &mut dyn SessionRecorder,
    ) -> Result<String> {
        if self.educational_prompt && self.seed_educational_prompt() {
            debug!("queued code block numbering instruction");
        }

        let built = self.transport.get_or_try_init(|| {
            debug!(endpoint = %self.provider.endpoint, "building HTTP transport");
            HttpTransport::new(self.provider.clone(), &self.generation, self.debug).map(
                |transport| {
                    Box::new(transport.with_interrupt(self.interrupt.clone()))
                        as Box<dyn ChatTransport>
                },
            )
        });
        let transport = match built {
            Ok(transport) => transport,
            Err(err) => {
                screen.error(&self.errors.handle(&err));
                return Ok(String::new());
            }
        };

        let result = StreamProcessor::new(screen, recorder, self.interrupt.clone())
            .refresh_delay(self.refresh_delay)
            .error_handler(self.errors.clone())
            .run(
                transport.as_ref(),
                &mut self.state,
                &self.provider.model,
                &self.generation,
                user_input,
            );

        match result {
            Ok(reply) => Ok(reply),
            Err(err) if is_interrupted(&err) => Err(err),
            Err(err) => {
                warn!(error = %err, "stream failed after the first chunk");
                screen.error(&self.errors.handle(&err));
                Ok(String::new())
            }
        }
    }

    /// Models offered by the current provider; empty when the listing fails.
    pub fn fetch_models(&self, filter: Option<&str>) -> Vec<ModelInfo> {
        fetch_models(&self.provider, &self.generation, filter)
    }
}
