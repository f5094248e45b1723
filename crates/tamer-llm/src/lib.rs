mod client;
mod models;
mod processor;
mod sse;
mod transport;

pub use client::{EDUCATIONAL_ACK, EDUCATIONAL_PROMPT, LlmClient, PERSONA, system_prompt};
pub use models::{ModelInfo, fetch_models, models_url};
pub use processor::{ConversationState, Phase, StreamProcessor};
pub use sse::{SseFrames, parse_frame};
pub use transport::{HttpTransport, build_payload, rate_limits_from_headers};
