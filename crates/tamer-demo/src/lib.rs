//! Session recording and replay.

mod player;
mod recorder;
mod session;

pub use player::{DemoPlayer, INPUT_PROMPT, PlaybackSummary};
pub use recorder::{
    DemoRecorder, NullRecorder, create_recorder, last_recording, next_session_path,
    session_number,
};
pub use session::{CommandEvent, DemoEvent, DemoSession, OutputChunk, SESSION_VERSION};
