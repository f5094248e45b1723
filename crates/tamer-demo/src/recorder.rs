use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tamer_core::SessionRecorder;
use tracing::{debug, info};

use crate::session::{CommandEvent, DemoEvent, DemoSession, OutputChunk};

const FILE_PREFIX: &str = "demo_session_";
const FILE_SUFFIX: &str = ".json";

/// Sequence number of a `demo_session_NNN.json` path.
pub fn session_number(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

fn recordings(dir: &Path) -> Vec<(u32, PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter_map(|path| session_number(&path).map(|n| (n, path)))
        .collect()
}

/// Next file name: highest existing number plus one. Gaps are never reused.
pub fn next_session_path(dir: &Path) -> PathBuf {
    let next = recordings(dir)
        .into_iter()
        .map(|(n, _)| n)
        .max()
        .unwrap_or(0)
        .saturating_add(1);
    dir.join(format!("{FILE_PREFIX}{next:03}{FILE_SUFFIX}"))
}

/// The highest-numbered recording in `dir`.
pub fn last_recording(dir: &Path) -> Option<PathBuf> {
    recordings(dir)
        .into_iter()
        .max_by_key(|(n, _)| *n)
        .map(|(_, path)| path)
}

/// Recording disabled: every hook does nothing.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl SessionRecorder for NullRecorder {
    fn is_recording(&self) -> bool {
        false
    }
    fn record_user_input(&mut self, _text: &str) {}
    fn record_assistant_chunk(&mut self, _text: &str) {}
    fn finalize_assistant_output(&mut self) {}
    fn discard_assistant_output(&mut self) {}
    fn start_command(&mut self, _command: &str) {}
    fn record_command_chunk(&mut self, _text: &str) {}
    fn finalize_command(&mut self, _exit_code: Option<i32>, _stderr: &str, _interrupted: bool) {}
    fn finish(&mut self) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

struct PendingCommand {
    command: String,
    started: Instant,
    chunks: Vec<OutputChunk>,
}

/// Collects session events in memory and writes them as one JSON document
/// when the session finishes.
pub struct DemoRecorder {
    dir: PathBuf,
    path: PathBuf,
    recording: bool,
    session: DemoSession,
    output: String,
    command: Option<PendingCommand>,
}

impl DemoRecorder {
    pub fn start(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create demo directory {}", dir.display()))?;
        let path = next_session_path(dir);
        info!(path = %path.display(), "demo recording started");
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
            recording: true,
            session: DemoSession::new(),
            output: String::new(),
            command: None,
        })
    }

    /// File the session will be written to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> &DemoSession {
        &self.session
    }

    /// Stop observing without writing anything.
    pub fn stop(&mut self) {
        self.recording = false;
        self.output.clear();
        self.command = None;
    }
}

impl SessionRecorder for DemoRecorder {
    fn is_recording(&self) -> bool {
        self.recording
    }

    fn record_user_input(&mut self, text: &str) {
        if !self.recording {
            return;
        }
        self.session.events.push(DemoEvent::Input {
            text: text.to_string(),
        });
    }

    fn record_assistant_chunk(&mut self, text: &str) {
        if self.recording {
            self.output.push_str(text);
        }
    }

    fn finalize_assistant_output(&mut self) {
        if !self.recording || self.output.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.output);
        self.session.events.push(DemoEvent::Output { text });
    }

    fn discard_assistant_output(&mut self) {
        if !self.output.is_empty() {
            debug!(chars = self.output.len(), "dropping partial assistant output");
        }
        self.output.clear();
    }

    fn start_command(&mut self, command: &str) {
        if !self.recording {
            return;
        }
        self.command = Some(PendingCommand {
            command: command.to_string(),
            started: Instant::now(),
            chunks: Vec::new(),
        });
    }

    fn record_command_chunk(&mut self, text: &str) {
        if let Some(pending) = self.command.as_mut() {
            pending.chunks.push(OutputChunk {
                text: text.to_string(),
                delay: pending.started.elapsed().as_secs_f64(),
            });
        }
    }

    fn finalize_command(&mut self, exit_code: Option<i32>, stderr: &str, interrupted: bool) {
        let Some(pending) = self.command.take() else {
            return;
        };
        if !self.recording {
            return;
        }
        self.session.events.push(DemoEvent::Command(CommandEvent {
            command: pending.command,
            output: None,
            chunks: pending.chunks,
            exit_code,
            stderr: (!stderr.is_empty()).then(|| stderr.to_string()),
            interrupted,
        }));
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        if !self.recording {
            return Ok(None);
        }
        self.finalize_assistant_output();
        self.recording = false;
        if self.session.is_empty() {
            debug!("demo session has no events; nothing written");
            return Ok(None);
        }
        if self.path.exists() {
            self.path = next_session_path(&self.dir);
        }
        self.session.save(&self.path)?;
        info!(path = %self.path.display(), events = self.session.events.len(), "demo session saved");
        Ok(Some(self.path.clone()))
    }
}

/// The recorder for a run: a [`DemoRecorder`] writing into `dir` when
/// `enabled`, otherwise a [`NullRecorder`].
pub fn create_recorder(enabled: bool, dir: &Path) -> Result<Box<dyn SessionRecorder>> {
    if enabled {
        Ok(Box::new(DemoRecorder::start(dir)?))
    } else {
        Ok(Box::new(NullRecorder))
    }
}
