use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use tamer_errors::errors::demo_file_unreadable;

pub const SESSION_VERSION: &str = "2.0";

/// One recorded session: the only unit written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoSession {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub events: Vec<DemoEvent>,
}

fn default_version() -> String {
    SESSION_VERSION.to_string()
}

impl Default for DemoSession {
    fn default() -> Self {
        Self {
            version: default_version(),
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DemoEvent {
    Input { text: String },
    /// The whole assistant reply, not individual chunks.
    Output { text: String },
    Command(CommandEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub command: String,
    /// Output stored in one piece, for recordings made without timing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<OutputChunk>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interrupted: bool,
}

/// A piece of command stdout and its offset in seconds from command start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub text: String,
    pub delay: f64,
}

impl DemoSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let display = path.display().to_string();
        let raw = fs::read_to_string(path)
            .map_err(|e| demo_file_unreadable(&display, &e.to_string()).into_error())?;
        serde_json::from_str(&raw)
            .map_err(|e| demo_file_unreadable(&display, &e.to_string()).into_error())
    }

    /// Write the session next to `path` and rename it into place.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create demo directory {}", dir.display()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), self)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("failed to write demo session {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DemoSession {
        DemoSession {
            version: SESSION_VERSION.to_string(),
            events: vec![
                DemoEvent::Input {
                    text: "disk usage?".to_string(),
                },
                DemoEvent::Output {
                    text: "Run:\n```bash\ndf -h\n```".to_string(),
                },
                DemoEvent::Command(CommandEvent {
                    command: "df -h".to_string(),
                    chunks: vec![
                        OutputChunk {
                            text: "Filesystem\n".to_string(),
                            delay: 0.0,
                        },
                        OutputChunk {
                            text: "/dev/sda1\n".to_string(),
                            delay: 0.25,
                        },
                    ],
                    exit_code: Some(0),
                    ..CommandEvent::default()
                }),
            ],
        }
    }

    #[test]
    fn save_and_load_preserve_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demo").join("demo_session_001.json");
        let session = sample();
        session.save(&path).expect("save");
        let loaded = DemoSession::load(&path).expect("load");
        assert_eq!(loaded, session);
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn wire_format_uses_type_tags() {
        let value = serde_json::to_value(sample()).expect("json");
        assert_eq!(value["version"], "2.0");
        assert_eq!(value["events"][0], json!({"type": "input", "text": "disk usage?"}));
        assert_eq!(value["events"][2]["type"], "command");
        assert_eq!(value["events"][2]["chunks"][1]["delay"], 0.25);
        assert!(value["events"][2].get("output").is_none());
        assert!(value["events"][2].get("interrupted").is_none());
    }

    #[test]
    fn reads_simple_command_events() {
        let raw = r#"{"version":"2.0","events":[
            {"type":"command","command":"uptime","output":"up 3 days"}
        ]}"#;
        let session: DemoSession = serde_json::from_str(raw).expect("parse");
        let DemoEvent::Command(cmd) = &session.events[0] else {
            panic!("expected command event");
        };
        assert_eq!(cmd.output.as_deref(), Some("up 3 days"));
        assert!(cmd.chunks.is_empty());
        assert_eq!(cmd.exit_code, None);
    }

    #[test]
    fn corrupt_file_reports_demo_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("demo_session_001.json");
        fs::write(&path, "{not json").expect("write");
        let err = DemoSession::load(&path).expect_err("corrupt");
        assert!(err.to_string().contains("Demo Playback Failed"));
        let missing = DemoSession::load(&dir.path().join("nope.json")).expect_err("missing");
        assert!(missing.to_string().contains("nope.json"));
    }
}
