use assert_cmd::Command;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use tamer_testkit::{MockHttpResponse, MockHttpServer, sse_body};
use tempfile::TempDir;

const INSTANT_PLAYBACK: &str = r#"{
  "typing_delay_per_char": 0,
  "typing_delay_variance": 0,
  "pause_after_input": 0,
  "output_delay": 0,
  "chunk_delay_scale": 0
}"#;

fn tamer(workspace: &Path, config: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tamer"));
    cmd.current_dir(workspace)
        .env("TAMER_CONFIG_DIR", config)
        .env("HOME", workspace)
        .env_remove("TAMER_LOG")
        .env_remove("RUST_LOG")
        .write_stdin("");
    cmd
}

fn write_settings(config: &Path, settings: &Value) {
    fs::create_dir_all(config).expect("config dir");
    fs::write(
        config.join("settings.json"),
        serde_json::to_vec_pretty(settings).expect("settings json"),
    )
    .expect("write settings");
}

fn mock_provider_settings(endpoint: &str) -> Value {
    json!({
        "current_llm": "mock",
        "providers": {
            "mock": {
                "endpoint": endpoint,
                "model": "mock-model",
                "requires_api_key": false
            }
        },
        "ui": { "refresh_delay_ms": 0 },
        "educational_prompt": false,
        "demo": serde_json::from_str::<Value>(INSTANT_PLAYBACK).expect("playback json")
    })
}

fn stdout_of(cmd: &mut Command) -> String {
    let out = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(out).expect("utf8 stdout")
}

#[test]
fn version_flag_prints_version() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let stdout = stdout_of(tamer(workspace.path(), &config).arg("--version"));
    assert!(stdout.starts_with("tamer "));
}

#[test]
fn settings_are_printed_with_keys_redacted() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    write_settings(
        &config,
        &json!({
            "providers": { "openai": { "api_key": "sk-very-secret" } }
        }),
    );
    let stdout = stdout_of(tamer(workspace.path(), &config).arg("--settings"));
    let value: Value = serde_json::from_str(&stdout).expect("settings json");
    assert_eq!(value["providers"]["openai"]["api_key"], "***REDACTED***");
    assert!(!stdout.contains("sk-very-secret"));
    assert!(value["providers"]["openrouter"].is_object());
}

#[test]
fn first_run_writes_default_settings() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    tamer(workspace.path(), &config)
        .arg("--settings")
        .assert()
        .success();
    let written = fs::read_to_string(config.join("settings.json")).expect("defaults written");
    let value: Value = serde_json::from_str(&written).expect("json");
    assert_eq!(value["current_llm"], "openrouter");
}

#[test]
fn single_query_streams_reply_and_reports_usage() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let server = MockHttpServer::start(vec![MockHttpResponse::sse(sse_body(&[
        r#"{"choices":[{"delta":{"content":"Check disk usage:\n"}}]}"#,
        r#"{"choices":[{"delta":{"content":"```bash\ndf -h\n```"}}]}"#,
        r#"{"choices":[],"usage":{"prompt_tokens":21,"completion_tokens":9}}"#,
    ]))]);
    write_settings(&config, &mock_provider_settings(&server.endpoint()));

    let stdout = stdout_of(tamer(workspace.path(), &config).args(["how", "full", "is", "disk?"]));
    assert!(stdout.contains("Check disk usage:"));
    assert!(stdout.contains("[Block #1]"));
    assert!(stdout.contains("df -h"));
    assert!(stdout.contains("requests:          1"));
    assert!(stdout.contains("prompt tokens:     21"));
    assert!(stdout.contains("completion tokens: 9"));

    let raw = server.requests().join("\n");
    assert!(raw.contains("how full is disk?"));
    assert!(raw.contains("mock-model"));
}

#[test]
fn recorded_query_plays_back() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let server = MockHttpServer::start(vec![MockHttpResponse::sse(sse_body(&[
        r#"{"choices":[{"delta":{"content":"Uptime is shown by "}}]}"#,
        r#"{"choices":[{"delta":{"content":"`uptime`."}}]}"#,
    ]))]);
    write_settings(&config, &mock_provider_settings(&server.endpoint()));

    let stdout = stdout_of(
        tamer(workspace.path(), &config).args(["--demo-record", "how", "long", "up?"]),
    );
    let saved = config.join("demo").join("demo_session_001.json");
    assert!(stdout.contains(&saved.display().to_string()));

    let recording: Value =
        serde_json::from_str(&fs::read_to_string(&saved).expect("recording")).expect("json");
    assert_eq!(recording["version"], "2.0");
    assert_eq!(recording["events"][0]["type"], "input");
    assert_eq!(recording["events"][0]["text"], "how long up?");
    assert_eq!(recording["events"][1]["type"], "output");
    assert_eq!(recording["events"][1]["text"], "Uptime is shown by `uptime`.");

    let replay = stdout_of(tamer(workspace.path(), &config).arg("--demo-play"));
    assert!(replay.contains(">>> how long up?"));
    assert!(replay.contains("Uptime is shown by"));
}

#[test]
fn demo_play_replays_commands_with_results() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    write_settings(&config, &json!({ "demo": serde_json::from_str::<Value>(INSTANT_PLAYBACK).expect("json") }));
    let session = workspace.path().join("session.json");
    fs::write(
        &session,
        serde_json::to_vec(&json!({
            "version": "2.0",
            "events": [
                { "type": "input", "text": "1" },
                {
                    "type": "command",
                    "command": "echo ready",
                    "chunks": [ { "text": "ready\n", "delay": 0.0 } ],
                    "exit_code": 0
                }
            ]
        }))
        .expect("session json"),
    )
    .expect("write session");

    let stdout = stdout_of(
        tamer(workspace.path(), &config)
            .arg("--demo-play")
            .arg(&session),
    );
    assert!(stdout.contains(">>> 1\n"));
    assert!(stdout.contains(">>> Running:"));
    assert!(stdout.contains(">>> Result:\nready\n"));
    assert!(stdout.contains(">>> Exit code: 0"));
}

#[test]
fn corrupt_demo_file_fails_without_playing() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let session = workspace.path().join("broken.json");
    fs::write(&session, "{ not json").expect("write");

    let assert = tamer(workspace.path(), &config)
        .arg("--demo-play")
        .arg(&session)
        .assert()
        .code(1);
    let output = assert.get_output();
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Demo Playback Failed"));
}

#[test]
fn demo_play_without_recordings_fails() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let assert = tamer(workspace.path(), &config)
        .arg("--demo-play")
        .assert()
        .code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).to_string();
    assert!(stderr.contains("No demo sessions found"));
}

#[test]
fn models_are_listed_and_filtered() {
    let workspace = TempDir::new().expect("workspace");
    let config = workspace.path().join("config");
    let server = MockHttpServer::start(vec![MockHttpResponse::json(
        200,
        r#"{"data":[{"id":"gpt-4o"},{"id":"meta/llama-3","name":"Llama 3"}]}"#,
    )]);
    write_settings(&config, &mock_provider_settings(&server.endpoint()));

    let stdout = stdout_of(tamer(workspace.path(), &config).arg("--models=llama"));
    assert_eq!(stdout.trim(), "meta/llama-3  (Llama 3)");
}
