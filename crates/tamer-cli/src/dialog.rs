use anyhow::Result;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::{Path, PathBuf};
use tamer_core::{InterruptFlag, Screen, SessionRecorder};
use tamer_demo::INPUT_PROMPT;
use tamer_errors::{errors, is_interrupted};
use tamer_llm::LlmClient;
use tamer_tools::ShellRunner;
use tamer_ui::command_view::{print_command_footer, print_command_header};
use tamer_ui::extract_code_blocks;
use tracing::{debug, warn};

use crate::output::usage_report;

const REQUEST_INTERRUPTED: &str = "Request interrupted by user (Ctrl+C)";
const EMPTY_COMMAND_HINT: &str = "Type a command after the dot, e.g. `.ls -la`.";

/// What a line typed at the dialog prompt asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DialogInput<'a> {
    Empty,
    Exit,
    Clear,
    Command(&'a str),
    Block(usize),
    Prompt(&'a str),
}

pub(crate) fn parse_input(line: &str) -> DialogInput<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return DialogInput::Empty;
    }
    match trimmed.to_ascii_lowercase().as_str() {
        "exit" | "quit" | "q" => return DialogInput::Exit,
        "clear" => return DialogInput::Clear,
        _ => {}
    }
    if let Some(command) = trimmed.strip_prefix('.') {
        return DialogInput::Command(command.trim());
    }
    if let Ok(n) = trimmed.parse::<usize>() {
        return DialogInput::Block(n);
    }
    DialogInput::Prompt(trimmed)
}

/// One interactive run: the chat client, the code blocks of the last reply,
/// and everything needed to execute them.
pub(crate) struct Session<S: Screen> {
    pub(crate) client: LlmClient,
    pub(crate) screen: S,
    pub(crate) recorder: Box<dyn SessionRecorder>,
    runner: Box<dyn ShellRunner>,
    interrupt: InterruptFlag,
    blocks: Vec<String>,
}

impl<S: Screen> Session<S> {
    pub(crate) fn new(
        client: LlmClient,
        screen: S,
        recorder: Box<dyn SessionRecorder>,
        runner: Box<dyn ShellRunner>,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            client,
            screen,
            recorder,
            runner,
            interrupt,
            blocks: Vec::new(),
        }
    }

    pub(crate) fn blocks(&self) -> &[String] {
        &self.blocks
    }

    /// Act on one line of input. Returns false when the user asked to leave.
    pub(crate) fn handle_line(&mut self, line: &str) -> Result<bool> {
        let input = parse_input(line);
        match input {
            DialogInput::Empty => return Ok(true),
            DialogInput::Exit => return Ok(false),
            _ => {}
        }
        self.recorder.record_user_input(line.trim());
        match input {
            DialogInput::Clear => {
                self.client.reset();
                self.blocks.clear();
                self.screen.println("Conversation cleared.");
            }
            DialogInput::Command("") => self.screen.println(EMPTY_COMMAND_HINT),
            DialogInput::Command(command) => self.run_command(None, command),
            DialogInput::Block(n) => match n.checked_sub(1).and_then(|i| self.blocks.get(i)) {
                Some(code) => {
                    let code = code.clone();
                    self.run_command(Some(n), &code);
                }
                None => self.screen.println(&format!("Code block #{n} not found.")),
            },
            DialogInput::Prompt(prompt) => self.ask(prompt)?,
            DialogInput::Empty | DialogInput::Exit => {}
        }
        Ok(true)
    }

    /// Send `prompt` and keep the reply's code blocks for execution.
    pub(crate) fn ask(&mut self, prompt: &str) -> Result<()> {
        self.interrupt.clear();
        let asked = self
            .client
            .ask_stream(prompt, &mut self.screen, self.recorder.as_mut());
        self.interrupt.clear();
        match asked {
            Ok(reply) if !reply.trim().is_empty() => {
                let (_, blocks) = extract_code_blocks(&reply);
                debug!(blocks = blocks.len(), "reply code blocks");
                self.blocks = blocks;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) if is_interrupted(&err) => {
                self.screen.warn(REQUEST_INTERRUPTED);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub(crate) fn run_command(&mut self, block: Option<usize>, code: &str) {
        print_command_header(&mut self.screen, block, code);
        self.recorder.start_command(code);
        self.interrupt.clear();

        let screen = &mut self.screen;
        let recorder = self.recorder.as_mut();
        let ran = self.runner.run_streaming(
            code,
            &mut |line: &str| {
                screen.println(line);
                recorder.record_command_chunk(&format!("{line}\n"));
            },
            &self.interrupt,
        );
        self.interrupt.clear();

        match ran {
            Ok(result) => {
                self.recorder
                    .finalize_command(result.exit_code, &result.stderr, result.interrupted);
                print_command_footer(
                    &mut self.screen,
                    result.exit_code,
                    &result.stderr,
                    result.interrupted,
                );
            }
            Err(err) => {
                warn!(error = %err, "command did not start");
                let reason = err.to_string();
                self.recorder.finalize_command(None, &reason, false);
                self.screen
                    .error(&errors::command_failed(&reason).to_string());
            }
        }
    }

    /// Print the usage report and persist the recording, if any.
    pub(crate) fn finish(&mut self) -> Result<Option<PathBuf>> {
        for line in usage_report(self.client.usage()) {
            self.screen.println(&line);
        }
        let saved = self.recorder.finish()?;
        if let Some(path) = &saved {
            self.screen
                .println(&format!("Demo session saved to {}", path.display()));
        }
        Ok(saved)
    }
}

/// Read lines until the user leaves. Ctrl+C or Ctrl+D at the prompt ends
/// the loop; during a request or a command it only cancels that operation.
pub(crate) fn run_dialog<S: Screen>(session: &mut Session<S>, history: Option<&Path>) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if let Some(path) = history
        && path.exists()
        && let Err(err) = rl.load_history(path)
    {
        debug!(error = %err, path = %path.display(), "history not loaded");
    }

    loop {
        let line = match rl.readline(INPUT_PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => break,
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        if !line.trim().is_empty() {
            let _ = rl.add_history_entry(line.as_str());
        }
        if !session.handle_line(&line)? {
            break;
        }
    }

    if let Some(path) = history
        && let Err(err) = rl.save_history(path)
    {
        warn!(error = %err, path = %path.display(), "failed to save history");
    }
    Ok(())
}
