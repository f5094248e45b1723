use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tamer_core::{AppConfig, InterruptFlag, Screen, config_dir, demo_dir, history_path};
use tamer_demo::{DemoPlayer, DemoSession, create_recorder, last_recording};
use tamer_errors::{ErrorHandler, errors};
use tamer_llm::LlmClient;
use tamer_observe::{LogOptions, init_logging, init_stderr_logging};
use tamer_tools::PlatformShellRunner;
use tamer_ui::TerminalScreen;
use tracing::{debug, info};

mod dialog;
mod output;

use dialog::{Session, run_dialog};
use output::{model_lines, print_json, redact_config_for_display};

#[derive(Parser)]
#[command(name = "tamer", version)]
#[command(about = "Terminal AI assistant for sysadmins", long_about = None)]
struct Cli {
    /// Prompt for a single query. Without one, the dialog starts.
    prompt: Vec<String>,

    /// Interactive dialog; follows the single query when a prompt is given.
    #[arg(short = 'd', long)]
    dialog: bool,

    /// Print the effective configuration with API keys redacted.
    #[arg(long)]
    settings: bool,

    /// List the models offered by the current provider.
    #[arg(long, value_name = "FILTER")]
    models: Option<Option<String>>,

    /// Record this session for later playback.
    #[arg(long)]
    demo_record: bool,

    /// Replay a recorded session; the latest one when FILE is omitted.
    #[arg(long, value_name = "FILE")]
    demo_play: Option<Option<PathBuf>>,

    /// Debug logging, including request payloads.
    #[arg(long)]
    debug: bool,

    /// Mirror log output on stderr.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", ErrorHandler::new().handle(&err));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let cwd = std::env::current_dir()?;
    let mut cfg = AppConfig::ensure(&cwd)?;
    if cli.debug {
        cfg.ui.debug = true;
    }
    let config_dir = config_dir();
    setup_logging(
        config_dir.as_deref(),
        LogOptions {
            verbose: cli.verbose,
            debug: cfg.ui.debug,
        },
    );

    let interrupt = InterruptFlag::new();
    install_interrupt_handler(&interrupt)?;

    if cli.settings {
        print_json(&redact_config_for_display(&cfg)?)?;
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(filter) = &cli.models {
        let client = LlmClient::new(&cfg, interrupt)?;
        let models = client.fetch_models(filter.as_deref());
        if models.is_empty() {
            eprintln!("No models found.");
        }
        for line in model_lines(&models) {
            println!("{line}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(file) = &cli.demo_play {
        return play_demo(&cfg, file.as_deref(), config_dir.as_deref(), interrupt);
    }

    let recordings = config_dir
        .as_deref()
        .map(demo_dir)
        .unwrap_or_else(|| cwd.join("demo"));
    let recorder = create_recorder(cli.demo_record, &recordings)?;
    let client = LlmClient::new(&cfg, interrupt.clone())?;
    info!(provider = %cfg.current_llm, model = client.model(), "session started");

    let screen = TerminalScreen::new(&cfg.ui.code_theme);
    let mut session = Session::new(
        client,
        screen,
        recorder,
        Box::new(PlatformShellRunner::in_dir(&cwd)),
        interrupt,
    );

    let prompt = cli.prompt.join(" ");
    let single = !prompt.trim().is_empty();
    if single {
        session.recorder.record_user_input(prompt.trim());
        session.ask(prompt.trim())?;
    }
    if cli.dialog || !single {
        let history = config_dir.as_deref().map(history_path);
        run_dialog(&mut session, history.as_deref())?;
    }
    session.finish()?;
    Ok(ExitCode::SUCCESS)
}

fn play_demo(
    cfg: &AppConfig,
    file: Option<&Path>,
    config_dir: Option<&Path>,
    interrupt: InterruptFlag,
) -> Result<ExitCode> {
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => {
            let dir = config_dir.map(demo_dir);
            match dir.as_deref().and_then(last_recording) {
                Some(path) => path,
                None => {
                    let shown = dir
                        .as_deref()
                        .map(|d| d.display().to_string())
                        .unwrap_or_else(|| "the demo directory".to_string());
                    eprintln!("{}", errors::no_recordings(&shown));
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    };

    let session = match DemoSession::load(&path) {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{}", ErrorHandler::new().handle(&err));
            return Ok(ExitCode::FAILURE);
        }
    };
    debug!(path = %path.display(), "playing demo session");

    let mut screen = TerminalScreen::new(&cfg.ui.code_theme);
    let summary = DemoPlayer::new(&mut screen, cfg.demo.clone(), interrupt)?.play(&session);
    if summary.stopped {
        screen.warn("Demo playback stopped.");
    }
    Ok(ExitCode::SUCCESS)
}

/// File logging under the config directory, falling back to stderr.
fn setup_logging(config_dir: Option<&Path>, options: LogOptions) {
    let Some(dir) = config_dir else {
        init_stderr_logging(options);
        return;
    };
    if let Err(err) = init_logging(dir, options) {
        init_stderr_logging(options);
        tracing::warn!(error = %err, "file logging disabled");
    }
}

/// Ctrl+C raises `interrupt`; a second Ctrl+C before it is cleared exits.
#[cfg(unix)]
fn install_interrupt_handler(interrupt: &InterruptFlag) -> Result<()> {
    use signal_hook::consts::SIGINT;

    signal_hook::flag::register_conditional_shutdown(SIGINT, 130, interrupt.handle())?;
    signal_hook::flag::register(SIGINT, interrupt.handle())?;
    Ok(())
}

#[cfg(not(unix))]
fn install_interrupt_handler(_interrupt: &InterruptFlag) -> Result<()> {
    Ok(())
}
