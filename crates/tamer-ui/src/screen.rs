use crossterm::cursor::{MoveToColumn, MoveToPreviousLine};
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{self, Clear, ClearType};
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tamer_core::{InterruptFlag, Screen};
use tracing::{debug, warn};

use crate::{MarkdownRenderer, extract_code_blocks, physical_rows};

const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SPINNER_POLL: Duration = Duration::from_millis(100);
const SPINNER_JOIN_TIMEOUT: Duration = Duration::from_millis(300);

const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// ANSI output is used when stdout is a terminal and `NO_COLOR` is unset.
pub fn color_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal()
}

/// [`Screen`] backed by the process terminal.
///
/// The live region is redrawn in place: the previous render is erased by
/// moving the cursor back over the rows it occupied. When stdout is not a
/// terminal, live updates are only kept and the final text is printed once
/// at [`Screen::end_live`].
pub struct TerminalScreen {
    renderer: MarkdownRenderer,
    interactive: bool,
    label_blocks: bool,
    live: Option<LiveRegion>,
    spinner: Option<Spinner>,
}

#[derive(Default)]
struct LiveRegion {
    rows: usize,
    truncated: bool,
    text: String,
}

impl TerminalScreen {
    pub fn new(code_theme: &str) -> Self {
        let renderer = if color_enabled() {
            MarkdownRenderer::new(code_theme)
        } else {
            MarkdownRenderer::plain()
        };
        Self {
            renderer,
            interactive: io::stdout().is_terminal(),
            label_blocks: true,
            live: None,
            spinner: None,
        }
    }

    /// Show `[Block #N]` labels in live renders as soon as a fence closes.
    pub fn with_block_labels(mut self, enabled: bool) -> Self {
        self.label_blocks = enabled;
        self
    }

    fn render(&self, markdown: &str) -> Vec<String> {
        if self.label_blocks {
            self.renderer.render(&extract_code_blocks(markdown).0)
        } else {
            self.renderer.render(markdown)
        }
    }

    fn draw_live(&mut self, markdown: &str) -> io::Result<()> {
        let lines = self.render(markdown);
        let (columns, height) = terminal::size().unwrap_or((80, 24));
        let mut out = io::stdout().lock();

        let Some(live) = self.live.as_mut() else {
            return Ok(());
        };
        erase_rows(&mut out, live.rows)?;

        // Only the tail fits when the reply is taller than the terminal.
        let budget = usize::from(height.saturating_sub(1)).max(1);
        let mut start = lines.len();
        let mut rows = 0;
        while start > 0 {
            let next = physical_rows(&lines[start - 1], columns);
            if rows + next > budget {
                break;
            }
            rows += next;
            start -= 1;
        }
        for line in &lines[start..] {
            queue!(out, Print(line), Print("\r\n"))?;
        }
        out.flush()?;

        live.rows = rows;
        live.truncated = start > 0;
        live.text = markdown.to_string();
        Ok(())
    }

    fn print_lines(&self, lines: &[String]) {
        let mut out = io::stdout().lock();
        for line in lines {
            let _ = writeln!(out, "{line}");
        }
        let _ = out.flush();
    }

    fn styled(&self, color: &str, text: &str) -> String {
        if self.renderer.is_color() {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }
}

fn erase_rows(out: &mut impl Write, rows: usize) -> io::Result<()> {
    if rows == 0 {
        return Ok(());
    }
    let rows = u16::try_from(rows).unwrap_or(u16::MAX);
    queue!(out, MoveToPreviousLine(rows), Clear(ClearType::FromCursorDown))
}

impl Screen for TerminalScreen {
    fn start_status(&mut self, message: &str, interrupt: &InterruptFlag) {
        self.stop_status();
        self.spinner = Some(Spinner::start(message, interrupt.clone(), self.interactive));
    }

    fn set_status(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.as_ref() {
            spinner.set_message(message);
        }
    }

    fn stop_status(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop();
        }
    }

    fn begin_live(&mut self) {
        self.stop_status();
        self.live = Some(LiveRegion::default());
    }

    fn update_live(&mut self, markdown: &str) {
        if !self.interactive {
            if let Some(live) = self.live.as_mut() {
                live.text = markdown.to_string();
            }
            return;
        }
        if let Err(err) = self.draw_live(markdown) {
            debug!(error = %err, "live redraw failed");
        }
    }

    fn end_live(&mut self) {
        let Some(live) = self.live.take() else {
            return;
        };
        if !self.interactive {
            let lines = self.render(&live.text);
            self.print_lines(&lines);
            return;
        }
        if live.truncated {
            let mut out = io::stdout().lock();
            let _ = erase_rows(&mut out, live.rows);
            let _ = out.flush();
            drop(out);
            let lines = self.render(&live.text);
            self.print_lines(&lines);
        }
    }

    fn print(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = write!(out, "{text}");
        let _ = out.flush();
    }

    fn println(&mut self, text: &str) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{text}");
    }

    fn print_markdown(&mut self, markdown: &str) {
        let lines = self.renderer.render(markdown);
        self.print_lines(&lines);
    }

    fn warn(&mut self, message: &str) {
        self.stop_status();
        let _ = writeln!(io::stderr(), "{}", self.styled(YELLOW, message));
    }

    fn error(&mut self, message: &str) {
        self.stop_status();
        let _ = writeln!(io::stderr(), "{}", self.styled(RED, message));
    }
}

impl Drop for TerminalScreen {
    fn drop(&mut self) {
        self.stop_status();
    }
}

/// Status line animated by a worker thread. The thread exits when stopped
/// or when the interrupt flag is raised, whichever happens first.
struct Spinner {
    stop: Arc<AtomicBool>,
    message: Arc<Mutex<String>>,
    done_rx: mpsc::Receiver<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Spinner {
    fn start(message: &str, interrupt: InterruptFlag, draw: bool) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let message = Arc::new(Mutex::new(message.to_string()));
        let (done_tx, done_rx) = mpsc::channel();
        let thread_stop = Arc::clone(&stop);
        let thread_message = Arc::clone(&message);
        let handle = thread::spawn(move || {
            let mut frame = 0usize;
            while !thread_stop.load(Ordering::Relaxed) && !interrupt.is_set() {
                if draw {
                    let text = thread_message
                        .lock()
                        .map(|m| m.clone())
                        .unwrap_or_default();
                    let glyph = SPINNER_FRAMES[frame % SPINNER_FRAMES.len()];
                    let mut out = io::stdout().lock();
                    let _ = queue!(
                        out,
                        MoveToColumn(0),
                        Clear(ClearType::CurrentLine),
                        Print(format!("{glyph} {text}"))
                    );
                    let _ = out.flush();
                }
                frame = frame.wrapping_add(1);
                thread::sleep(SPINNER_POLL);
            }
            if draw {
                let mut out = io::stdout().lock();
                let _ = queue!(out, MoveToColumn(0), Clear(ClearType::CurrentLine));
                let _ = out.flush();
            }
            let _ = done_tx.send(());
        });
        Self {
            stop,
            message,
            done_rx,
            handle: Some(handle),
        }
    }

    fn set_message(&self, message: &str) {
        if let Ok(mut current) = self.message.lock() {
            *current = message.to_string();
        }
    }

    fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        match self.done_rx.recv_timeout(SPINNER_JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("status spinner did not stop in time");
            }
        }
    }
}
