use anyhow::Result;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::Duration;
use tamer_core::{InterruptFlag, PlaybackConfig, Screen};
use tamer_ui::command_view::{print_command_footer, print_command_header};
use tracing::{debug, info};

use crate::session::{CommandEvent, DemoEvent, DemoSession};

pub const INPUT_PROMPT: &str = ">>> ";

/// Weights for output chunk sizes 1..=10 characters.
const CHUNK_SIZE_WEIGHTS: [u32; 10] = [30, 20, 15, 10, 8, 6, 4, 3, 2, 2];

/// Delay regimes between output chunks: (weight, min seconds, max seconds).
const DELAY_REGIMES: [(u32, f64, f64); 4] = [
    (60, 0.005, 0.02), // fast
    (30, 0.02, 0.06),  // normal
    (8, 0.06, 0.15),   // slow
    (2, 0.2, 0.5),     // pause
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackSummary {
    pub events_played: usize,
    pub stopped: bool,
}

/// Replays a [`DemoSession`] onto a screen with synthesized typing and
/// streaming cadence. Recorded command output keeps its original timing.
pub struct DemoPlayer<'a> {
    screen: &'a mut dyn Screen,
    config: PlaybackConfig,
    stop: InterruptFlag,
    rng: StdRng,
    chunk_sizes: WeightedIndex<u32>,
    regimes: WeightedIndex<u32>,
}

impl<'a> DemoPlayer<'a> {
    pub fn new(screen: &'a mut dyn Screen, config: PlaybackConfig, stop: InterruptFlag) -> Result<Self> {
        Ok(Self {
            screen,
            config,
            stop,
            rng: StdRng::from_entropy(),
            chunk_sizes: WeightedIndex::new(CHUNK_SIZE_WEIGHTS)?,
            regimes: WeightedIndex::new(DELAY_REGIMES.iter().map(|(w, _, _)| *w))?,
        })
    }

    /// Fixed random sequence, for reproducible replays.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Play every event in order. The stop flag is checked between events;
    /// an event that has started always runs to completion.
    pub fn play(&mut self, session: &DemoSession) -> PlaybackSummary {
        info!(events = session.events.len(), version = %session.version, "demo playback");
        let mut summary = PlaybackSummary::default();
        for event in &session.events {
            if self.stop.is_set() {
                summary.stopped = true;
                break;
            }
            match event {
                DemoEvent::Input { text } => self.play_input(text),
                DemoEvent::Output { text } => self.play_output(text),
                DemoEvent::Command(cmd) => self.play_command(cmd),
            }
            summary.events_played += 1;
        }
        if summary.stopped {
            debug!(played = summary.events_played, "demo playback stopped");
        }
        summary
    }

    fn play_input(&mut self, text: &str) {
        self.screen.print(INPUT_PROMPT);
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            self.screen.print(ch.encode_utf8(&mut buf));
            let jitter = if self.config.typing_delay_variance > 0.0 {
                let v = self.config.typing_delay_variance;
                self.rng.gen_range(-v..=v)
            } else {
                0.0
            };
            sleep_secs(self.config.typing_delay_per_char + jitter);
        }
        self.screen.println("");
        sleep_secs(self.config.pause_after_input);
    }

    fn play_output(&mut self, text: &str) {
        if self.config.output_delay > 0.0 {
            self.screen.start_status("AI thinking...", &self.stop);
            sleep_secs(self.config.output_delay);
            self.screen.stop_status();
        }

        self.screen.begin_live();
        let chars: Vec<char> = text.chars().collect();
        let mut shown = String::with_capacity(text.len());
        let mut pos = 0;
        while pos < chars.len() {
            let size = self.chunk_sizes.sample(&mut self.rng) + 1;
            let end = (pos + size).min(chars.len());
            shown.extend(&chars[pos..end]);
            pos = end;
            self.screen.update_live(&shown);
            sleep_secs(self.chunk_delay() * self.config.chunk_delay_scale);
        }
        self.screen.end_live();
        self.screen.println("");
    }

    fn chunk_delay(&mut self) -> f64 {
        let (_, min, max) = DELAY_REGIMES[self.regimes.sample(&mut self.rng)];
        self.rng.gen_range(min..=max)
    }

    fn play_command(&mut self, cmd: &CommandEvent) {
        print_command_header(self.screen, None, &cmd.command);
        if cmd.chunks.is_empty() {
            if let Some(output) = cmd.output.as_deref().filter(|o| !o.is_empty()) {
                self.screen.println(output.trim_end_matches('\n'));
            }
        } else {
            let instant = self.config.chunk_delay_scale <= 0.0;
            let mut previous = 0.0;
            for chunk in &cmd.chunks {
                if !instant {
                    sleep_secs(chunk.delay - previous);
                }
                previous = chunk.delay;
                self.screen.print(&chunk.text);
            }
        }
        print_command_footer(
            self.screen,
            cmd.exit_code,
            cmd.stderr.as_deref().unwrap_or(""),
            cmd.interrupted,
        );
        self.screen.println("");
    }
}

fn sleep_secs(seconds: f64) {
    if seconds.is_finite() && seconds > 0.0 {
        thread::sleep(Duration::from_secs_f64(seconds));
    }
}
