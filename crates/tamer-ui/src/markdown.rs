//! Markdown-to-ANSI rendering for assistant replies.
//!
//! The renderer always works on the full accumulated reply so that markup
//! that was incomplete in an earlier frame (an unterminated `**`, an open
//! fence) is drawn correctly once the rest of it arrives.

use std::sync::OnceLock;
use syntect::easy::HighlightLines;
use syntect::highlighting::{Theme, ThemeSet};
use syntect::parsing::SyntaxSet;
use syntect::util::as_24_bit_terminal_escaped;

use crate::code_blocks::is_block_label;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const ITALIC: &str = "\x1b[3m";
const UNDERLINE: &str = "\x1b[4m";
const STRIKE: &str = "\x1b[9m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const WHITE: &str = "\x1b[37m";
const GRAY: &str = "\x1b[90m";
const BG_GRAY: &str = "\x1b[48;5;236m";

pub const DEFAULT_CODE_THEME: &str = "base16-ocean.dark";

struct SyntectAssets {
    syntax_set: SyntaxSet,
    theme_set: ThemeSet,
}

fn syntect_assets() -> &'static SyntectAssets {
    static ASSETS: OnceLock<SyntectAssets> = OnceLock::new();
    ASSETS.get_or_init(|| SyntectAssets {
        syntax_set: SyntaxSet::load_defaults_nonewlines(),
        theme_set: ThemeSet::load_defaults(),
    })
}

fn theme(name: &str) -> Option<&'static Theme> {
    let themes = &syntect_assets().theme_set.themes;
    themes
        .get(name)
        .or_else(|| themes.get(DEFAULT_CODE_THEME))
        .or_else(|| themes.values().next())
}

/// Renders markdown text to terminal lines.
#[derive(Debug, Clone)]
pub struct MarkdownRenderer {
    theme: String,
    color: bool,
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_THEME)
    }
}

impl MarkdownRenderer {
    pub fn new(theme: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            color: true,
        }
    }

    /// Renderer that returns the source lines untouched (pipes, `NO_COLOR`).
    pub fn plain() -> Self {
        Self {
            theme: DEFAULT_CODE_THEME.to_string(),
            color: false,
        }
    }

    pub fn is_color(&self) -> bool {
        self.color
    }

    pub fn render(&self, text: &str) -> Vec<String> {
        if !self.color {
            return text.split('\n').map(ToString::to_string).collect();
        }
        let mut state = RenderState::new(theme(&self.theme));
        for line in text.split('\n') {
            state.line(line);
        }
        state.out
    }
}

struct RenderState {
    out: Vec<String>,
    theme: Option<&'static Theme>,
    code: Option<CodeFence>,
}

struct CodeFence {
    highlighter: Option<HighlightLines<'static>>,
}

impl RenderState {
    fn new(theme: Option<&'static Theme>) -> Self {
        Self {
            out: Vec::new(),
            theme,
            code: None,
        }
    }

    fn line(&mut self, line: &str) {
        if self.code.is_some() {
            self.code_line(line);
        } else {
            self.text_line(line);
        }
    }

    fn code_line(&mut self, line: &str) {
        if let Some(after) = line.trim_start().strip_prefix("```") {
            self.code = None;
            self.out.push(format!("  {DIM}{GRAY}└────────{RESET}"));
            let after = after.trim();
            if !after.is_empty() {
                self.text_line(after);
            }
            return;
        }
        let highlighted = self
            .code
            .as_mut()
            .and_then(|fence| fence.highlighter.as_mut())
            .and_then(|h| h.highlight_line(line, &syntect_assets().syntax_set).ok())
            .map(|ranges| format!("{}{RESET}", as_24_bit_terminal_escaped(&ranges, false)));
        let body = highlighted.unwrap_or_else(|| format!("{WHITE}{line}{RESET}"));
        self.out.push(format!("  {DIM}{GRAY}│{RESET} {body}"));
    }

    fn open_fence(&mut self, info: &str) {
        let lang = info.split_whitespace().next().unwrap_or("");
        let assets = syntect_assets();
        let syntax = if lang.is_empty() {
            None
        } else {
            assets
                .syntax_set
                .find_syntax_by_token(lang)
                .or_else(|| assets.syntax_set.find_syntax_by_extension(lang))
        };
        let highlighter = match (syntax, self.theme) {
            (Some(syntax), Some(theme)) => Some(HighlightLines::new(syntax, theme)),
            _ => None,
        };
        let label = if lang.is_empty() {
            String::new()
        } else {
            format!(" {lang}")
        };
        self.out.push(format!("  {DIM}{GRAY}┌──{label}──{RESET}"));
        self.code = Some(CodeFence { highlighter });
    }

    fn text_line(&mut self, line: &str) {
        let trimmed = line.trim_start();
        if let Some(info) = trimmed.strip_prefix("```") {
            self.open_fence(info.trim());
            return;
        }
        // A fence opened mid-line: "run this ```bash"
        if let Some(pos) = line.find("```") {
            let (before, fence) = line.split_at(pos);
            if !fence[3..].contains('`') {
                self.text_line(before.trim_end());
                self.open_fence(fence[3..].trim());
                return;
            }
        }

        if is_block_label(trimmed) {
            self.out.push(format!("{BOLD}{YELLOW}{}{RESET}", trimmed.trim()));
            return;
        }

        if matches!(trimmed.trim_end(), "---" | "***" | "___") {
            self.out.push(format!("  {GRAY}{}{RESET}", "─".repeat(40)));
            return;
        }

        if let Some((level, heading)) = heading(line) {
            let styled = render_inline(heading);
            match level {
                1 => self.out.push(format!("  {BOLD}{CYAN}{UNDERLINE}{styled}{RESET}")),
                2 => self.out.push(format!("  {BOLD}{CYAN}{styled}{RESET}")),
                3 => self.out.push(format!("  {CYAN}{styled}{RESET}")),
                _ => self.out.push(format!("  {BOLD}{WHITE}{styled}{RESET}")),
            }
            return;
        }

        if let Some(quote) = line.strip_prefix("> ") {
            self.out
                .push(format!("  {GRAY}│{RESET} {DIM}{}{RESET}", render_inline(quote)));
            return;
        }

        let indent = line.len() - trimmed.len();
        if let Some(rest) = trimmed
            .strip_prefix("- [ ] ")
            .or_else(|| trimmed.strip_prefix("* [ ] "))
        {
            self.out.push(format!(
                "  {}{GRAY}☐{RESET} {}",
                " ".repeat(indent),
                render_inline(rest)
            ));
            return;
        }
        if let Some(rest) = ["- [x] ", "* [x] ", "- [X] ", "* [X] "]
            .iter()
            .find_map(|marker| trimmed.strip_prefix(marker))
        {
            self.out.push(format!(
                "  {}{GREEN}☑{RESET} {DIM}{}{RESET}",
                " ".repeat(indent),
                render_inline(rest)
            ));
            return;
        }
        if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| trimmed.strip_prefix("* "))
        {
            let bullet = if indent >= 2 { '◦' } else { '•' };
            self.out.push(format!(
                "  {}{CYAN}{bullet}{RESET} {}",
                " ".repeat(indent),
                render_inline(item)
            ));
            return;
        }
        if let Some(dot) = trimmed.find(". ")
            && dot > 0
            && dot <= 4
            && trimmed[..dot].chars().all(|c| c.is_ascii_digit())
        {
            let (num, item) = trimmed.split_at(dot + 2);
            self.out.push(format!(
                "  {}{CYAN}{num}{RESET}{}",
                " ".repeat(indent),
                render_inline(item)
            ));
            return;
        }

        let row = trimmed.trim_end();
        if let Some(inner) = row.strip_prefix('|').and_then(|r| r.strip_suffix('|')) {
            if inner.chars().all(|c| matches!(c, '-' | '|' | ':' | ' ')) {
                self.out.push(format!("  {GRAY}{row}{RESET}"));
            } else {
                let mut out = format!("  {GRAY}│{RESET}");
                for cell in inner.split('|') {
                    out.push_str(&format!(" {} {GRAY}│{RESET}", render_inline(cell.trim())));
                }
                self.out.push(out);
            }
            return;
        }

        if line.trim().is_empty() {
            self.out.push(String::new());
            return;
        }

        self.out.push(format!("  {}", render_inline(line)));
    }
}

fn heading(line: &str) -> Option<(usize, &str)> {
    if !line.starts_with('#') || line.starts_with("#!") {
        return None;
    }
    let rest = line.trim_start_matches('#');
    let level = line.len() - rest.len();
    let text = rest.strip_prefix(' ')?;
    (level <= 6 && !text.is_empty()).then_some((level, text))
}

/// Inline emphasis, strike-through and code spans.
pub fn render_inline(text: &str) -> String {
    const SPANS: [(&str, &str); 7] = [
        ("***", "\x1b[1m\x1b[3m"),
        ("**", BOLD),
        ("__", BOLD),
        ("~~", STRIKE),
        ("*", ITALIC),
        ("_", ITALIC),
        ("`", ""),
    ];

    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 32);
    let mut i = 0;
    'outer: while i < chars.len() {
        for (delim, style) in SPANS {
            let delim: Vec<char> = delim.chars().collect();
            if !starts_with_at(&chars, i, &delim) {
                continue;
            }
            // snake_case identifiers are not emphasis
            if delim[0] == '_' && i > 0 && chars[i - 1].is_alphanumeric() {
                continue;
            }
            let start = i + delim.len();
            let Some(end) = find_closing(&chars, start, &delim) else {
                continue;
            };
            if end == start {
                continue;
            }
            let inner: String = chars[start..end].iter().collect();
            if delim == ['`'] {
                out.push_str(&format!("{BG_GRAY}{YELLOW} {inner} {RESET}"));
            } else {
                out.push_str(&format!("{style}{inner}{RESET}"));
            }
            i = end + delim.len();
            continue 'outer;
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn starts_with_at(chars: &[char], at: usize, delim: &[char]) -> bool {
    chars.get(at..at + delim.len()) == Some(delim)
}

fn find_closing(chars: &[char], start: usize, delim: &[char]) -> Option<usize> {
    (start..chars.len()).find(|&i| starts_with_at(chars, i, delim))
}
