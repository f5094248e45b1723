mod code_blocks;
pub mod command_view;
mod markdown;
mod screen;

pub use code_blocks::{block_label, extract_code_blocks, is_block_label};
pub use markdown::{DEFAULT_CODE_THEME, MarkdownRenderer, render_inline};
pub use screen::{TerminalScreen, color_enabled};

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_width::UnicodeWidthStr;

static ANSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("ansi regex"));

pub fn strip_ansi(text: &str) -> String {
    ANSI.replace_all(text, "").into_owned()
}

/// Terminal rows taken by `line` when wrapped at `columns`.
pub fn physical_rows(line: &str, columns: u16) -> usize {
    let width = UnicodeWidthStr::width(strip_ansi(line).as_str());
    let columns = usize::from(columns.max(1));
    width.div_ceil(columns).max(1)
}
