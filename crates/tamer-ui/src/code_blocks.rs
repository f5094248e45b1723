use once_cell::sync::Lazy;
use regex::Regex;

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```([^\n`]*)\n(.*?)```").expect("fence regex")
});

static LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?:Block|Code) #\d+\]$").expect("label regex")
});

/// True for a line holding only a block label such as `[Block #3]`. The
/// `[Code #N]` form is what the model writes when asked to number its blocks.
pub fn is_block_label(line: &str) -> bool {
    LABEL.is_match(line.trim())
}

pub fn block_label(index: usize) -> String {
    format!("[Block #{index}]")
}

/// Number the fenced code regions of one reply.
///
/// Returns the text with a `[Block #N]` line directly before every fence and
/// the raw contents of the fences in order, trailing newlines removed.
/// Numbering starts at 1 on every call. A label the model already wrote on
/// the line before a fence is replaced rather than doubled.
pub fn extract_code_blocks(text: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len() + 32);
    let mut blocks = Vec::new();
    let mut last = 0;

    for caps in FENCE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let code = caps.get(2).map_or("", |m| m.as_str());
        blocks.push(code.trim_end_matches(['\n', '\r']).to_string());

        let mut before = &text[last..whole.start()];
        if let Some(body) = before.trim_end_matches([' ', '\t']).strip_suffix('\n') {
            let (head, line) = match body.rsplit_once('\n') {
                Some((head, line)) => (&before[..head.len() + 1], line),
                None => ("", body),
            };
            if is_block_label(line) {
                before = head;
            }
        }
        out.push_str(before);
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&block_label(blocks.len()));
        out.push('\n');
        out.push_str(whole.as_str());

        last = whole.end();
        if !text[last..].is_empty() && !text[last..].starts_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(&text[last..]);
    (out, blocks)
}
