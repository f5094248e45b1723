//! Headers and footers printed around a shell command, shared by live
//! execution and demo playback so both look the same.

use tamer_core::Screen;

pub const RESULT_MARKER: &str = ">>> Result:";
pub const INTERRUPTED_MARKER: &str = ">>> Command interrupted by user (Ctrl+C)";

pub fn print_command_header(screen: &mut dyn Screen, block: Option<usize>, command: &str) {
    match block {
        Some(n) => screen.println(&format!(">>> Running block #{n}:")),
        None => screen.println(">>> Running:"),
    }
    screen.print_markdown(&format!("```bash\n{}\n```", command.trim_end()));
    screen.println(RESULT_MARKER);
}

pub fn print_command_footer(
    screen: &mut dyn Screen,
    exit_code: Option<i32>,
    stderr: &str,
    interrupted: bool,
) {
    if interrupted {
        screen.warn(INTERRUPTED_MARKER);
    }
    if let Some(code) = exit_code {
        screen.println(&format!(">>> Exit code: {code}"));
    }
    if !stderr.trim().is_empty() {
        screen.println(">>> Error:");
        screen.println(stderr.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tamer_testkit::{RecordingScreen, ScreenEvent};

    #[test]
    fn header_names_the_block_and_shows_code() {
        let mut screen = RecordingScreen::new();
        print_command_header(&mut screen, Some(2), "ls -la\n");
        assert_eq!(
            screen.events(),
            vec![
                ScreenEvent::Println(">>> Running block #2:".to_string()),
                ScreenEvent::Markdown("```bash\nls -la\n```".to_string()),
                ScreenEvent::Println(RESULT_MARKER.to_string()),
            ]
        );
    }

    #[test]
    fn footer_reports_interrupt_exit_code_and_stderr() {
        let mut screen = RecordingScreen::new();
        print_command_footer(&mut screen, Some(130), "boom\n", true);
        assert_eq!(screen.warnings(), vec![INTERRUPTED_MARKER.to_string()]);
        let output = screen.output();
        assert!(output.contains(">>> Exit code: 130"));
        assert!(output.contains(">>> Error:\nboom"));
    }

    #[test]
    fn footer_skips_empty_stderr() {
        let mut screen = RecordingScreen::new();
        print_command_footer(&mut screen, Some(0), "  \n", false);
        assert_eq!(
            screen.events(),
            vec![ScreenEvent::Println(">>> Exit code: 0".to_string())]
        );
    }
}
