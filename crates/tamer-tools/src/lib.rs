mod shell;

pub use shell::{PlatformShellRunner, ShellError, ShellRunResult, ShellRunner};
