use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

fn shell_name(shell: &str) -> &str {
    Path::new(shell)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(shell)
}

/// Run `command` through `shell`, inheriting the terminal.
pub(crate) fn execute(command: &str, shell: &str) -> Result<ExitStatus> {
    let flag = if shell_name(shell).eq_ignore_ascii_case("cmd.exe") {
        "/C"
    } else {
        "-c"
    };
    Command::new(shell)
        .arg(flag)
        .arg(command)
        .status()
        .with_context(|| format!("failed to start {shell}"))
}

/// History file the user's shell reads back, if we know it.
pub(crate) fn history_file(shell: &str, home: &Path) -> Option<PathBuf> {
    match shell_name(shell) {
        "bash" | "sh" => Some(home.join(".bash_history")),
        "zsh" => Some(home.join(".zsh_history")),
        _ => None,
    }
}

/// Append one command line to `path`, creating the file if needed.
pub(crate) fn append_history(path: &Path, command: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(f, "{}", command.trim_end())?;
    Ok(())
}
