use crate::interrupt::Interrupt;
use aicmd_agent::highlight::{GREEN_BOLD, RESET};
use aicmd_agent::{Candidate, ChatIo, Prompter};
use aicmd_core::AicmdError;
use anyhow::Result;
use std::io::{self, BufRead, Write};

/// Read one line from stdin. `None` at end of input.
fn read_stdin_line() -> Result<Option<String>> {
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn ask(question: &str, interrupt: &Interrupt) -> Result<Option<String>> {
    if interrupt.is_raised() {
        return Err(AicmdError::Interrupted.into());
    }
    print!("{question}");
    io::stdout().flush()?;
    interrupt.while_reading(read_stdin_line)
}

/// Interactive prompts on stdin/stdout. A quiet prompter shows nothing, so
/// stdout carries only the JSON outcome.
pub(crate) struct TerminalPrompter {
    color: bool,
    quiet: bool,
    interrupt: Interrupt,
}

impl TerminalPrompter {
    pub(crate) fn new(color: bool, interrupt: Interrupt) -> Self {
        Self {
            color,
            quiet: false,
            interrupt,
        }
    }

    pub(crate) fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    fn paint(&self, command: &str) -> String {
        if self.color {
            format!("{GREEN_BOLD}{command}{RESET}")
        } else {
            command.to_string()
        }
    }
}

impl Prompter for TerminalPrompter {
    fn show_command(&mut self, command: &str) {
        if self.quiet {
            return;
        }
        println!("AI wants to execute\n{}\n", self.paint(command));
    }

    fn show_explanation(&mut self, explanation: &str) {
        if self.quiet {
            return;
        }
        println!("{explanation}\n");
    }

    fn confirm(&mut self, _command: &str) -> Result<String> {
        ask("Do you want to execute this command? [Y/n] ", &self.interrupt)?
            .ok_or_else(|| AicmdError::Aborted("no answer on stdin".to_string()).into())
    }

    fn show_candidates(&mut self, candidates: &[Candidate]) {
        if self.quiet {
            return;
        }
        println!("Alternatives:");
        for (index, candidate) in candidates.iter().enumerate() {
            println!("  {index}: {}", self.paint(&candidate.command));
            if let Some(explanation) = &candidate.explanation {
                for line in explanation.lines() {
                    println!("       {line}");
                }
            }
        }
    }

    fn choose(&mut self, count: usize) -> Result<String> {
        let question = format!("Pick a command [0-{}]: ", count.saturating_sub(1));
        Ok(ask(&question, &self.interrupt)?.unwrap_or_default())
    }
}

/// Chat prompt on stdin/stdout.
pub(crate) struct TerminalChat {
    interrupt: Interrupt,
}

impl TerminalChat {
    pub(crate) fn new(interrupt: Interrupt) -> Self {
        Self { interrupt }
    }
}

impl ChatIo for TerminalChat {
    fn read_line(&mut self) -> Result<Option<String>> {
        ask("> ", &self.interrupt)
    }

    fn show_reply(&mut self, reply: &str) {
        println!("{reply}\n");
    }
}
