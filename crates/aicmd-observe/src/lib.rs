use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Append-only event log shared by every component of one invocation.
///
/// Lines go to `observe.log` in the state directory. Verbose lines are echoed
/// to stderr only when verbose mode is on; warnings always are.
#[derive(Debug)]
pub struct Observer {
    log_path: Option<PathBuf>,
    verbose: AtomicBool,
}

impl Observer {
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        Ok(Self {
            log_path: Some(state_dir.join(aicmd_core::LOG_FILE)),
            verbose: AtomicBool::new(false),
        })
    }

    /// An observer that writes nowhere. Used by tests and `--json` probes.
    pub fn silent() -> Self {
        Self {
            log_path: None,
            verbose: AtomicBool::new(false),
        }
    }

    pub fn set_verbose(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Record a structured event line, e.g. `record("CACHE_HIT", "op=generate_command")`.
    pub fn record(&self, kind: &str, detail: &str) {
        let _ = self.append_log_line(&format!("{} {kind} {detail}", Utc::now().to_rfc3339()));
        self.verbose_log(&format!("{kind} {detail}"));
    }

    /// Log a message to stderr with `[aicmd]` prefix when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.is_verbose() {
            eprintln!("[aicmd] {msg}");
        }
    }

    /// Log a warning to the log file and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[aicmd WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
