use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) const EXIT_INTERRUPTED: u8 = 130;

/// Process-wide SIGINT state.
///
/// While `reading` is set the process is parked on stdin with everything
/// already saved, so a SIGINT exits 130 at once. Otherwise the first SIGINT
/// only raises the flag and the caller stops at its next check; a second one
/// exits at once.
#[derive(Clone, Default)]
pub(crate) struct Interrupt {
    raised: Arc<AtomicBool>,
    reading: Arc<AtomicBool>,
}

impl Interrupt {
    pub(crate) fn install() -> Result<Self> {
        let interrupt = Self::default();
        #[cfg(unix)]
        {
            use signal_hook::consts::SIGINT;
            use signal_hook::flag;
            let code = i32::from(EXIT_INTERRUPTED);
            // Actions run in registration order: both shutdowns see the
            // flags as they were before this signal raised `raised`.
            flag::register_conditional_shutdown(SIGINT, code, Arc::clone(&interrupt.raised))?;
            flag::register_conditional_shutdown(SIGINT, code, Arc::clone(&interrupt.reading))?;
            flag::register(SIGINT, Arc::clone(&interrupt.raised))?;
        }
        Ok(interrupt)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.raised)
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Run a blocking terminal read during which SIGINT exits immediately.
    pub(crate) fn while_reading<T>(&self, read: impl FnOnce() -> T) -> T {
        self.reading.store(true, Ordering::SeqCst);
        let out = read();
        self.reading.store(false, Ordering::SeqCst);
        out
    }
}
