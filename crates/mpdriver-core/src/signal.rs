//! SIGINT observation.
//!
//! The handler registered through `signal-hook` only raises a flag.
//! Threads polling [`SigintWatch::fired`] fold that flag into a counter,
//! so every watch created before a signal sees it, however many watches
//! there are.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

static PENDING: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(false)));

static SIGINT_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of SIGINTs observed since the process started.
///
/// Signals arriving between two observations are counted once.
pub fn sigint_count() -> u64 {
    if PENDING.swap(false, Ordering::SeqCst) {
        SIGINT_COUNT.fetch_add(1, Ordering::SeqCst);
    }
    SIGINT_COUNT.load(Ordering::SeqCst)
}

/// Detects SIGINTs delivered after it was created.
#[derive(Debug, Clone, Copy)]
pub struct SigintWatch {
    baseline: u64,
}

impl SigintWatch {
    pub fn new() -> Self {
        Self {
            baseline: sigint_count(),
        }
    }

    pub fn fired(&self) -> bool {
        sigint_count() != self.baseline
    }
}

impl Default for SigintWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
mod imp {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, LazyLock};

    use parking_lot::Mutex;
    use signal_hook::consts::SIGINT;
    use signal_hook::flag;

    use super::PENDING;

    /// While set, SIGINT terminates the process as if no handler existed.
    static RELEASED: LazyLock<Arc<AtomicBool>> = LazyLock::new(|| Arc::new(AtomicBool::new(true)));

    struct Installed {
        guards: usize,
        registered: bool,
    }

    static INSTALLED: Mutex<Installed> = parking_lot::const_mutex(Installed {
        guards: 0,
        registered: false,
    });

    /// Keeps SIGINT from terminating the process while alive.
    ///
    /// Guards nest. The handlers are registered on first use and stay
    /// registered; once the last guard drops, SIGINT takes its default
    /// action again.
    pub struct SigintGuard {
        _private: (),
    }

    impl SigintGuard {
        pub fn install() -> std::io::Result<Self> {
            let mut installed = INSTALLED.lock();
            if !installed.registered {
                flag::register(SIGINT, Arc::clone(&PENDING))?;
                flag::register_conditional_default(SIGINT, Arc::clone(&RELEASED))?;
                installed.registered = true;
                tracing::debug!("SIGINT handler registered");
            }
            if installed.guards == 0 {
                RELEASED.store(false, Ordering::SeqCst);
            }
            installed.guards += 1;
            Ok(Self { _private: () })
        }
    }

    impl Drop for SigintGuard {
        fn drop(&mut self) {
            let mut installed = INSTALLED.lock();
            installed.guards = installed.guards.saturating_sub(1);
            if installed.guards == 0 {
                RELEASED.store(true, Ordering::SeqCst);
                tracing::debug!("SIGINT default action restored");
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    pub struct SigintGuard {
        _private: (),
    }

    impl SigintGuard {
        pub fn install() -> std::io::Result<Self> {
            Ok(Self { _private: () })
        }
    }
}

pub use imp::SigintGuard;
