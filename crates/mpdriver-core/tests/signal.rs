//! Runs in its own process so the raised SIGINT cannot reach other tests.

#![cfg(unix)]

use mpdriver_core::signal::{SigintGuard, SigintWatch, sigint_count};
use signal_hook::consts::SIGINT;
use signal_hook::low_level::raise;

#[test]
fn test_raised_sigint_is_counted() {
    let guard = SigintGuard::install().unwrap();
    let watch = SigintWatch::new();
    let other = SigintWatch::new();
    assert!(!watch.fired());

    raise(SIGINT).unwrap();
    assert!(watch.fired());
    // A second watch still sees the same signal after the first consumed it.
    assert!(other.fired());
    assert!(!SigintWatch::new().fired());

    // Nested guards keep the handler until the last one drops.
    let inner = SigintGuard::install().unwrap();
    drop(guard);
    let before = sigint_count();
    let watch = SigintWatch::new();
    raise(SIGINT).unwrap();
    assert!(watch.fired());
    assert_eq!(sigint_count(), before + 1);
    drop(inner);
}
