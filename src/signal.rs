//! Trivial signal capture: the handler does nothing but record which signal
//! arrived, leaving all real work to the main loop's next iteration. This
//! keeps the daemon's core single-threaded rather than fanning responses
//! out across a sigwait background thread.

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal as NixSignal};
use std::sync::atomic::{AtomicI32, Ordering};

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signo: libc::c_int) {
    PENDING_SIGNAL.store(signo, Ordering::SeqCst);
}

/// Installs the handler for every signal the main loop is willing to
/// receive: the three graceful-exit signals, reload, the timeout tick, the
/// reserved pair (logged and otherwise ignored), and child-exited.
pub fn install() -> nix::Result<()> {
    let action = unsafe {
        SigAction::new(SigHandler::Handler(record_signal), SaFlags::empty(), SigSet::empty())
    };
    unsafe {
        sigaction(NixSignal::SIGTERM, &action)?;
        sigaction(NixSignal::SIGINT, &action)?;
        sigaction(NixSignal::SIGQUIT, &action)?;
        sigaction(NixSignal::SIGHUP, &action)?;
        sigaction(NixSignal::SIGALRM, &action)?;
        sigaction(NixSignal::SIGUSR1, &action)?;
        sigaction(NixSignal::SIGUSR2, &action)?;
        sigaction(NixSignal::SIGCHLD, &action)?;
    }
    Ok(())
}

/// Drains whatever signal arrived since the last call. Returns `None` if
/// nothing has arrived; a second call before the next delivery also
/// returns `None`, since the first call already consumed it.
pub fn take_pending() -> Option<NixSignal> {
    let signo = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
    NixSignal::try_from(signo).ok()
}

/// Whether the pending signal (if any) asks for shutdown.
pub fn is_terminating(signal: NixSignal) -> bool {
    matches!(signal, NixSignal::SIGTERM | NixSignal::SIGINT | NixSignal::SIGQUIT)
}

/// Whether the pending signal (if any) asks for a config reload.
pub fn is_reload(signal: NixSignal) -> bool {
    signal == NixSignal::SIGHUP
}

/// Whether the pending signal is the timeout tick the main loop uses to
/// bound how long a single blocking poll can run before timeout bookkeeping
/// needs another look.
pub fn is_timer_tick(signal: NixSignal) -> bool {
    signal == NixSignal::SIGALRM
}

/// The reserved pair: accepted so the daemon doesn't die to the default
/// action, but otherwise just logged by the caller.
pub fn is_reserved(signal: NixSignal) -> bool {
    matches!(signal, NixSignal::SIGUSR1 | NixSignal::SIGUSR2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_pending_is_none_until_a_signal_is_recorded() {
        // Drain anything a previous test in this process may have left
        // pending, since the flag is a single global.
        let _ = take_pending();
        assert!(take_pending().is_none());

        record_signal(NixSignal::SIGHUP as libc::c_int);
        assert_eq!(take_pending(), Some(NixSignal::SIGHUP));
        assert!(take_pending().is_none());
    }

    #[test]
    fn classifies_terminate_vs_reload() {
        assert!(is_terminating(NixSignal::SIGTERM));
        assert!(is_terminating(NixSignal::SIGINT));
        assert!(is_terminating(NixSignal::SIGQUIT));
        assert!(!is_terminating(NixSignal::SIGHUP));
        assert!(is_reload(NixSignal::SIGHUP));
    }

    #[test]
    fn classifies_timer_tick_and_reserved_pair() {
        assert!(is_timer_tick(NixSignal::SIGALRM));
        assert!(!is_timer_tick(NixSignal::SIGUSR1));
        assert!(is_reserved(NixSignal::SIGUSR1));
        assert!(is_reserved(NixSignal::SIGUSR2));
        assert!(!is_reserved(NixSignal::SIGCHLD));
    }
}
