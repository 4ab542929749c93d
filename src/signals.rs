// Signal handling: handlers only count; the watchdog draws the consequences

use std::sync::atomic::{AtomicU32, Ordering};

/// Number of termination signals received so far. The watchdog maps this to
/// the registry death level on its next tick.
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

/// Exit code when the parent gives up after repeated signals.
pub const SELF_KILL_EXIT: i32 = 43;

extern "C" fn on_signal(_sig: libc::c_int) {
    let count = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    if count >= 5 {
        // Fifth consecutive signal: the user really means it. _exit is
        // async-signal-safe; no cleanup is attempted.
        unsafe { libc::_exit(SELF_KILL_EXIT) };
    }
}

/// Install handlers for interrupt, quit and terminate.
pub fn install() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;

        for sig in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM] {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
}

/// How many termination signals have arrived.
pub fn signal_count() -> u32 {
    SIGNAL_COUNT.load(Ordering::SeqCst)
}
