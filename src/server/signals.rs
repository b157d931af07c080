/*!
 * Signal Handling
 *
 * Handlers store into process-wide atomics and nothing else; the monitor
 * and child main loops observe the flags at every suspension point. The
 * flags are the only global state in the server, because a signal handler
 * cannot reach anything that is not.
 */

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::core::types::ServerResult;

static TERMINATE: AtomicBool = AtomicBool::new(false);
static RECONFIGURE: AtomicBool = AtomicBool::new(false);
static CHILD_TERM: AtomicBool = AtomicBool::new(false);

extern "C" fn monitor_handler(sig: libc::c_int) {
    match sig {
        libc::SIGTERM | libc::SIGINT => TERMINATE.store(true, Ordering::Relaxed),
        libc::SIGHUP => RECONFIGURE.store(true, Ordering::Relaxed),
        _ => {}
    }
}

extern "C" fn child_handler(sig: libc::c_int) {
    if sig == libc::SIGTERM {
        CHILD_TERM.store(true, Ordering::Relaxed);
    }
}

fn install(signal: Signal, handler: SigHandler) -> ServerResult<()> {
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(signal, &action) }
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}

/// Monitor dispositions: TERM/INT request shutdown, HUP reconfigure,
/// PIPE and CHLD are ignored (children are reaped with `waitpid`).
pub fn install_monitor_handlers() -> ServerResult<()> {
    let h = SigHandler::Handler(monitor_handler);
    install(Signal::SIGTERM, h)?;
    install(Signal::SIGINT, h)?;
    install(Signal::SIGHUP, h)?;
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    install(Signal::SIGCHLD, SigHandler::SigIgn)?;
    Ok(())
}

/// Child dispositions: TERM sets the flag (the main loop maps it through
/// `father_said`), INT and HUP are ignored, PIPE is ignored.
pub fn install_child_handlers() -> ServerResult<()> {
    install(Signal::SIGTERM, SigHandler::Handler(child_handler))?;
    install(Signal::SIGINT, SigHandler::SigIgn)?;
    install(Signal::SIGHUP, SigHandler::SigIgn)?;
    install(Signal::SIGPIPE, SigHandler::SigIgn)?;
    Ok(())
}

/// Hold SIGTERM until the child's workers are up.
pub fn ignore_sigterm() -> ServerResult<()> {
    install(Signal::SIGTERM, SigHandler::SigIgn)
}

/// A forked child inherits the parent's flags; clear them before use.
pub fn reset_flags() {
    TERMINATE.store(false, Ordering::Relaxed);
    RECONFIGURE.store(false, Ordering::Relaxed);
    CHILD_TERM.store(false, Ordering::Relaxed);
}

#[must_use]
pub fn terminate_requested() -> bool {
    TERMINATE.load(Ordering::Relaxed)
}

/// Consume a pending reconfigure request.
#[must_use]
pub fn take_reconfigure() -> bool {
    RECONFIGURE.swap(false, Ordering::Relaxed)
}

/// Consume a pending child SIGTERM.
#[must_use]
pub fn take_child_term() -> bool {
    CHILD_TERM.swap(false, Ordering::Relaxed)
}

#[must_use]
pub fn child_term_pending() -> bool {
    CHILD_TERM.load(Ordering::Relaxed)
}
