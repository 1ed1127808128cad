//! Reporting for errors that cannot reach a downstream consumer.
//!
//! A valve delivers exactly one terminal error per instance. A second error
//! arriving after the slot is taken has nowhere to go, but it must not be
//! silently lost: it is handed to the process-wide hook installed here, or
//! logged through `tracing` when no hook is set.

use crate::error::Error;
use std::sync::RwLock;

type Hook = Box<dyn Fn(&Error) + Send + Sync>;

static HOOK: RwLock<Option<Hook>> = RwLock::new(None);

/// Install a process-wide hook for errors that cannot be delivered downstream.
///
/// Replaces any previously installed hook. The hook may be called from any
/// thread that feeds a valve.
pub fn set_unhandled_error_hook(hook: impl Fn(&Error) + Send + Sync + 'static) {
    *HOOK.write().unwrap() = Some(Box::new(hook));
}

/// Remove the installed hook, restoring the default `tracing::error!` record.
pub fn clear_unhandled_error_hook() {
    *HOOK.write().unwrap() = None;
}

/// Route an error that has no downstream left to receive it.
pub(crate) fn unhandled_error(error: &Error) {
    let hook = HOOK.read().unwrap();
    match hook.as_ref() {
        Some(hook) => hook(error),
        None => tracing::error!(%error, "suppressed error with no downstream"),
    }
}

/// Serializes tests that install a hook; the registry is process-global.
#[cfg(test)]
pub(crate) static HOOK_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_hook_receives_errors() {
        let _guard = HOOK_TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        set_unhandled_error_hook(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        unhandled_error(&Error::GateTerminated);
        unhandled_error(&Error::Upstream("late".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        clear_unhandled_error_hook();
        unhandled_error(&Error::GateTerminated);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
