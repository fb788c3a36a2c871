use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

// -----------------------------------------------------------------------------
// CancellationToken

/// A one-way stop signal shared between the build driver and the executor.
///
/// Cloned handles observe the same flag. The flag flips from unset to set at
/// most once per build; there is no way to reset it. Workers poll the token at
/// each scheduling step, so cancellation drains schedulable work without
/// interrupting actions already in flight. The executor registers an
/// [`on_cancel`] callback that wakes parked workers, otherwise a fully idle
/// pool would never observe the flip.
///
/// [`on_cancel`]: Self::on_cancel
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl CancellationToken {
    /// Creates a token in the unset state.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and runs the registered callbacks. Idempotent;
    /// the callbacks run for the first request only.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Whether cancellation has been requested.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Registers a callback to run when cancellation is requested. Runs the
    /// callback immediately when the token is already cancelled.
    pub fn on_cancel(&self, callback: impl Fn() + Send + Sync + 'static) {
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Checked under the lock: `cancel` sets the flag before it drains
            // the list, so either the push is visible to the drain or the flag
            // is visible here.
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::CancellationToken;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());

        token.cancel();
        assert!(observer.is_cancelled());

        // A second request changes nothing.
        token.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn callbacks_run_exactly_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counted = calls.clone();
        token.on_cancel(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Late registration runs immediately.
        let counted = calls.clone();
        token.on_cancel(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
