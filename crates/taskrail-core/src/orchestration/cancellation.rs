use std::fmt::{Debug, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::models::{TaskError, TaskResult};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle returned by [`CancellationToken::register`], used to remove the callback again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CallbackHandle(u64);

/// Shared cancellation flag. Cloning yields another handle to the same token.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    flag: AtomicBool,
    notify: Notify,
    callbacks: Mutex<CallbackState>,
    blocking: (Mutex<()>, Condvar),
    parent: OnceLock<(CancellationToken, CallbackHandle)>,
}

#[derive(Default)]
struct CallbackState {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                callbacks: Mutex::new(CallbackState::default()),
                blocking: (Mutex::new(()), Condvar::new()),
                parent: OnceLock::new(),
            }),
        }
    }

    /// Token that is cancelled together with `self` but can also be cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        let weak: Weak<TokenInner> = Arc::downgrade(&child.inner);
        let handle = self.register(move || {
            if let Some(inner) = weak.upgrade() {
                CancellationToken { inner }.cancel();
            }
        });
        let _ = child.inner.parent.set((self.clone(), handle));
        child
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.notify.notify_waiters();
        {
            let (lock, condvar) = &self.inner.blocking;
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            condvar.notify_all();
        }

        let entries = {
            let mut state = self.lock_callbacks();
            std::mem::take(&mut state.entries)
        };
        for (id, callback) in entries {
            if catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!(callback_id = id, "cancellation callback panicked");
            }
        }
    }

    pub fn throw_if_cancellation_requested(&self) -> TaskResult<()> {
        if self.is_cancellation_requested() {
            return Err(TaskError::cancelled("cancellation requested"));
        }
        Ok(())
    }

    /// Runs `callback` once when the token is cancelled, or right away if it already is.
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) -> CallbackHandle {
        let mut state = self.lock_callbacks();
        let id = state.next_id;
        state.next_id = state.next_id.saturating_add(1);

        if self.is_cancellation_requested() {
            drop(state);
            callback();
        } else {
            state.entries.push((id, Box::new(callback)));
        }

        CallbackHandle(id)
    }

    /// Returns false when the callback already ran or was never registered here.
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut state = self.lock_callbacks();
        let before = state.entries.len();
        state.entries.retain(|(id, _)| *id != handle.0);
        state.entries.len() != before
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancellation_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Blocks the calling thread until cancelled or `timeout` elapses. Returns the flag.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &self.inner.blocking;
        let mut guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while !self.is_cancellation_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match condvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_cancellation_requested()
    }

    fn lock_callbacks(&self) -> std::sync::MutexGuard<'_, CallbackState> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CancellationToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancellation_requested())
            .finish()
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        if let Some((parent, handle)) = self.parent.take() {
            parent.unregister(handle);
        }
    }
}
