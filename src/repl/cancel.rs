//! Request cancellation and deadlines.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

/// Something blocked that must re-check its state when a token is cancelled.
pub trait CancelListener: Send + Sync {
    fn on_cancel(&self);
}

/// Shared, clonable cancellation flag.
///
/// Cancellation is sticky. Listeners registered before `cancel()` are called
/// exactly once; a registration made afterwards never fires, so callers check
/// `is_cancelled()` after registering.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Weak<dyn CancelListener>)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<Arc<dyn CancelListener>> = {
            let mut guard = self
                .inner
                .listeners
                .lock()
                .expect("cancel listeners lock poisoned");
            guard
                .drain(..)
                .filter_map(|(_, listener)| listener.upgrade())
                .collect()
        };
        for listener in listeners {
            listener.on_cancel();
        }
    }

    /// Registers `listener` until the returned guard is dropped.
    pub fn register(&self, listener: Weak<dyn CancelListener>) -> CancelRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .expect("cancel listeners lock poisoned")
            .push((id, listener));
        CancelRegistration {
            token: self.clone(),
            id,
        }
    }

    /// New token that is cancelled with `self` or on its own.
    ///
    /// Forwarding stops when the returned link is dropped; a parent that is
    /// already cancelled yields a cancelled child.
    pub fn child(&self) -> (CancelToken, CancelLink) {
        let child = CancelToken::new();
        let forward = Arc::new(Forward(child.clone()));
        let listener: Arc<dyn CancelListener> = forward.clone();
        let registration = self.register(Arc::downgrade(&listener));
        if self.is_cancelled() {
            child.cancel();
        }
        let link = CancelLink {
            _registration: registration,
            _forward: forward,
        };
        (child, link)
    }

    fn unregister(&self, id: u64) {
        self.inner
            .listeners
            .lock()
            .expect("cancel listeners lock poisoned")
            .retain(|(registered, _)| *registered != id);
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .expect("cancel listeners lock poisoned")
            .len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[must_use = "dropping the registration unregisters the listener"]
pub struct CancelRegistration {
    token: CancelToken,
    id: u64,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        self.token.unregister(self.id);
    }
}

struct Forward(CancelToken);

impl CancelListener for Forward {
    fn on_cancel(&self) {
        self.0.cancel();
    }
}

/// Keeps a child token subscribed to its parent.
#[must_use = "dropping the link stops forwarding parent cancellation"]
pub struct CancelLink {
    _registration: CancelRegistration,
    _forward: Arc<Forward>,
}

/// Per-call deadline and cancellation carried into every ack manager call.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancelToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Earliest of `now + wait` and the caller's deadline.
    pub fn wait_deadline(&self, now: Instant, wait: Duration) -> Instant {
        let bound = now + wait;
        match self.deadline {
            Some(deadline) if deadline < bound => deadline,
            _ => bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl CancelListener for Counting {
        fn on_cancel(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_notifies_registered_listeners_once() {
        let token = CancelToken::new();
        let listener = Arc::new(Counting::default());
        let as_dyn: Arc<dyn CancelListener> = listener.clone();
        let _registration = token.register(Arc::downgrade(&as_dyn));

        token.cancel();
        token.cancel();

        assert!(token.is_cancelled());
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_registration_is_removed() {
        let token = CancelToken::new();
        let listener: Arc<dyn CancelListener> = Arc::new(Counting::default());
        {
            let _registration = token.register(Arc::downgrade(&listener));
            assert_eq!(token.listener_count(), 1);
        }
        assert_eq!(token.listener_count(), 0);
    }

    #[test]
    fn clones_share_state() {
        let token = CancelToken::new();
        let ctx = RequestContext::new().with_cancel(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn child_follows_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let (child, _link) = parent.child();
        let (sibling, _sibling_link) = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());

        let (late, _late_link) = parent.child();
        assert!(late.is_cancelled());
    }

    #[test]
    fn dropped_link_stops_forwarding() {
        let parent = CancelToken::new();
        let (child, link) = parent.child();
        drop(link);
        assert_eq!(parent.listener_count(), 0);
        parent.cancel();
        assert!(!child.is_cancelled());
    }

    #[test]
    fn wait_deadline_prefers_earlier_bound() {
        let now = Instant::now();
        let ctx = RequestContext::new().with_deadline(now + Duration::from_millis(10));
        assert_eq!(
            ctx.wait_deadline(now, Duration::from_secs(20)),
            now + Duration::from_millis(10)
        );
        let open = RequestContext::new();
        assert_eq!(
            open.wait_deadline(now, Duration::from_secs(1)),
            now + Duration::from_secs(1)
        );
    }
}
