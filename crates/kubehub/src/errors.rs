//! Stream error policy: decides whether a watcher keeps existing after a fault.
//!
//! Retrying the connection itself belongs to the stream engine; this module only
//! ignores, logs, or cancels.

use std::sync::{Arc, RwLock, Weak};

use kube::runtime::watcher;
use lazywatch_core::{ApiStatus, WatchError, WatchScope};
use metrics::counter;
use once_cell::sync::Lazy;
use tracing::error;

/// What to do about a stream error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Expected during shutdown or normal stream turnover.
    Ignore,
    Log,
    /// Log and cancel the whole watcher.
    Cancel,
    /// Log and hand to the process-wide unhandled-error hook.
    Escalate,
}

impl Verdict {
    fn label(self) -> &'static str {
        match self {
            Verdict::Ignore => "ignore",
            Verdict::Log => "log",
            Verdict::Cancel => "cancel",
            Verdict::Escalate => "escalate",
        }
    }
}

pub fn classify(err: &WatchError) -> Verdict {
    match err {
        WatchError::Cancelled | WatchError::EndOfStream => Verdict::Ignore,
        WatchError::Expired(_) | WatchError::UnexpectedEof(_) => Verdict::Log,
        WatchError::Api(st) if st.is_forbidden() => Verdict::Cancel,
        WatchError::Api(_) => Verdict::Log,
        WatchError::Other(_) => Verdict::Escalate,
    }
}

type UnhandledHook = Arc<dyn Fn(&WatchError) + Send + Sync>;

static UNHANDLED: Lazy<RwLock<Option<UnhandledHook>>> = Lazy::new(|| RwLock::new(None));

/// Install the process-wide sink for errors outside the known categories,
/// replacing any previous one.
pub fn set_unhandled_error_hook(hook: impl Fn(&WatchError) + Send + Sync + 'static) {
    let mut slot = UNHANDLED.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = Some(Arc::new(hook));
}

pub fn clear_unhandled_error_hook() {
    let mut slot = UNHANDLED.write().unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = None;
}

fn report_unhandled(err: &WatchError) {
    counter!("watcher_unhandled_errors_total", 1u64);
    let hook = UNHANDLED.read().unwrap_or_else(std::sync::PoisonError::into_inner).clone();
    if let Some(hook) = hook {
        hook(err);
    }
}

/// Something the error handler can cancel without knowing its object type.
pub(crate) trait Cancel: Send + Sync {
    fn cancel(&self);
}

/// Error callback handed to a stream engine.
#[derive(Clone)]
pub struct ErrorHandler {
    scope: WatchScope,
    target: Option<Weak<dyn Cancel>>,
}

impl ErrorHandler {
    pub(crate) fn new(scope: WatchScope, target: Weak<dyn Cancel>) -> Self {
        Self { scope, target: Some(target) }
    }

    /// A handler that classifies and logs but has nothing to cancel.
    pub fn detached(scope: WatchScope) -> Self {
        Self { scope, target: None }
    }

    pub fn handle(&self, err: &WatchError) -> Verdict {
        let verdict = classify(err);
        let (resource, ns) = (self.scope.resource(), self.scope.ns());
        if verdict != Verdict::Ignore {
            counter!("watcher_stream_errors_total", 1u64, "action" => verdict.label());
        }
        match (verdict, err) {
            (Verdict::Ignore, _) => {}
            (_, WatchError::Expired(st)) => {
                // The engine relists from its last seen version; nothing to do here.
                error!(resource, ns, error = %st, "Watcher closed: resource version expired");
            }
            (_, WatchError::UnexpectedEof(msg)) => {
                error!(resource, ns, error = %msg, "Watcher closed with unexpected EOF");
            }
            (Verdict::Cancel, WatchError::Api(st)) => {
                error!(resource, ns, reason = %st.reason, "Watcher was denied access: {}", st.detail());
                if let Some(target) = self.target.as_ref().and_then(Weak::upgrade) {
                    target.cancel();
                }
            }
            (_, WatchError::Api(st)) => {
                error!(resource, ns, code = st.code, reason = %st.reason, "Watcher failed: {}", st.detail());
            }
            (_, other) => {
                error!(resource, ns, error = ?other, "Watcher failed: {}", other);
                report_unhandled(other);
            }
        }
        verdict
    }
}

fn status_of(resp: &kube::core::ErrorResponse) -> ApiStatus {
    ApiStatus { code: resp.code, reason: resp.reason.clone(), message: resp.message.clone() }
}

fn is_unexpected_eof(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut cur = Some(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        cur = e.source();
    }
    false
}

fn from_kube(err: kube::Error) -> WatchError {
    match err {
        kube::Error::Api(resp) => WatchError::from_status(status_of(&resp)),
        other if is_unexpected_eof(&other) => WatchError::UnexpectedEof(other.to_string()),
        other => WatchError::Other(anyhow::Error::new(other)),
    }
}

/// Translate a kube runtime watcher error into the watch error taxonomy.
pub fn watch_error_from(err: watcher::Error) -> WatchError {
    match err {
        watcher::Error::InitialListFailed(e) | watcher::Error::WatchStartFailed(e) | watcher::Error::WatchFailed(e) => {
            from_kube(e)
        }
        watcher::Error::WatchError(resp) => WatchError::from_status(status_of(&resp)),
        #[allow(unreachable_patterns)]
        other => WatchError::Other(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl Cancel for Counter {
        fn cancel(&self) { self.0.fetch_add(1, Ordering::SeqCst); }
    }

    fn handler(target: &Arc<Counter>) -> ErrorHandler {
        let t: Arc<dyn Cancel> = target.clone();
        ErrorHandler::new(WatchScope::new("pods", Some("ns1")), Arc::downgrade(&t))
    }

    #[test]
    fn policy_table() {
        assert_eq!(classify(&WatchError::Cancelled), Verdict::Ignore);
        assert_eq!(classify(&WatchError::EndOfStream), Verdict::Ignore);
        assert_eq!(classify(&WatchError::from_status(ApiStatus::new(410, "Gone", "too old"))), Verdict::Log);
        assert_eq!(classify(&WatchError::UnexpectedEof("eof".into())), Verdict::Log);
        assert_eq!(classify(&WatchError::Api(ApiStatus::new(403, "Forbidden", "denied"))), Verdict::Cancel);
        assert_eq!(classify(&WatchError::Api(ApiStatus::new(500, "InternalError", "boom"))), Verdict::Log);
        assert_eq!(classify(&WatchError::Other(anyhow::anyhow!("socket reset"))), Verdict::Escalate);
    }

    #[test]
    fn only_forbidden_cancels() {
        let target = Arc::new(Counter(AtomicUsize::new(0)));
        let h = handler(&target);
        h.handle(&WatchError::Api(ApiStatus::new(500, "InternalError", "boom")));
        h.handle(&WatchError::Expired(ApiStatus::new(410, "Expired", "")));
        assert_eq!(target.0.load(Ordering::SeqCst), 0);
        assert_eq!(h.handle(&WatchError::Api(ApiStatus::new(403, "Forbidden", "denied"))), Verdict::Cancel);
        assert_eq!(target.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_target_is_not_cancelled() {
        let target = Arc::new(Counter(AtomicUsize::new(0)));
        let h = handler(&target);
        drop(target);
        assert_eq!(h.handle(&WatchError::Api(ApiStatus::new(403, "Forbidden", ""))), Verdict::Cancel);
    }

    #[test]
    fn unknown_errors_reach_the_hook() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        set_unhandled_error_hook(move |_| { s.fetch_add(1, Ordering::SeqCst); });
        let h = ErrorHandler::detached(WatchScope::new("pods", None));
        h.handle(&WatchError::Other(anyhow::anyhow!("tls handshake")));
        h.handle(&WatchError::Api(ApiStatus::new(500, "InternalError", "")));
        h.handle(&WatchError::EndOfStream);
        clear_unhandled_error_hook();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn kube_errors_map_onto_taxonomy() {
        let resp = kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "pods is forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        };
        let mapped = watch_error_from(watcher::Error::WatchError(resp));
        assert!(matches!(&mapped, WatchError::Api(st) if st.is_forbidden()));

        let gone = kube::core::ErrorResponse { status: "Failure".into(), message: "too old".into(), reason: "Expired".into(), code: 410 };
        let mapped = watch_error_from(watcher::Error::WatchFailed(kube::Error::Api(gone)));
        assert!(matches!(mapped, WatchError::Expired(_)));

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert!(is_unexpected_eof(&eof));
    }
}
