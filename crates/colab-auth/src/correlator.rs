//! Matches authorization codes arriving out of band to the attempt waiting
//! for them.
//!
//! Each login attempt registers a nonce and waits. Whatever receives the
//! redirect (URI handler, loopback server) calls
//! [`CodeCorrelator::resolve_code`] with the nonce it found. A wait ends
//! exactly once and its pending entry is removed on every exit path.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AuthError, AuthResult};

/// How long a registered nonce waits for its code.
pub const CODE_TIMEOUT: Duration = Duration::from_secs(60);

/// Nonce-keyed rendezvous between login attempts and redirect receivers.
///
/// Cheap to clone; clones share the same pending set.
#[derive(Clone)]
pub struct CodeCorrelator {
    inner: Arc<Inner>,
}

struct Inner {
    pending: Mutex<HashMap<String, Pending>>,
    next_id: AtomicU64,
    timeout: Duration,
}

struct Pending {
    id: u64,
    tx: oneshot::Sender<String>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the entry when the wait ends, unless something else already
/// replaced or consumed it.
struct Registration {
    inner: Arc<Inner>,
    nonce: String,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut pending = self.inner.pending();
        if pending.get(&self.nonce).is_some_and(|p| p.id == self.id) {
            pending.remove(&self.nonce);
        }
    }
}

impl Default for CodeCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCorrelator {
    /// Creates a correlator with the standard 60 second timeout.
    pub fn new() -> Self {
        Self::with_timeout(CODE_TIMEOUT)
    }

    /// Creates a correlator with a custom timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                timeout,
            }),
        }
    }

    /// Waits for the code delivered under `nonce`.
    ///
    /// Registration happens when this is called, not when the future is first
    /// polled, so a redirect that races the browser launch is not lost. The
    /// timeout is measured from registration.
    ///
    /// # Errors
    ///
    /// - [`AuthError::AlreadyWaiting`] if `nonce` is already registered; the
    ///   existing wait is untouched.
    /// - [`AuthError::Timeout`] if no code arrives in time.
    /// - [`AuthError::Cancelled`] if `cancel` fires first.
    pub fn wait_for_code(
        &self,
        nonce: impl Into<String>,
        cancel: CancellationToken,
    ) -> impl Future<Output = AuthResult<String>> + Send + 'static {
        let registration = self.register(nonce.into());
        let deadline = Instant::now() + self.inner.timeout;

        async move {
            let (registration, rx) = registration?;
            let nonce = registration.nonce.clone();

            let result = tokio::select! {
                biased;
                code = rx => code.map_err(|_| AuthError::Cancelled),
                () = cancel.cancelled() => {
                    debug!(nonce = %nonce, "authorization wait cancelled");
                    Err(AuthError::Cancelled)
                }
                () = tokio::time::sleep_until(deadline) => {
                    warn!(nonce = %nonce, "timed out waiting for authorization code");
                    Err(AuthError::Timeout)
                }
            };

            drop(registration);
            result
        }
    }

    fn register(&self, nonce: String) -> AuthResult<(Registration, oneshot::Receiver<String>)> {
        let mut pending = self.inner.pending();
        if pending.contains_key(&nonce) {
            return Err(AuthError::AlreadyWaiting { nonce });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(nonce.clone(), Pending { id, tx });
        debug!(nonce = %nonce, "waiting for authorization code");

        Ok((
            Registration {
                inner: Arc::clone(&self.inner),
                nonce,
                id,
            },
            rx,
        ))
    }

    /// Delivers `code` to the wait registered under `nonce`.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownNonce`] if nothing is waiting, including waits
    /// that already finished.
    pub fn resolve_code(&self, nonce: &str, code: impl Into<String>) -> AuthResult<()> {
        let entry = self.inner.pending().remove(nonce);
        let unknown = || AuthError::UnknownNonce {
            nonce: nonce.to_string(),
        };

        entry
            .ok_or_else(unknown)?
            .tx
            .send(code.into())
            .map_err(|_| unknown())?;
        debug!(nonce = %nonce, "authorization code delivered");
        Ok(())
    }

    /// Returns true if a wait is registered under `nonce`.
    pub fn is_pending(&self, nonce: &str) -> bool {
        self.inner.pending().contains_key(nonce)
    }

    /// Number of outstanding waits.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_registered_nonce() {
        let correlator = CodeCorrelator::new();
        let wait = correlator.wait_for_code("n1", CancellationToken::new());

        correlator.resolve_code("n1", "the-code").unwrap();
        assert_eq!(wait.await.unwrap(), "the-code");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn registration_is_eager() {
        let correlator = CodeCorrelator::new();
        let _wait = correlator.wait_for_code("n1", CancellationToken::new());
        assert!(correlator.is_pending("n1"));
    }

    #[tokio::test]
    async fn duplicate_nonce_is_rejected_without_disturbing_first_wait() {
        let correlator = CodeCorrelator::new();
        let first = correlator.wait_for_code("dup", CancellationToken::new());
        let second = correlator.wait_for_code("dup", CancellationToken::new());

        assert!(matches!(
            second.await,
            Err(AuthError::AlreadyWaiting { ref nonce }) if nonce == "dup"
        ));
        assert!(correlator.is_pending("dup"));

        correlator.resolve_code("dup", "c").unwrap();
        assert_eq!(first.await.unwrap(), "c");
    }

    #[tokio::test]
    async fn unknown_nonce_is_an_error() {
        let correlator = CodeCorrelator::new();
        assert!(matches!(
            correlator.resolve_code("nope", "c"),
            Err(AuthError::UnknownNonce { .. })
        ));
    }

    #[tokio::test]
    async fn distinct_nonces_resolve_in_any_order() {
        let correlator = CodeCorrelator::new();
        let first = correlator.wait_for_code("n1", CancellationToken::new());
        let second = correlator.wait_for_code("n2", CancellationToken::new());

        correlator.resolve_code("n2", "code-2").unwrap();
        assert!(correlator.is_pending("n1"));
        correlator.resolve_code("n1", "code-1").unwrap();

        assert_eq!(second.await.unwrap(), "code-2");
        assert_eq!(first.await.unwrap(), "code-1");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_nonce_leaves_pending_waits_alone() {
        let correlator = CodeCorrelator::new();
        let wait = correlator.wait_for_code("n1", CancellationToken::new());

        assert!(matches!(
            correlator.resolve_code("unknown", "c"),
            Err(AuthError::UnknownNonce { ref nonce }) if nonce == "unknown"
        ));
        assert!(correlator.is_pending("n1"));

        correlator.resolve_code("n1", "code-1").unwrap();
        assert_eq!(wait.await.unwrap(), "code-1");
    }

    #[tokio::test(start_paused = true)]
    async fn each_nonce_times_out_on_its_own_clock() {
        let correlator = CodeCorrelator::new();
        let first = tokio::spawn(correlator.wait_for_code("n1", CancellationToken::new()));

        tokio::time::advance(Duration::from_secs(30)).await;
        let second = tokio::spawn(correlator.wait_for_code("n2", CancellationToken::new()));
        assert!(correlator.resolve_code("unknown", "c").is_err());

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(matches!(first.await.unwrap(), Err(AuthError::Timeout)));
        assert!(correlator.is_pending("n2"));

        correlator.resolve_code("n2", "code-2").unwrap();
        assert_eq!(second.await.unwrap().unwrap(), "code-2");
    }

    #[tokio::test]
    async fn second_resolve_fails() {
        let correlator = CodeCorrelator::new();
        let wait = correlator.wait_for_code("n", CancellationToken::new());
        correlator.resolve_code("n", "first").unwrap();
        assert!(correlator.resolve_code("n", "second").is_err());
        assert_eq!(wait.await.unwrap(), "first");
    }

    #[tokio::test(start_paused = true)]
    async fn code_just_before_deadline_wins() {
        let correlator = CodeCorrelator::new();
        let wait = tokio::spawn(correlator.wait_for_code("n", CancellationToken::new()));

        tokio::time::advance(Duration::from_millis(59_999)).await;
        correlator.resolve_code("n", "late-but-ok").unwrap();

        assert_eq!(wait.await.unwrap().unwrap(), "late-but-ok");
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_sixty_seconds() {
        let correlator = CodeCorrelator::new();
        let wait = tokio::spawn(correlator.wait_for_code("n", CancellationToken::new()));

        tokio::time::advance(Duration::from_millis(60_001)).await;

        assert!(matches!(wait.await.unwrap(), Err(AuthError::Timeout)));
        assert!(!correlator.is_pending("n"));
        assert!(matches!(
            correlator.resolve_code("n", "too-late"),
            Err(AuthError::UnknownNonce { .. })
        ));
    }

    #[tokio::test]
    async fn cancellation_ends_wait_and_clears_entry() {
        let correlator = CodeCorrelator::new();
        let cancel = CancellationToken::new();
        let wait = tokio::spawn(correlator.wait_for_code("n", cancel.clone()));

        cancel.cancel();

        assert!(matches!(wait.await.unwrap(), Err(AuthError::Cancelled)));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropping_the_wait_clears_entry() {
        let correlator = CodeCorrelator::new();
        let wait = correlator.wait_for_code("n", CancellationToken::new());
        drop(wait);
        assert!(!correlator.is_pending("n"));
    }

    #[tokio::test]
    async fn nonce_can_be_reused_after_completion() {
        let correlator = CodeCorrelator::new();
        let wait = correlator.wait_for_code("n", CancellationToken::new());
        correlator.resolve_code("n", "a").unwrap();
        wait.await.unwrap();

        let again = correlator.wait_for_code("n", CancellationToken::new());
        correlator.resolve_code("n", "b").unwrap();
        assert_eq!(again.await.unwrap(), "b");
    }
}
