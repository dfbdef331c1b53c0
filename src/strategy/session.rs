//! Live authorization state of one strategy

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::errors::Result;
use crate::strategy::Decoration;
use crate::sync::SingleFlight;

/// Sessions are treated as lapsed this long before their stated expiry
const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Authorization state produced by a handshake or token exchange
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub decoration: Decoration,
    pub established_at: Instant,
    /// `None` for sessions that only end on invalidation (NTLM)
    pub expires_at: Option<Instant>,
}

impl AuthSession {
    pub fn new(decoration: Decoration, lifetime: Option<Duration>) -> Self {
        let established_at = Instant::now();
        Self {
            decoration,
            established_at,
            expires_at: lifetime.map(|l| established_at + l),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Instant::now() + EXPIRY_MARGIN < expires_at,
            None => true,
        }
    }
}

struct SessionInner {
    current: RwLock<Option<Arc<AuthSession>>>,
    // Keyed by generation so an invalidation never joins a stale flight
    flights: SingleFlight<u64, Arc<AuthSession>>,
    generation: AtomicU64,
    handshakes: AtomicU64,
}

/// Holds at most one live [`AuthSession`] and serializes its creation
///
/// Concurrent callers that find no valid session share one establish call.
#[derive(Clone)]
pub struct SessionCache {
    inner: Arc<SessionInner>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                current: RwLock::new(None),
                flights: SingleFlight::new(),
                generation: AtomicU64::new(0),
                handshakes: AtomicU64::new(0),
            }),
        }
    }
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCache")
            .field("live", &self.current().is_some())
            .field("generation", &self.inner.generation.load(Ordering::Relaxed))
            .field("handshakes", &self.handshakes())
            .finish()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live session, if it has not lapsed
    pub fn current(&self) -> Option<Arc<AuthSession>> {
        let guard = self.inner.current.read().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().filter(|s| s.is_valid()).cloned()
    }

    /// Return the live session or run `establish` (once across concurrent callers)
    pub async fn get_or_establish<F, Fut>(&self, establish: F) -> Result<Arc<AuthSession>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AuthSession>> + Send + 'static,
    {
        if let Some(session) = self.current() {
            return Ok(session);
        }

        let generation = self.inner.generation.load(Ordering::Acquire);
        let inner = self.inner.clone();

        self.inner
            .flights
            .run(generation, move || {
                let pending = establish();
                async move {
                    inner.handshakes.fetch_add(1, Ordering::Relaxed);
                    let session = Arc::new(pending.await?);

                    // Invalidated while we were establishing: hand the result to
                    // our waiters but do not publish it
                    let mut guard = inner.current.write().unwrap_or_else(|e| e.into_inner());
                    if inner.generation.load(Ordering::Acquire) == generation {
                        *guard = Some(session.clone());
                    }
                    Ok(session)
                }
            })
            .await
    }

    /// Bumped by every invalidation
    ///
    /// Read it before `get_or_establish` to know which session a request was
    /// decorated with.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Drop the live session; the next caller re-establishes
    pub fn invalidate(&self) {
        let mut guard = self.inner.current.write().unwrap_or_else(|e| e.into_inner());
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        *guard = None;
    }

    /// Drop the live session only if it still belongs to `generation`
    ///
    /// Returns `false` when another caller already replaced it; that caller's
    /// flight is the one to join.
    pub fn invalidate_if(&self, generation: u64) -> bool {
        let mut guard = self.inner.current.write().unwrap_or_else(|e| e.into_inner());
        if self
            .inner
            .generation
            .compare_exchange(generation, generation + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *guard = None;
        true
    }

    /// Number of establish calls that actually ran
    pub fn handshakes(&self) -> u64 {
        self.inner.handshakes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;

    #[tokio::test]
    async fn test_reuses_live_session() {
        let cache = SessionCache::new();
        for _ in 0..3 {
            cache
                .get_or_establish(|| async { Ok(AuthSession::new(Decoration::none(), None)) })
                .await
                .unwrap();
        }
        assert_eq!(cache.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_one_handshake() {
        let cache = SessionCache::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_establish(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(AuthSession::new(Decoration::none(), None))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cache.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_new_handshake() {
        let cache = SessionCache::new();
        let establish = || async { Ok(AuthSession::new(Decoration::none(), None)) };
        cache.get_or_establish(establish).await.unwrap();
        cache.invalidate();
        assert!(cache.current().is_none());
        cache.get_or_establish(establish).await.unwrap();
        assert_eq!(cache.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_if_only_once_per_generation() {
        let cache = SessionCache::new();
        let establish = || async { Ok(AuthSession::new(Decoration::none(), None)) };
        let generation = cache.generation();
        cache.get_or_establish(establish).await.unwrap();

        assert!(cache.invalidate_if(generation));
        for _ in 0..5 {
            assert!(!cache.invalidate_if(generation));
        }
        assert_eq!(cache.generation(), generation + 1);

        cache.get_or_establish(establish).await.unwrap();
        assert!(cache.current().is_some());
        assert_eq!(cache.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_invalidations_share_one_handshake() {
        let cache = SessionCache::new();
        cache
            .get_or_establish(|| async { Ok(AuthSession::new(Decoration::none(), None)) })
            .await
            .unwrap();
        let generation = cache.generation();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.invalidate_if(generation);
                cache
                    .get_or_establish(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(AuthSession::new(Decoration::none(), None))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(cache.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_replaced() {
        let cache = SessionCache::new();
        cache
            .get_or_establish(|| async {
                Ok(AuthSession::new(Decoration::none(), Some(Duration::from_secs(5))))
            })
            .await
            .unwrap();
        // 5s lifetime is inside the expiry margin
        assert!(cache.current().is_none());
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = SessionCache::new();
        let err = cache
            .get_or_establish(|| async {
                Err::<AuthSession, _>(Error::AuthUnavailable {
                    strategy: "ntlm",
                    endpoint: "http://x".into(),
                    reason: "down".into(),
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(cache.current().is_none());

        cache
            .get_or_establish(|| async { Ok(AuthSession::new(Decoration::none(), None)) })
            .await
            .unwrap();
        assert_eq!(cache.handshakes(), 2);
    }
}
