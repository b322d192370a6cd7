//! Signed cookie sessions and per-session serialization.

use crate::keystore::KeySet;
use crate::runtime::RuntimeRef;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cookie::time::Duration;
use cookie::{Cookie, CookieJar, Key, SameSite};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "compiler-rpc-session";

/// Session cookie lifetime in seconds.
pub const SESSION_TTL_SECS: i64 = 24 * 60 * 60;

/// State carried inside the signed session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    /// Bound sandbox id, empty until provisioned.
    #[serde(default)]
    pub sandbox: String,
    /// Runtime the bound sandbox was created from.
    #[serde(default)]
    pub runtime: Option<RuntimeRef>,
}

impl SessionData {
    pub fn fresh() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ..Self::default()
        }
    }

    pub fn is_bound(&self) -> bool {
        !self.sandbox.is_empty()
    }

    /// True when the bound sandbox was created from `runtime`.
    pub fn bound_to(&self, runtime: &RuntimeRef) -> bool {
        self.is_bound() && self.runtime.as_ref() == Some(runtime)
    }
}

/// Issues and verifies session cookies.
///
/// New cookies are signed with the newest key; every stored key is tried,
/// newest first, when verifying.
pub struct SessionStore {
    signing: Key,
    verifying: Vec<Key>,
}

impl SessionStore {
    pub fn new(keys: &KeySet) -> Result<Self, cookie::KeyError> {
        let verifying = keys
            .verification_keys()
            .map(Key::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let signing = Key::try_from(keys.signing_key())?;
        Ok(Self { signing, verifying })
    }

    /// Read the session from request headers. The flag is true when no valid
    /// session cookie was presented and a fresh session was created.
    pub fn load(&self, headers: &HeaderMap) -> (SessionData, bool) {
        match self.read(headers) {
            Some(session) => (session, false),
            None => (SessionData::fresh(), true),
        }
    }

    fn read(&self, headers: &HeaderMap) -> Option<SessionData> {
        let raw = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(Result::ok)
            .find(|c| c.name() == SESSION_COOKIE)?
            .into_owned();

        let mut jar = CookieJar::new();
        jar.add_original(raw);

        let verified = self
            .verifying
            .iter()
            .find_map(|key| jar.signed(key).get(SESSION_COOKIE));
        let Some(verified) = verified else {
            debug!("Session cookie failed verification");
            return None;
        };

        let payload = URL_SAFE_NO_PAD.decode(verified.value()).ok()?;
        let session: SessionData = serde_json::from_slice(&payload).ok()?;
        (!session.id.is_empty()).then_some(session)
    }

    /// Build the signed `Set-Cookie` value persisting `session`.
    pub fn save(&self, session: &SessionData) -> Result<String, serde_json::Error> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(session)?);
        let cookie = Cookie::build((SESSION_COOKIE, payload))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(Duration::seconds(SESSION_TTL_SECS))
            .build();

        let mut jar = CookieJar::new();
        jar.signed_mut(&self.signing).add(cookie);
        Ok(jar
            .get(SESSION_COOKIE)
            .map(|c| c.to_string())
            .unwrap_or_default())
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn expire(&self) -> String {
        Cookie::build((SESSION_COOKIE, ""))
            .path("/")
            .http_only(true)
            .max_age(Duration::ZERO)
            .build()
            .to_string()
    }
}

/// One async mutex per session id, guarding the session's current binding.
///
/// Held across provisioning and across a submission's copy-in and exec so
/// two requests from the same session never interleave on its sandbox. The
/// binding recorded here wins over the copy in a request's cookie, which may
/// predate a request that held the lock first.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<Option<Recorded>>>>>>,
}

struct Recorded {
    session: SessionData,
    at: Instant,
}

/// Exclusive access to one session's binding.
pub struct SessionGuard {
    slot: OwnedMutexGuard<Option<Recorded>>,
}

impl SessionGuard {
    /// The latest recorded state of the session, or `presented` when this
    /// process has not recorded one.
    pub fn resolve(&self, presented: SessionData) -> SessionData {
        match self.slot.as_ref() {
            Some(recorded) => recorded.session.clone(),
            None => presented,
        }
    }

    pub fn record(&mut self, session: &SessionData) {
        *self.slot = Some(Recorded {
            session: session.clone(),
            at: Instant::now(),
        });
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let entry = {
            let mut slots = self.inner.lock().await;
            // Drop entries nobody holds or waits on, unless they record a
            // binding whose cookie may still be presented.
            let ttl = StdDuration::from_secs(SESSION_TTL_SECS as u64);
            slots.retain(|_, slot| {
                Arc::strong_count(slot) > 1
                    || slot
                        .try_lock()
                        .map_or(true, |r| matches!(&*r, Some(rec) if rec.at.elapsed() < ttl))
            });
            slots.entry(session_id.to_string()).or_default().clone()
        };
        SessionGuard {
            slot: entry.lock_owned().await,
        }
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn store_with(dir: &tempfile::TempDir, rotate: bool) -> (SessionStore, KeySet) {
        let keys = KeySet::load(dir.path().join("auth.keys"), rotate, 64).unwrap();
        (SessionStore::new(&keys).unwrap(), keys)
    }

    fn request_headers(set_cookie: &str) -> HeaderMap {
        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_str(pair).unwrap());
        headers
    }

    fn bound_session() -> SessionData {
        SessionData {
            sandbox: "ctr-1".into(),
            runtime: RuntimeRef::parse("python", "3.11"),
            ..SessionData::fresh()
        }
    }

    #[test]
    fn missing_cookie_is_new() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with(&dir, false);
        let (session, is_new) = store.load(&HeaderMap::new());
        assert!(is_new);
        assert!(!session.id.is_empty());
        assert!(!session.is_bound());
    }

    #[test]
    fn saved_session_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with(&dir, false);
        let session = bound_session();

        let set_cookie = store.save(&session).unwrap();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Max-Age=86400"));

        let (loaded, is_new) = store.load(&request_headers(&set_cookie));
        assert!(!is_new);
        assert_eq!(loaded, session);
    }

    #[test]
    fn tampered_cookie_is_new() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with(&dir, false);
        let set_cookie = store.save(&bound_session()).unwrap();

        let pair = set_cookie.split(';').next().unwrap();
        let tampered = format!("{pair}A");

        let (_, is_new) = store.load(&request_headers(&tampered));
        assert!(is_new);
    }

    #[test]
    fn cookie_from_another_key_is_new() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (store_a, _) = store_with(&a, false);
        let (store_b, _) = store_with(&b, false);

        let set_cookie = store_a.save(&bound_session()).unwrap();
        let (_, is_new) = store_b.load(&request_headers(&set_cookie));
        assert!(is_new);
    }

    #[test]
    fn cookies_survive_key_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let (before, _) = store_with(&dir, false);
        let old_cookie = before.save(&bound_session()).unwrap();

        let (after, keys) = store_with(&dir, true);
        assert_eq!(keys.keys().len(), 2);
        let (loaded, is_new) = after.load(&request_headers(&old_cookie));
        assert!(!is_new);
        assert_eq!(loaded.sandbox, "ctr-1");

        // New cookies are signed with the newest key only.
        let new_cookie = after.save(&bound_session()).unwrap();
        let (_, is_new) = before.load(&request_headers(&new_cookie));
        assert!(is_new);
    }

    #[test]
    fn expire_clears_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = store_with(&dir, false);
        let expired = store.expire();
        assert!(expired.starts_with(&format!("{SESSION_COOKIE}=")));
        assert!(expired.contains("Max-Age=0"));
    }

    #[test]
    fn short_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeySet::load(dir.path().join("short.keys"), false, 16).unwrap();
        assert!(SessionStore::new(&keys).is_err());
    }

    #[test]
    fn bound_to_matches_runtime() {
        let session = bound_session();
        assert!(session.bound_to(&RuntimeRef::parse("python", "3.11").unwrap()));
        assert!(!session.bound_to(&RuntimeRef::parse("python", "3.12").unwrap()));
        assert!(!SessionData::fresh().bound_to(&RuntimeRef::parse("python", "3.11").unwrap()));
    }

    #[tokio::test]
    async fn same_session_is_serialized() {
        let locks = SessionLocks::new();
        let guard = locks.lock("s1").await;

        let other = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock("s1").await;
        });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different session is not blocked.
        let _unrelated = tokio::time::timeout(StdDuration::from_secs(1), locks.lock("s2"))
            .await
            .unwrap();

        drop(guard);
        tokio::time::timeout(StdDuration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn idle_locks_are_pruned() {
        let locks = SessionLocks::new();
        drop(locks.lock("a").await);
        drop(locks.lock("b").await);
        let _held = locks.lock("c").await;
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn recorded_binding_outlives_the_guard() {
        let locks = SessionLocks::new();
        let bound = bound_session();
        locks.lock(&bound.id).await.record(&bound);
        drop(locks.lock("other").await);

        let stale = SessionData {
            id: bound.id.clone(),
            ..SessionData::default()
        };
        let guard = locks.lock(&bound.id).await;
        assert_eq!(guard.resolve(stale), bound);
        assert_eq!(locks.len().await, 1);

        // Nothing recorded: the presented session stands.
        let fresh = SessionData::fresh();
        let guard = locks.lock(&fresh.id).await;
        assert_eq!(guard.resolve(fresh.clone()), fresh);
    }
}
