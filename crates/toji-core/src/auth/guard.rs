//! The session guard: owns the token, decides validity, runs the countdown.
//!
//! Validation prefers the expiry claim inside the token. When the token
//! carries one, the verdict is local and the backend is only asked in the
//! background (its answer is logged, never applied). When it does not, the
//! backend decides, within a bounded wait.
//!
//! A valid session with time left gets one countdown task ticking once per
//! period. Reaching zero raises `Notice::SessionExpired` and logs out.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::SessionError;
use super::notice::{Notice, Notifier};
use super::source::resolve_token;
use super::state::{SessionPhase, SessionState, SessionUser};
use super::store::TokenStore;
use super::timestamp::parse_instant;
use super::token::{decode, SessionPayload};
use crate::api::SessionValidator;
use crate::utils::token_preview;

/// Bound on the background confirmation after a local verdict
const SOFT_CHECK_TIMEOUT_SECS: u64 = 3;

/// Bound on the blocking backend validation
const VALIDATION_TIMEOUT_SECS: u64 = 5;

/// Lifetime assumed when the backend confirms without an expiry.
/// Matches the bot's 30 minute sessions.
const DEFAULT_LIFETIME_SECS: u64 = 30 * 60;

const TICK_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone)]
pub struct GuardOptions {
    pub soft_check_timeout: Duration,
    pub validation_timeout: Duration,
    pub default_lifetime: Duration,
    pub tick_interval: Duration,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self {
            soft_check_timeout: Duration::from_secs(SOFT_CHECK_TIMEOUT_SECS),
            validation_timeout: Duration::from_secs(VALIDATION_TIMEOUT_SECS),
            default_lifetime: Duration::from_secs(DEFAULT_LIFETIME_SECS),
            tick_interval: Duration::from_secs(TICK_INTERVAL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerdictSource {
    Token,
    Backend,
}

#[derive(Debug, Clone)]
struct Verdict {
    user: SessionUser,
    remaining_secs: u64,
    source: VerdictSource,
}

#[derive(Default)]
struct GuardTasks {
    countdown: Option<JoinHandle<()>>,
    soft_check: Option<JoinHandle<()>>,
}

impl GuardTasks {
    fn abort_all(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
        if let Some(handle) = self.soft_check.take() {
            handle.abort();
        }
    }
}

struct GuardInner {
    validator: Arc<dyn SessionValidator>,
    store: Arc<dyn TokenStore>,
    notifier: Arc<dyn Notifier>,
    options: GuardOptions,
    state: watch::Sender<SessionState>,
    /// Bumped on every token change or logout; in-flight validations
    /// started under an older value are dropped.
    generation: watch::Sender<u64>,
    tasks: Mutex<GuardTasks>,
}

impl GuardInner {
    fn tasks(&self) -> MutexGuard<'_, GuardTasks> {
        // Only join handles live here, so a poisoned lock is still usable
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        self.tasks
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
    }
}

/// Session guard handle. Clone is cheap and clones share one session.
#[derive(Clone)]
pub struct SessionGuard {
    inner: Arc<GuardInner>,
}

impl SessionGuard {
    pub fn new(
        validator: Arc<dyn SessionValidator>,
        store: Arc<dyn TokenStore>,
        notifier: Arc<dyn Notifier>,
        options: GuardOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let (generation, _) = watch::channel(0);
        Self {
            inner: Arc::new(GuardInner {
                validator,
                store,
                notifier,
                options,
                state,
                generation,
                tasks: Mutex::new(GuardTasks::default()),
            }),
        }
    }

    /// Observe state changes. Receivers see every transition and tick.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.inner.state.borrow().is_valid()
    }

    pub fn remaining_secs(&self) -> u64 {
        self.inner.state.borrow().remaining_secs
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    /// Pick up the startup token: `url_token` if given, else the stored one.
    /// Returns whether a token was found.
    pub fn acquire(&self, url_token: Option<String>) -> bool {
        let stored = match self.inner.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to read stored session");
                None
            }
        };

        debug!(
            url = url_token.is_some(),
            stored = stored.is_some(),
            "Looking for session token"
        );

        match resolve_token(url_token, stored) {
            Some(token) => {
                self.set_token(token);
                true
            }
            None => {
                info!("No session token found");
                false
            }
        }
    }

    /// Replace the token. Cancels in-flight validation and the countdown,
    /// persists the new token and restarts at `Validating`.
    pub fn set_token(&self, token: String) {
        info!(token = %token_preview(&token), "Session token set");
        self.inner.tasks().abort_all();

        // The generation moves under the state lock, so a check never pairs
        // the old token with the new generation.
        self.inner.state.send_modify(|s| {
            if let Err(e) = self.inner.store.save(&token) {
                warn!(error = %e, "Failed to persist session token");
            }
            *s = SessionState::validating(token);
            self.bump_generation();
        });
    }

    /// Validate the current token, updating state. See `check` for the reason
    /// behind a `false`.
    pub async fn validate(&self) -> bool {
        self.check().await.is_ok()
    }

    /// Validate the current token, returning why it is not valid.
    ///
    /// `SessionError::Cancelled` means a newer token or a logout arrived
    /// while waiting on the backend; state then belongs to that change.
    pub async fn check(&self) -> Result<(), SessionError> {
        let (token, generation) = self.current();
        let Some(token) = token else {
            debug!("No session token to validate");
            self.inner.state.send_modify(|s| s.invalidate());
            return Err(SessionError::NoToken);
        };
        self.check_at(token, generation).await
    }

    /// Token and generation read together under the state lock.
    fn current(&self) -> (Option<String>, u64) {
        let state = self.inner.state.borrow();
        (state.token.clone(), *self.inner.generation.borrow())
    }

    async fn check_at(&self, token: String, generation: u64) -> Result<(), SessionError> {
        if !self.apply_if_current(generation, |s| s.phase = SessionPhase::Validating) {
            debug!("Validation skipped, session changed meanwhile");
            return Err(SessionError::Cancelled);
        }
        self.inner.tasks().abort_all();

        match self.evaluate(&token, generation).await {
            Ok(verdict) => self.accept(&token, generation, verdict),
            Err(error) if error.is_terminal() => self.reject(generation, error),
            Err(error) => Err(error),
        }
    }

    /// Advance the countdown by one step.
    ///
    /// No-op unless the session is valid with time left. Returns whether the
    /// countdown should keep running.
    pub fn tick(&self) -> bool {
        let mut ticked = false;
        let mut exhausted = false;
        self.inner.state.send_if_modified(|s| {
            if !s.is_valid() || s.remaining_secs == 0 {
                return false;
            }
            s.remaining_secs -= 1;
            ticked = true;
            exhausted = s.remaining_secs == 0;
            true
        });

        if !ticked {
            return false;
        }
        if exhausted {
            info!("Session countdown reached zero");
            self.inner.notifier.notify(Notice::SessionExpired);
            self.logout();
            return false;
        }
        true
    }

    /// End the session. Safe to call repeatedly; each call raises one
    /// `Notice::LoggedOut`.
    pub fn logout(&self) {
        info!("Logging out");
        self.inner.tasks().abort_all();
        self.inner.state.send_modify(|s| {
            s.clear();
            self.clear_store();
            self.bump_generation();
        });
        self.inner.notifier.notify(Notice::LoggedOut);
    }

    /// Only ever called with the state lock held.
    fn bump_generation(&self) {
        self.inner.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    /// Apply `update` if no token change or logout happened since
    /// `generation` was read. Returns whether it was applied.
    fn apply_if_current(&self, generation: u64, update: impl FnOnce(&mut SessionState)) -> bool {
        self.inner.state.send_if_modified(|s| {
            if *self.inner.generation.borrow() != generation {
                return false;
            }
            update(s);
            true
        })
    }

    fn clear_store(&self) {
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
    }

    async fn evaluate(&self, token: &str, generation: u64) -> Result<Verdict, SessionError> {
        match decode(token) {
            Ok(payload) => match payload.expiry() {
                Some(expiry) => return local_verdict(&payload, expiry, Utc::now()),
                None => debug!("Token has no usable expires_at, asking backend"),
            },
            Err(e) => debug!(error = %e, "Token not decodable locally, asking backend"),
        }
        self.backend_verdict(token, generation).await
    }

    async fn backend_verdict(&self, token: &str, generation: u64) -> Result<Verdict, SessionError> {
        let timeout = self.inner.options.validation_timeout;
        let mut generations = self.inner.generation.subscribe();

        let call = tokio::time::timeout(timeout, self.inner.validator.validate(token));
        let outcome = tokio::select! {
            outcome = call => outcome,
            _ = generations.wait_for(|g| *g != generation) => return Err(SessionError::Cancelled),
        };

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(SessionError::Remote(e)),
            Err(_) => return Err(SessionError::Timeout(timeout.as_secs())),
        };
        debug!(valid = response.valid, "Backend validation response");

        if !response.valid {
            return Err(SessionError::Rejected(response.message));
        }

        let expiry = response.expires_at.as_deref().and_then(|raw| {
            let parsed = parse_instant(raw);
            if parsed.is_none() {
                warn!(expires_at = raw, "Unparsable expires_at from backend, using default lifetime");
            }
            parsed
        });
        let now = Utc::now();
        let remaining_secs = match expiry {
            Some(expiry) => seconds_until(expiry, now),
            None => self.inner.options.default_lifetime.as_secs(),
        };
        // A confirmation with no whole second left would leave nothing to count down
        if remaining_secs == 0 {
            return Err(SessionError::Expired(expiry.unwrap_or(now)));
        }

        Ok(Verdict {
            user: SessionUser::new(response.user_id, response.username),
            remaining_secs,
            source: VerdictSource::Backend,
        })
    }

    fn accept(&self, token: &str, generation: u64, verdict: Verdict) -> Result<(), SessionError> {
        let Verdict {
            user,
            remaining_secs,
            source,
        } = verdict;
        let user_id = user.user_id;

        let applied = self.apply_if_current(generation, |s| {
            s.phase = SessionPhase::Valid;
            s.user = Some(user);
            s.remaining_secs = remaining_secs;
        });
        if !applied {
            debug!("Validation result discarded, session changed meanwhile");
            return Err(SessionError::Cancelled);
        }
        info!(user_id, remaining_secs, source = ?source, "Session valid");

        if source == VerdictSource::Token {
            self.spawn_soft_check(token.to_string());
        }
        self.start_countdown();
        Ok(())
    }

    fn reject(&self, generation: u64, error: SessionError) -> Result<(), SessionError> {
        let applied = self.apply_if_current(generation, |s| {
            s.invalidate();
            self.clear_store();
        });
        if !applied {
            debug!(error = %error, "Validation result discarded, session changed meanwhile");
            return Err(SessionError::Cancelled);
        }

        warn!(error = %error, "Session invalid");
        self.inner.tasks().abort_all();
        self.inner.notifier.notify(Notice::SessionExpired);
        Err(error)
    }

    /// Ask the backend in the background; the answer is only logged.
    fn spawn_soft_check(&self, token: String) {
        let validator = Arc::clone(&self.inner.validator);
        let timeout = self.inner.options.soft_check_timeout;

        let handle = tokio::spawn(async move {
            match tokio::time::timeout(timeout, validator.validate(&token)).await {
                Ok(Ok(response)) => {
                    debug!(valid = response.valid, "Backend confirmation (non-blocking)")
                }
                Ok(Err(e)) => warn!(error = %e, "Backend validation failed (non-blocking)"),
                Err(_) => warn!(
                    timeout_secs = timeout.as_secs(),
                    "Backend validation timed out (non-blocking)"
                ),
            }
        });

        if let Some(previous) = self.inner.tasks().soft_check.replace(handle) {
            previous.abort();
        }
    }

    /// Start ticking, replacing any running countdown.
    fn start_countdown(&self) {
        let weak: Weak<GuardInner> = Arc::downgrade(&self.inner);
        let period = self.inner.options.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !(SessionGuard { inner }).tick() {
                    break;
                }
            }
        });

        if let Some(previous) = self.inner.tasks().countdown.replace(handle) {
            previous.abort();
        }
    }
}

fn local_verdict(
    payload: &SessionPayload,
    expiry: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Verdict, SessionError> {
    // Less than a whole second left counts as already expired
    let remaining_secs = seconds_until(expiry, now);
    if remaining_secs == 0 {
        return Err(SessionError::Expired(expiry));
    }
    Ok(Verdict {
        user: SessionUser::new(payload.user_id, payload.username.clone()),
        remaining_secs,
        source: VerdictSource::Token,
    })
}

/// Whole seconds from `now` to `expiry`, floored, never negative
fn seconds_until(expiry: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (expiry - now).num_milliseconds();
    if millis <= 0 {
        0
    } else {
        (millis / 1000) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, ValidationResponse};
    use crate::auth::store::MemoryTokenStore;
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FUTURE_TOKEN: &str = "A.eyJleHBpcmVzX2F0IjoiMjE5OS0wMS0wMVQwMDowMDowMFoifQ.C";
    const PAST_TOKEN: &str = "A.eyJleHBpcmVzX2F0IjoiMjAwMC0wMS0wMVQwMDowMDowMFoifQ.C";

    #[derive(Clone)]
    enum Reply {
        Valid(ValidationResponse),
        Reject,
        Fail,
        Hang,
    }

    struct FakeValidator {
        reply: Reply,
        calls: AtomicUsize,
    }

    impl FakeValidator {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionValidator for FakeValidator {
        async fn validate(&self, _token: &str) -> Result<ValidationResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.reply.clone() {
                Reply::Valid(response) => Ok(response),
                Reply::Reject => Ok(ValidationResponse {
                    valid: false,
                    message: Some("Invalid or expired session".to_string()),
                    ..Default::default()
                }),
                Reply::Fail => Err(ApiError::ServerError("boom".to_string())),
                Reply::Hang => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<Notice>>,
    }

    impl RecordingNotifier {
        fn notices(&self) -> Vec<Notice> {
            self.notices.lock().unwrap().clone()
        }

        fn count(&self, notice: Notice) -> usize {
            self.notices().iter().filter(|n| **n == notice).count()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, notice: Notice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct Harness {
        guard: SessionGuard,
        validator: Arc<FakeValidator>,
        store: Arc<MemoryTokenStore>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(reply: Reply) -> Harness {
        let validator = FakeValidator::new(reply);
        let store = Arc::new(MemoryTokenStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let guard = SessionGuard::new(
            validator.clone(),
            store.clone(),
            notifier.clone(),
            GuardOptions::default(),
        );
        Harness {
            guard,
            validator,
            store,
            notifier,
        }
    }

    fn token_with(payload: &str) -> String {
        format!("hdr.{}.sig", URL_SAFE_NO_PAD.encode(payload))
    }

    fn stored(h: &Harness) -> Option<String> {
        h.store.load().unwrap()
    }

    #[test]
    fn test_local_verdict_floors_remaining() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let expiry = now + chrono::Duration::milliseconds(90_700);
        let payload = SessionPayload {
            user_id: Some(42),
            username: Some("kai".to_string()),
            ..Default::default()
        };

        let verdict = local_verdict(&payload, expiry, now).unwrap();
        assert_eq!(verdict.remaining_secs, 90);
        assert_eq!(verdict.user, SessionUser { user_id: 42, username: "kai".to_string() });
        assert_eq!(verdict.source, VerdictSource::Token);
    }

    #[test]
    fn test_local_verdict_expired_at_boundary() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let payload = SessionPayload::default();
        assert!(matches!(local_verdict(&payload, now, now), Err(SessionError::Expired(_))));
    }

    #[test]
    fn test_local_verdict_sub_second_is_expired() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let expiry = now + chrono::Duration::milliseconds(600);
        let payload = SessionPayload::default();
        assert!(matches!(
            local_verdict(&payload, expiry, now),
            Err(SessionError::Expired(at)) if at == expiry
        ));
    }

    #[test]
    fn test_seconds_until_never_negative() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(seconds_until(now - chrono::Duration::seconds(5), now), 0);
        assert_eq!(seconds_until(now + chrono::Duration::milliseconds(999), now), 0);
        assert_eq!(seconds_until(now + chrono::Duration::seconds(61), now), 61);
    }

    #[tokio::test]
    async fn test_future_token_is_valid() {
        let h = harness(Reply::Fail);
        h.guard.set_token(FUTURE_TOKEN.to_string());

        assert!(h.guard.validate().await);
        let state = h.guard.snapshot();
        assert_eq!(state.phase, SessionPhase::Valid);
        assert!(state.remaining_secs > 0);
        assert_eq!(state.user, Some(SessionUser { user_id: 0, username: String::new() }));
        assert_eq!(stored(&h).as_deref(), Some(FUTURE_TOKEN));
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_remaining_matches_expiry() {
        let h = harness(Reply::Fail);
        let expiry = Utc::now() + chrono::Duration::seconds(600);
        let token = token_with(&format!(
            r#"{{"user_id":7,"username":"kai","expires_at":"{}"}}"#,
            expiry.to_rfc3339()
        ));
        h.guard.set_token(token);

        assert!(h.guard.validate().await);
        let remaining = h.guard.remaining_secs();
        assert!((598..=600).contains(&remaining), "remaining = {remaining}");
        assert_eq!(h.guard.snapshot().user.unwrap().username, "kai");
    }

    #[tokio::test]
    async fn test_past_token_is_rejected_and_cleared() {
        let h = harness(Reply::Valid(ValidationResponse {
            valid: true,
            ..Default::default()
        }));
        h.guard.set_token(PAST_TOKEN.to_string());

        assert!(matches!(h.guard.check().await, Err(SessionError::Expired(_))));
        assert!(!h.guard.is_valid());
        assert_eq!(h.guard.snapshot().phase, SessionPhase::Invalid);
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired]);
        // Local expiry is final; the backend is never asked
        assert_eq!(h.validator.calls(), 0);
    }

    #[tokio::test]
    async fn test_token_expiring_within_a_second_is_rejected() {
        let h = harness(Reply::Fail);
        let expiry = Utc::now() + chrono::Duration::milliseconds(600);
        h.guard.set_token(token_with(&format!(r#"{{"expires_at":"{}"}}"#, expiry.to_rfc3339())));

        assert!(matches!(h.guard.check().await, Err(SessionError::Expired(_))));
        let state = h.guard.snapshot();
        assert_eq!(state.phase, SessionPhase::Invalid);
        assert_eq!(state.remaining_secs, 0);
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired]);
        assert!(h.guard.inner.tasks().countdown.is_none());
    }

    #[tokio::test]
    async fn test_soft_check_failure_does_not_override() {
        let h = harness(Reply::Reject);
        h.guard.set_token(FUTURE_TOKEN.to_string());
        assert!(h.guard.validate().await);

        while h.validator.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        assert!(h.guard.is_valid());
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_token_falls_back_to_backend() {
        let expiry = Utc::now() + chrono::Duration::seconds(120);
        let h = harness(Reply::Valid(ValidationResponse {
            valid: true,
            user_id: Some(12345),
            username: Some("test_user".to_string()),
            expires_at: Some(expiry.to_rfc3339()),
            message: None,
        }));
        h.guard.set_token("opaque-token".to_string());

        assert!(h.guard.validate().await);
        assert_eq!(h.validator.calls(), 1);
        let state = h.guard.snapshot();
        assert_eq!(state.user, Some(SessionUser { user_id: 12345, username: "test_user".to_string() }));
        assert!((118..=120).contains(&state.remaining_secs));
    }

    #[tokio::test]
    async fn test_backend_without_expiry_uses_default_lifetime() {
        let h = harness(Reply::Valid(ValidationResponse {
            valid: true,
            user_id: Some(1),
            ..Default::default()
        }));
        h.guard.set_token(token_with(r#"{"user_id":1}"#));

        assert!(h.guard.validate().await);
        assert_eq!(h.guard.remaining_secs(), DEFAULT_LIFETIME_SECS);
    }

    #[tokio::test]
    async fn test_backend_past_expiry_is_expired() {
        let h = harness(Reply::Valid(ValidationResponse {
            valid: true,
            user_id: Some(1),
            expires_at: Some("2000-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }));
        h.guard.set_token("opaque".to_string());

        assert!(matches!(h.guard.check().await, Err(SessionError::Expired(_))));
        let state = h.guard.snapshot();
        assert_eq!(state.phase, SessionPhase::Invalid);
        assert!(state.user.is_none());
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_check_timeout_is_swallowed() {
        let h = harness(Reply::Hang);
        h.guard.set_token(FUTURE_TOKEN.to_string());
        assert!(h.guard.validate().await);
        let before = h.guard.remaining_secs();

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert!(h.guard.is_valid());
        assert_eq!(before - h.guard.remaining_secs(), 4);
        assert!(h.notifier.notices().is_empty());
        assert_eq!(h.validator.calls(), 1);
        assert!(h
            .guard
            .inner
            .tasks()
            .soft_check
            .as_ref()
            .is_some_and(|handle| handle.is_finished()));
    }

    #[tokio::test]
    async fn test_backend_rejection_invalidates() {
        let h = harness(Reply::Reject);
        h.guard.set_token("opaque".to_string());

        assert!(matches!(h.guard.check().await, Err(SessionError::Rejected(Some(_)))));
        assert!(!h.guard.is_valid());
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired]);
    }

    #[tokio::test]
    async fn test_backend_failure_invalidates() {
        let h = harness(Reply::Fail);
        h.guard.set_token("opaque".to_string());

        assert!(matches!(h.guard.check().await, Err(SessionError::Remote(_))));
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.count(Notice::SessionExpired), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_timeout_invalidates() {
        let h = harness(Reply::Hang);
        h.guard.set_token("opaque".to_string());

        assert!(matches!(
            h.guard.check().await,
            Err(SessionError::Timeout(VALIDATION_TIMEOUT_SECS))
        ));
        assert!(!h.guard.is_valid());
        assert_eq!(stored(&h), None);
    }

    #[tokio::test]
    async fn test_no_token() {
        let h = harness(Reply::Fail);
        assert!(matches!(h.guard.check().await, Err(SessionError::NoToken)));
        assert_eq!(h.guard.snapshot().phase, SessionPhase::Invalid);
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_token_change_cancels_backend_call() {
        let h = harness(Reply::Hang);
        h.guard.set_token("first".to_string());

        let guard = h.guard.clone();
        let pending = tokio::spawn(async move { guard.check().await });
        while h.validator.calls() == 0 {
            tokio::task::yield_now().await;
        }

        h.guard.set_token("second".to_string());
        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(SessionError::Cancelled)));

        let state = h.guard.snapshot();
        assert_eq!(state.token.as_deref(), Some("second"));
        assert_eq!(state.phase, SessionPhase::Validating);
        assert_eq!(stored(&h).as_deref(), Some("second"));
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_is_cancelled() {
        let h = harness(Reply::Fail);
        h.guard.set_token(PAST_TOKEN.to_string());
        let (token, generation) = h.guard.current();
        h.guard.set_token(FUTURE_TOKEN.to_string());

        let outcome = h.guard.check_at(token.unwrap(), generation).await;
        assert!(matches!(outcome, Err(SessionError::Cancelled)));

        let state = h.guard.snapshot();
        assert_eq!(state.token.as_deref(), Some(FUTURE_TOKEN));
        assert_eq!(state.phase, SessionPhase::Validating);
        assert!(state.user.is_none());
        assert_eq!(stored(&h).as_deref(), Some(FUTURE_TOKEN));
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn test_token_and_generation_move_together() {
        let h = harness(Reply::Fail);
        h.guard.set_token(PAST_TOKEN.to_string());
        let (first, g1) = h.guard.current();
        h.guard.set_token(FUTURE_TOKEN.to_string());
        let (second, g2) = h.guard.current();

        assert_eq!(first.as_deref(), Some(PAST_TOKEN));
        assert_eq!(second.as_deref(), Some(FUTURE_TOKEN));
        assert_ne!(g1, g2);

        // Checking under the current pair goes through
        assert!(h.guard.check_at(second.unwrap(), g2).await.is_ok());
        assert!(h.guard.is_valid());
    }

    #[test]
    fn test_tick_decrements() {
        let h = harness(Reply::Fail);
        h.guard.inner.state.send_modify(|s| {
            s.token = Some("t".to_string());
            s.phase = SessionPhase::Valid;
            s.remaining_secs = 5;
        });

        assert!(h.guard.tick());
        assert_eq!(h.guard.remaining_secs(), 4);
        assert!(h.notifier.notices().is_empty());
    }

    #[test]
    fn test_tick_at_one_logs_out_once() {
        let h = harness(Reply::Fail);
        h.store.save("t").unwrap();
        h.guard.inner.state.send_modify(|s| {
            s.token = Some("t".to_string());
            s.phase = SessionPhase::Valid;
            s.remaining_secs = 1;
            s.user = Some(SessionUser::new(Some(1), None));
        });

        assert!(!h.guard.tick());
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired, Notice::LoggedOut]);
        let state = h.guard.snapshot();
        assert_eq!(state.phase, SessionPhase::Invalid);
        assert!(state.token.is_none());
        assert!(state.user.is_none());
        assert_eq!(stored(&h), None);

        // Further ticks are inert
        assert!(!h.guard.tick());
        assert_eq!(h.notifier.count(Notice::LoggedOut), 1);
    }

    #[test]
    fn test_tick_ignored_when_invalid() {
        let h = harness(Reply::Fail);
        h.guard.inner.state.send_modify(|s| s.remaining_secs = 10);
        assert!(!h.guard.tick());
        assert_eq!(h.guard.remaining_secs(), 10);
    }

    #[test]
    fn test_logout_is_idempotent() {
        let h = harness(Reply::Fail);
        h.guard.set_token(FUTURE_TOKEN.to_string());

        h.guard.logout();
        let once = h.guard.snapshot();
        h.guard.logout();
        let twice = h.guard.snapshot();

        assert_eq!(once, twice);
        assert_eq!(once.phase, SessionPhase::Invalid);
        assert!(once.token.is_none());
        assert_eq!(once.remaining_secs, 0);
        assert_eq!(stored(&h), None);
        assert_eq!(h.notifier.notices(), vec![Notice::LoggedOut, Notice::LoggedOut]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_runs_to_logout() {
        let h = harness(Reply::Fail);
        let expiry = Utc::now() + chrono::Duration::milliseconds(3_500);
        h.guard.set_token(token_with(&format!(r#"{{"expires_at":"{}"}}"#, expiry.to_rfc3339())));

        let mut rx = h.guard.subscribe();
        assert!(h.guard.validate().await);
        let start = h.guard.remaining_secs();
        assert!((1..=3).contains(&start), "start = {start}");

        rx.wait_for(|s| !s.is_valid()).await.unwrap();
        assert_eq!(h.notifier.notices(), vec![Notice::SessionExpired, Notice::LoggedOut]);
        assert!(h.guard.snapshot().token.is_none());
        assert!(h.guard.inner.tasks().countdown.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_revalidation_keeps_single_countdown() {
        let h = harness(Reply::Fail);
        let expiry = Utc::now() + chrono::Duration::seconds(100);
        h.guard.set_token(token_with(&format!(r#"{{"expires_at":"{}"}}"#, expiry.to_rfc3339())));

        assert!(h.guard.validate().await);
        assert!(h.guard.validate().await);
        let before = h.guard.remaining_secs();

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // Two streams would have taken off four seconds
        assert_eq!(before - h.guard.remaining_secs(), 2);
    }

    #[tokio::test]
    async fn test_acquire_prefers_url_and_persists() {
        let h = harness(Reply::Fail);
        h.store.save("stored.token").unwrap();

        assert!(h.guard.acquire(Some("url.token".to_string())));
        assert_eq!(h.guard.token().as_deref(), Some("url.token"));
        assert_eq!(stored(&h).as_deref(), Some("url.token"));
        assert!(h.guard.snapshot().is_validating());
    }

    #[tokio::test]
    async fn test_acquire_falls_back_to_store() {
        let h = harness(Reply::Fail);
        assert!(!h.guard.acquire(None));
        assert_eq!(h.guard.snapshot().phase, SessionPhase::Uninitialized);

        h.store.save("stored.token").unwrap();
        assert!(h.guard.acquire(None));
        assert_eq!(h.guard.token().as_deref(), Some("stored.token"));
    }
}
