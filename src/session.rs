//! Authentication state machine.
//!
//! `Unauthenticated` → `login` → `Authenticated` → `logout`/`invalidate` →
//! `Unauthenticated`. Transitions run under one async mutex, so a second
//! caller needing a session waits for an in-progress login instead of
//! starting another. Requests read the auth header from an immutable
//! snapshot that a transition swaps out whole.

use arc_swap::ArcSwap;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::Credentials;
use crate::dispatch::Dispatcher;
use crate::errors::{BricataError, Failure, FailureKind, Result};
use crate::results::{aggregate, Results};
use crate::transport::{Headers, Request};

pub const LOGIN_ENDPOINT: &str = "/login/";
pub const LOGOUT_ENDPOINT: &str = "/logout/";
pub const AUTHORIZATION: &str = "Authorization";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// Snapshot of the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub state: SessionState,
    pub token: Option<String>,
    pub token_type: Option<String>,
    /// Auth header installed by login
    pub header: Option<Headers>,
}

impl AuthSession {
    fn unauthenticated() -> Self {
        Self {
            state: SessionState::Unauthenticated,
            token: None,
            token_type: None,
            header: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginToken {
    token: String,
    token_type: String,
}

/// Owns the session and gates every authenticated batch
pub struct SessionManager {
    dispatcher: Dispatcher,
    credentials: Option<Arc<Credentials>>,
    base_headers: Arc<Headers>,
    session: Mutex<AuthSession>,
    headers: ArcSwap<Headers>,
}

impl SessionManager {
    pub fn new(dispatcher: Dispatcher, credentials: Option<Arc<Credentials>>) -> Self {
        let mut base_headers = Headers::new();
        base_headers.insert(
            "Content-Type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        let base_headers = Arc::new(base_headers);

        Self {
            dispatcher,
            credentials,
            headers: ArcSwap::new(base_headers.clone()),
            base_headers,
            session: Mutex::new(AuthSession::unauthenticated()),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Headers currently attached to outgoing requests
    pub fn headers(&self) -> Arc<Headers> {
        self.headers.load_full()
    }

    pub fn is_authenticated(&self) -> bool {
        self.headers.load().contains_key(AUTHORIZATION)
    }

    /// Copy of the session, waiting for any transition in progress
    pub async fn session(&self) -> AuthSession {
        self.session.lock().await.clone()
    }

    /// Log in unless a session is already active
    ///
    /// Returns empty [`Results`] when already authenticated.
    ///
    /// # Errors
    ///
    /// Returns an error if no credentials are configured or the login batch
    /// is timed out. A rejected login is reported in `Results::failure`.
    #[instrument(name = "SessionManager::login", skip_all)]
    pub async fn login(&self) -> Result<Results> {
        let mut session = self.session.lock().await;
        if session.state == SessionState::Authenticated {
            debug!("Already authenticated");
            return Ok(Results::default());
        }
        self.login_locked(&mut session).await
    }

    /// Log in even if a session is already active
    #[instrument(name = "SessionManager::relogin", skip_all)]
    pub async fn relogin(&self) -> Result<Results> {
        let mut session = self.session.lock().await;
        self.login_locked(&mut session).await
    }

    /// Log out and drop the local session
    ///
    /// The local session is cleared even when the logout call fails, since the
    /// server may already have rotated the token. No-op when not
    /// authenticated.
    #[instrument(name = "SessionManager::logout", skip_all)]
    pub async fn logout(&self) -> Result<Results> {
        let mut session = self.session.lock().await;
        if session.state == SessionState::Unauthenticated {
            debug!("Not authenticated; nothing to log out");
            return Ok(Results::default());
        }

        debug!("Logging out of Bricata");
        let outcome = match self.credentials.as_deref() {
            Some(credentials) => {
                let request = Request::post(LOGOUT_ENDPOINT)
                    .with_body(json!({ "username": credentials.username }));
                let headers = self.headers.load_full();
                self.dispatcher
                    .dispatch(std::slice::from_ref(&request), &headers)
                    .await
                    .map(|outcomes| aggregate(outcomes, None))
            }
            None => Err(BricataError::MissingCredentials),
        };

        self.clear(&mut session);

        match &outcome {
            Ok(results) if !results.is_ok() => {
                warn!(failures = results.failure.len(), "Logout failed; local session cleared anyway")
            }
            Ok(_) => debug!("Logged out"),
            Err(err) => warn!(error = %err, "Logout aborted; local session cleared anyway"),
        }
        outcome
    }

    /// Drop the local session without contacting the server
    pub async fn invalidate(&self) {
        let mut session = self.session.lock().await;
        self.clear(&mut session);
    }

    /// Run `requests` with the session's auth header, logging in first if needed
    ///
    /// If the lazy login fails, every request gets an
    /// [`FailureKind::AuthRequired`] entry and none is sent.
    ///
    /// # Errors
    ///
    /// Returns an error only for call-aborting conditions: missing
    /// credentials or a batch timeout.
    pub async fn execute(&self, requests: Vec<Request>, data_key: Option<&str>) -> Result<Results> {
        let headers = match self.ensure_authenticated().await? {
            Ok(headers) => headers,
            Err(failure) => return Ok(auth_required(&requests, &failure)),
        };
        let outcomes = self.dispatcher.dispatch(&requests, &headers).await?;
        Ok(aggregate(outcomes, data_key))
    }

    /// Like [`execute`](Self::execute), aborting the batch when `token` fires
    ///
    /// # Errors
    ///
    /// Additionally returns [`BricataError::Cancelled`] on cancellation.
    pub async fn execute_cancellable(
        &self,
        requests: Vec<Request>,
        data_key: Option<&str>,
        token: &CancellationToken,
    ) -> Result<Results> {
        let headers = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BricataError::Cancelled),
            auth = self.ensure_authenticated() => match auth? {
                Ok(headers) => headers,
                Err(failure) => return Ok(auth_required(&requests, &failure)),
            },
        };
        let outcomes = self
            .dispatcher
            .dispatch_cancellable(&requests, &headers, token)
            .await?;
        Ok(aggregate(outcomes, data_key))
    }

    async fn ensure_authenticated(&self) -> Result<std::result::Result<Arc<Headers>, Failure>> {
        let mut session = self.session.lock().await;
        if session.state == SessionState::Authenticated {
            return Ok(Ok(self.headers.load_full()));
        }

        debug!("No active session; logging in");
        let results = self.login_locked(&mut session).await?;
        if session.state == SessionState::Authenticated {
            return Ok(Ok(self.headers.load_full()));
        }

        Ok(Err(results.failure.into_iter().next().unwrap_or_else(|| {
            Failure::new(Uuid::nil(), FailureKind::AuthFailed, "login produced no result")
        })))
    }

    async fn login_locked(&self, session: &mut AuthSession) -> Result<Results> {
        let credentials = self
            .credentials
            .as_deref()
            .ok_or(BricataError::MissingCredentials)?;

        debug!(username = %credentials.username, "Logging in to Bricata");
        let request = Request::post(LOGIN_ENDPOINT).with_body(json!({
            "username": credentials.username,
            "password": credentials.password.expose_secret(),
        }));

        let outcomes = self
            .dispatcher
            .dispatch(std::slice::from_ref(&request), &self.base_headers)
            .await?;
        let mut results = aggregate(outcomes, None);

        if let Some(success) = results.success.pop() {
            match serde_json::from_value::<LoginToken>(success.data.clone()) {
                Ok(token) => {
                    self.install(session, token);
                    results.success.push(success);
                    debug!("Logged in");
                }
                Err(e) => {
                    warn!(error = %e, "Login response carried no usable token");
                    results.failure.push(
                        Failure::new(
                            success.request_id,
                            FailureKind::AuthFailed,
                            format!("unexpected login response: {e}"),
                        )
                        .with_status(success.status),
                    );
                }
            }
        } else {
            warn!(failures = results.failure.len(), "Login failed");
        }

        Ok(results)
    }

    fn install(&self, session: &mut AuthSession, token: LoginToken) {
        let value = format!("{} {}", token.token_type, token.token);

        let mut header = Headers::new();
        header.insert(AUTHORIZATION.to_string(), value.clone());

        let mut headers = (*self.base_headers).clone();
        headers.insert(AUTHORIZATION.to_string(), value);
        self.headers.store(Arc::new(headers));

        *session = AuthSession {
            state: SessionState::Authenticated,
            token: Some(token.token),
            token_type: Some(token.token_type),
            header: Some(header),
        };
    }

    fn clear(&self, session: &mut AuthSession) {
        self.headers.store(self.base_headers.clone());
        *session = AuthSession::unauthenticated();
    }
}

fn auth_required(requests: &[Request], cause: &Failure) -> Results {
    Results {
        success: Vec::new(),
        failure: requests
            .iter()
            .map(|request| {
                Failure::new(
                    request.id(),
                    FailureKind::AuthRequired,
                    format!("login failed: {cause}"),
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::tests::ScriptedTransport;
    use crate::retry::{Jitter, RetryPolicy};

    const TOKEN: &str = r#"{"token": "abc", "token_type": "Bearer"}"#;

    fn manager(transport: Arc<ScriptedTransport>) -> SessionManager {
        let dispatcher = Dispatcher::new(transport)
            .with_policy(RetryPolicy::default().with_jitter(Jitter::None));
        SessionManager::new(
            dispatcher,
            Some(Arc::new(Credentials::new("analyst", "s3cret"))),
        )
    }

    fn auth_header(transport: &ScriptedTransport, endpoint: &str) -> Vec<Option<String>> {
        transport
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, h)| h.get(AUTHORIZATION).cloned())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_installs_header() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        let results = manager.login().await.unwrap();

        assert!(results.is_ok());
        assert_eq!(results.success.len(), 1);
        assert!(manager.is_authenticated());
        assert_eq!(
            manager.headers().get(AUTHORIZATION),
            Some(&"Bearer abc".to_string())
        );

        let session = manager.session().await;
        assert_eq!(session.state, SessionState::Authenticated);
        assert_eq!(session.token.as_deref(), Some("abc"));
        assert_eq!(session.token_type.as_deref(), Some("Bearer"));
        // Login itself goes out without an auth header
        assert_eq!(auth_header(&transport, LOGIN_ENDPOINT), vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_is_idempotent_unless_forced() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        manager.login().await.unwrap();
        let second = manager.login().await.unwrap();
        assert!(second.is_empty());
        assert_eq!(transport.calls_to(LOGIN_ENDPOINT), 1);

        manager.relogin().await.unwrap();
        assert_eq!(transport.calls_to(LOGIN_ENDPOINT), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_login_happens_once() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        manager.execute(vec![Request::get("/tags/")], None).await.unwrap();
        manager.execute(vec![Request::get("/tags/")], None).await.unwrap();

        assert_eq!(transport.call_log(), vec![LOGIN_ENDPOINT, "/tags/", "/tags/"]);
        assert_eq!(
            auth_header(&transport, "/tags/"),
            vec![Some("Bearer abc".to_string()), Some("Bearer abc".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_login() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        let (a, b) = tokio::join!(
            manager.execute(vec![Request::get("/tags/")], None),
            manager.execute(vec![Request::get("/alerts/")], None),
        );

        assert!(a.unwrap().is_ok());
        assert!(b.unwrap().is_ok());
        assert_eq!(transport.calls_to(LOGIN_ENDPOINT), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_marks_every_request() {
        let transport = Arc::new(ScriptedTransport::new().script(LOGIN_ENDPOINT, &[401]));
        let manager = manager(transport.clone());

        let requests = vec![Request::get("/alert/1"), Request::get("/alert/2")];
        let ids: Vec<Uuid> = requests.iter().map(Request::id).collect();
        let results = manager.execute(requests, None).await.unwrap();

        assert!(results.success.is_empty());
        assert_eq!(results.failure.len(), 2);
        assert!(results
            .failure
            .iter()
            .all(|f| f.kind == FailureKind::AuthRequired));
        assert_eq!(
            results.failure.iter().map(|f| f.request_id).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(transport.call_log(), vec![LOGIN_ENDPOINT]);
        assert!(!manager.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_without_token_is_auth_failed() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, r#"{"ok": true}"#));
        let manager = manager(transport);

        let results = manager.login().await.unwrap();

        assert!(results.success.is_empty());
        assert_eq!(results.failure.len(), 1);
        assert_eq!(results.failure[0].kind, FailureKind::AuthFailed);
        assert_eq!(results.failure[0].status, Some(200));
        assert_eq!(manager.session().await.state, SessionState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_credentials() {
        let transport = Arc::new(ScriptedTransport::new());
        let manager = SessionManager::new(Dispatcher::new(transport.clone()), None);

        let err = manager
            .execute(vec![Request::get("/tags/")], None)
            .await
            .unwrap_err();

        assert!(matches!(err, BricataError::MissingCredentials));
        assert!(transport.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_session() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        manager.login().await.unwrap();
        let results = manager.logout().await.unwrap();

        assert!(results.is_ok());
        assert!(!manager.is_authenticated());
        assert_eq!(manager.session().await, AuthSession::unauthenticated());
        assert_eq!(
            auth_header(&transport, LOGOUT_ENDPOINT),
            vec![Some("Bearer abc".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_session_even_on_failure() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .body(LOGIN_ENDPOINT, TOKEN)
                .script(LOGOUT_ENDPOINT, &[500]),
        );
        let manager = manager(transport.clone());

        manager.login().await.unwrap();
        let results = manager.logout().await.unwrap();

        assert_eq!(results.failure.len(), 1);
        assert_eq!(results.failure[0].kind, FailureKind::ServerFault);
        assert_eq!(manager.session().await.state, SessionState::Unauthenticated);
        assert_eq!(manager.headers().get(AUTHORIZATION), None);

        // Next authenticated call logs in again
        manager.execute(vec![Request::get("/tags/")], None).await.unwrap();
        assert_eq!(transport.calls_to(LOGIN_ENDPOINT), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_when_unauthenticated_is_noop() {
        let transport = Arc::new(ScriptedTransport::new());
        let manager = manager(transport.clone());

        let results = manager.logout().await.unwrap();

        assert!(results.is_empty());
        assert!(transport.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_new_login() {
        let transport = Arc::new(ScriptedTransport::new().body(LOGIN_ENDPOINT, TOKEN));
        let manager = manager(transport.clone());

        manager.login().await.unwrap();
        manager.invalidate().await;
        assert!(!manager.is_authenticated());

        manager.login().await.unwrap();
        assert_eq!(transport.calls_to(LOGIN_ENDPOINT), 2);
        assert!(transport.calls_to(LOGOUT_ENDPOINT) == 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_cancellable() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .body(LOGIN_ENDPOINT, TOKEN)
                .delay("/alerts/", std::time::Duration::from_secs(30)),
        );
        let manager = manager(transport.clone());
        let token = CancellationToken::new();

        let canceller = {
            let token = token.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                token.cancel();
            }
        };

        let (result, ()) = tokio::join!(
            manager.execute_cancellable(vec![Request::get("/alerts/")], Some("objects"), &token),
            canceller
        );

        assert!(matches!(result, Err(BricataError::Cancelled)));
        // The login finished before cancellation and stays valid
        assert!(manager.is_authenticated());
    }
}
