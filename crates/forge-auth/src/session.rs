use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{AuthConfig, AuthError, Credential, CredentialProvider, Identity, RequestContext};

/// A verified identity bound to one request for a bounded time.
#[derive(Debug)]
pub struct Session {
    request_id: String,
    identity: Identity,
    issued_at: SystemTime,
    ttl: Duration,
    /// Cancelled on release.
    token: CancellationToken,
    released: AtomicBool,
}

impl Session {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn issued_at(&self) -> SystemTime {
        self.issued_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Token cancelled when the session is released.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

type Sessions = Arc<Mutex<HashMap<String, Arc<Session>>>>;

/// Opens and releases request-bound sessions.
pub struct AuthSessionManager {
    provider: Arc<dyn CredentialProvider>,
    config: AuthConfig,
    sessions: Sessions,
}

impl AuthSessionManager {
    pub fn new(
        provider: Arc<dyn CredentialProvider>,
        config: AuthConfig,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Verify `credential` and bind the resulting session to `ctx`.
    ///
    /// The exchange runs under a child of the request token and is bounded by
    /// the exchange timeout; timeouts, rejections and request aborts are all
    /// `InvalidCredential` and leave nothing registered. Opening twice for
    /// one request returns the session already bound.
    #[instrument(level = "debug", skip(self, ctx, credential), fields(request = %ctx.id(), scheme = %credential.scheme))]
    pub async fn open(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<Arc<Session>, AuthError> {
        if !self.config.accepts(credential.scheme) {
            return Err(AuthError::AuthRequired);
        }
        if let Some(existing) = ctx.session() {
            return Ok(existing);
        }

        let identity = self.exchange(ctx, credential).await?;
        if ctx.is_cancelled() {
            return Err(AuthError::InvalidCredential("request aborted".into()));
        }

        let session = Arc::new(Session {
            request_id: ctx.id().to_string(),
            identity,
            issued_at: SystemTime::now(),
            ttl: self.config.session_ttl,
            token: CancellationToken::new(),
            released: AtomicBool::new(false),
        });
        // A concurrent open on the same request may have bound first.
        let bound = {
            let mut sessions = self.lock_sessions();
            let bound = ctx.bind(Arc::clone(&session));
            if bound.is_ok() {
                sessions.insert(ctx.id().to_string(), Arc::clone(&session));
            }
            bound
        };
        if let Err(winner) = bound {
            release(&self.sessions, &session, "concurrent open lost");
            return Ok(winner);
        }
        self.watch(ctx.token().clone(), Arc::clone(&session));

        info!(login = %session.identity.login, provider = %session.identity.provider, "session opened");
        Ok(session)
    }

    /// Parse the `Authorization` header value and open a session from it.
    pub async fn open_header(
        &self,
        ctx: &RequestContext,
        header: Option<&str>,
    ) -> Result<Arc<Session>, AuthError> {
        let credential = Credential::from_header(header)?;
        self.open(ctx, &credential).await
    }

    /// Release the session bound to `ctx`. No-op if none was opened.
    pub fn close(&self, ctx: &RequestContext) {
        if let Some(session) = ctx.take_session() {
            release(&self.sessions, &session, "request completed");
        }
    }

    /// Guard that closes the session of `ctx` when dropped.
    pub fn scope(&self, ctx: &RequestContext) -> SessionScope<'_> {
        SessionScope {
            manager: self,
            ctx: ctx.clone(),
        }
    }

    /// Live session of a request.
    pub fn session(&self, request_id: &str) -> Option<Arc<Session>> {
        self.lock_sessions().get(request_id).cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    async fn exchange(
        &self,
        ctx: &RequestContext,
        credential: &Credential,
    ) -> Result<Identity, AuthError> {
        let exchange_ctx = ctx.token().child_token();
        let _cancel_on_exit = exchange_ctx.clone().drop_guard();

        let result = tokio::select! {
            _ = ctx.token().cancelled() => {
                Err(AuthError::InvalidCredential("request aborted".into()))
            }
            exchanged = tokio::time::timeout(
                self.config.exchange_timeout,
                self.provider.exchange(credential, exchange_ctx.clone()),
            ) => match exchanged {
                Ok(result) => result,
                Err(_) => Err(AuthError::InvalidCredential(format!(
                    "credential exchange timed out after {:?}",
                    self.config.exchange_timeout
                ))),
            },
        };

        result.map_err(|e| {
            warn!(error = %e, "credential exchange failed");
            match e {
                AuthError::InvalidCredential(_) => e,
                other => AuthError::InvalidCredential(other.to_string()),
            }
        })
    }

    /// Release `session` once its request ends or its TTL elapses.
    fn watch(&self, request: CancellationToken, session: Arc<Session>) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = session.token.cancelled() => return,
                _ = request.cancelled() => "request cancelled",
                _ = tokio::time::sleep(session.ttl) => "ttl elapsed",
            };
            release(&sessions, &session, reason);
        });
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases `session` unless that already happened. Returns whether this call did it.
fn release(sessions: &Sessions, session: &Arc<Session>, reason: &'static str) -> bool {
    if session.released.swap(true, Ordering::AcqRel) {
        return false;
    }
    session.token.cancel();

    let mut map = sessions.lock().unwrap_or_else(PoisonError::into_inner);
    if map
        .get(&session.request_id)
        .is_some_and(|current| Arc::ptr_eq(current, session))
    {
        map.remove(&session.request_id);
    }
    debug!(request = %session.request_id, reason, "session released");
    true
}

/// Closes the request's session on drop, on every exit path.
pub struct SessionScope<'a> {
    manager: &'a AuthSessionManager,
    ctx: RequestContext,
}

impl SessionScope<'_> {
    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        self.manager.close(&self.ctx);
    }
}
