use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Identity, Session};

/// Lifecycle object of one inbound request.
///
/// Clones share the same id, cancellation token and session slot.
#[derive(Clone)]
pub struct RequestContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: String,
    token: CancellationToken,
    session: Mutex<Option<Arc<Session>>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Context whose lifetime is bound to `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4().to_string(),
                token,
                session: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// End the request: in-flight work bound to it stops.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Session bound to this request, if one was opened and not yet closed.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.slot().clone().filter(|s| !s.is_released())
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session().map(|s| s.identity().clone())
    }

    /// Bind `session` unless a live one is bound already; that one is returned instead.
    pub(crate) fn bind(&self, session: Arc<Session>) -> Result<(), Arc<Session>> {
        let mut slot = self.slot();
        if let Some(existing) = slot.as_ref().filter(|s| !s.is_released()) {
            return Err(Arc::clone(existing));
        }
        *slot = Some(session);
        Ok(())
    }

    pub(crate) fn take_session(&self) -> Option<Arc<Session>> {
        self.slot().take()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Session>>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let ctx = RequestContext::new();
        let clone = ctx.clone();
        assert_eq!(ctx.id(), clone.id());

        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(ctx.session().is_none());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(RequestContext::new().id(), RequestContext::new().id());
    }
}
