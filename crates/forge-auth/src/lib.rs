//! Request-scoped authentication sessions.
//!
//! A request carries a [`RequestContext`]. [`AuthSessionManager::open`] turns
//! a [`Credential`] into a verified [`Identity`] through a
//! [`CredentialProvider`] and binds the resulting [`Session`] to that
//! context. The session is released exactly once: when the request closes
//! it, when the request is cancelled, or when its TTL runs out.

mod config;
pub use config::AuthConfig;

mod error;
pub use error::AuthError;

mod credential;
pub use credential::{Credential, CredentialProvider, Identity, TokenScheme};

mod context;
pub use context::RequestContext;

mod session;
pub use session::{AuthSessionManager, Session, SessionScope};

#[cfg(feature = "github")]
mod github;
#[cfg(feature = "github")]
pub use github::GithubProvider;
