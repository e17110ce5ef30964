use crate::credentials::Credentials;
use thiserror::Error;

/// Errors raised by [`crate::upstream::Upstream`] implementations.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream unreachable for service {service:?}")]
    Unavailable { service: String },
    #[error("upstream returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// Errors raised by [`crate::authorizer::Authorizer`].
#[derive(Debug, Error)]
pub enum AuthorizerError {
    #[error("upstream unavailable for service {service:?}")]
    UpstreamUnavailable {
        service: String,
        creds: Credentials,
    },
    #[error("upstream call failed: {0}")]
    Upstream(#[from] UpstreamError),
}

/// Errors raised by [`crate::storage::Storage`].
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to renew auths for service {service:?}")]
    RenewAuth { service: String, creds: Credentials },
    #[error("kv operation failed: {0}")]
    Kv(#[from] KvError),
}

/// Errors surfaced by a [`crate::kv::KvStore`] implementation.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("command error: {0}")]
    Command(String),
    #[error("rename target already exists: {0}")]
    RenameCollision(String),
}

/// Errors raised by the renewer's subscription loop. Only this variant is
/// re-raised to the caller of `start()`; everything else is logged and
/// swallowed so one bad message never takes the loop down.
#[derive(Debug, Error)]
pub enum RenewerError {
    #[error("subscription primitive failed: {0}")]
    Subscription(#[from] KvError),
}
