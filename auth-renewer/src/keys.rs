use crate::credentials::Credentials;
use thiserror::Error;

/// The single well-known request channel every client handler publishes to
/// on a cache miss.
pub const AUTH_REQUESTS_CHANNEL: &str = "auth_requests";

/// Set of report-hash keys currently accumulating usage (not yet snapshotted
/// for a flush).
pub const SET_KEYS_CACHED_REPORTS: &str = "report_keys";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("key {0:?} does not have the expected \"to_flush:<key>{1:?}\" shape")]
    MalformedFlushedKey(String, String),
    #[error("key {0:?} does not have the expected \"report:<service>:<creds>\" shape")]
    MalformedReportKey(String),
}

/// Pure naming functions deriving KV keys and channel names from
/// (service, credentials, metric, suffix). Holds no state and no I/O.
pub struct StorageKeys;

impl StorageKeys {
    pub fn auth_hash_key(service_id: &str, creds: &Credentials) -> String {
        format!("auth:{}:{}", service_id, creds.to_sorted_escaped_s())
    }

    pub fn report_hash_key(service_id: &str, creds: &Credentials) -> String {
        format!("report:{}:{}", service_id, creds.to_sorted_escaped_s())
    }

    pub fn flushing_report_keys_set(suffix: &str) -> String {
        format!("flushing_report_keys{suffix}")
    }

    pub fn name_key_to_flush(key: &str, suffix: &str) -> String {
        format!("to_flush:{key}{suffix}")
    }

    /// Inverse of [`Self::name_key_to_flush`] composed with
    /// [`Self::report_hash_key`]: recovers `(service_id, creds_canonical)`
    /// from a `to_flush:report:<service>:<creds><suffix>` key. Returns the
    /// canonical credentials *string*, not a reconstructed [`Credentials`]
    /// (the escaping is reversible but the original field names are not
    /// recoverable from the canonical form alone).
    pub fn service_and_creds(
        flushed_key: &str,
        suffix: &str,
    ) -> Result<(String, String), KeyParseError> {
        let without_suffix = flushed_key.strip_suffix(suffix).ok_or_else(|| {
            KeyParseError::MalformedFlushedKey(flushed_key.to_string(), suffix.to_string())
        })?;
        let without_prefix = without_suffix
            .strip_prefix("to_flush:report:")
            .ok_or_else(|| {
                KeyParseError::MalformedFlushedKey(flushed_key.to_string(), suffix.to_string())
            })?;
        let mut parts = without_prefix.splitn(2, ':');
        let service = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KeyParseError::MalformedReportKey(flushed_key.to_string()))?;
        let creds = parts
            .next()
            .ok_or_else(|| KeyParseError::MalformedReportKey(flushed_key.to_string()))?;
        Ok((service.to_string(), creds.to_string()))
    }

    pub fn pubsub_auths_resp_channel(service_id: &str, creds: &Credentials, metric: &str) -> String {
        format!(
            "auths_resp:{}:{}:{}",
            service_id,
            creds.to_sorted_escaped_s(),
            metric
        )
    }
}
