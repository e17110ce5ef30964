use crate::credentials::Credentials;
use crate::error::UpstreamError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One usage report line the upstream returns for a metric: the application's
/// current usage against that metric and the limit it's being checked
/// against.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UsageReport {
    pub metric: String,
    pub current_value: i64,
    pub max_value: i64,
}

/// The structured equivalent of the duck-typed `AuthResult` the original
/// system passes around. Every field the Authorizer reads is present here,
/// nothing else.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AuthResult {
    pub success: bool,
    pub limits_exceeded: bool,
    pub error_code: Option<String>,
    pub usage_reports: Vec<UsageReport>,
    /// Parent metric -> child metrics. Absent parents have no entry.
    #[serde(default)]
    pub hierarchy: HashMap<String, Vec<String>>,
}

/// Parameters forwarded to the upstream call. `extensions.hierarchy` is
/// always requested by the Authorizer so the response includes the
/// hierarchy map.
#[derive(Debug, Clone)]
pub struct AuthRequestParams {
    pub service_id: String,
    pub creds: Credentials,
    pub hierarchy_extension: bool,
}

/// The one external operation this crate depends on: turn a service id plus
/// credentials into an [`AuthResult`]. Out of scope per SPEC_FULL.md §1 —
/// specified only via this trait. `oauth_authorize` and `authorize` are
/// separate methods because the upstream API distinguishes them at the
/// wire level even though callers only ever invoke whichever one
/// `Credentials::is_oauth` selects.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError>;
    async fn oauth_authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError>;
}

/// Thin JSON-over-HTTP client for a real rate-limiting upstream. Mirrors the
/// `reqwest::Client` usage already present in `integration-gateway`'s
/// `AppState::http_client`; this is the out-of-scope external collaborator,
/// provided only so the crate is runnable end to end.
pub struct ReqwestUpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestUpstreamClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    async fn call(&self, path: &str, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
        let mut query: Vec<(String, String)> = vec![("service_id".into(), params.service_id.clone())];
        if params.hierarchy_extension {
            query.push(("extensions[hierarchy]".into(), "1".into()));
        }
        for (key, value) in params.creds.creds() {
            query.push((key.clone(), value.clone()));
        }

        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|_| UpstreamError::Unavailable {
                service: params.service_id.clone(),
            })?;

        if response.status().is_server_error() {
            return Err(UpstreamError::Unavailable {
                service: params.service_id.clone(),
            });
        }

        response
            .json::<AuthResult>()
            .await
            .map_err(|e| UpstreamError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl Upstream for ReqwestUpstreamClient {
    async fn authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
        self.call("authorize", params).await
    }

    async fn oauth_authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
        self.call("oauth_authorize", params).await
    }
}

/// In-memory [`Upstream`] fake, in the same spirit as
/// `integration-gateway`'s `InMemoryRateLimiter`: a canned response (or
/// error) keyed by `service_id`, with no network involved. Not `cfg(test)`
/// so it's also reachable from this crate's `tests/` integration suite.
pub mod test_support {
    use super::*;
    use tokio::sync::Mutex;

    /// An in-memory [`Upstream`] fake, in the same spirit as
    /// `integration-gateway`'s `InMemoryRateLimiter`: a canned response (or
    /// error) keyed by `service_id`, with no network involved.
    pub struct FakeUpstream {
        responses: Mutex<HashMap<String, Result<AuthResult, UpstreamError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeUpstream {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub async fn set_response(&self, service_id: &str, result: Result<AuthResult, UpstreamError>) {
            self.responses
                .lock()
                .await
                .insert(service_id.to_string(), result);
        }

        pub async fn call_count(&self) -> usize {
            self.calls.lock().await.len()
        }

        async fn respond(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
            self.calls.lock().await.push(params.service_id.clone());
            let guard = self.responses.lock().await;
            match guard.get(&params.service_id) {
                Some(Ok(result)) => Ok(result.clone()),
                Some(Err(UpstreamError::Unavailable { service })) => Err(UpstreamError::Unavailable {
                    service: service.clone(),
                }),
                Some(Err(UpstreamError::MalformedResponse(msg))) => {
                    Err(UpstreamError::MalformedResponse(msg.clone()))
                }
                None => Err(UpstreamError::Unavailable {
                    service: params.service_id.clone(),
                }),
            }
        }
    }

    #[async_trait]
    impl Upstream for FakeUpstream {
        async fn authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
            self.respond(params).await
        }

        async fn oauth_authorize(&self, params: &AuthRequestParams) -> Result<AuthResult, UpstreamError> {
            self.respond(params).await
        }
    }
}
