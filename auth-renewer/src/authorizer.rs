use crate::authorization::Authorization;
use crate::credentials::Credentials;
use crate::error::{AuthorizerError, UpstreamError};
use crate::upstream::{AuthRequestParams, AuthResult, Upstream, UsageReport};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Translates one upstream call into a per-metric authorization map, applying
/// hierarchy-aware limit propagation (SPEC_FULL.md §4.2). Holds its upstream
/// collaborator as a trait object so callers composing the renewer don't
/// have to thread an upstream type parameter through every layer above it.
pub struct Authorizer {
    upstream: Arc<dyn Upstream>,
}

impl Authorizer {
    pub fn new(upstream: impl Upstream + 'static) -> Self {
        Self {
            upstream: Arc::new(upstream),
        }
    }

    pub fn from_arc(upstream: Arc<dyn Upstream>) -> Self {
        Self { upstream }
    }

    pub async fn authorizations(
        &self,
        service_id: &str,
        creds: &Credentials,
        reported_metrics: &[String],
    ) -> Result<HashMap<String, Authorization>, AuthorizerError> {
        let params = AuthRequestParams {
            service_id: service_id.to_string(),
            creds: creds.clone(),
            hierarchy_extension: true,
        };

        let result = if creds.is_oauth() {
            self.upstream.oauth_authorize(&params).await
        } else {
            self.upstream.authorize(&params).await
        }
        .map_err(|err| match err {
            UpstreamError::Unavailable { service } => AuthorizerError::UpstreamUnavailable {
                service,
                creds: creds.clone(),
            },
            other => AuthorizerError::Upstream(other),
        })?;

        Ok(compute_authorizations(&result, reported_metrics))
    }
}

/// Pure function extracted from [`Authorizer::authorizations`] so the
/// hierarchy algorithm can be exercised directly without an upstream.
fn compute_authorizations(
    result: &AuthResult,
    reported_metrics: &[String],
) -> HashMap<String, Authorization> {
    if !result.success && !result.limits_exceeded {
        let reason = result.error_code.clone();
        return reported_metrics
            .iter()
            .map(|metric| {
                let auth = match &reason {
                    Some(r) => Authorization::deny(r.clone()),
                    None => Authorization::deny_no_reason(),
                };
                (metric.clone(), auth)
            })
            .collect();
    }

    let metrics_usage = group_usage_by_metric(&result.usage_reports);

    // Union of reported metrics and every metric the upstream mentioned
    // (either via usage reports or as a hierarchy parent/child).
    let mut all_metrics: HashSet<String> = reported_metrics.iter().cloned().collect();
    all_metrics.extend(metrics_usage.keys().cloned());
    for (parent, children) in &result.hierarchy {
        all_metrics.insert(parent.clone());
        all_metrics.extend(children.iter().cloned());
    }

    let ordered = order_parents_first(&all_metrics, &result.hierarchy);

    let mut decided: HashMap<String, Authorization> = HashMap::new();
    for metric in ordered {
        if decided.contains_key(&metric) {
            continue;
        }
        let usages = metrics_usage.get(&metric);
        let within_limits = usages
            .map(|reports| reports.iter().all(|r| r.current_value < r.max_value))
            .unwrap_or(true);

        if within_limits {
            decided.insert(metric.clone(), Authorization::Allow);
        } else {
            decided.insert(metric.clone(), Authorization::DenyOverLimits);
            if let Some(children) = result.hierarchy.get(&metric) {
                for child in children {
                    decided.insert(child.clone(), Authorization::DenyOverLimits);
                }
            }
        }
    }

    decided
}

fn group_usage_by_metric(usage_reports: &[UsageReport]) -> HashMap<String, Vec<UsageReport>> {
    let mut grouped: HashMap<String, Vec<UsageReport>> = HashMap::new();
    for report in usage_reports {
        grouped
            .entry(report.metric.clone())
            .or_default()
            .push(report.clone());
    }
    grouped
}

/// Orders metrics so every parent (any key of `hierarchy`) comes before
/// non-parents. The hierarchy is at most two levels deep, so a single
/// partition suffices — no topological sort needed.
fn order_parents_first(
    all_metrics: &HashSet<String>,
    hierarchy: &HashMap<String, Vec<String>>,
) -> Vec<String> {
    let mut parents: Vec<String> = Vec::new();
    let mut rest: Vec<String> = Vec::new();
    for metric in all_metrics {
        if hierarchy.contains_key(metric) {
            parents.push(metric.clone());
        } else {
            rest.push(metric.clone());
        }
    }
    parents.sort();
    rest.sort();
    parents.into_iter().chain(rest).collect()
}
