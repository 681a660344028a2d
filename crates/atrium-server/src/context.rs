//! Business context: tenant facts the agent needs in its system prompt.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use atrium_core::TenantKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl BusinessContext {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Prompt section for this context. `None` when there is nothing to say.
    pub fn render(&self) -> Option<String> {
        let mut out = self.summary.trim().to_string();
        let has_details = match &self.details {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            _ => true,
        };
        if has_details {
            if let Ok(pretty) = serde_json::to_string_pretty(&self.details) {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(&pretty);
            }
        }
        (!out.is_empty()).then_some(out)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context source unreachable: {0}")]
    Unreachable(String),
    #[error("context source returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid context payload: {0}")]
    Invalid(String),
}

impl ContextError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Invalid(_) => false,
        }
    }
}

#[async_trait]
pub trait BusinessContextProvider: Send + Sync {
    async fn fetch(&self, tenant: &TenantKey) -> Result<BusinessContext, ContextError>;
}

/// Fixed per-tenant contexts with a shared fallback.
#[derive(Default)]
pub struct StaticContextProvider {
    contexts: HashMap<TenantKey, BusinessContext>,
    fallback: BusinessContext,
}

impl StaticContextProvider {
    pub fn new(fallback: BusinessContext) -> Self {
        Self {
            contexts: HashMap::new(),
            fallback,
        }
    }

    pub fn with_tenant(mut self, tenant: TenantKey, context: BusinessContext) -> Self {
        self.contexts.insert(tenant, context);
        self
    }
}

#[async_trait]
impl BusinessContextProvider for StaticContextProvider {
    async fn fetch(&self, tenant: &TenantKey) -> Result<BusinessContext, ContextError> {
        Ok(self.contexts.get(tenant).unwrap_or(&self.fallback).clone())
    }
}

/// Reads `GET {base}/context/{tenant_id}/{user_id}`.
pub struct HttpContextProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpContextProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ContextError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContextError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BusinessContextProvider for HttpContextProvider {
    #[instrument(skip(self), fields(tenant = %tenant))]
    async fn fetch(&self, tenant: &TenantKey) -> Result<BusinessContext, ContextError> {
        let url = format!("{}/context/{}/{}", self.base_url, tenant.tenant_id, tenant.user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ContextError::Unreachable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ContextError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let context = response
            .json::<BusinessContext>()
            .await
            .map_err(|e| ContextError::Invalid(e.to_string()))?;
        debug!(summary_len = context.summary.len(), "business context fetched");
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn render_joins_summary_and_details() {
        let ctx = BusinessContext {
            summary: "Acme sells widgets.".into(),
            details: serde_json::json!({"fiscal_year_end": "March"}),
        };
        let rendered = ctx.render().unwrap();
        assert!(rendered.starts_with("Acme sells widgets."));
        assert!(rendered.contains("fiscal_year_end"));
        assert!(BusinessContext::default().render().is_none());
    }

    #[tokio::test]
    async fn static_provider_falls_back() {
        let acme = TenantKey::new("alice", "acme");
        let provider = StaticContextProvider::new(BusinessContext::new("generic"))
            .with_tenant(acme.clone(), BusinessContext::new("acme specific"));
        assert_eq!(provider.fetch(&acme).await.unwrap().summary, "acme specific");
        let other = TenantKey::new("bob", "globex");
        assert_eq!(provider.fetch(&other).await.unwrap().summary, "generic");
    }

    #[tokio::test]
    async fn http_provider_reads_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/context/acme/alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "summary": "Acme sells widgets.",
                "details": {"region": "EU"}
            })))
            .mount(&server)
            .await;

        let provider = HttpContextProvider::new(server.uri(), Duration::from_secs(5)).unwrap();
        let ctx = provider.fetch(&TenantKey::new("alice", "acme")).await.unwrap();
        assert_eq!(ctx.summary, "Acme sells widgets.");
        assert_eq!(ctx.details["region"], "EU");
    }

    #[tokio::test]
    async fn http_provider_classifies_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let provider = HttpContextProvider::new(format!("{}/", server.uri()), Duration::from_secs(5)).unwrap();
        let err = provider.fetch(&TenantKey::new("alice", "acme")).await.unwrap_err();
        assert!(matches!(err, ContextError::Status { status: 503, .. }));
        assert!(err.is_transient());
    }
}
