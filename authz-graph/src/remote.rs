use crate::{
    error::{AuthzError, Result},
    models::CheckAttributeResponse,
};
use tracing::debug;
use uuid::Uuid;

/// Header naming the tenant a request is evaluated for
pub const TENANT_HEADER: &str = "X-Tenant-ID";

/// Client for a peer service that evaluates attribute checks over HTTP
#[derive(Clone)]
pub struct RemoteEvaluator {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteEvaluator {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn check_attribute(
        &self,
        tenant_id: Uuid,
        source_object_id: Uuid,
        target_object_id: Uuid,
        attribute: &str,
    ) -> Result<CheckAttributeResponse> {
        debug!(
            tenant_id = %tenant_id,
            "remote check {} -[{}]-> {} via {}",
            source_object_id,
            attribute,
            target_object_id,
            self.base_url
        );
        let response = self
            .client
            .get(format!("{}/checkattribute", self.base_url))
            .header(TENANT_HEADER, tenant_id.to_string())
            .query(&[
                ("source_object_id", source_object_id.to_string()),
                ("target_object_id", target_object_id.to_string()),
                ("attribute", attribute.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthzError::RemoteEvaluator(format!(
                "checkattribute returned {}: {}",
                status, body
            )));
        }
        Ok(response.json::<CheckAttributeResponse>().await?)
    }
}
