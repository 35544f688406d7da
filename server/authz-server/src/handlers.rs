use crate::error::ApiError;
use crate::state::AppState;
use authz_graph::{CheckAttributeResponse, ListObjectsReachableWithAttributeResponse, TENANT_HEADER};
use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::request::Parts,
    Json,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Tenant a request is evaluated for, taken from the `X-Tenant-ID` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(TENANT_HEADER)
            .ok_or_else(|| ApiError::bad_request(format!("missing {} header", TENANT_HEADER)))?;
        let value = header
            .to_str()
            .map_err(|_| ApiError::bad_request(format!("{} header is not valid text", TENANT_HEADER)))?;
        let tenant_id = Uuid::parse_str(value.trim())
            .map_err(|e| ApiError::bad_request(format!("invalid {} header: {}", TENANT_HEADER, e)))?;
        Ok(TenantId(tenant_id))
    }
}

/// Query string parameters, rejected as an [`ApiError`] when missing or
/// malformed
#[derive(Debug, Clone)]
pub struct QueryParams<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(params) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        Ok(QueryParams(params))
    }
}

#[derive(Debug, Deserialize)]
pub struct CheckAttributeParams {
    pub source_object_id: Uuid,
    pub target_object_id: Uuid,
    pub attribute: String,
}

#[derive(Debug, Deserialize)]
pub struct ListReachableParams {
    pub source_object_id: Uuid,
    pub target_object_type_id: Uuid,
    pub attribute: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAttributesParams {
    pub source_object_id: Uuid,
    pub target_object_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// `GET /checkattribute`
pub async fn check_attribute(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    QueryParams(params): QueryParams<CheckAttributeParams>,
) -> Result<Json<CheckAttributeResponse>, ApiError> {
    if params.attribute.is_empty() {
        return Err(ApiError::bad_request("attribute must not be empty"));
    }
    debug!(
        tenant_id = %tenant_id,
        "checkattribute {} -[{}]-> {}",
        params.source_object_id,
        params.attribute,
        params.target_object_id
    );
    let response = state
        .engine(tenant_id)
        .check_attribute(params.source_object_id, params.target_object_id, &params.attribute)
        .await?;
    Ok(Json(response))
}

/// `GET /listobjectsreachablewithattribute`
pub async fn list_objects_reachable_with_attribute(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    QueryParams(params): QueryParams<ListReachableParams>,
) -> Result<Json<ListObjectsReachableWithAttributeResponse>, ApiError> {
    if params.attribute.is_empty() {
        return Err(ApiError::bad_request("attribute must not be empty"));
    }
    let objects = state
        .engine(tenant_id)
        .list_objects_reachable_with_attribute(
            params.source_object_id,
            params.target_object_type_id,
            &params.attribute,
        )
        .await?;
    Ok(Json(ListObjectsReachableWithAttributeResponse { data: objects }))
}

/// `GET /listattributes`
pub async fn list_attributes(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    QueryParams(params): QueryParams<ListAttributesParams>,
) -> Result<Json<Vec<String>>, ApiError> {
    let attributes = state
        .engine(tenant_id)
        .list_attributes(params.source_object_id, params.target_object_id)
        .await?;
    Ok(Json(attributes))
}
