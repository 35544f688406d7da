//! HTTP surface of the authz graph engine
//!
//! Serves attribute checks and listings for any tenant named by the
//! `X-Tenant-ID` header. The same `/checkattribute` endpoint is what
//! peer processes call when configured as a remote evaluator.

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiErrorResponse};
pub use state::{AppState, InMemoryStores, PostgresStores, StoreProvider};

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Build the application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/checkattribute", get(handlers::check_attribute))
        .route(
            "/listobjectsreachablewithattribute",
            get(handlers::list_objects_reachable_with_attribute),
        )
        .route("/listattributes", get(handlers::list_attributes))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
