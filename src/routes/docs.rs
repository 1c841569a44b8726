use axum::{Json, Router, routing::get};
use utoipa::{OpenApi, openapi::OpenApi as OpenApiDocument};

use crate::{services::documentation::ApiDoc, state::SharedState};

/// Serve the generated OpenAPI document.
pub fn router() -> Router<SharedState> {
    Router::new().route("/api-doc/openapi.json", get(openapi_json))
}

async fn openapi_json() -> Json<OpenApiDocument> {
    Json(ApiDoc::openapi())
}
