use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI document of the session store server.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::store::insert_row,
        crate::routes::store::select_rows,
        crate::routes::store::update_rows,
        crate::routes::store::delete_rows,
        crate::routes::store::change_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::store::AffectedRows,
            crate::dao::models::Table,
            crate::dao::models::ChangeKind,
            crate::dao::models::ChangeEvent,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "store", description = "Session tables shared by every participant"),
    )
)]
pub struct ApiDoc;
