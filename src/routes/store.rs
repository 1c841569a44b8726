use std::convert::Infallible;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;

use crate::{
    dao::models::{Patch, Row, Table},
    dto::store::{AffectedRows, RowQuery},
    error::AppError,
    services::store_service,
    state::SharedState,
};

/// Routes exposing the session tables.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route(
            "/tables/{table}/rows",
            get(select_rows)
                .post(insert_row)
                .patch(update_rows)
                .delete(delete_rows),
        )
        .route("/tables/{table}/changes", get(change_stream))
}

/// Insert one row.
#[utoipa::path(
    post,
    path = "/tables/{table}/rows",
    tag = "store",
    params(("table" = Table, Path, description = "Target table")),
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Row inserted"),
        (status = 400, description = "Row lacks a string `id`"),
        (status = 409, description = "A row with the same id exists")
    )
)]
pub async fn insert_row(
    State(state): State<SharedState>,
    Path(table): Path<Table>,
    Json(row): Json<Row>,
) -> Result<StatusCode, AppError> {
    store_service::insert(&state, table, row).await?;
    Ok(StatusCode::CREATED)
}

/// Select the rows matching the filter.
#[utoipa::path(
    get,
    path = "/tables/{table}/rows",
    tag = "store",
    params(("table" = Table, Path, description = "Target table"), RowQuery),
    responses((status = 200, description = "Matching rows", body = Vec<serde_json::Value>))
)]
pub async fn select_rows(
    State(state): State<SharedState>,
    Path(table): Path<Table>,
    Query(query): Query<RowQuery>,
) -> Result<Json<Vec<Row>>, AppError> {
    let rows = store_service::select(&state, table, query).await?;
    Ok(Json(rows))
}

/// Patch the rows matching the filter.
#[utoipa::path(
    patch,
    path = "/tables/{table}/rows",
    tag = "store",
    params(("table" = Table, Path, description = "Target table"), RowQuery),
    request_body = serde_json::Value,
    responses((status = 200, description = "Rows updated", body = AffectedRows))
)]
pub async fn update_rows(
    State(state): State<SharedState>,
    Path(table): Path<Table>,
    Query(query): Query<RowQuery>,
    Json(patch): Json<Patch>,
) -> Result<Json<AffectedRows>, AppError> {
    let affected = store_service::update(&state, table, query, patch).await?;
    Ok(Json(affected))
}

/// Delete the rows matching the filter.
#[utoipa::path(
    delete,
    path = "/tables/{table}/rows",
    tag = "store",
    params(("table" = Table, Path, description = "Target table"), RowQuery),
    responses((status = 200, description = "Rows deleted", body = AffectedRows))
)]
pub async fn delete_rows(
    State(state): State<SharedState>,
    Path(table): Path<Table>,
    Query(query): Query<RowQuery>,
) -> Result<Json<AffectedRows>, AppError> {
    let affected = store_service::delete(&state, table, query).await?;
    Ok(Json(affected))
}

/// Stream changes to the rows matching the filter.
#[utoipa::path(
    get,
    path = "/tables/{table}/changes",
    tag = "store",
    params(("table" = Table, Path, description = "Target table"), RowQuery),
    responses((status = 200, description = "`change` events carrying a ChangeEvent", content_type = "text/event-stream", body = String))
)]
pub async fn change_stream(
    State(state): State<SharedState>,
    Path(table): Path<Table>,
    Query(query): Query<RowQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    store_service::subscribe(&state, table, query).await
}
