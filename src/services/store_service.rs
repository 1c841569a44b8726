use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use validator::Validate;

use crate::{
    dao::{
        models::{ChangeEvent, Patch, Row, Table},
        session_store::SessionStore,
    },
    dto::store::{AffectedRows, RowQuery},
    error::AppError,
    state::SharedState,
};

/// Name of the SSE event carrying a [`ChangeEvent`].
pub const CHANGE_EVENT: &str = "change";

/// Insert `row` into `table`.
pub async fn insert(state: &SharedState, table: Table, row: Row) -> Result<(), AppError> {
    state.store().insert(table, row).await?;
    Ok(())
}

/// Rows of `table` selected by `query`.
pub async fn select(
    state: &SharedState,
    table: Table,
    query: RowQuery,
) -> Result<Vec<Row>, AppError> {
    query.validate()?;
    let filter = query.filter()?;
    Ok(state.store().select(table, filter, query.order_by()).await?)
}

/// Apply `patch` to the rows of `table` selected by `query`.
pub async fn update(
    state: &SharedState,
    table: Table,
    query: RowQuery,
    patch: Patch,
) -> Result<AffectedRows, AppError> {
    let filter = query.filter()?;
    let affected = state.store().update(table, filter, patch).await?;
    Ok(AffectedRows { affected })
}

/// Delete the rows of `table` selected by `query`.
pub async fn delete(
    state: &SharedState,
    table: Table,
    query: RowQuery,
) -> Result<AffectedRows, AppError> {
    let filter = query.filter()?;
    let affected = state.store().delete(table, filter).await?;
    Ok(AffectedRows { affected })
}

/// Open a change feed on `table` and stream it as server-sent events.
pub async fn subscribe(
    state: &SharedState,
    table: Table,
    query: RowQuery,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>> + use<>>, AppError> {
    let filter = query.filter()?;
    let changes = state.store().subscribe(table, filter).await?;
    info!(%table, "change stream connected");
    Ok(to_sse_stream(table, changes))
}

/// Forward `changes` into an SSE response until the client disconnects.
fn to_sse_stream(
    table: Table,
    mut changes: BoxStream<'static, ChangeEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(8);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                next = changes.next() => {
                    let Some(change) = next else { break };
                    let data = match serde_json::to_string(&change) {
                        Ok(data) => data,
                        Err(err) => {
                            warn!(%table, error = %err, "failed to encode change event");
                            continue;
                        }
                    };
                    let event = Event::default().event(CHANGE_EVENT).data(data);
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
            }
        }

        info!(%table, "change stream disconnected");
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
