use std::sync::Arc;

use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::{
    dao::{
        models::{ChangeEvent, Filter, OrderBy, Patch, Row, Table, row_id},
        session_store::SessionStore,
        storage::{StorageError, StorageResult},
    },
    dto::store::AffectedRows,
};

use super::{
    config::HttpStoreConfig,
    error::{HttpDaoError, HttpResult},
};

/// [`SessionStore`] client speaking to the `quiz-arena` store server.
///
/// CRUD goes through `/tables/{table}/rows`; subscriptions read the
/// `/tables/{table}/changes` event stream.
#[derive(Clone)]
pub struct HttpSessionStore {
    client: Client,
    base_url: Arc<str>,
}

impl HttpSessionStore {
    /// Build a client for the configured server. No request is sent.
    pub fn new(config: HttpStoreConfig) -> HttpResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| HttpDaoError::ClientBuilder { source })?;
        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        Ok(Self { client, base_url })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        self.client.request(method, url)
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> HttpResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|source| HttpDaoError::RequestSend {
                path: path.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(HttpDaoError::RequestStatus {
                path: path.to_string(),
                status: response.status(),
            })
        }
    }

    async fn send_json<T>(&self, builder: RequestBuilder, path: &str) -> HttpResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send(builder, path).await?;
        response
            .json::<T>()
            .await
            .map_err(|source| HttpDaoError::DecodeResponse {
                path: path.to_string(),
                source,
            })
    }
}

fn rows_path(table: Table) -> String {
    format!("tables/{table}/rows")
}

fn filter_query(
    table: Table,
    filter: &Filter,
    order_by: Option<&OrderBy>,
) -> HttpResult<Vec<(&'static str, String)>> {
    let encoded = serde_json::to_string(filter)
        .map_err(|source| HttpDaoError::EncodeFilter { table, source })?;
    let mut query = vec![("filter", encoded)];
    if let Some(order) = order_by {
        query.push(("order_by", order.column.clone()));
        query.push(("descending", order.descending.to_string()));
    }
    Ok(query)
}

impl SessionStore for HttpSessionStore {
    fn insert(&self, table: Table, row: Row) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let id = row_id(&row).unwrap_or_default().to_string();
            let path = rows_path(table);
            let response = store
                .request(Method::POST, &path)
                .json(&row)
                .send()
                .await
                .map_err(|source| HttpDaoError::RequestSend {
                    path: path.clone(),
                    source,
                })?;

            match response.status() {
                status if status.is_success() => Ok(()),
                StatusCode::CONFLICT => Err(StorageError::Conflict { table, id }),
                status => Err(HttpDaoError::RequestStatus { path, status }.into()),
            }
        })
    }

    fn update(
        &self,
        table: Table,
        filter: Filter,
        patch: Patch,
    ) -> BoxFuture<'static, StorageResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            let path = rows_path(table);
            let query = filter_query(table, &filter, None)?;
            let builder = store.request(Method::PATCH, &path).query(&query).json(&patch);
            let body: AffectedRows = store.send_json(builder, &path).await?;
            Ok(body.affected)
        })
    }

    fn select(
        &self,
        table: Table,
        filter: Filter,
        order_by: Option<OrderBy>,
    ) -> BoxFuture<'static, StorageResult<Vec<Row>>> {
        let store = self.clone();
        Box::pin(async move {
            let path = rows_path(table);
            let query = filter_query(table, &filter, order_by.as_ref())?;
            let builder = store.request(Method::GET, &path).query(&query);
            Ok(store.send_json(builder, &path).await?)
        })
    }

    fn delete(&self, table: Table, filter: Filter) -> BoxFuture<'static, StorageResult<usize>> {
        let store = self.clone();
        Box::pin(async move {
            let path = rows_path(table);
            let query = filter_query(table, &filter, None)?;
            let builder = store.request(Method::DELETE, &path).query(&query);
            let body: AffectedRows = store.send_json(builder, &path).await?;
            Ok(body.affected)
        })
    }

    fn subscribe(
        &self,
        table: Table,
        filter: Filter,
    ) -> BoxFuture<'static, StorageResult<BoxStream<'static, ChangeEvent>>> {
        let store = self.clone();
        Box::pin(async move {
            let path = format!("tables/{table}/changes");
            let query = filter_query(table, &filter, None)?;
            let builder = store.request(Method::GET, &path).query(&query);
            let response = store.send(builder, &path).await?;
            debug!(%table, "subscribed to store change stream");

            let stream = async_stream::stream! {
                let mut bytes = response.bytes_stream();
                let mut buffer: Vec<u8> = Vec::new();
                while let Some(chunk) = bytes.next().await {
                    match chunk {
                        Ok(chunk) => buffer.extend_from_slice(&chunk),
                        Err(err) => {
                            warn!(%table, error = %err, "store change stream interrupted");
                            break;
                        }
                    }
                    while let Some((end, separator)) = frame_end(&buffer) {
                        let frame: Vec<u8> = buffer.drain(..end + separator).collect();
                        if let Some(change) = parse_change_frame(&frame) {
                            yield change;
                        }
                    }
                }
            };
            let stream: BoxStream<'static, ChangeEvent> = Box::pin(stream);
            Ok(stream)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let path = "healthcheck";
            let builder = store.request(Method::GET, path);
            store.send(builder, path).await?;
            Ok(())
        })
    }
}

/// Offset and length of the blank line terminating the first complete event frame.
///
/// Lines may end in `\n` or `\r\n`.
fn frame_end(buffer: &[u8]) -> Option<(usize, usize)> {
    [b"\n\n".as_slice(), b"\r\n\r\n".as_slice()]
        .into_iter()
        .filter_map(|separator| {
            buffer
                .windows(separator.len())
                .position(|window| window == separator)
                .map(|at| (at, separator.len()))
        })
        .min_by_key(|(at, _)| *at)
}

/// Decode the `data:` lines of one event frame; comments and keep-alives yield nothing.
fn parse_change_frame(frame: &[u8]) -> Option<ChangeEvent> {
    let text = std::str::from_utf8(frame).ok()?;
    let data: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if data.is_empty() {
        return None;
    }

    match serde_json::from_str(&data.join("\n")) {
        Ok(change) => Some(change),
        Err(err) => {
            warn!(error = %err, "discarding undecodable change event");
            None
        }
    }
}
