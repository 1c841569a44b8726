use axum::Router;

use crate::state::SharedState;

pub mod docs;
pub mod health;
pub mod store;

/// Compose all route trees, wiring in shared state and documentation routes.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(store::router())
        .merge(docs::router())
        .with_state(state)
}
