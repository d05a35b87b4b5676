//! API v1 routes.

mod nodes;
mod webhooks;

pub use nodes::NODE_SECRET_HEADER;

use axum::Router;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/nodes", nodes::routes())
        .nest("/webhooks", webhooks::routes())
}
