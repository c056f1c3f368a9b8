use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use http::{StatusCode, header};
use tokio_util::sync::CancellationToken;

use crate::identity::IdentityTable;

#[derive(Clone)]
pub struct State {
    ready: CancellationToken,
    identities: IdentityTable,
}

impl State {
    /// `ready` is cancelled by the agent once it is fully started.
    pub fn new(ready: CancellationToken, identities: IdentityTable) -> Self {
        Self { ready, identities }
    }

    pub fn ready(&self) -> Readiness {
        if self.ready.is_cancelled() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/readyz", get(readyz))
        .route("/identities", get(identities))
        .with_state(state)
}

async fn metrics() -> String {
    crate::metrics::encode()
}

async fn readyz(AxumState(handler): AxumState<Arc<State>>) -> Readiness {
    handler.ready()
}

async fn identities(AxumState(handler): AxumState<Arc<State>>) -> Response {
    let snapshot = handler.identities.snapshot();
    Json(&*snapshot).into_response()
}

#[derive(Debug, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Readiness::Ready => (StatusCode::OK, "Ok"),
            Readiness::NotReady => (StatusCode::INTERNAL_SERVER_ERROR, "NotReady"),
        };
        (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
    }
}
