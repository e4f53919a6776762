//! Agent socket endpoint.
//!
//! `GET /v1/agents/connect` upgrades to the persistent agent WebSocket.
//! The bearer token travels in the `Authorization` header or the `token`
//! query parameter; validation happens after the upgrade so auth failures
//! can be signaled with the protocol's 4001 close code.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::hub::session;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    token: Option<String>,
}

/// Agent connection routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/connect", get(connect_agent))
}

async fn connect_agent(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query.token.or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| session::run(socket, token, state))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth = headers.get("Authorization")?.to_str().ok()?;
    let token = auth.trim().strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
