use anyhow::Result;
use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::client::BackendClient;

#[derive(Clone)]
pub struct ProxyState {
    client: BackendClient,
}

pub fn router(client: BackendClient) -> Router {
    Router::new()
        .route("/api/report", get(report))
        .route("/api/report/notify", post(notify))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ProxyState { client })
}

pub async fn serve(bind: &str, client: BackendClient) -> Result<()> {
    let backend = client.base().to_string();
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, %backend, "passthrough listening");
    axum::serve(listener, router(client)).await?;
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    run_id: Option<String>,
    inline: Option<String>,
}

fn non_empty(id: Option<String>) -> Option<String> {
    id.filter(|s| !s.trim().is_empty())
}

async fn report(State(st): State<ProxyState>, Query(q): Query<RunQuery>) -> Result<Response, ApiErr> {
    let run_id = non_empty(q.run_id).ok_or_else(ApiErr::missing_run_id)?;
    let inline = q.inline.as_deref() == Some("1");
    let upstream = st.client.report(&run_id, inline).await.map_err(ApiErr::upstream)?;
    Ok(relay(upstream))
}

/// The run id comes from the JSON body when it has one, else from the query string.
async fn notify(
    State(st): State<ProxyState>,
    Query(q): Query<RunQuery>,
    body: Bytes,
) -> Result<Response, ApiErr> {
    let from_body = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| v.get("run_id").and_then(Value::as_str).map(String::from));
    let run_id = non_empty(from_body)
        .or_else(|| non_empty(q.run_id))
        .ok_or_else(ApiErr::missing_run_id)?;
    let upstream = st.client.notify(&run_id).await.map_err(ApiErr::upstream)?;
    Ok(relay(upstream))
}

/// Upstream status, headers and body as-is, minus hop-by-hop headers.
fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    for name in [header::CONNECTION, header::TRANSFER_ENCODING, header::UPGRADE] {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    let mut resp = Response::new(Body::from_stream(upstream.bytes_stream()));
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

#[derive(Debug)]
struct ApiErr {
    status: StatusCode,
    error: &'static str,
    detail: Option<String>,
}

impl ApiErr {
    fn missing_run_id() -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: "missing_run_id", detail: None }
    }

    fn upstream(e: anyhow::Error) -> Self {
        tracing::warn!("passthrough upstream failed: {e:#}");
        Self { status: StatusCode::BAD_GATEWAY, error: "upstream_unreachable", detail: Some(format!("{e:#}")) }
    }
}

impl IntoResponse for ApiErr {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            detail: Option<String>,
        }
        (self.status, Json(ErrorResponse { error: self.error, detail: self.detail })).into_response()
    }
}
