use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};

use crate::{error::ApiError, state::AppState};

/// Hop-by-hop headers that must never be forwarded verbatim in either
/// direction (RFC 7230 §6.1).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Reverse-proxies `{name}/proxy/*rest` to `http://127.0.0.1:<port>/*rest`,
/// starting the instance on demand if configured to do so. Streams the
/// upstream body without buffering and forwards the client's `X-Forwarded-For`.
pub async fn proxy(
    State(state): State<AppState>,
    Path((name, rest)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    mut headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let port = state.manager.resolve_for_proxy(&name).await?;

    let query = uri.query().map(|q| format!("?{q}")).unwrap_or_default();
    let target = format!("http://127.0.0.1:{port}/{rest}{query}");

    strip_hop_by_hop(&mut headers);
    headers.remove(axum::http::header::HOST);

    let mut upstream_req = state.proxy_client.request(method, &target);
    for (key, value) in headers.iter() {
        upstream_req = upstream_req.header(key, value);
    }
    upstream_req = upstream_req.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) if e.is_connect() => {
            return Ok((StatusCode::BAD_GATEWAY, format!("upstream connect failed: {e}")).into_response());
        }
        Err(e) => return Err(ApiError::internal(format!("proxy request failed: {e}"))),
    };

    let status = upstream_resp.status();
    let mut response_headers = upstream_resp.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let stream = upstream_resp.bytes_stream();
    let mut response = Response::builder().status(status).body(Body::from_stream(stream)).unwrap();
    response.headers_mut().extend(response_headers);

    Ok(response)
}
