use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use gatewayrs_core::{DispatchHandle, ErrorKind, GatewayError, PipelineOutcome, RequestPipeline};
use tokio_stream::StreamExt;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
}

pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/responses", post(handle_responses))
        .route("/v1/gemini/{*rest}", post(handle_gemini))
        .with_state(state)
}

async fn handle_messages(state: State<AppState>, conn: ConnectInfo<SocketAddr>, req: Request) -> Response {
    dispatch(state, conn, req, "/v1/messages").await
}

async fn handle_responses(state: State<AppState>, conn: ConnectInfo<SocketAddr>, req: Request) -> Response {
    dispatch(state, conn, req, "/v1/responses").await
}

async fn handle_gemini(state: State<AppState>, conn: ConnectInfo<SocketAddr>, req: Request) -> Response {
    dispatch(state, conn, req, "/v1/gemini").await
}

/// Common admission path for all three frontend families: pull the
/// fields the pipeline needs out of the request (method/headers/client
/// ip, plus `model`/`stream` from the JSON body — reading those two
/// top-level fields is not itself protocol conversion), run the
/// pipeline, and shape the result into an axum response.
async fn dispatch(State(state): State<AppState>, ConnectInfo(peer): ConnectInfo<SocketAddr>, req: Request, path: &str) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let client_ip = client_ip(&headers, peer);

    let body = match axum::body::to_bytes(req.into_body(), 64 * 1024 * 1024).await {
        Ok(body) => body,
        Err(_) => return error_response(&GatewayError::new(ErrorKind::PayloadTooLarge, "request body too large")),
    };

    let (requested_model, stream, session_id) = peek_body_fields(&body);

    match state
        .pipeline
        .handle(&method, path, &headers, &client_ip, body, &requested_model, stream, session_id)
        .await
    {
        Ok(PipelineOutcome::Dispatched(handle)) => dispatched_response(handle, stream),
        Ok(PipelineOutcome::Exhausted(err)) => error_response(&err),
        Err(err) => error_response(&err),
    }
}

fn peek_body_fields(body: &Bytes) -> (String, bool, Option<String>) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        tracing::debug!(bytes = body.len(), "request body is not a JSON object, model/stream default");
        return (String::new(), false, None);
    };
    let model = value.get("model").and_then(|m| m.as_str()).unwrap_or_default().to_string();
    let stream = value.get("stream").and_then(|s| s.as_bool()).unwrap_or(false);
    let session_id = value
        .get("session_id")
        .or_else(|| value.get("metadata").and_then(|m| m.get("session_id")))
        .and_then(|s| s.as_str())
        .map(|s| s.to_string());
    (model, stream, session_id)
}

fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

fn dispatched_response(handle: DispatchHandle, stream: bool) -> Response {
    let mut builder = Response::builder().status(StatusCode::from_u16(handle.status).unwrap_or(StatusCode::OK));
    {
        let response_headers = builder.headers_mut().expect("builder has no error yet");
        for (name, value) in &handle.headers {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                response_headers.insert(name, value);
            }
        }
        if stream {
            response_headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        }
    }
    let body_stream = tokio_stream::wrappers::ReceiverStream::new(spawn_forwarder(handle.body));
    builder.body(Body::from_stream(body_stream)).unwrap_or_else(|_| {
        error_response(&GatewayError::new(ErrorKind::Internal, "failed to build response"))
    })
}

/// Bridges the pipeline's `BodyStream` into a channel so a dropped
/// client connection doesn't hang the upstream-reading task; the tee
/// inside the pipeline still finishes the usage extraction regardless.
fn spawn_forwarder(
    mut body: gatewayrs_core::BodyStream,
) -> tokio::sync::mpsc::Receiver<Result<Bytes, std::io::Error>> {
    let (tx, rx) = tokio::sync::mpsc::channel(32);
    tokio::spawn(async move {
        while let Some(chunk) = body.next().await {
            let forwarded = match chunk {
                Ok(bytes) => tx.send(Ok(bytes)).await,
                Err(err) => tx.send(Err(std::io::Error::other(err.to_string()))).await,
            };
            if forwarded.is_err() {
                break;
            }
        }
    });
    rx
}

fn error_response(err: &GatewayError) -> Response {
    let mut builder = Response::builder().status(err.status_code());
    {
        let headers = builder.headers_mut().expect("builder has no error yet");
        headers.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(info) = err.rate_limit {
            if let Ok(v) = HeaderValue::from_str(&info.limit.to_string()) {
                headers.insert("x-ratelimit-limit", v);
            }
            if let Ok(v) = HeaderValue::from_str(&info.remaining.to_string()) {
                headers.insert("x-ratelimit-remaining", v);
            }
            let reset_secs = info.reset_at.unix_timestamp().max(0);
            if let Ok(v) = HeaderValue::from_str(&reset_secs.to_string()) {
                headers.insert("x-ratelimit-reset", v.clone());
                headers.insert(axum::http::header::RETRY_AFTER, v);
            }
        }
    }
    let envelope = err.exhausted_envelope(None);
    builder.body(Body::from(envelope)).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_body_fields_reads_model_and_stream() {
        let body = Bytes::from_static(br#"{"model":"claude-haiku-4-5","stream":true}"#);
        let (model, stream, session_id) = peek_body_fields(&body);
        assert_eq!(model, "claude-haiku-4-5");
        assert!(stream);
        assert_eq!(session_id, None);
    }

    #[test]
    fn peek_body_fields_reads_nested_metadata_session_id() {
        let body = Bytes::from_static(br#"{"model":"m","metadata":{"session_id":"s-1"}}"#);
        let (_, _, session_id) = peek_body_fields(&body);
        assert_eq!(session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn peek_body_fields_tolerates_malformed_json() {
        let body = Bytes::from_static(b"not json");
        let (model, stream, session_id) = peek_body_fields(&body);
        assert_eq!(model, "");
        assert!(!stream);
        assert_eq!(session_id, None);
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.7, 10.0.0.1"));
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(client_ip(&headers, peer), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_peer_addr() {
        let peer: SocketAddr = "198.51.100.2:443".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), peer), "198.51.100.2");
    }
}
