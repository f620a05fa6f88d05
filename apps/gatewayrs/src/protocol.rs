//! Minimal wiring stand-in for the protocol-conversion collaborator
//! (§6/§1 Non-goals: wire-format translation between Anthropic/OpenAI/
//! Gemini shapes is explicitly out of scope for this gateway). This
//! converter forwards the inbound body unchanged and only resolves the
//! upstream path/method, so the binary links and the pipeline can be
//! exercised end-to-end; a real deployment swaps this for the actual
//! translating converter.

use std::collections::HashMap;

use gatewayrs_common::Family;
use gatewayrs_protocol::{HttpMethod, InboundRequest, ProtocolConverter, ProtocolError, UpstreamHttpRequest, UpstreamHttpResponse};

pub struct PassthroughProtocolConverter;

impl ProtocolConverter for PassthroughProtocolConverter {
    fn build_upstream_request(
        &self,
        base_url: &str,
        target_family: Family,
        req: &InboundRequest,
        model_override: Option<&str>,
    ) -> Result<UpstreamHttpRequest, ProtocolError> {
        let path = match target_family {
            Family::Messages => "/v1/messages",
            Family::Responses => "/v1/responses",
            Family::Gemini => "/v1beta/models:generateContent",
        };
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        let body = if let Some(model) = model_override {
            rewrite_model(&req.body, model).unwrap_or_else(|| req.body.clone())
        } else {
            req.body.clone()
        };

        Ok(UpstreamHttpRequest {
            method: HttpMethod::Post,
            url: format!("{}{path}", base_url.trim_end_matches('/')),
            headers,
            body,
            is_stream: req.stream,
        })
    }

    fn render_error(&self, _client_family: Family, status: u16, upstream_body: &[u8]) -> UpstreamHttpResponse {
        UpstreamHttpResponse { status, headers: HashMap::new(), body: bytes::Bytes::copy_from_slice(upstream_body) }
    }
}

fn rewrite_model(body: &bytes::Bytes, model: &str) -> Option<bytes::Bytes> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.as_object_mut()?.insert("model".to_string(), serde_json::Value::String(model.to_string()));
    Some(bytes::Bytes::from(serde_json::to_vec(&value).ok()?))
}
