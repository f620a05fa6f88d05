//! A concrete `UpstreamClient` (§4.G step 5's HTTP dispatch) built on
//! `wreq`, mirroring `gproxy-core::upstream_client::WreqUpstreamClient`.
//! Unlike that client this one always streams the body back through the
//! tee in `gatewayrs-core::pipeline`, since usage extraction needs the
//! incremental chunks regardless of whether the caller asked to stream.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use gatewayrs_core::{DispatchError, UpstreamClient, UpstreamStreamResponse};
use gatewayrs_protocol::{HttpMethod, UpstreamHttpRequest};
use wreq::{Client, Method};

pub struct WreqUpstreamClient {
    client: Client,
}

impl WreqUpstreamClient {
    pub fn new() -> Result<Self, wreq::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(600))
            .read_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamClient for WreqUpstreamClient {
    async fn send(&self, request: UpstreamHttpRequest) -> Result<UpstreamStreamResponse, DispatchError> {
        let method = match request.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
        };

        let mut builder = self.client.request(method, &request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(classify_wreq_error)?;
        let status = response.status().as_u16();
        let headers = headers_from_wreq(response.headers());

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, DispatchError>>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let item = item.map_err(classify_wreq_error);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        let body = Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)) as gatewayrs_core::BodyStream;
        Ok(UpstreamStreamResponse { status, headers, body })
    }
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), value.to_string());
        }
    }
    out
}

fn classify_wreq_error(err: wreq::Error) -> DispatchError {
    if err.is_timeout() {
        return DispatchError::Network(format!("timeout: {err}"));
    }
    if err.is_connect() {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("tls") {
            return DispatchError::TlsHandshake(message);
        }
        return DispatchError::Network(message);
    }
    DispatchError::Network(err.to_string())
}
