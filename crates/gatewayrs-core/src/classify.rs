//! Maps an inbound request's method/path to a protocol family and logical
//! endpoint name, ahead of permission enforcement.

use gatewayrs_common::Family;
use http::Method;

use crate::error::GatewayError;

#[derive(Debug, Clone)]
pub struct Classified {
    pub family: Family,
    pub endpoint: String,
}

pub fn classify_request(method: &Method, path: &str) -> Result<Classified, GatewayError> {
    let path = path.trim_start_matches('/');
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match segments.as_slice() {
        ["v1", "messages"] => {
            ensure_post(method)?;
            Ok(Classified { family: Family::Messages, endpoint: "/v1/messages".to_string() })
        }
        ["v1", "responses"] => {
            ensure_post(method)?;
            Ok(Classified { family: Family::Responses, endpoint: "/v1/responses".to_string() })
        }
        ["v1", "gemini", ..] => {
            ensure_post(method)?;
            Ok(Classified { family: Family::Gemini, endpoint: "/v1/gemini".to_string() })
        }
        _ => Err(GatewayError::bad_request(format!("unknown path: /{path}"))),
    }
}

fn ensure_post(method: &Method) -> Result<(), GatewayError> {
    if method != Method::POST {
        return Err(GatewayError::bad_request(format!("method {method} not allowed here")));
    }
    Ok(())
}
