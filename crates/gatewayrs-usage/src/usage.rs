//! Usage extraction (§4.H): derives token counts from provider responses,
//! streaming or not, without understanding the wire protocol itself — the
//! extractor only ever looks for the handful of fields it needs.

use gatewayrs_common::Family;
use serde_json::Value;

use crate::sse::{SseEvent, SseParser};

/// Token usage accumulated over the lifetime of one request/response.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StreamUsage {
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
}

impl StreamUsage {
    fn merge_anthropic_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = v;
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = v;
        }
        if let Some(v) = usage.get("cache_creation_input_tokens").and_then(Value::as_u64) {
            self.cache_creation_input_tokens = v;
        }
        if let Some(v) = usage.get("cache_read_input_tokens").and_then(Value::as_u64) {
            self.cache_read_input_tokens = v;
        }
    }

    fn merge_openai_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("prompt_tokens").and_then(Value::as_u64) {
            self.input_tokens = v;
        }
        if let Some(v) = usage.get("completion_tokens").and_then(Value::as_u64) {
            self.output_tokens = v;
        }
        if let Some(v) = usage.get("input_tokens").and_then(Value::as_u64) {
            self.input_tokens = v;
        }
        if let Some(v) = usage.get("output_tokens").and_then(Value::as_u64) {
            self.output_tokens = v;
        }
        if let Some(details) = usage.get("prompt_tokens_details").or_else(|| usage.get("input_tokens_details")) {
            if let Some(v) = details.get("cached_tokens").and_then(Value::as_u64) {
                self.cache_read_input_tokens = v;
            }
        }
    }

    fn merge_gemini_usage(&mut self, usage: &Value) {
        if let Some(v) = usage.get("promptTokenCount").and_then(Value::as_u64) {
            self.input_tokens = v;
        }
        if let Some(v) = usage.get("candidatesTokenCount").and_then(Value::as_u64) {
            self.output_tokens = v;
        }
        if let Some(v) = usage.get("cachedContentTokenCount").and_then(Value::as_u64) {
            self.cache_read_input_tokens = v;
        }
    }
}

/// Accumulates usage across a stream of SSE events or a single JSON body.
/// Malformed chunks are logged and skipped rather than aborting extraction —
/// a usage miss degrades billing accuracy, it shouldn't fail the request.
#[derive(Debug)]
pub struct UsageExtractor {
    family: Family,
    parser: SseParser,
    usage: StreamUsage,
}

impl UsageExtractor {
    pub fn new(family: Family) -> Self {
        Self { family, parser: SseParser::new(), usage: StreamUsage::default() }
    }

    /// Feeds a chunk of an SSE body through the parser, folding any usage
    /// data found in completed events into the running total.
    pub fn push_sse_chunk(&mut self, chunk: &str) {
        let events = self.parser.push_str(chunk);
        for event in events {
            self.consume_event(&event);
        }
    }

    /// Call once after the upstream stream ends, to flush a final
    /// unterminated event still sitting in the line buffer.
    pub fn finish_stream(&mut self) {
        let events = self.parser.finish();
        for event in events {
            self.consume_event(&event);
        }
    }

    fn consume_event(&mut self, event: &SseEvent) {
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(err) => {
                if !event.data.trim().is_empty() && event.data.trim() != "[DONE]" {
                    tracing::warn!(error = %err, data = %event.data, "usage extractor: malformed SSE payload");
                }
                return;
            }
        };
        self.consume_json(&value);
    }

    fn consume_json(&mut self, value: &Value) {
        if let Some(model) = value.get("model").and_then(Value::as_str) {
            self.usage.model = Some(model.to_string());
        }

        match self.family {
            Family::Messages => self.consume_anthropic(value),
            Family::Responses => self.consume_openai(value),
            Family::Gemini => self.consume_gemini(value),
        }
    }

    fn consume_anthropic(&mut self, value: &Value) {
        // message_start carries the initial usage block; message_delta
        // carries the final output_tokens tally once generation finishes.
        if let Some(usage) = value.pointer("/message/usage") {
            self.usage.merge_anthropic_usage(usage);
        }
        if let Some(usage) = value.get("usage") {
            self.usage.merge_anthropic_usage(usage);
        }
    }

    fn consume_openai(&mut self, value: &Value) {
        if let Some(usage) = value.get("usage") {
            self.usage.merge_openai_usage(usage);
        }
        // Responses API terminal event nests usage under `response`.
        if let Some(usage) = value.pointer("/response/usage") {
            self.usage.merge_openai_usage(usage);
        }
        if let Some(model) = value.pointer("/response/model").and_then(Value::as_str) {
            self.usage.model = Some(model.to_string());
        }
    }

    fn consume_gemini(&mut self, value: &Value) {
        if let Some(usage) = value.get("usageMetadata") {
            self.usage.merge_gemini_usage(usage);
        }
    }

    /// Parses a complete, non-streaming JSON response body in one shot.
    pub fn extract_non_streaming(family: Family, body: &[u8]) -> Option<StreamUsage> {
        let value: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "usage extractor: malformed non-streaming body");
                return None;
            }
        };
        let mut extractor = UsageExtractor::new(family);
        extractor.consume_json(&value);
        Some(extractor.usage)
    }

    pub fn usage(&self) -> &StreamUsage {
        &self.usage
    }

    pub fn into_usage(self) -> StreamUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_message_start_then_delta() {
        let mut extractor = UsageExtractor::new(Family::Messages);
        extractor.push_sse_chunk(
            "event: message_start\ndata: {\"message\":{\"model\":\"claude-sonnet-4-5\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n\n",
        );
        extractor.push_sse_chunk(
            "event: message_delta\ndata: {\"usage\":{\"output_tokens\":42}}\n\n",
        );
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 42);
        assert_eq!(usage.model.as_deref(), Some("claude-sonnet-4-5"));
    }

    #[test]
    fn openai_chat_completions_terminal_usage() {
        let mut extractor = UsageExtractor::new(Family::Responses);
        extractor.push_sse_chunk(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
        );
        extractor.push_sse_chunk(
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\n\n",
        );
        extractor.push_sse_chunk("data: [DONE]\n\n");
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 5);
        assert_eq!(usage.output_tokens, 7);
    }

    #[test]
    fn openai_responses_api_completed_event() {
        let mut extractor = UsageExtractor::new(Family::Responses);
        extractor.push_sse_chunk(
            "event: response.completed\ndata: {\"response\":{\"model\":\"gpt-5\",\"usage\":{\"input_tokens\":3,\"output_tokens\":9}}}\n\n",
        );
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 3);
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.model.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn gemini_usage_metadata() {
        let mut extractor = UsageExtractor::new(Family::Gemini);
        extractor.push_sse_chunk(
            "data: {\"usageMetadata\":{\"promptTokenCount\":4,\"candidatesTokenCount\":6}}\n\n",
        );
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 4);
        assert_eq!(usage.output_tokens, 6);
    }

    #[test]
    fn malformed_chunk_is_skipped_not_fatal() {
        let mut extractor = UsageExtractor::new(Family::Messages);
        extractor.push_sse_chunk("data: {not json\n\n");
        extractor.push_sse_chunk("data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":2}}\n\n");
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 1);
        assert_eq!(usage.output_tokens, 2);
    }

    #[test]
    fn non_streaming_extraction() {
        let body = br#"{"model":"claude-opus-4","usage":{"input_tokens":10,"output_tokens":20,"cache_read_input_tokens":3}}"#;
        let usage = UsageExtractor::extract_non_streaming(Family::Messages, body).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 20);
        assert_eq!(usage.cache_read_input_tokens, 3);
        assert_eq!(usage.model.as_deref(), Some("claude-opus-4"));
    }

    #[test]
    fn finish_stream_flushes_unterminated_event() {
        let mut extractor = UsageExtractor::new(Family::Messages);
        extractor.push_sse_chunk("data: {\"usage\":{\"input_tokens\":1,\"output_tokens\":2}}");
        extractor.finish_stream();
        let usage = extractor.usage();
        assert_eq!(usage.input_tokens, 1);
        assert_eq!(usage.output_tokens, 2);
    }
}
