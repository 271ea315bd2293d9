//! Shared SSE decoding for the Anthropic-compatible backends (Anthropic
//! itself, Z.AI, Ollama, Azure AI Foundry): all four speak the same
//! `event: <name>\ndata: <json>\n\n` framing the dispatch core treats as
//! canonical, so one decoder serves all of them. Bedrock and Vertex have
//! their own translation from AWS Event-Stream / `generateContent` chunks
//! respectively and do not use this module.

use async_stream::stream;
use futures::StreamExt;
use reqwest::Response;

use crate::error::ProviderError;
use crate::models::StreamEvent;
use crate::providers::EventStream;

/// Decode a `reqwest::Response` body as Messages-format SSE into a stream of
/// [`StreamEvent`]. Buffers partial lines across chunk boundaries; a `data:`
/// payload that fails to parse as the expected event shape is surfaced as an
/// error rather than silently dropped, since a partial/garbled signature
/// event would otherwise go unnoticed.
pub fn decode_anthropic_sse(resp: Response) -> EventStream {
    Box::pin(stream! {
        let mut bytes_stream = resp.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    yield Err(ProviderError::Http(e));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(block_end) = buffer.find("\n\n") {
                let block = buffer[..block_end].to_string();
                buffer.drain(..block_end + 2);

                let mut data_lines = Vec::new();
                for line in block.lines() {
                    if let Some(data) = line.strip_prefix("data:") {
                        data_lines.push(data.trim());
                    }
                }
                if data_lines.is_empty() {
                    continue;
                }
                let payload = data_lines.join("\n");
                match serde_json::from_str::<StreamEvent>(&payload) {
                    Ok(event) => yield Ok(event),
                    Err(e) => yield Err(ProviderError::Serialization(e)),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn stream_response(body: &str) -> Response {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/stream"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(body.as_bytes().to_vec(), "text/event-stream"),
            )
            .mount(&server)
            .await;
        reqwest::get(format!("{}/stream", server.uri())).await.unwrap()
    }

    #[tokio::test]
    async fn decodes_a_sequence_of_events_split_across_blank_lines() {
        let body = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-3-opus\",\"content\":[],\"usage\":{\"input_tokens\":1,\"output_tokens\":0}}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";
        let resp = stream_response(body).await;
        let events: Vec<_> = decode_anthropic_sse(resp).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(events[1].is_ok());
    }

    #[tokio::test]
    async fn handles_a_data_payload_split_across_chunk_reassembly() {
        let body = "data: {\"type\":\"message_stop\"}\n\n";
        let resp = stream_response(body).await;
        let events: Vec<_> = decode_anthropic_sse(resp).collect().await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());
    }

    #[tokio::test]
    async fn surfaces_a_malformed_payload_as_an_error_rather_than_dropping_it() {
        let body = "data: {not json}\n\n";
        let resp = stream_response(body).await;
        let events: Vec<_> = decode_anthropic_sse(resp).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(ProviderError::Serialization(_))));
    }

    #[tokio::test]
    async fn ignores_blocks_with_no_data_lines() {
        let body = "event: ping\n\n";
        let resp = stream_response(body).await;
        let events: Vec<_> = decode_anthropic_sse(resp).collect().await;
        assert!(events.is_empty());
    }
}
