use crate::{QueueResult, QueueError, JobEnvelope, codec::EnvelopeCodec};

pub const CONTENT_TYPE: &str = "application/json";

/// JSON codec for job envelopes
#[derive(Debug, Clone)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn encode(&self, envelope: &JobEnvelope) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(envelope).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> QueueResult<JobEnvelope> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;
    use serde_json::json;

    #[test]
    fn test_json_codec_preserves_envelope() {
        let codec = JsonCodec;
        let mut envelope = JobEnvelope::new(
            "index-document",
            json!({"index": "posts", "documentId": "42"}),
            JobOptions::new().with_max_retries(5),
        );
        envelope.attempts = 2;

        let bytes = codec.encode(&envelope).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_malformed_body_is_a_serialization_error() {
        let codec = JsonCodec;
        let result = codec.decode(b"not json at all");
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }

    #[test]
    fn test_body_missing_required_fields_is_rejected() {
        let codec = JsonCodec;
        let result = codec.decode(br#"{"payload": {}}"#);
        assert!(matches!(result, Err(QueueError::Serialization(_))));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(JsonCodec.content_type(), "application/json");
    }
}
