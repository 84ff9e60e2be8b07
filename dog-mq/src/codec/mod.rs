pub mod json;

use std::collections::HashMap;
use std::sync::Arc;

use crate::{QueueResult, QueueError, JobEnvelope};

/// Wire codec for job envelopes
pub trait EnvelopeCodec: Send + Sync {
    /// Serialize an envelope into a message body
    fn encode(&self, envelope: &JobEnvelope) -> QueueResult<Vec<u8>>;

    /// Parse a message body back into an envelope
    fn decode(&self, bytes: &[u8]) -> QueueResult<JobEnvelope>;

    /// MIME type stamped on published messages and used to pick a decoder
    fn content_type(&self) -> &'static str;
}

/// Registry of envelope codecs keyed by content type
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn EnvelopeCodec>>,
    default_codec: String,
}

impl CodecRegistry {
    /// Create a new codec registry with JSON as default
    pub fn new() -> Self {
        let mut registry = Self {
            codecs: HashMap::new(),
            default_codec: json::CONTENT_TYPE.to_string(),
        };

        registry.register(Arc::new(json::JsonCodec));
        registry
    }

    /// Register a new codec
    pub fn register(&mut self, codec: Arc<dyn EnvelopeCodec>) {
        let content_type = codec.content_type().to_string();
        self.codecs.insert(content_type, codec);
    }

    /// Get a codec by content type
    pub fn get_codec(&self, content_type: &str) -> QueueResult<Arc<dyn EnvelopeCodec>> {
        self.codecs
            .get(content_type)
            .cloned()
            .ok_or_else(|| QueueError::CodecNotFound(content_type.to_string()))
    }

    /// Get the codec used for publishing
    pub fn default_codec(&self) -> QueueResult<Arc<dyn EnvelopeCodec>> {
        self.get_codec(&self.default_codec)
    }

    /// Set the codec used for publishing
    pub fn set_default_codec(&mut self, content_type: &str) -> QueueResult<()> {
        if self.codecs.contains_key(content_type) {
            self.default_codec = content_type.to_string();
            Ok(())
        } else {
            Err(QueueError::CodecNotFound(content_type.to_string()))
        }
    }

    /// List registered content types
    pub fn available_codecs(&self) -> Vec<String> {
        self.codecs.keys().cloned().collect()
    }

    /// Encode with the default codec, returning the body and its content type
    pub fn encode(&self, envelope: &JobEnvelope) -> QueueResult<(Vec<u8>, &'static str)> {
        let codec = self.default_codec()?;
        let body = codec.encode(envelope)?;
        Ok((body, codec.content_type()))
    }

    /// Decode a delivery body; messages without a content type use the default codec
    pub fn decode(&self, content_type: Option<&str>, bytes: &[u8]) -> QueueResult<JobEnvelope> {
        let codec = match content_type {
            Some(content_type) => self.get_codec(content_type)?,
            None => self.default_codec()?,
        };
        codec.decode(bytes)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for CodecRegistry {
    fn clone(&self) -> Self {
        Self {
            codecs: self.codecs.clone(),
            default_codec: self.default_codec.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;
    use serde_json::json;

    #[test]
    fn json_is_the_default() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.default_codec().unwrap().content_type(), "application/json");
        assert_eq!(registry.available_codecs(), vec!["application/json".to_string()]);
    }

    #[test]
    fn unknown_content_type_is_rejected() {
        let registry = CodecRegistry::new();
        let result = registry.decode(Some("application/msgpack"), b"{}");
        assert!(matches!(result, Err(QueueError::CodecNotFound(_))));
    }

    #[test]
    fn cannot_default_to_unregistered_codec() {
        let mut registry = CodecRegistry::new();
        assert!(registry.set_default_codec("text/plain").is_err());
    }

    #[test]
    fn decode_without_content_type_uses_default() {
        let registry = CodecRegistry::new();
        let envelope = JobEnvelope::new("send-email", json!({"to": "a@b.com"}), JobOptions::default());
        let (body, content_type) = registry.encode(&envelope).unwrap();

        assert_eq!(content_type, "application/json");
        assert_eq!(registry.decode(None, &body).unwrap(), envelope);
    }
}
