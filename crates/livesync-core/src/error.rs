//! Error taxonomy for the reconciliation core.
//!
//! Parse and identity failures are recoverable: the caller logs them and
//! drops the offending message. Stale updates are not errors at all and
//! never surface here.

/// Errors produced while decoding a raw live-channel message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected payload shape: expected {expected}")]
    UnexpectedShape { expected: &'static str },

    #[error("missing field: {field}")]
    MissingField { field: &'static str },

    #[error("unknown event type: {event_type}")]
    UnknownEventType { event_type: String },

    #[error("stream entry {index} carries malformed data: {source}")]
    StreamEntry {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors produced when an object carries too little information to be keyed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("{object_kind} object missing required field: {field}")]
    MissingField {
        object_kind: String,
        field: &'static str,
    },

    #[error("{object_kind} object has empty field: {field}")]
    EmptyField {
        object_kind: String,
        field: &'static str,
    },

    #[error("{event} event cannot be keyed on an object stream")]
    UnscopedStreamEvent { event: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_names_kind_and_field() {
        let err = IdentityError::MissingField {
            object_kind: "helm_release".to_string(),
            field: "namespace",
        };
        let msg = err.to_string();
        assert!(msg.contains("helm_release"));
        assert!(msg.contains("namespace"));
    }
}
