//! Metadata codec: encode/parse a `Metadata` value to/from the hypervisor's
//! free-form description field as a human-readable, stable-key-order,
//! tag-free YAML document (struct field declaration order is preserved on
//! encode; serde's derive-driven encoding never emits executable tags).

use crate::error::EngineError;
use crate::model::Metadata;

/// Encode metadata as the description-field document. Infallible for any
/// well-formed `Metadata` value — there is no way to construct one that
/// fails to serialize.
pub fn encode(metadata: &Metadata) -> String {
    serde_yaml::to_string(metadata).expect("Metadata always serializes")
}

/// Decode a description field back into `Metadata`. Any malformed or
/// partial document yields `MalformedMetadata` rather than panicking —
/// callers in bulk reads can downgrade this to a remark.
pub fn decode(description: &str) -> Result<Metadata, EngineError> {
    serde_yaml::from_str(description)
        .map_err(|e| EngineError::MalformedMetadata(format!("description field: {e}")))
}
