//! Identifier helpers for sagas, correlation ids and content keys.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered).
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Generates a saga id of the form `{prefix}-{uuid7}`.
///
/// Time-ordered ids keep saga logs sortable by start time.
#[must_use]
pub fn saga_id(prefix: &str) -> String {
    format!("{prefix}-{}", generate_uuid_v7())
}

/// Builds the stable content key for an item: `{platform}:{content_id}`.
#[must_use]
pub fn content_key(platform: &str, content_id: &str) -> String {
    format!("{}:{}", platform.trim().to_ascii_lowercase(), content_id.trim())
}

/// Splits a content key back into `(platform, content_id)`.
#[must_use]
pub fn split_content_key(key: &str) -> Option<(&str, &str)> {
    let (platform, id) = key.split_once(':')?;
    if platform.is_empty() || id.is_empty() {
        return None;
    }
    Some((platform, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saga_id_prefix() {
        let id = saga_id("vdp-processing");
        assert!(id.starts_with("vdp-processing-"));
        assert_ne!(id, saga_id("vdp-processing"));
    }

    #[test]
    fn test_content_key_normalizes_platform() {
        assert_eq!(content_key(" YouTube ", "abc123"), "youtube:abc123");
    }

    #[test]
    fn test_split_content_key() {
        assert_eq!(split_content_key("tiktok:789"), Some(("tiktok", "789")));
        assert_eq!(split_content_key("tiktok:"), None);
        assert_eq!(split_content_key("no-separator"), None);
    }
}
