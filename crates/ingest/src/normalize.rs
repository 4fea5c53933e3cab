//! Provider-id normalization and echo-marker detection.

use {
    sha2::{Digest, Sha256},
    switchboard_channels::Metadata,
};

/// Normalize a provider message id for storage.
///
/// Trims whitespace and angle-bracket wrapping (email Message-IDs arrive
/// as `<id@host>`). Unusually long ids are replaced with a content hash so
/// a hostile or buggy provider cannot bloat the dedup index.
#[must_use]
pub fn normalize_external_id(raw: &str, max_len: usize) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim();

    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() > max_len {
        let digest = Sha256::digest(trimmed.as_bytes());
        return Some(format!("sha256:{}", hex::encode(digest)));
    }
    Some(trimmed.to_string())
}

/// Metadata keys providers use to flag an echoed copy of the business's
/// own outbound send.
const ECHO_MARKERS: &[&str] = &["is_echo", "from_me", "echo"];

/// Whether inbound metadata explicitly marks the payload as an echo of an
/// outbound message.
#[must_use]
pub fn has_echo_marker(metadata: &Metadata) -> bool {
    ECHO_MARKERS.iter().any(|key| {
        metadata
            .get(*key)
            .is_some_and(|v| v.as_bool() == Some(true) || v.as_str() == Some("true"))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("  <abc@mail.example>  ", Some("abc@mail.example"))]
    #[case("wamid.HBgN", Some("wamid.HBgN"))]
    #[case("<inner@host>", Some("inner@host"))]
    #[case("  ", None)]
    #[case("<>", None)]
    fn id_normalization(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_external_id(input, 120).as_deref(), expected);
    }

    #[test]
    fn oversized_ids_become_hashes() {
        let long = "x".repeat(200);
        let id = normalize_external_id(&long, 120).unwrap();
        assert!(id.starts_with("sha256:"));
        assert_eq!(id.len(), "sha256:".len() + 64);
        // Deterministic: replay hashes to the same id.
        assert_eq!(normalize_external_id(&long, 120).unwrap(), id);
    }

    #[test]
    fn echo_markers() {
        let mut md = Metadata::new();
        assert!(!has_echo_marker(&md));

        md.insert("is_echo".into(), serde_json::json!(true));
        assert!(has_echo_marker(&md));

        let mut md = Metadata::new();
        md.insert("from_me".into(), serde_json::json!("true"));
        assert!(has_echo_marker(&md));

        let mut md = Metadata::new();
        md.insert("is_echo".into(), serde_json::json!(false));
        assert!(!has_echo_marker(&md));
    }
}
