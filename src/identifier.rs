//! Session and request identifiers.
//!
//! Identifiers are random 128-bit values rendered in the canonical
//! 36-character hyphenated form, e.g. `9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11`.

use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::error_handling::types::IdentifierError;

const CANONICAL_PATTERN: &str =
    r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";

fn canonical_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(CANONICAL_PATTERN).expect("identifier pattern is valid"))
}

/// Generates a new random identifier.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Reports whether `text` is a canonical identifier (case-insensitive).
pub fn is_valid(text: &str) -> bool {
    canonical_regex().is_match(text)
}

/// Parses a canonical identifier. Braced, URN and simple forms are rejected.
pub fn parse(text: &str) -> Result<Uuid, IdentifierError> {
    if !is_valid(text) {
        return Err(IdentifierError::Malformed(text.to_string()));
    }

    Uuid::parse_str(text).map_err(|_| IdentifierError::Malformed(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_canonical() {
        let id = new_id();
        assert!(is_valid(&id.to_string()));
        assert_ne!(new_id(), id);
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11"));
        assert!(is_valid("9B2B4A9E-6F0C-4C1E-8A53-2F1D0E4B7C11"));
        assert!(!is_valid("9b2b4a9e6f0c4c1e8a532f1d0e4b7c11"));
        assert!(!is_valid("{9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11}"));
        assert!(!is_valid("9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c1"));
        assert!(!is_valid("api"));
        assert!(!is_valid(""));
    }

    #[test]
    fn test_parse() {
        let id = parse("9B2B4A9E-6F0C-4C1E-8A53-2F1D0E4B7C11").unwrap();
        assert_eq!(id.to_string(), "9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11");

        assert_eq!(
            parse("urn:uuid:9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11"),
            Err(IdentifierError::Malformed(
                "urn:uuid:9b2b4a9e-6f0c-4c1e-8a53-2f1d0e4b7c11".to_string()
            ))
        );
    }
}
