//! Identifier validation.
//!
//! Session identifiers are client-provided and travel into container labels
//! and URLs, so the accepted alphabet is deliberately narrow.

use crate::error::{Error, Result};

/// Maximum accepted session identifier length.
pub const MAX_SESSION_ID_LEN: usize = 65;

/// Validate a client-provided session identifier: 1-65 characters drawn
/// from `[A-Za-z0-9-]`.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::Validation("session id must not be empty".into()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(Error::Validation(format!(
            "session id exceeds {MAX_SESSION_ID_LEN} characters"
        )));
    }
    if let Some(ch) = id.chars().find(|ch| !ch.is_ascii_alphanumeric() && *ch != '-') {
        return Err(Error::Validation(format!(
            "session id contains invalid character {ch:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_ids() {
        for id in ["s1", "S1-abc", "0", "a-b-c-9"] {
            assert!(validate_session_id(id).is_ok(), "rejected {id}");
        }
    }

    #[test]
    fn length_boundary() {
        let at_limit = "a".repeat(MAX_SESSION_ID_LEN);
        assert!(validate_session_id(&at_limit).is_ok());

        let over = "a".repeat(MAX_SESSION_ID_LEN + 1);
        assert!(validate_session_id(&over).is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_session_id("").is_err());
    }

    #[test]
    fn rejects_invalid_characters() {
        for id in ["a_b", "a b", "a.b", "a/b", "a\nb", "ü1"] {
            assert!(validate_session_id(id).is_err(), "accepted {id:?}");
        }
    }
}
