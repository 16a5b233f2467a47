//! Bearer token authentication for the control socket
//!
//! Tokens are configured as SHA-256 hex digests so the configuration file
//! never holds a usable secret. Generate one with
//! `echo -n "your-secret-token" | sha256sum`.

use hex::encode;
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// ```ron
/// auth: (
///     enabled: true,
///     token_hashes: [
///         "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e",
///     ],
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlAuthConfig {
    /// Without authentication, access is governed by the socket's file mode
    #[serde(default)]
    pub enabled: bool,

    /// SHA-256 digests of the accepted tokens, hex encoded
    #[serde(default)]
    pub token_hashes: Vec<String>,
}

impl ControlAuthConfig {
    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        self.enabled
    }

    /// Whether `token` hashes to one of the configured digests. Always true
    /// while authentication is disabled.
    #[must_use]
    pub fn validate_token(&self, token: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let hash = encode(hasher.finalize());

        self.token_hashes
            .iter()
            .any(|h| h.eq_ignore_ascii_case(&hash))
    }

    /// # Errors
    ///
    /// Returns the reason if authentication is enabled and the token is
    /// missing or unknown
    pub fn validate_token_option(&self, token: Option<&str>) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }

        match token {
            None => Err("Authentication required but no token provided".to_string()),
            Some(t) if self.validate_token(t) => Ok(()),
            Some(_) => Err("Invalid authentication token".to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    // sha256("test-token")
    const TEST_TOKEN_HASH: &str =
        "4c5dc9b7708905f77f5e5d16316b5dfb425e68cb326dcd55a860e90a7707031e";

    fn enabled(hashes: &[&str]) -> ControlAuthConfig {
        ControlAuthConfig {
            enabled: true,
            token_hashes: hashes.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn disabled_auth_allows_everything() {
        let config = ControlAuthConfig::default();

        assert!(!config.requires_auth());
        assert!(config.validate_token("anything"));
        assert!(config.validate_token_option(None).is_ok());
    }

    #[test]
    fn known_tokens_are_accepted() {
        let config = enabled(&[TEST_TOKEN_HASH]);

        assert!(config.requires_auth());
        assert!(config.validate_token("test-token"));
        assert!(config.validate_token_option(Some("test-token")).is_ok());
    }

    #[test]
    fn digests_compare_case_insensitively() {
        let config = enabled(&[&TEST_TOKEN_HASH.to_uppercase()]);
        assert!(config.validate_token("test-token"));
    }

    #[test]
    fn missing_and_unknown_tokens_are_rejected() {
        let config = enabled(&[TEST_TOKEN_HASH]);

        assert!(!config.validate_token("test-token-modified"));
        assert!(!config.validate_token(""));
        assert_eq!(
            config.validate_token_option(None).unwrap_err(),
            "Authentication required but no token provided"
        );
        assert!(config.validate_token_option(Some("wrong")).is_err());
    }

    #[test]
    fn an_empty_digest_list_rejects_all_tokens() {
        let config = enabled(&[]);
        assert!(!config.validate_token("any-token"));
    }
}
