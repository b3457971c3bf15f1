use std::{env, fmt};

use crate::DeepResearchError;

const REDACTED: &str = "***redacted***";
/// Trailing characters shown by [`SecretValue::hint`].
const HINT_SUFFIX_CHARS: usize = 4;

/// API key for the model or search provider. Never printed in full: `Debug`
/// and `Display` redact it, and provider error bodies go through
/// [`SecretValue::scrub`] before they reach logs.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Short fingerprint such as `sk-…7f3a` so operators can tell which key
    /// was loaded. Keys too short to mask are fully hidden.
    pub fn hint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= HINT_SUFFIX_CHARS * 3 {
            return REDACTED.to_string();
        }
        let prefix: String = self
            .0
            .split_once('-')
            .filter(|(head, _)| head.len() <= 4)
            .map(|(head, _)| format!("{head}-"))
            .unwrap_or_default();
        let suffix: String = chars[chars.len() - HINT_SUFFIX_CHARS..].iter().collect();
        format!("{prefix}…{suffix}")
    }

    /// Replace every occurrence of the key in `text`; providers sometimes echo
    /// the request (Tavily sends the key in the body) in their error messages.
    pub fn scrub(&self, text: &str) -> String {
        if self.0.is_empty() {
            return text.to_string();
        }
        text.replace(&self.0, REDACTED)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Require that a given environment variable is set and non-empty.
pub fn require_env(var: &str) -> Result<SecretValue, DeepResearchError> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value.trim().to_string())),
        _ => Err(DeepResearchError::MissingSecret(var.to_string())),
    }
}

/// One-line status of a key variable for configuration summaries.
pub fn secret_status(var: &str) -> String {
    match require_env(var) {
        Ok(secret) => format!("{var} set ({})", secret.hint()),
        Err(_) => format!("{var} missing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_env_trims_and_redacts() {
        unsafe { std::env::set_var("DEEPRESEARCH_TEST_SECRET", " sk-0123456789abcdef\n") };
        let secret = require_env("DEEPRESEARCH_TEST_SECRET").expect("secret should load");
        assert_eq!(secret.expose(), "sk-0123456789abcdef");
        assert_eq!(format!("{secret:?}"), REDACTED);
        assert_eq!(secret.to_string(), REDACTED);
        assert_eq!(
            secret_status("DEEPRESEARCH_TEST_SECRET"),
            "DEEPRESEARCH_TEST_SECRET set (sk-…cdef)"
        );
    }

    #[test]
    fn require_env_missing() {
        unsafe { std::env::set_var("DEEPRESEARCH_TEST_SECRET_BLANK", "   ") };
        let err = require_env("DEEPRESEARCH_TEST_SECRET_BLANK").unwrap_err();
        assert!(matches!(err, DeepResearchError::MissingSecret(_)));
        assert_eq!(
            secret_status("DEEPRESEARCH_TEST_SECRET_ABSENT"),
            "DEEPRESEARCH_TEST_SECRET_ABSENT missing"
        );
    }

    #[test]
    fn short_keys_are_never_hinted() {
        assert_eq!(SecretValue("tvly-1234".into()).hint(), REDACTED);
        assert_eq!(SecretValue("abcdefghijklmnopqrstuvwxyz".into()).hint(), "…wxyz");
    }

    #[test]
    fn scrub_removes_echoed_keys() {
        let secret = SecretValue("tvly-secret-key-0001".into());
        let body = r#"{"error":"invalid api_key tvly-secret-key-0001"}"#;
        assert_eq!(secret.scrub(body), r#"{"error":"invalid api_key ***redacted***"}"#);
        assert!(!format!("{:?}", Some(&secret)).contains("tvly"));
    }
}
