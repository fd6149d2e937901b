//! Request-shape validation, run ahead of each handler body so a malformed
//! request never reaches the business logic.

use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$")
        .expect("hardcoded email regex is invalid - fix source code")
});

/// RFC-5322-ish email shape check: non-empty, bounded length, matches the
/// common `local@domain.tld` pattern.
pub fn validate_email(email: &str) -> bool {
    !email.is_empty() && email.len() <= 254 && EMAIL_REGEX.is_match(email)
}

pub fn non_empty(value: &str) -> bool {
    !value.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_email_formats_are_accepted() {
        assert!(validate_email("user@example.com"));
        assert!(validate_email("test.user+tag@sub.example.co.uk"));
    }

    #[test]
    fn invalid_email_formats_are_rejected() {
        assert!(!validate_email("invalid"));
        assert!(!validate_email("@example.com"));
        assert!(!validate_email("user@"));
        assert!(!validate_email(""));
    }

    #[test]
    fn non_empty_rejects_blank_and_whitespace_only() {
        assert!(!non_empty(""));
        assert!(!non_empty("   "));
        assert!(non_empty("dfr_abc"));
    }
}
