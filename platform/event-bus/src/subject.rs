//! Subject routing with NATS-style wildcards

use crate::{BusError, BusResult};

/// Check if a subject matches a subscription pattern
///
/// Supports NATS-style wildcards:
/// - `*` matches exactly one token
/// - `>` matches one or more tokens
///
/// # Examples
/// - `payments.>` matches `payments.payment.captured`
/// - `payments.*.captured` matches `payments.payment.captured`
/// - `payments.payment.*` does NOT match `payments.payment.refund.created` (too many tokens)
pub fn subject_matches(subject: &str, pattern: &str) -> bool {
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();

    let mut s_idx = 0;
    let mut p_idx = 0;

    while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
        let pattern_token = pattern_tokens[p_idx];

        if pattern_token == ">" {
            return true;
        } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
            s_idx += 1;
            p_idx += 1;
        } else {
            return false;
        }
    }

    // Both must be exhausted for a full match (unless pattern ended with `>`)
    s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
}

/// Reject patterns a subscriber could never have meant: empty tokens and a
/// `>` that is not the final token.
pub fn validate_pattern(pattern: &str) -> BusResult<()> {
    if pattern.is_empty() {
        return Err(BusError::InvalidSubject("empty pattern".to_string()));
    }

    let tokens: Vec<&str> = pattern.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(BusError::InvalidSubject(format!(
                "empty token in pattern '{}'",
                pattern
            )));
        }
        if *token == ">" && idx != tokens.len() - 1 {
            return Err(BusError::InvalidSubject(format!(
                "'>' must be the last token in '{}'",
                pattern
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matching() {
        assert!(subject_matches("payments.payment.captured", "payments.payment.captured"));

        assert!(subject_matches("payments.payment.captured", "payments.*.captured"));
        assert!(subject_matches("payments.payment.captured", "*.payment.*"));
        assert!(!subject_matches("payments.payment.captured", "payments.*"));

        assert!(subject_matches("payments.payment.captured", "payments.>"));
        assert!(subject_matches("payments.intent.cancelled", ">"));
        assert!(!subject_matches("payments.payment.captured", "subscriptions.>"));

        assert!(subject_matches("single", "single"));
        assert!(subject_matches("single", "*"));
        assert!(!subject_matches("one.two", "one"));
    }

    #[test]
    fn test_validate_pattern() {
        assert!(validate_pattern("payments.>").is_ok());
        assert!(validate_pattern("payments.*.captured").is_ok());
        assert!(validate_pattern("").is_err());
        assert!(validate_pattern("payments..captured").is_err());
        assert!(validate_pattern("payments.>.captured").is_err());
    }
}
