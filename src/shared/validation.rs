//! Validation Utilities

use validator::{Validate, ValidationErrors};

use super::error::AppError;

/// Maximum length of a topic or pattern string
pub const MAX_TOPIC_LENGTH: u64 = 256;

/// Convert validation errors to AppError
pub fn validation_error(errors: ValidationErrors) -> AppError {
    let message = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let detail = e
                    .message
                    .clone()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string());
                format!("{}: {}", field, detail)
            })
        })
        .next()
        .unwrap_or_else(|| "Validation failed".into());

    AppError::Validation(message)
}

/// Run derive-based validation and map failures into the error taxonomy
pub fn validate<T: Validate>(value: &T) -> Result<(), AppError> {
    value.validate().map_err(validation_error)
}

/// Check that a concrete (publishable) topic is well formed.
///
/// Topics are dot-separated, with no empty segments and no wildcards.
pub fn validate_topic(topic: &str) -> Result<(), AppError> {
    if topic.is_empty() || topic.len() as u64 > MAX_TOPIC_LENGTH {
        return Err(AppError::Validation(format!(
            "topic must be between 1 and {} characters",
            MAX_TOPIC_LENGTH
        )));
    }
    for segment in topic.split('.') {
        if segment.is_empty() {
            return Err(AppError::Validation(format!(
                "topic '{}' contains an empty segment",
                topic
            )));
        }
        if segment.contains('*') {
            return Err(AppError::Validation(format!(
                "topic '{}' must not contain wildcards",
                topic
            )));
        }
    }
    Ok(())
}

/// Check that a subscription pattern is well formed.
///
/// Wildcards are only allowed as whole segments (`*` or `**`).
pub fn validate_pattern(pattern: &str) -> Result<(), AppError> {
    if pattern.is_empty() || pattern.len() as u64 > MAX_TOPIC_LENGTH {
        return Err(AppError::Validation(format!(
            "pattern must be between 1 and {} characters",
            MAX_TOPIC_LENGTH
        )));
    }
    for segment in pattern.split('.') {
        if segment.is_empty() {
            return Err(AppError::Validation(format!(
                "pattern '{}' contains an empty segment",
                pattern
            )));
        }
        if segment.contains('*') && segment != "*" && segment != "**" {
            return Err(AppError::Validation(format!(
                "pattern '{}' mixes wildcards and literals in one segment",
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
    fn test_valid_topics() {
        assert!(validate_topic("users").is_ok());
        assert!(validate_topic("messages.user.42").is_ok());
    }

    #[test]
    fn test_invalid_topics() {
        assert!(validate_topic("").is_err());
        assert!(validate_topic("a..b").is_err());
        assert!(validate_topic(".a").is_err());
        assert!(validate_topic("a.*").is_err());
        assert!(validate_topic(&"a".repeat(MAX_TOPIC_LENGTH as usize + 1)).is_err());
    }

    #[test]
    fn test_patterns() {
        assert!(validate_pattern("messages.*").is_ok());
        assert!(validate_pattern("messages.**").is_ok());
        assert!(validate_pattern("**").is_ok());
        assert!(validate_pattern("messages.us*").is_err());
        assert!(validate_pattern("a..b").is_err());
        assert!(validate_pattern("").is_err());
    }
}
