use serde_json::json;

use crate::error::AppError;

pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }

    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty() || domain.contains('@') {
        return false;
    }

    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

pub fn validate_email(email: &str, field: &str) -> Result<(), AppError> {
    if !is_valid_email(email) {
        return Err(AppError::validation_with(
            "Invalid email address format",
            json!({ "field": field, "value": email }),
        ));
    }

    Ok(())
}

pub fn validate_url(url: &str, field: &str) -> Result<(), AppError> {
    let valid = reqwest::Url::parse(url)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false);

    if !valid {
        return Err(AppError::validation_with(
            "Invalid URL format",
            json!({ "field": field, "value": url }),
        ));
    }

    Ok(())
}

/// Returns the value of a required field or a validation error naming it.
pub fn require<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, AppError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::validation_with(
            format!("Missing required fields: {}", field),
            json!({ "missing": { field: true } }),
        )),
    }
}
