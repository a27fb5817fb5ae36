//! Settings validation

use url::Url;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::settings::Settings;

/// Validate settings
///
/// `require_token` is set when the caller is about to propagate
/// certificates; `check` without a token still passes with a warning.
pub fn validate_settings(settings: &Settings, require_token: bool) -> ValidationResult {
    let mut result = ValidationResult::new();

    for (field, value) in [
        ("ca_url", &settings.ca_url),
        ("acme_dns_url", &settings.acme_dns_url),
        ("hetzner_api_url", &settings.hetzner_api_url),
    ] {
        match Url::parse(value) {
            Ok(url) if url.scheme() == "https" || url.scheme() == "http" => {}
            Ok(url) => result.add_error(ValidationError::new(
                ErrorCategory::Endpoint,
                format!("{} has unsupported scheme '{}'", field, url.scheme()),
            )),
            Err(e) => result.add_error(ValidationError::new(
                ErrorCategory::Endpoint,
                format!("{} '{}' is not a valid URL: {}", field, value, e),
            )),
        }
    }

    match settings.hetzner_api_token.as_deref() {
        Some(token) if !token.trim().is_empty() => {}
        _ if require_token => result.add_error(ValidationError::new(
            ErrorCategory::Credential,
            "hetzner_api_token is not set",
        )),
        _ => result.add_warning(ValidationWarning::new(
            "hetzner_api_token is not set; certificates cannot be propagated",
        )),
    }

    if settings.renew_after_days == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Schema,
            "renew_after_days must be at least 1",
        ));
    } else if settings.renew_after_days >= 90 {
        result.add_warning(ValidationWarning::new(format!(
            "renew_after_days is {}; 90-day certificates expire before renewal",
            settings.renew_after_days
        )));
    }

    if settings.check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Schema,
            "check_interval_secs must be at least 1",
        ));
    }

    if settings.superseded_suffix.is_empty() {
        result.add_error(ValidationError::new(
            ErrorCategory::Schema,
            "superseded_suffix must not be empty",
        ));
    }

    result
}
