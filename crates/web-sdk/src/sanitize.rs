//! URL sanitization: redacts sensitive query parameters before a URL leaves
//! the client.

use url::Url;

pub const REDACTION_MARKER: &str = "[REDACTED]";
pub const QUERY_REDACTED_MARKER: &str = "?[QUERY_REDACTED]";

/// Query parameter names whose values are never sent, compared case-insensitively.
pub const SENSITIVE_PARAMS: &[&str] = &[
    // tokens and keys
    "token",
    "access_token",
    "refresh_token",
    "id_token",
    "auth",
    "authorization",
    "api_key",
    "apikey",
    "key",
    "secret",
    "client_secret",
    "jwt",
    // passwords
    "password",
    "passwd",
    "pwd",
    // sessions
    "session",
    "sessionid",
    "session_id",
    "sid",
    // oauth
    "code",
    "state",
    // pii
    "email",
    "phone",
    "ssn",
    // payment
    "credit_card",
    "card_number",
    "cvv",
    "cvc",
];

pub fn is_sensitive_param(name: &str) -> bool {
    SENSITIVE_PARAMS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(name))
}

/// Redact sensitive query values. Unparsable input falls back to dropping the
/// whole query string.
pub fn sanitize_url(url: Option<&str>) -> Option<String> {
    let raw = url.filter(|u| !u.is_empty())?;

    let Ok(mut parsed) = Url::parse(raw) else {
        return Some(redact_query_text(raw));
    };

    let pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if !pairs.iter().any(|(k, _)| is_sensitive_param(k)) {
        return Some(raw.to_string());
    }

    parsed.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(k, v)| {
        if is_sensitive_param(k) {
            (k.as_str(), REDACTION_MARKER)
        } else {
            (k.as_str(), v.as_str())
        }
    }));

    Some(parsed.to_string())
}

/// Scheme, host and path only. Used for high-volume resource sampling.
pub fn sanitize_resource_url(url: &str) -> Option<String> {
    if url.is_empty() {
        return None;
    }

    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            Some(parsed.to_string())
        }
        Err(_) => {
            let end = url.find(&['?', '#'][..]).unwrap_or(url.len());
            Some(url[..end].to_string())
        }
    }
}

fn redact_query_text(raw: &str) -> String {
    match raw.find('?') {
        Some(idx) => format!("{}{}", &raw[..idx], QUERY_REDACTED_MARKER),
        None => raw.to_string(),
    }
}
