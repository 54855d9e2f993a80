use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Remove markup tags and surrounding whitespace. Length limits apply to this form.
pub fn strip_markup(text: &str) -> String {
    TAG_RE.replace_all(text, "").trim().to_string()
}

pub fn escape_markup(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

/// The stored form of user text. Clients apply it to optimistic copies so they
/// compare equal to the server's confirmation.
pub fn sanitize(text: &str) -> String {
    escape_markup(&strip_markup(text))
}
