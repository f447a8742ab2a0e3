use reqwest::Url;

/// Query parameter carrying the token in bot-issued links
pub const SESSION_PARAM: &str = "session";

/// Pull the `session` parameter out of a launch URL.
///
/// Returns the token (if present and non-empty) and the URL with that
/// parameter removed. Other query parameters are kept in order; an empty
/// query is dropped entirely.
pub fn take_session_param(url: &Url) -> (Option<String>, Url) {
    let mut token = None;
    let mut kept: Vec<(String, String)> = Vec::new();

    for (key, value) in url.query_pairs() {
        if key == SESSION_PARAM {
            if token.is_none() && !value.is_empty() {
                token = Some(value.into_owned());
            }
        } else {
            kept.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut cleaned = url.clone();
    if kept.is_empty() {
        cleaned.set_query(None);
    } else {
        cleaned.query_pairs_mut().clear().extend_pairs(kept);
    }
    (token, cleaned)
}

/// Pick the token to use at startup: the URL wins over storage.
pub fn resolve_token(url_token: Option<String>, stored_token: Option<String>) -> Option<String> {
    url_token
        .filter(|t| !t.is_empty())
        .or_else(|| stored_token.filter(|t| !t.is_empty()))
}
