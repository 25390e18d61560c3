//! Small helpers shared across modules.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Number of random bytes behind every session, upload and asset token.
const TOKEN_BYTES: usize = 32;

/// Generate a fresh URL-safe secret token.
///
/// 32 bytes from the thread-local CSPRNG, base64url-encoded without padding
/// (43 characters). Safe to embed in URLs, query strings and HTML.
pub fn new_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Shorten a token for log output. Tokens are secrets, never log them whole.
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map_or(token.len(), |(idx, _)| idx);
    &token[..end]
}

/// Path component of an absolute or relative URL, without query or fragment.
///
/// `http://host:8000/docs?x=1` yields `/docs`; a URL with no path yields `/`.
pub fn url_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(idx) => {
            let after = &url[idx + 3..];
            match after.find('/') {
                Some(slash) => &after[slash..],
                None => return "/",
            }
        }
        None => url,
    };
    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    if end == 0 {
        "/"
    } else {
        &rest[..end]
    }
}

/// Minimal HTML escaping for text inserted into the index template.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(ch),
        }
    }
    out
}
