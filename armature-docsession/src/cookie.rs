//! Session cookie transport over HTTP headers.

use crate::config::CookieSettings;
use crate::error::{SessionError, SessionResult};
use http::HeaderMap;
use http::header::{COOKIE, HeaderValue, SET_COOKIE};

/// Find a cookie by name in the request's `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };

        for pair in header.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key.trim() == name {
                    return Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
    }

    None
}

/// Render a `Set-Cookie` value.
pub fn render_set_cookie(settings: &CookieSettings, value: &str) -> String {
    let mut cookie = format!("{}={}; Path={}", settings.name, value, settings.path);

    if let Some(ref domain) = settings.domain {
        cookie.push_str(&format!("; Domain={}", domain));
    }

    if settings.secure {
        cookie.push_str("; Secure");
    }

    if settings.http_only {
        cookie.push_str("; HttpOnly");
    }

    cookie.push_str(&format!("; SameSite={}", settings.same_site.as_str()));
    cookie
}

/// Append a `Set-Cookie` header carrying `value`.
pub fn append_set_cookie(
    headers: &mut HeaderMap,
    settings: &CookieSettings,
    value: &str,
) -> SessionResult<()> {
    let header = HeaderValue::from_str(&render_set_cookie(settings, value))
        .map_err(|e| SessionError::Header(e.to_string()))?;
    headers.append(SET_COOKIE, header);
    Ok(())
}
