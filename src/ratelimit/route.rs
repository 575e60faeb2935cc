//! Route key generation and handling.

use std::fmt;

/// A key that uniquely identifies a server-side rate limit bucket.
///
/// The key is composed of the HTTP method, the endpoint path template and an
/// optional major parameter (for example a channel or guild id), so that
/// per-resource limits on the same endpoint are tracked independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    /// HTTP method, upper case
    pub method: String,
    /// Endpoint path template, e.g. `/channels/{channel_id}/messages`
    pub path: String,
    /// Resource-scoping parameter, if the endpoint has one
    pub major: Option<String>,
}

impl Route {
    /// Create a route with no major parameter.
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            major: None,
        }
    }

    /// Scope this route to a major parameter.
    pub fn with_major(mut self, major: impl Into<String>) -> Self {
        self.major = Some(major.into());
        self
    }

    /// Parse a route from its display form, `METHOD path[:major]`.
    ///
    /// Returns `None` if the method or path is missing.
    pub fn parse(s: &str) -> Option<Self> {
        let (method, rest) = s.trim().split_once(' ')?;
        let rest = rest.trim();
        if method.is_empty() || rest.is_empty() {
            return None;
        }

        // The major parameter follows the last ':' after the final path segment
        let last_segment_start = rest.rfind('/').unwrap_or(0);
        let route = match rest[last_segment_start..].rfind(':') {
            Some(idx) => {
                let split = last_segment_start + idx;
                let major = &rest[split + 1..];
                if major.is_empty() {
                    return None;
                }
                Route::new(method, &rest[..split]).with_major(major)
            }
            None => Route::new(method, rest),
        };
        Some(route)
    }

    /// Convert the route to a string representation.
    ///
    /// This is useful for logging and debugging.
    pub fn to_string_key(&self) -> String {
        match &self.major {
            Some(major) => format!("{} {}:{}", self.method, self.path, major),
            None => format!("{} {}", self.method, self.path),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
