use std::collections::HashMap;

/// Errors raised while tokenizing a header value.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Malformed header parameter (missing '='): {0}")]
    MissingEquals(String),
}

/// A parsed `title; key=value; ...` header value.
///
/// Used both for the request `Content-Type` and for per-part headers such as
/// `Content-Disposition`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub title: String,
    pub params: HashMap<String, String>,
}

impl Header {
    /// Parse a header value line.
    pub fn parse(line: &str) -> Result<Self, HeaderError> {
        let mut tokens = line.trim().split(';');
        let title = tokens.next().unwrap_or_default().trim().to_string();

        let mut params = HashMap::new();
        for token in tokens {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (key, value) = token
                .split_once('=')
                .ok_or_else(|| HeaderError::MissingEquals(token.to_string()))?;
            params.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { title, params })
    }

    /// Case-insensitive comparison of the title.
    pub fn is(&self, candidate: &str) -> bool {
        self.title.eq_ignore_ascii_case(candidate)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parameter value with one pair of surrounding double quotes removed.
    pub fn unquoted_param(&self, key: &str) -> Option<&str> {
        self.param(key).map(unquote)
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}
