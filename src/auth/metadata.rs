//! # Call Metadata Extraction
//!
//! Derives the per-call metadata forwarded to backends from an inbound request.
//! The only recognized key is `token`: the `token` header wins when it is present
//! and non-empty, the `token` query parameter is the fallback, and otherwise the
//! token is empty. Authorization is left to the backends, so this never fails.

use axum::http::HeaderMap;
use std::collections::HashMap;

/// Header, query parameter and metadata key carrying the caller's token
pub const TOKEN_KEY: &str = "token";

/// Metadata attached to every transcoded backend call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallMetadata {
    token: String,
}

impl CallMetadata {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Key/value pairs to attach to the outgoing call, empty values included
    pub fn pairs(&self) -> impl Iterator<Item = (&'static str, &str)> {
        std::iter::once((TOKEN_KEY, self.token.as_str()))
    }
}

/// Extract call metadata from request headers and query parameters
pub fn extract_metadata(headers: &HeaderMap, query: &HashMap<String, String>) -> CallMetadata {
    let from_header = headers
        .get(TOKEN_KEY)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());

    let from_query = query
        .get(TOKEN_KEY)
        .map(String::as_str)
        .filter(|value| !value.is_empty());

    CallMetadata::new(from_header.or(from_query).unwrap_or_default())
}
