//! # Authentication Context
//!
//! The gateway does not authenticate callers itself. It extracts the caller's
//! token and hands it to the backends, which make the authorization decision.

pub mod metadata;

pub use metadata::{extract_metadata, CallMetadata, TOKEN_KEY};
