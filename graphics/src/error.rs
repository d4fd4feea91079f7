//! Graphics error types.
//!
//! Errors only exist at the configuration boundary: a render path that
//! fails to parse is an error, but frame-time problems (missing passes,
//! exhausted shadow maps, failed buffer maps) degrade to a valid frame and
//! are never reported as `Result`s.

use std::fmt;

/// Errors that can occur while loading a render path definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderPathError {
    /// The declarative source failed to parse.
    ParseFailed(String),
    /// The source parsed but contained no usable commands.
    Empty,
}

impl fmt::Display for RenderPathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseFailed(msg) => write!(f, "render path parse failed: {msg}"),
            Self::Empty => write!(f, "render path defines no commands"),
        }
    }
}

impl std::error::Error for RenderPathError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderPathError::Empty;
        assert_eq!(err.to_string(), "render path defines no commands");

        let err = RenderPathError::ParseFailed("bad token".to_string());
        assert_eq!(err.to_string(), "render path parse failed: bad token");
    }
}
