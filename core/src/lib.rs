//! # Nightshade Engine Core
//!
//! Core crate for Nightshade Engine basic utilities: math type aliases,
//! bounding volumes, allocation-preserving pooling, and the fork-join
//! thread pool used for per-frame parallel work.

pub mod bounds;
pub mod frustum;
pub mod math;
pub mod pool;
pub mod thread;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
