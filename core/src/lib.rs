//! Core utilities and shared types for the reflector service.

pub mod accesslog;
pub mod addr;
pub mod error;
pub mod ratelimiter;
pub mod settings;

pub use error::Rejection;
pub use settings::Settings;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }
}
