pub mod crypto;
pub mod provider;
pub mod review;

pub use provider::*;
pub use review::*;

/// Returns the crate version as reported in admin responses.
pub fn get_service_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
