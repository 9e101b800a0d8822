// =============================================================================
// Read API
// =============================================================================

pub mod auth;
pub mod rest;
pub mod schema;

pub use rest::router;
