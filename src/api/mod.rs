//! HTTP boundary: router, endpoint handlers, error mapping.

pub mod endpoints;
pub mod error;
pub mod router;

pub use router::build_router;
