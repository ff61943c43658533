//! HTTP read surface over the mirror
pub mod routes;

pub use routes::{create_router, AppState};
