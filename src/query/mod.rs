//! List-view parameters, fetch sequencing and invalidation handling

pub mod coordinator;
pub mod models;

pub use coordinator::QueryCoordinator;
pub use models::*;
