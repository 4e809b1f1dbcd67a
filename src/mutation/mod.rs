//! Optimistic create/update/delete with per-entity ordering and rollback

pub mod manager;
pub mod models;

pub use manager::OptimisticMutationManager;
pub use models::*;
