//! REST boundary of the issue tracker

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod request;
pub mod traits;

pub use client::HttpApi;
pub use request::{ApiRequest, ApiResponse};
pub use traits::IssueTrackerApi;
