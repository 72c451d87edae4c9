//! HTTP API Module
//!
//! REST surface for cluster membership management, public and internal.

mod http;

pub use http::{ApiServer, AppState};
