pub mod auth;
pub mod error;
pub mod models;
pub mod notify;
pub mod openapi;
pub mod rate_limit; // in-memory rate limiting
pub mod repo;
pub mod routes;
pub mod service;
pub mod storage; // expose storage for routes

// Re-export commonly used items for tests / external users
pub use routes::{config, security_headers, AppState};
