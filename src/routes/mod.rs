//! Router Module Index
//!
//! Endpoints grouped by how the access policy treats them. All three are merged
//! under `/api` and sit behind the same authorization middleware; the grouping
//! documents intent, the policy enforces it.

/// Strictly public: login, registration, refresh, logout, health.
pub mod public;

/// Any authenticated caller whose permissions cover the path (self-service).
pub mod authenticated;

/// Administrative endpoints, reachable only with the matching path permissions.
pub mod admin;
