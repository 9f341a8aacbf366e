//! Response and query caching for admin-panel origins.
//!
//! The [`cache`] module is usable on its own; [`infra`] wires it into a
//! caching reverse proxy with an admin API.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
