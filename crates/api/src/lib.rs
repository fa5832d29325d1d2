//! HTTP API: configuration, application context, routing and request mapping.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
