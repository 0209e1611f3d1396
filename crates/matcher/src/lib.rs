//! Service shell around the matching engine: configuration and the HTTP API

pub mod api;
pub mod config;
