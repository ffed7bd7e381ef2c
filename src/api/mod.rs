//! HTTP API Module
//!
//! Provides a REST API for initialization control and progress reporting.

mod http;

pub use http::{ControlResponse, ErrorResponse, HealthResponse, HttpServer, StartRequest};
