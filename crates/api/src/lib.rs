//! HTTP API and process wiring: router, backends, built-in jobs and consumers.

pub mod app;
pub mod consumers;
pub mod jobs;
