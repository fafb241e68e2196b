//! HTTP API: starting book imports and polling their status.

pub mod app;
