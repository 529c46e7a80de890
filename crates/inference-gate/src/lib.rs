//! inference-gate: recording reverse proxy for OpenAI-compatible inference
//! APIs. Library surface for the binary and the integration tests.

pub mod cli;
pub mod commands;
pub mod config;
pub mod server;
pub mod upstream;
