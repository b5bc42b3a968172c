//! ComfyUI execution client.
//!
//! Submits workflow graphs over the server's REST API, polls history until
//! completion under a deadline, resolves image parameters (uploading bytes
//! when needed), and turns finished history records into artifacts.
//! Retries, cancellation, and cleanup follow one policy across every call.

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod images;
pub mod messages;
pub mod mutator;
pub mod observer;
pub mod outputs;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod transport;

pub use client::ExecutionClient;
pub use config::ExecutionConfig;
pub use error::ComfyUIError;
