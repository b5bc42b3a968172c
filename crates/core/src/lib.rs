//! Pure building blocks for driving a remote ComfyUI-style generation server.
//!
//! Nothing in this crate performs I/O: it defines the workflow graph model,
//! structural validation, parameter override records, the base64 codec, and
//! the artifact extraction rules applied to history records. The network
//! side lives in `genrelay-comfyui`.

pub mod artifacts;
pub mod codec;
pub mod error;
pub mod execution;
pub mod hashing;
pub mod overrides;
pub mod validation;
pub mod workflow;
