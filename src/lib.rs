//! Supervision and reconnection layer for the llama desktop backends.
//!
//! Keeps the inference WebSocket server, its HTTP companion and the SSE
//! model-download server alive, holds a self-healing message channel to the
//! inference server, and hot-swaps the loaded model when the persisted
//! selection changes.

pub mod channel;
pub mod config;
pub mod download;
pub mod error;
pub mod lookout;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod readiness;

pub use error::{LlamadError, Result};
