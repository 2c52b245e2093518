//! modeld: a local inference server.
//!
//! Fronts heterogeneous inference backends (llama.cpp servers, ONNX
//! generate-API servers, FastFlowLM, whisper.cpp) behind an OpenAI-compatible
//! and an Ollama-compatible HTTP surface.  The core is the model router and
//! backend lifecycle manager: requests are resolved against the model
//! catalog, a bounded per-class pool of backend subprocesses is maintained
//! with LRU eviction, and request bodies are proxied to the chosen backend
//! with per-recipe translation.

pub mod api;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod process;
pub mod recipe;
pub mod router;
pub mod server;
pub mod sysprobe;

pub use error::ServeError;
