//! Single-image multimodal inference session
//!
//! Drives text generation conditioned on one image: media loading, chunking with a
//! fixed prompt, prefill, then token-by-token sampling with optional streaming and
//! cooperative cancellation.
//!
//! The llama.cpp backend and the C ABI are enabled by the `llama` feature.

pub mod backend;
pub mod decoder;
pub mod error;
pub mod media;
pub mod options;
mod prefill;
pub mod sampler;
pub mod session;
pub mod utils;

#[cfg(feature = "llama")]
pub mod ffi;
#[cfg(feature = "llama")]
pub mod llama;

#[cfg(test)]
pub(crate) mod mock;

pub use backend::{PromptText, Runtime, Token, TokenSampler};
pub use decoder::{Generation, StopReason, StreamControl};
pub use error::{Error, ErrorKind, Result};
pub use options::SessionOptions;
pub use sampler::SamplerConfig;
pub use session::Session;
