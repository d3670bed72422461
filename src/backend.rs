//! Runtime seam between the session and the model/vision runtimes
//!
//! The session only drives these calls in order; weights, tensors and devices stay
//! inside the implementation. [`crate::llama`] provides the llama.cpp one.

use crate::error::Error;

/// Vocabulary token id.
pub type Token = i32;

/// Sequence id used for every evaluation of a session.
pub const SEQ_ID: i32 = 0;

/// Text part of the prompt handed to the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptText {
    pub text: String,
    /// Add the implicit framing tokens (BOS ...).
    pub add_special: bool,
    /// Parse special tokens written in the text.
    pub parse_special: bool,
}

impl PromptText {
    /// Template supplies its own framing, special tokens are parsed.
    pub fn template(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            add_special: false,
            parse_special: true,
        }
    }
}

/// Language model, inference context and vision encoder of one session.
pub trait Runtime {
    /// Decoded media entry.
    type Bitmap;
    /// Interleaved text and image chunks.
    type Chunks;

    fn bitmap_from_file(&self, path: &str) -> Result<Self::Bitmap, Error>;

    fn bitmap_from_buffer(&self, data: &[u8]) -> Result<Self::Bitmap, Error>;

    /// Substitutes the bitmaps for the media markers of `prompt`, in order.
    fn tokenize(&self, prompt: &PromptText, bitmaps: &[Self::Bitmap])
        -> Result<Self::Chunks, Error>;

    /// Number of positions the chunks occupy once evaluated.
    fn chunk_positions(&self, chunks: &Self::Chunks) -> i32;

    /// Evaluates the chunks starting at `n_past` and returns the new position.
    fn eval_chunks(
        &mut self,
        chunks: &Self::Chunks,
        n_past: i32,
        seq_id: i32,
        n_batch: i32,
        logits_last: bool,
    ) -> Result<i32, Error>;

    /// Evaluates a single token at `pos`, keeping its logits.
    fn decode_token(&mut self, token: Token, pos: i32, seq_id: i32) -> Result<(), Error>;

    /// End of generation (eos, eot ...).
    fn is_eog(&self, token: Token) -> bool;

    /// Raw bytes of the token's text surface form.
    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, Error>;

    /// Drops every KV cache entry of the sequence.
    fn clear_sequence(&mut self, seq_id: i32) -> Result<(), Error>;

    /// Drops cached per-image state of the vision encoder.
    fn reset_vision(&mut self) {}
}

/// Picks the next token from the runtime's output distribution.
pub trait TokenSampler<R: Runtime> {
    /// Samples at output index `idx`, -1 is the last one.
    fn sample(&mut self, runtime: &R, idx: i32) -> Token;

    /// Registers the token in the sampler history.
    fn accept(&mut self, token: Token);
}
