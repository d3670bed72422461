//! Autoregressive decoding

use std::time::Instant;

use encoding_rs::{CoderResult, Decoder};
use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{Runtime, TokenSampler, SEQ_ID},
    error::Error,
    session::Session,
};

/// 生成结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model emitted an end-of-generation token.
    EndOfGeneration,
    /// The generation budget was used up.
    Length,
    /// The stream callback asked to stop.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::EndOfGeneration => write!(f, "stop"),
            StopReason::Length => write!(f, "length"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Returned by a stream callback after each piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    Stop,
}

/// Output of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

impl<R, S> Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    /// Generates a response by sampling tokens from the model
    ///
    /// Must follow a successful [`Session::prefill`]. Each piece is appended to the
    /// session output before `on_token` sees it. An evaluation failure aborts the
    /// request; the output keeps whatever was appended so far.
    pub fn generate(
        &mut self,
        mut on_token: Option<&mut dyn FnMut(&str) -> StreamControl>,
    ) -> Result<Generation, Error> {
        // The `Decoder`
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let t_main_start = Instant::now();

        let mut tokens_generated = 0;
        let mut stop_reason = StopReason::Length;

        for _ in 0..self.n_predict {
            // Sample next token
            let token = self.sampler.sample(&self.runtime, -1);
            self.sampler.accept(token);

            // Check for end of generation
            if self.runtime.is_eog(token) {
                stop_reason = StopReason::EndOfGeneration;
                break;
            }

            let output_bytes = self.runtime.token_to_bytes(token).map_err(|e| {
                error!("Token decode error: {e}");
                e
            })?;
            // 多字节字符可能跨越多个 token
            let piece = decode_piece(&mut decoder, &output_bytes, false);
            self.result.push_str(&piece);
            tokens_generated += 1;

            if let Some(cb) = on_token.as_mut() {
                if cb(&piece) == StreamControl::Stop {
                    stop_reason = StopReason::Cancelled;
                    break;
                }
            }

            // Decode
            self.runtime
                .decode_token(token, self.n_past, SEQ_ID)
                .map_err(|e| {
                    error!("failed to decode token: {e}");
                    e
                })?;
            self.n_past += 1;
        }

        // 未完成的多字节序列输出为 U+FFFD
        let tail = decode_piece(&mut decoder, &[], true);
        if !tail.is_empty() {
            self.result.push_str(&tail);
            if stop_reason != StopReason::Cancelled {
                if let Some(cb) = on_token.as_mut() {
                    let _ = cb(&tail);
                }
            }
        }

        let duration = t_main_start.elapsed();
        info!(
            "Generated {} tokens in {:.2}s ({:.2} t/s), {}",
            tokens_generated,
            duration.as_secs_f32(),
            tokens_generated as f32 / duration.as_secs_f32().max(0.001),
            stop_reason
        );

        Ok(Generation {
            text: self.result.clone(),
            tokens_generated,
            stop_reason,
        })
    }
}

/// Decodes `bytes` after whatever the decoder still holds from earlier pieces.
fn decode_piece(decoder: &mut Decoder, bytes: &[u8], last: bool) -> String {
    let mut piece = String::new();
    let mut input = bytes;
    loop {
        piece.reserve(decoder.max_utf8_buffer_length(input.len()).unwrap_or(32));
        let (result, read, _) = decoder.decode_to_string(input, &mut piece, last);
        input = &input[read..];
        if result == CoderResult::InputEmpty {
            return piece;
        }
    }
}
