//! Chunking and prompt evaluation

use log::{error, info};

use crate::{
    backend::{Runtime, TokenSampler, SEQ_ID},
    error::Error,
    session::Session,
};

impl<R, S> Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    /// Processes and evaluates the prompt with the queued media through the model
    ///
    /// The media queue is drained before tokenizing, so it is empty afterwards
    /// whether or not this succeeds. Only the logits of the last position are kept,
    /// sampling starts with [`Session::generate`].
    pub fn prefill(&mut self) -> Result<(), Error> {
        let bitmaps = self.media.drain();
        if bitmaps.is_empty() {
            info!("No bitmaps loaded, only tokenizing text");
        } else {
            info!("Tokenizing with {} bitmaps", bitmaps.len());
        }

        // Tokenize
        let chunks = self
            .runtime
            .tokenize(&self.prompt, &bitmaps)
            .map_err(|e| {
                error!("Inference tokenizer failed: {e}");
                e
            })?;
        drop(bitmaps);
        info!(
            "Tokenization complete, {} positions",
            self.runtime.chunk_positions(&chunks)
        );

        // 评估 chunks
        let n_batch = i32::try_from(self.n_batch)
            .map_err(|e| Error::InvalidParameter(format!("n_batch {}: {e}", self.n_batch)))?;
        let n_past = self
            .runtime
            .eval_chunks(&chunks, self.n_past, SEQ_ID, n_batch, true)
            .map_err(|e| {
                error!("Unable to eval prompt: {e}");
                e
            })?;
        info!("Prompt evaluated, n_past {} -> {}", self.n_past, n_past);
        self.n_past = n_past;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{error::ErrorKind, mock::mock_session};

    #[test]
    fn test_prefill_advances_position() -> anyhow::Result<()> {
        let mut session = mock_session(&[]);
        session.load_media_buffer(b"cat")?;
        session.prefill()?;

        assert!(session.n_past() > 0);
        assert_eq!(session.pending_media(), 0);

        let calls = session.runtime().eval_calls();
        assert_eq!(calls.len(), 1);
        let (n_past, seq_id, n_batch, logits_last) = calls[0];
        assert_eq!((n_past, seq_id, n_batch, logits_last), (0, 0, 2048, true));

        let prompts = session.runtime().tokenized();
        assert_eq!(prompts[0].0.text, "<__media__>:");
        assert!(!prompts[0].0.add_special);
        assert!(prompts[0].0.parse_special);
        assert_eq!(prompts[0].1, vec!["buffer:cat".to_string()]);
        Ok(())
    }

    #[test]
    fn test_tokenize_failure_clears_queue() -> anyhow::Result<()> {
        let mut session = mock_session(&[]);
        session.load_media_buffer(b"cat")?;
        session.runtime_mut().fail_tokenize(true);

        let err = session.prefill().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Tokenize);
        assert_eq!(session.pending_media(), 0);
        assert_eq!(session.n_past(), 0);
        assert!(session.runtime().eval_calls().is_empty());
        Ok(())
    }

    #[test]
    fn test_eval_failure() -> anyhow::Result<()> {
        let mut session = mock_session(&[]);
        session.load_media_buffer(b"cat")?;
        session.runtime_mut().fail_eval(true);

        let err = session.prefill().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Eval);
        assert_eq!(session.pending_media(), 0);
        assert_eq!(session.n_past(), 0);
        Ok(())
    }
}
