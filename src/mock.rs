//! Scripted runtime and sampler for the session tests

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use crate::{
    backend::{PromptText, Runtime, Token, TokenSampler},
    error::Error,
    options::SessionOptions,
    session::Session,
};

/// End-of-generation token of the mock vocabulary.
pub(crate) const EOG: Token = 2000;

pub(crate) type MockSession = Session<MockRuntime, ScriptedSampler>;

/// Names pushed by the mocks when they are dropped.
pub(crate) type DropLog = Rc<RefCell<Vec<&'static str>>>;

/// Session with default options whose sampler emits `script`, then EOG.
pub(crate) fn mock_session(script: &[Token]) -> MockSession {
    Session::new(
        MockRuntime::default(),
        ScriptedSampler::new(script),
        &SessionOptions::default(),
    )
    .expect("default options are valid")
}

#[derive(Debug)]
pub(crate) struct MockChunks {
    positions: i32,
}

/// Records every call, positions advance by prompt bytes plus 16 per image.
#[derive(Debug, Default)]
pub(crate) struct MockRuntime {
    loaded_buffers: RefCell<Vec<Vec<u8>>>,
    tokenized: RefCell<Vec<(PromptText, Vec<String>)>>,
    eval_calls: Vec<(i32, i32, i32, bool)>,
    decoded: Vec<(Token, i32)>,
    cleared: usize,
    vision_resets: usize,
    fail_tokenize: bool,
    fail_eval: bool,
    fail_decode_at: Option<usize>,
    drop_log: Option<DropLog>,
}

impl MockRuntime {
    pub(crate) fn fail_tokenize(&mut self, fail: bool) {
        self.fail_tokenize = fail;
    }

    pub(crate) fn fail_eval(&mut self, fail: bool) {
        self.fail_eval = fail;
    }

    /// Fails the n-th (0 based) single token evaluation.
    pub(crate) fn fail_decode_at(&mut self, n: usize) {
        self.fail_decode_at = Some(n);
    }

    pub(crate) fn record_drop(&mut self, log: DropLog) {
        self.drop_log = Some(log);
    }

    pub(crate) fn loaded_buffers(&self) -> Vec<Vec<u8>> {
        self.loaded_buffers.borrow().clone()
    }

    pub(crate) fn tokenized(&self) -> Vec<(PromptText, Vec<String>)> {
        self.tokenized.borrow().clone()
    }

    pub(crate) fn eval_calls(&self) -> &[(i32, i32, i32, bool)] {
        &self.eval_calls
    }

    pub(crate) fn decoded(&self) -> &[(Token, i32)] {
        &self.decoded
    }

    pub(crate) fn cleared(&self) -> usize {
        self.cleared
    }

    pub(crate) fn vision_resets(&self) -> usize {
        self.vision_resets
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        if let Some(log) = &self.drop_log {
            log.borrow_mut().push("runtime");
        }
    }
}

impl Runtime for MockRuntime {
    type Bitmap = String;
    type Chunks = MockChunks;

    fn bitmap_from_file(&self, path: &str) -> Result<Self::Bitmap, Error> {
        std::fs::read(path).map_err(|e| Error::MediaDecode(format!("{path}: {e}")))?;
        Ok(format!("file:{path}"))
    }

    fn bitmap_from_buffer(&self, data: &[u8]) -> Result<Self::Bitmap, Error> {
        if data.is_empty() {
            return Err(Error::MediaDecode("empty buffer".into()));
        }
        self.loaded_buffers.borrow_mut().push(data.to_vec());
        Ok(format!("buffer:{}", String::from_utf8_lossy(data)))
    }

    fn tokenize(
        &self,
        prompt: &PromptText,
        bitmaps: &[Self::Bitmap],
    ) -> Result<Self::Chunks, Error> {
        self.tokenized
            .borrow_mut()
            .push((prompt.clone(), bitmaps.to_vec()));
        if self.fail_tokenize {
            return Err(Error::Tokenize("image preprocessing error".into()));
        }
        Ok(MockChunks {
            positions: prompt.text.len() as i32 + 16 * bitmaps.len() as i32,
        })
    }

    fn chunk_positions(&self, chunks: &Self::Chunks) -> i32 {
        chunks.positions
    }

    fn eval_chunks(
        &mut self,
        chunks: &Self::Chunks,
        n_past: i32,
        seq_id: i32,
        n_batch: i32,
        logits_last: bool,
    ) -> Result<i32, Error> {
        self.eval_calls.push((n_past, seq_id, n_batch, logits_last));
        if self.fail_eval {
            return Err(Error::PromptEval("eval failed with code: 1".into()));
        }
        Ok(n_past + chunks.positions)
    }

    fn decode_token(&mut self, token: Token, pos: i32, _seq_id: i32) -> Result<(), Error> {
        if self.fail_decode_at == Some(self.decoded.len()) {
            return Err(Error::TokenDecode {
                pos,
                message: "NoKvCacheSlot".into(),
            });
        }
        self.decoded.push((token, pos));
        Ok(())
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOG
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, Error> {
        let bytes: &[u8] = match token {
            1 => b"a ",
            2 => b"cat",
            3 => b" sat",
            4 => b" down",
            // "猫" = E7 8C AB
            10 => &[0xE7, 0x8C],
            11 => &[0xAB],
            EOG => b"</s>",
            _ => {
                return Err(Error::TokenToPiece {
                    token,
                    message: "unknown token".into(),
                })
            }
        };
        Ok(bytes.to_vec())
    }

    fn clear_sequence(&mut self, _seq_id: i32) -> Result<(), Error> {
        self.cleared += 1;
        Ok(())
    }

    fn reset_vision(&mut self) {
        self.vision_resets += 1;
    }
}

/// Emits a fixed token sequence, EOG once exhausted.
#[derive(Debug, Default)]
pub(crate) struct ScriptedSampler {
    script: VecDeque<Token>,
    accepted: Vec<Token>,
    drop_log: Option<DropLog>,
}

impl ScriptedSampler {
    pub(crate) fn new(script: &[Token]) -> Self {
        Self {
            script: script.iter().copied().collect(),
            accepted: Vec::new(),
            drop_log: None,
        }
    }

    pub(crate) fn record_drop(&mut self, log: DropLog) {
        self.drop_log = Some(log);
    }

    pub(crate) fn accepted(&self) -> &[Token] {
        &self.accepted
    }
}

impl Drop for ScriptedSampler {
    fn drop(&mut self) {
        if let Some(log) = &self.drop_log {
            log.borrow_mut().push("sampler");
        }
    }
}

impl<R: Runtime> TokenSampler<R> for ScriptedSampler {
    fn sample(&mut self, _runtime: &R, _idx: i32) -> Token {
        self.script.pop_front().unwrap_or(EOG)
    }

    fn accept(&mut self, token: Token) {
        self.accepted.push(token);
    }
}
