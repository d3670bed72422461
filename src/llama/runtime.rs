//! llama.cpp runtime: model, context, mtmd context and the single token batch

use std::{ffi::CString, num::NonZeroU32, sync::Arc};

use llama_cpp_2::{
    context::{params::LlamaContextParams, LlamaContext},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, LlamaModel, Special},
    mtmd::{MtmdBitmap, MtmdContext, MtmdContextParams, MtmdInputChunks, MtmdInputText},
    token::LlamaToken,
};
use tracing::{error, info};

use crate::{
    backend::{PromptText, Runtime, Token},
    error::Error,
    options::SessionOptions,
};

/// llama.cpp state of one session.
///
/// Field order is drop order: the batch and the mtmd context go first, the
/// context is released before the model it borrows from.
#[allow(missing_debug_implementations)]
pub struct LlamaRuntime {
    /// Single slot batch used for every generated token.
    batch: LlamaBatch<'static>,
    /// The MTMD context for multimodal processing.
    mtmd_context: MtmdContext,
    context: LlamaContext<'static>,
    model: Arc<LlamaModel>,
}

unsafe impl Send for LlamaRuntime {}

impl LlamaRuntime {
    /// Loads the model, its context and the vision projector
    pub fn load(backend: &LlamaBackend, options: &SessionOptions) -> Result<Self, Error> {
        let model = Self::load_model(backend, options)?;
        let context = Self::load_context(&model, backend, options)?;
        let mtmd_context = Self::load_mtmd_context(&model, options)?;

        Ok(Self {
            batch: LlamaBatch::new(1, 1),
            mtmd_context,
            context,
            model,
        })
    }

    /// 加载模型
    fn load_model(backend: &LlamaBackend, options: &SessionOptions) -> Result<Arc<LlamaModel>, Error> {
        info!("Loading model: {:?}", options.model_path);

        let model_params = LlamaModelParams::default().with_n_gpu_layers(options.gpu_layers());
        let model = LlamaModel::load_from_file(backend, &options.model_path, &model_params)
            .map_err(|e| {
                error!("Failed to load model: {:?}", e);
                Error::ModelLoad {
                    path: options.model_path.clone(),
                    message: e.to_string(),
                }
            })?;

        Ok(Arc::new(model))
    }

    /// Setup context parameters
    fn load_context(
        model: &Arc<LlamaModel>,
        backend: &LlamaBackend,
        options: &SessionOptions,
    ) -> Result<LlamaContext<'static>, Error> {
        let n_threads = options.threads();
        let context_params = LlamaContextParams::default()
            .with_n_threads(n_threads)
            .with_n_threads_batch(n_threads)
            .with_n_batch(options.n_batch)
            .with_n_ubatch(options.n_ubatch)
            .with_n_ctx(NonZeroU32::new(options.n_ctx));

        let context = model
            .new_context(backend, context_params)
            .map_err(|e| {
                error!("Failed to create context: {e}");
                Error::ContextLoad(e.to_string())
            })?;

        // context 借用 model, LlamaRuntime 持有 Arc<LlamaModel> 且后于 context 释放
        let context =
            unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(context) };

        Ok(context)
    }

    /// Initialize MTMD context
    fn load_mtmd_context(model: &LlamaModel, options: &SessionOptions) -> Result<MtmdContext, Error> {
        let media_marker = CString::new(options.media_marker.clone()).map_err(|e| Error::InvalidInput {
            field: "media_marker".into(),
            message: e.to_string(),
        })?;

        let mtmd_params = MtmdContextParams {
            use_gpu: options.use_gpu,
            print_timings: options.verbose,
            n_threads: options.threads(),
            media_marker,
        };
        let mtmd_context = MtmdContext::init_from_file(&options.mmproj_path, model, &mtmd_params)
            .map_err(|e| {
                error!("Init vision model failed: {e}");
                Error::VisionLoad {
                    path: options.mmproj_path.clone(),
                    message: e.to_string(),
                }
            })?;
        info!("Loading mtmd projection: {}", options.mmproj_path);

        Ok(mtmd_context)
    }

    pub(crate) fn context(&self) -> &LlamaContext<'static> {
        &self.context
    }

    pub fn model(&self) -> &Arc<LlamaModel> {
        &self.model
    }
}

impl Runtime for LlamaRuntime {
    type Bitmap = MtmdBitmap;
    type Chunks = MtmdInputChunks;

    fn bitmap_from_file(&self, path: &str) -> Result<Self::Bitmap, Error> {
        MtmdBitmap::from_file(&self.mtmd_context, path)
            .map_err(|e| Error::MediaDecode(format!("{path}: {e}")))
    }

    fn bitmap_from_buffer(&self, data: &[u8]) -> Result<Self::Bitmap, Error> {
        MtmdBitmap::from_buffer(&self.mtmd_context, data)
            .map_err(|e| Error::MediaDecode(e.to_string()))
    }

    fn tokenize(
        &self,
        prompt: &PromptText,
        bitmaps: &[Self::Bitmap],
    ) -> Result<Self::Chunks, Error> {
        let input_text = MtmdInputText {
            text: prompt.text.clone(),
            add_special: prompt.add_special,
            parse_special: prompt.parse_special,
        };
        info!("MtmdInputText: {input_text:?}");

        let bitmap_refs: Vec<&MtmdBitmap> = bitmaps.iter().collect();
        let chunks = self
            .mtmd_context
            .tokenize(input_text, &bitmap_refs)
            .map_err(|e| Error::Tokenize(e.to_string()))?;
        info!("Tokenization complete, {} chunks created", chunks.len());

        Ok(chunks)
    }

    fn chunk_positions(&self, chunks: &Self::Chunks) -> i32 {
        chunks.total_positions()
    }

    fn eval_chunks(
        &mut self,
        chunks: &Self::Chunks,
        n_past: i32,
        seq_id: i32,
        n_batch: i32,
        logits_last: bool,
    ) -> Result<i32, Error> {
        chunks
            .eval_chunks(
                &self.mtmd_context,
                &self.context,
                n_past,
                seq_id,
                n_batch,
                logits_last,
            )
            .map_err(|e| Error::PromptEval(e.to_string()))
    }

    fn decode_token(&mut self, token: Token, pos: i32, seq_id: i32) -> Result<(), Error> {
        // Prepare next batch
        self.batch.clear();
        self.batch
            .add(LlamaToken(token), pos, &[seq_id], true)
            .map_err(|e| Error::TokenDecode {
                pos,
                message: e.to_string(),
            })?;

        self.context
            .decode(&mut self.batch)
            .map_err(|e| Error::TokenDecode {
                pos,
                message: e.to_string(),
            })
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn token_to_bytes(&self, token: Token) -> Result<Vec<u8>, Error> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| Error::TokenToPiece {
                token,
                message: e.to_string(),
            })
    }

    fn clear_sequence(&mut self, seq_id: i32) -> Result<(), Error> {
        let seq_id = u32::try_from(seq_id)
            .map_err(|e| Error::InvalidParameter(format!("seq_id {seq_id}: {e}")))?;
        self.context
            .clear_kv_cache_seq(Some(seq_id), None, None)
            .map_err(|e| Error::PromptEval(format!("clear kv cache: {e}")))?;
        Ok(())
    }

    // llama-cpp-2 的 mtmd 封装不暴露 mtmd_reset, 投影器在两次请求之间不保留图像状态
}
