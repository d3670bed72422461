//! Inference session
//!
//! One session binds a runtime (model, context, vision encoder, batch) and a sampler.
//! Every request runs reset → load media → prefill → generate, and each request is
//! independent: the decode position starts from zero again.
//!
//! A session is driven through `&mut self`, so one session is never used from two
//! threads at once. Resources are released on drop, sampler first.

use log::{error, info};

use crate::{
    backend::{PromptText, Runtime, TokenSampler, SEQ_ID},
    decoder::{Generation, StreamControl},
    error::Error,
    media::MediaQueue,
    options::SessionOptions,
};

/// State of one inference session.
pub struct Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    // 字段顺序即释放顺序: sampler 先于 runtime
    pub(crate) sampler: S,
    pub(crate) runtime: R,
    /// The list of loaded bitmaps.
    pub(crate) media: MediaQueue<R::Bitmap>,
    /// Fixed prompt of every request.
    pub(crate) prompt: PromptText,
    /// The number of past tokens processed.
    pub(crate) n_past: i32,
    /// Maximum number of tokens generated per request.
    pub(crate) n_predict: u32,
    /// Per-step batch limit of the prompt evaluation.
    pub(crate) n_batch: u32,
    pub(crate) image_max_resolution: Option<u32>,
    /// Text generated by the current request.
    pub(crate) result: String,
    use_gpu: bool,
}

impl<R, S> Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    /// Creates a session over a ready runtime and sampler
    pub fn new(runtime: R, sampler: S, options: &SessionOptions) -> Result<Self, Error> {
        options.validate()?;

        Ok(Self {
            sampler,
            runtime,
            media: MediaQueue::default(),
            prompt: PromptText::template(options.prompt_text()),
            n_past: 0,
            n_predict: options.n_predict,
            n_batch: options.n_batch,
            image_max_resolution: options.image_max_resolution,
            result: String::with_capacity(1024),
            use_gpu: options.use_gpu,
        })
    }

    /// Clears the state left by the previous request
    ///
    /// Position back to zero, output cleared, KV cache of the sequence and the
    /// vision encoder's cached state dropped.
    pub fn reset(&mut self) -> Result<(), Error> {
        self.n_past = 0;
        self.result.clear();
        self.result.reserve(1024);

        self.runtime.clear_sequence(SEQ_ID).map_err(|e| {
            error!("Failed to clear kv cache: {e}");
            e
        })?;
        self.runtime.reset_vision();
        Ok(())
    }

    /// Describes the image at `path`
    pub fn infer_path(&mut self, path: &str) -> Result<Generation, Error> {
        self.run_path(path, None)
    }

    /// Describes the image at `path`, handing every piece to `on_token`
    pub fn infer_path_stream<F>(&mut self, path: &str, mut on_token: F) -> Result<Generation, Error>
    where
        F: FnMut(&str) -> StreamControl,
    {
        self.run_path(path, Some(&mut on_token))
    }

    /// Describes an encoded image held in memory
    pub fn infer_buffer(&mut self, data: &[u8]) -> Result<Generation, Error> {
        self.run_buffer(data, None)
    }

    /// Describes an encoded image held in memory, handing every piece to `on_token`
    pub fn infer_buffer_stream<F>(
        &mut self,
        data: &[u8],
        mut on_token: F,
    ) -> Result<Generation, Error>
    where
        F: FnMut(&str) -> StreamControl,
    {
        self.run_buffer(data, Some(&mut on_token))
    }

    fn run_path(
        &mut self,
        path: &str,
        on_token: Option<&mut dyn FnMut(&str) -> StreamControl>,
    ) -> Result<Generation, Error> {
        info!("inference {path}");
        self.reset()?;
        self.load_media_file(path)?;
        self.prefill()?;
        self.generate(on_token)
    }

    fn run_buffer(
        &mut self,
        data: &[u8],
        on_token: Option<&mut dyn FnMut(&str) -> StreamControl>,
    ) -> Result<Generation, Error> {
        info!("inference buffer of {} bytes", data.len());
        self.reset()?;
        self.load_media_buffer(data)?;
        self.prefill()?;
        self.generate(on_token)
    }
}

impl<R, S> Session<R, S>
where
    R: Runtime,
    S: TokenSampler<R>,
{
    pub fn with_n_predict(mut self, n_predict: u32) -> Self {
        self.n_predict = n_predict.max(1);
        self
    }

    pub fn with_image_max_resolution(mut self, max_resolution: Option<u32>) -> Self {
        self.image_max_resolution = max_resolution;
        self
    }

    /// Decode position.
    pub fn n_past(&self) -> i32 {
        self.n_past
    }

    pub fn n_predict(&self) -> u32 {
        self.n_predict
    }

    /// Text accumulated by the current request, partial after a failure.
    pub fn output(&self) -> &str {
        &self.result
    }

    /// Number of bitmaps waiting for the next prefill.
    pub fn pending_media(&self) -> usize {
        self.media.len()
    }

    pub fn use_gpu(&self) -> bool {
        self.use_gpu
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }
}
