//! Session options
//!
//! ## media_marker
//! - llama.cpp mtmd 默认标记: `<__media__>`
//! - the prompt must contain the marker once per image, otherwise it is appended

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::Error, sampler::SamplerConfig};

/// Default media placeholder used by llama.cpp mtmd.
pub const DEFAULT_MEDIA_MARKER: &str = "<__media__>";

/// Fixed prompt of every request: the image followed by a colon.
pub const DEFAULT_PROMPT: &str = "<__media__>:";

/// Extra context reserved on top of the caller supplied size by [`SessionOptions::with_params`].
pub const CONTEXT_HEADROOM: u32 = 256;

/// Session options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Path to the model file (e.g., "model-Q4_K_M.gguf")
    #[serde(default)]
    pub model_path: String,

    /// Path to the multimodal projection file (e.g., "mmproj-model-f16.gguf")
    #[serde(default)]
    pub mmproj_path: String,

    /// Size of the prompt context window.
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,

    /// Batch size for prompt processing.
    /// Also used as the per-step limit while evaluating the prompt chunks.
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,

    /// Physical batch size.
    #[serde(default = "default_n_ubatch")]
    pub n_ubatch: u32,

    /// Maximum number of tokens generated per request.
    #[serde(default = "default_n_predict")]
    pub n_predict: u32,

    /// Number of threads used by the model and the vision encoder.
    /// 0 = hardware concurrency
    #[serde(default)]
    pub n_threads: i32,

    /// Offload layers and the vision encoder to the GPU.
    #[serde(default)]
    pub use_gpu: bool,

    /// Number of GPU layers to offload when `use_gpu` is set.
    #[serde(default = "default_n_gpu_layers")]
    pub n_gpu_layers: u32,

    /// 媒体占位符标记
    #[serde(default = "default_media_marker")]
    pub media_marker: String,

    /// Prompt template, containing the media marker.
    #[serde(default = "default_prompt")]
    pub prompt: String,

    /// 图片最大分辨率限制, images with a longer side are downscaled
    #[serde(default)]
    pub image_max_resolution: Option<u32>,

    /// Sampling parameters
    #[serde(default = "SamplerConfig::greedy")]
    pub sampler: SamplerConfig,

    /// Enables verbose logging from llama.cpp.
    #[serde(default)]
    pub verbose: bool,
}

fn default_n_ctx() -> u32 {
    4096
}

fn default_n_batch() -> u32 {
    2048
}

fn default_n_ubatch() -> u32 {
    512
}

fn default_n_predict() -> u32 {
    512
}

fn default_n_gpu_layers() -> u32 {
    99
}

fn default_media_marker() -> String {
    DEFAULT_MEDIA_MARKER.to_string()
}

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            mmproj_path: String::new(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_ubatch(),
            n_predict: default_n_predict(),
            n_threads: 0,
            use_gpu: false,
            n_gpu_layers: default_n_gpu_layers(),
            media_marker: default_media_marker(),
            prompt: default_prompt(),
            image_max_resolution: None,
            sampler: SamplerConfig::greedy(),
            verbose: false,
        }
    }
}

// 预设
impl SessionOptions {
    /// GPU preferring defaults.
    ///
    /// flash attention 不单独配置, 使用 llama.cpp 的默认策略
    pub fn gpu_default(model_path: impl Into<String>, mmproj_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            mmproj_path: mmproj_path.into(),
            n_threads: hardware_concurrency().max(8),
            use_gpu: true,
            ..Self::default()
        }
    }

    /// Same as [`SessionOptions::gpu_default`] with everything on the CPU.
    pub fn cpu_default(model_path: impl Into<String>, mmproj_path: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            mmproj_path: mmproj_path.into(),
            n_threads: hardware_concurrency(),
            use_gpu: false,
            ..Self::default()
        }
    }

    /// Caller controlled context size, the generation budget follows it.
    ///
    /// A size too large to take the headroom leaves `n_ctx` at 0, rejected by [`SessionOptions::validate`].
    pub fn with_params(
        model_path: impl Into<String>,
        mmproj_path: impl Into<String>,
        n_ctx: u32,
        use_gpu: bool,
        n_threads: i32,
    ) -> Self {
        Self {
            model_path: model_path.into(),
            mmproj_path: mmproj_path.into(),
            n_ctx: n_ctx.checked_add(CONTEXT_HEADROOM).unwrap_or(0),
            n_predict: n_ctx,
            n_threads,
            use_gpu,
            ..Self::default()
        }
    }

    /// Loads options from a JSON file, missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidInput {
            field: "config".into(),
            message: format!("{}: {e}", path.display()),
        })?;
        let options: Self = serde_json::from_str(&content)?;
        Ok(options)
    }
}

// 生成便捷方法
impl SessionOptions {
    pub fn with_n_threads(mut self, n_threads: i32) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_n_batch(mut self, n_batch: u32) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_predict(mut self, n_predict: u32) -> Self {
        self.n_predict = n_predict;
        self
    }

    pub fn with_media_marker(mut self, marker: impl Into<String>) -> Self {
        self.media_marker = marker.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_image_max_resolution(mut self, max_resolution: u32) -> Self {
        self.image_max_resolution = Some(max_resolution);
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerConfig) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

impl SessionOptions {
    /// Thread count handed to the runtimes, resolving 0 to the hardware concurrency.
    pub fn threads(&self) -> i32 {
        if self.n_threads > 0 {
            self.n_threads
        } else {
            hardware_concurrency()
        }
    }

    /// GPU layers handed to the model loader, 0 when running on the CPU.
    pub fn gpu_layers(&self) -> u32 {
        if self.use_gpu {
            self.n_gpu_layers
        } else {
            0
        }
    }

    /// Prompt with the media marker, appended when the template lacks one.
    pub fn prompt_text(&self) -> String {
        let mut prompt = self.prompt.clone();
        if !prompt.contains(&self.media_marker) {
            prompt.push_str(&self.media_marker);
        }
        prompt
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.n_ctx == 0 {
            return Err(Error::InvalidParameter(
                "n_ctx must be positive and leave room for the context headroom".to_string(),
            ));
        }
        if self.n_predict == 0 {
            return Err(Error::InvalidParameter(
                "n_predict must be positive".to_string(),
            ));
        }
        if self.n_batch == 0 || self.n_batch > i32::MAX as u32 {
            return Err(Error::InvalidParameter(format!(
                "n_batch must be in 1..={}",
                i32::MAX
            )));
        }
        if self.n_predict > self.n_ctx {
            return Err(Error::InvalidParameter(
                "n_predict > n_ctx, the required kv cache size is not big enough either reduce n_predict or increase n_ctx"
                    .to_string(),
            ));
        }
        if self.media_marker.is_empty() {
            return Err(Error::InvalidInput {
                field: "media_marker".into(),
                message: "must not be empty".into(),
            });
        }
        if self.image_max_resolution == Some(0) {
            return Err(Error::InvalidInput {
                field: "image_max_resolution".into(),
                message: "must be positive".into(),
            });
        }
        self.sampler.validate()
    }
}

fn hardware_concurrency() -> i32 {
    std::thread::available_parallelism()
        .map(|p| p.get() as i32)
        .unwrap_or(4)
}
