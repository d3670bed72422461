//! llama.cpp backend
//!
//! - model + context: llama.cpp text model, one sequence
//! - mtmd context: the vision projector (mmproj) turning bitmaps into embeddings
//!     - https://github.com/ggml-org/llama.cpp/tree/master/tools/mtmd

mod runtime;
mod sampler;

use std::sync::OnceLock;

use llama_cpp_2::{llama_backend::LlamaBackend, send_logs_to_tracing, LlamaCppError, LogOptions};
use tracing::{error, info};

use crate::{error::Error, options::SessionOptions, session::Session};

pub use runtime::LlamaRuntime;
pub use sampler::LlamaTokenSampler;

/// Session over llama.cpp.
pub type LlamaSession = Session<LlamaRuntime, LlamaTokenSampler>;

static BACKEND: OnceLock<Result<LlamaBackend, String>> = OnceLock::new();

/// Process-wide backend, initialized once.
fn backend() -> Result<&'static LlamaBackend, Error> {
    BACKEND
        .get_or_init(|| match LlamaBackend::init() {
            Ok(backend) => Ok(backend),
            Err(LlamaCppError::BackendAlreadyInitialized) => Ok(LlamaBackend {}),
            Err(e) => {
                error!("Failed to initialize backend: {}", e);
                Err(e.to_string())
            }
        })
        .as_ref()
        .map_err(|e| Error::Backend(e.clone()))
}

/// Loads the model, the vision projector and the sampler into a new session
///
/// Either every part is created or the ones already built are released and
/// an [`crate::ErrorKind::Init`] error is returned.
pub fn init(options: &SessionOptions) -> Result<LlamaSession, Error> {
    options.validate()?;

    // 关闭 llama.cpp 原生日志, verbose 时转发到 tracing
    send_logs_to_tracing(LogOptions::default().with_logs_enabled(options.verbose));

    let backend = backend()?;
    let runtime = LlamaRuntime::load(backend, options)?;
    let sampler = LlamaTokenSampler::new(&options.sampler);

    let session = Session::new(runtime, sampler, options)?;
    info!(
        "Session ready, n_ctx: {}, n_predict: {}, gpu: {}",
        options.n_ctx,
        options.n_predict,
        session.use_gpu()
    );
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, StopReason};

    /// MTMD_MODEL / MTMD_MMPROJ / MTMD_IMAGE point at a GGUF model, its projector and an image.
    fn env_paths() -> Option<(String, String, String)> {
        Some((
            std::env::var("MTMD_MODEL").ok()?,
            std::env::var("MTMD_MMPROJ").ok()?,
            std::env::var("MTMD_IMAGE").ok()?,
        ))
    }

    #[test]
    fn test_missing_model() {
        let options = SessionOptions::cpu_default("/nonexistent/model.gguf", "/nonexistent/mmproj.gguf");
        let err = init(&options).err().expect("model must not load");
        assert_eq!(err.kind(), ErrorKind::Init);
    }

    #[test]
    #[ignore]
    fn test_missing_mmproj() -> anyhow::Result<()> {
        let Some((model_path, _, _)) = env_paths() else {
            return Ok(());
        };
        let options = SessionOptions::cpu_default(model_path, "/nonexistent/mmproj.gguf");
        let err = init(&options).err().expect("projector must not load");
        assert_eq!(err.kind(), ErrorKind::Init);
        Ok(())
    }

    #[test]
    #[ignore]
    fn test_simple() -> anyhow::Result<()> {
        let Some((model_path, mmproj_path, image_path)) = env_paths() else {
            return Ok(());
        };
        crate::utils::log::init_logger(tracing::Level::INFO);

        let options = SessionOptions::cpu_default(model_path, mmproj_path);
        let mut session = init(&options)?;

        let generation = session.infer_path(&image_path)?;
        assert!(session.n_past() > 0);
        assert!(generation.tokens_generated <= 512);
        assert!(!generation.text.contains("<|im_end|>"));
        assert!(!generation.text.contains("</s>"));

        // 流式输出与一次性输出一致
        let mut streamed = String::new();
        let stream = session.infer_path_stream(&image_path, |piece| {
            streamed.push_str(piece);
            crate::StreamControl::Continue
        })?;
        assert_eq!(streamed, generation.text);
        assert_eq!(stream.text, generation.text);

        let data = std::fs::read(&image_path)?;
        let from_memory = session.infer_buffer(&data)?;
        assert_eq!(from_memory.text, generation.text);
        assert_ne!(from_memory.stop_reason, StopReason::Cancelled);

        println!("{:?}", generation.text);
        Ok(())
    }
}
