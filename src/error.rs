//! 错误类型定义

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 推理会话错误类型
#[derive(Debug, Error)]
pub enum Error {
    // ==================== 初始化错误 ====================
    #[error("Backend init failed: {0}")]
    Backend(String),

    #[error("Model load failed: {path}, {message}")]
    ModelLoad { path: String, message: String },

    #[error("Context init failed: {0}")]
    ContextLoad(String),

    #[error("Vision model load failed: {path}, {message}")]
    VisionLoad { path: String, message: String },

    // ==================== 媒体错误 ====================
    #[error("Load media failed: {0}")]
    MediaDecode(String),

    #[error("Image buffer error")]
    ImageBuffer,

    #[error(transparent)]
    ImageError(#[from] image::ImageError),

    // ==================== 推理错误 ====================
    #[error("Tokenize failed: {0}")]
    Tokenize(String),

    #[error("Unable to eval prompt: {0}")]
    PromptEval(String),

    #[error("Failed to decode token at position {pos}: {message}")]
    TokenDecode { pos: i32, message: String },

    #[error("Failed to convert token {token} to text: {message}")]
    TokenToPiece { token: i32, message: String },

    #[error("Inference panicked: {0}")]
    InferencePanic(String),

    // ==================== 配置错误 ====================
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid input for {field}: {message}")]
    InvalidInput { field: String, message: String },

    // ==================== IO和序列化错误 ====================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Model, context or vision encoder could not be created.
    Init,
    /// Media could not be decoded; the session is untouched.
    MediaDecode,
    /// Chunk construction failed; the media queue was still drained.
    Tokenize,
    /// A model evaluation step failed, during prefill or decoding.
    Eval,
    /// Options or call arguments were rejected before touching the runtime.
    InvalidParameter,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Init => write!(f, "InitFailure"),
            ErrorKind::MediaDecode => write!(f, "MediaDecodeFailure"),
            ErrorKind::Tokenize => write!(f, "TokenizeFailure"),
            ErrorKind::Eval => write!(f, "EvalFailure"),
            ErrorKind::InvalidParameter => write!(f, "InvalidParameter"),
        }
    }
}

impl Error {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend(_)
            | Error::ModelLoad { .. }
            | Error::ContextLoad(_)
            | Error::VisionLoad { .. } => ErrorKind::Init,
            Error::MediaDecode(_) | Error::ImageBuffer | Error::ImageError(_) | Error::Io(_) => {
                ErrorKind::MediaDecode
            }
            Error::Tokenize(_) => ErrorKind::Tokenize,
            Error::PromptEval(_)
            | Error::TokenDecode { .. }
            | Error::TokenToPiece { .. }
            | Error::InferencePanic(_) => ErrorKind::Eval,
            Error::InvalidParameter(_) | Error::InvalidInput { .. } | Error::Serde(_) => {
                ErrorKind::InvalidParameter
            }
        }
    }
}
