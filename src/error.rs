// Ошибки входного конвейера. Все операции библиотеки возвращают Result<T>,
// ошибки нижних слоев (файловая система, токенизатор, хранилище записей)
// оборачиваются в один тип и пробрасываются вызывающему коду.

use thiserror::Error;

/// Ошибка входного конвейера
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("record store error: {0}")]
    Records(String),

    #[error("record metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("invalid input config: {0}")]
    InvalidConfig(String),

    #[error("no inputs to encode")]
    EmptyInput,

    #[error("multimodal and text inputs cannot be mixed in one request")]
    MixedInputKinds,

    #[error("example {index} has keys {found:?}, expected {expected:?}")]
    InconsistentFeatures {
        index: usize,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("task `{task}` expects a {expected} target")]
    TargetMismatch { task: String, expected: &'static str },

    #[error("feature `{key}` has rows of width {found}, expected {expected}")]
    ModalityWidth {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("record {index} of task `{task}` could not be read")]
    MissingRecord { task: String, index: usize },

    #[error("serving request does not match the input signature: {0}")]
    InvalidRequest(String),

    #[error("{0} mode has no record split")]
    UnsupportedMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
