use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Compile pipeline step that produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Dom,
    Ssr,
    Css,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Dom => f.write_str("DOM"),
            Stage::Ssr => f.write_str("SSR"),
            Stage::Css => f.write_str("CSS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("wx: failed to compile {stage} {view}: {message}")]
    Compile {
        view: String,
        stage: Stage,
        message: String,
    },

    #[error("wx: view {name} already registered")]
    DuplicateRegistration { name: String },

    #[error("wx: view is nil")]
    NilView,

    #[error("wx: view {name:?} is not registered")]
    ViewNotRegistered { name: String },

    #[error("wx: failed to render {view}: {message}")]
    Render { view: String, message: String },

    #[error("wx: failed to close {} pool workers: [{}]", failures.len(), failures.join("; "))]
    PoolClose { failures: Vec<String> },

    #[error("wx: pool is closed")]
    PoolClosed,

    #[error("wx: render engine is closed")]
    EngineClosed,

    #[error("wx: pool capacity must be at least 1")]
    InvalidCapacity,

    #[error("wx: script vm failure: {0}")]
    Vm(String),

    #[error("wx: failed to generate views: {0}")]
    Generate(String),

    #[error("wx: invalid config {}: {message}", path.display())]
    Config { path: PathBuf, message: String },

    #[error("wx: failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn compile(view: &str, stage: Stage, message: impl fmt::Display) -> Self {
        Self::Compile {
            view: view.to_string(),
            stage,
            message: message.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
