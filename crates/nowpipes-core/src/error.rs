use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage name `{name}` is already registered")]
    DuplicateName { name: String },

    #[error("no stage registered under `{name}`")]
    UnknownStage { name: String },

    #[error("invalid pipeline description: {message}")]
    Configuration { message: String },

    #[error("alignment failure while merging sources: {message}")]
    Alignment { message: String },

    #[error("fork branch {branch} fell {lag} records behind (limit {limit})")]
    ResourceExhausted {
        branch: usize,
        lag: usize,
        limit: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stage `{stage}` failed: {message}")]
    Stage { stage: String, message: String },
}

impl PipelineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        PipelineError::Alignment {
            message: message.into(),
        }
    }

    pub fn stage(stage: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Stage {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
