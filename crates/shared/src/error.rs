use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures the pipeline core knows how to name.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("no distinct sort key fits between {lower} and {upper}")]
    KeyExhaustion { lower: f64, upper: f64 },
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },
    #[error("invalid input: {0}")]
    Validation(String),
}

impl PipelineError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Validation,
    Internal,
}

/// JSON error envelope returned by the HTTP host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Maps the envelope back into the core taxonomy. `internal` picks
    /// between `Fetch` and `Write` depending on the call that failed.
    pub fn into_pipeline_error(self, internal: fn(String) -> PipelineError) -> PipelineError {
        match self.code {
            ErrorCode::NotFound => PipelineError::NotFound {
                entity: "resource".to_string(),
                id: self.message,
            },
            ErrorCode::Validation => PipelineError::Validation(self.message),
            ErrorCode::Internal => internal(self.message),
        }
    }
}

impl From<&PipelineError> for ApiError {
    fn from(value: &PipelineError) -> Self {
        let code = match value {
            PipelineError::NotFound { .. } => ErrorCode::NotFound,
            PipelineError::Validation(_) | PipelineError::KeyExhaustion { .. } => {
                ErrorCode::Validation
            }
            PipelineError::Fetch(_) | PipelineError::Write(_) => ErrorCode::Internal,
        };
        let message = match value {
            PipelineError::NotFound { id, .. } => id.clone(),
            other => other.to_string(),
        };
        Self { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_survives_the_wire_envelope() {
        let err = PipelineError::not_found("deal", "abc");
        let api = ApiError::from(&err);
        assert_eq!(api.code, ErrorCode::NotFound);
        let back = api.into_pipeline_error(PipelineError::Fetch);
        assert!(matches!(back, PipelineError::NotFound { id, .. } if id == "abc"));
    }

    #[test]
    fn internal_code_maps_to_the_callers_category() {
        let api = ApiError::new(ErrorCode::Internal, "disk full");
        assert_eq!(
            api.into_pipeline_error(PipelineError::Write),
            PipelineError::Write("disk full".to_string())
        );
    }
}
