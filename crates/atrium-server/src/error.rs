use atrium_engine::workflow::WorkflowError;
use atrium_engine::EngineError;
use atrium_store::StoreError;

/// Failures surfaced by the exposed operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The tenant session could not be initialized.
    #[error("session unavailable: {0}")]
    Unavailable(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::InvalidParams(_) => "invalid_params",
            Self::Engine(e) => e.code(),
            Self::Store(_) => "store_unavailable",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// Machine-readable payload for callers that need more than the message.
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Engine(EngineError::Workflow(WorkflowError::IncompleteChecklist { unmet })) => {
                Some(serde_json::json!({ "unmet": unmet }))
            }
            _ => None,
        }
    }
}

impl From<WorkflowError> for ServerError {
    fn from(e: WorkflowError) -> Self {
        Self::Engine(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_engine::workflow::{StepStatus, UnmetStep};

    #[test]
    fn incomplete_checklist_lists_every_unmet_step() {
        let err = ServerError::from(WorkflowError::IncompleteChecklist {
            unmet: vec![
                UnmetStep {
                    id: "collect".into(),
                    title: "Collect invoices".into(),
                    status: StepStatus::InProgress,
                },
                UnmetStep {
                    id: "send".into(),
                    title: "Send summary".into(),
                    status: StepStatus::Pending,
                },
            ],
        });
        assert_eq!(err.code(), "incomplete_checklist");
        let details = err.details().unwrap();
        let ids: Vec<&str> = details["unmet"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["collect", "send"]);
    }

    #[test]
    fn unavailable_code() {
        assert_eq!(ServerError::Unavailable("context down".into()).code(), "unavailable");
        assert!(ServerError::NotFound("x".into()).details().is_none());
    }
}
