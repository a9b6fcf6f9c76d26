use sink_api::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("connect: {0}")]
    Connect(StoreError),

    /// The session handle was closed or never opened; no write can be submitted.
    #[error("store session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("placeholder in '{template}': {detail}")]
    Placeholder { template: String, detail: String },

    #[error("format: {0}")]
    Format(StoreError),
}

impl SinkError {
    pub(crate) fn config(context: &'static str, detail: impl Into<String>) -> Self {
        SinkError::Config { context, detail: detail.into() }
    }
}
