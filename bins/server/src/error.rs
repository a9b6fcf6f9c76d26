#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("{0}")]
    Sink(#[from] pipeline::SinkError),

    #[error("store: {0}")]
    Store(#[from] sink_api::StoreError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn config(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Config { context, detail: detail.into() }
    }
}
