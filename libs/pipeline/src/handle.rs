use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sink_api::{StoreError, StoreSession};

use crate::SinkError;

/// Process-lifetime handle to the store session.
///
/// Opened once at startup, shared by reference with every worker and
/// closed once at shutdown. After `close` no new write can be submitted.
pub struct SessionHandle {
    session: Arc<dyn StoreSession>,
    keyspace: Option<String>,
    closed: AtomicBool,
}

impl SessionHandle {
    /// Await a backend connect future. A failure here is fatal for startup.
    pub async fn open<F>(connect: F, keyspace: Option<String>) -> Result<Self, SinkError>
    where
        F: Future<Output = Result<Arc<dyn StoreSession>, StoreError>>,
    {
        let session = connect.await.map_err(SinkError::Connect)?;
        tracing::info!(keyspace = ?keyspace, "store session opened");
        Ok(Self::new(session, keyspace))
    }

    pub fn new(session: Arc<dyn StoreSession>, keyspace: Option<String>) -> Self {
        Self {
            session,
            keyspace,
            closed: AtomicBool::new(false),
        }
    }

    /// Keyspace the session is bound to, if any.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Session for submitting writes; fails once the handle is closed.
    pub fn session(&self) -> Result<Arc<dyn StoreSession>, SinkError> {
        if self.is_open() {
            Ok(self.session.clone())
        } else {
            Err(SinkError::SessionUnavailable("session closed".into()))
        }
    }

    /// Close the session. Only the first call reaches the backend; later calls are no-ops.
    /// Close errors are logged and returned, never retried.
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.session.close().await {
            Ok(()) => {
                tracing::info!("store session closed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "store session close error");
                Err(e)
            }
        }
    }
}
