use crate::engine::{Engine, EngineError, RegistrationRequest};
use facegate_core::IdentityId;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facegate.Engine1";
pub const OBJECT_PATH: &str = "/org/facegate/Engine1";

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// D-Bus interface for the Facegate verification daemon.
///
/// Bus name: org.facegate.Engine1
/// Object path: /org/facegate/Engine1
///
/// Structured results are returned as JSON strings.
pub struct FacegateService {
    engine: Arc<Engine>,
}

impl FacegateService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Input(_) | EngineError::Registration(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
        EngineError::NotFound(_) => zbus::fdo::Error::UnknownObject(err.to_string()),
        EngineError::Timeout(_) => zbus::fdo::Error::TimedOut(err.to_string()),
        EngineError::Store(_) | EngineError::Internal(_) => zbus::fdo::Error::Failed(err.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[interface(name = "org.facegate.Engine1")]
impl FacegateService {
    /// Verify encoded frames. With `live` and more than one frame the
    /// frames are put to a consensus vote.
    async fn verify(&self, frames: Vec<Vec<u8>>, live: bool) -> zbus::fdo::Result<String> {
        tracing::info!(frames = frames.len(), live, "verify requested");
        let verdict = self.engine.verify(frames, live).await.map_err(to_fdo)?;
        tracing::info!(authorized = verdict.authorized(), "verify complete");
        to_json(&verdict)
    }

    /// Feed one frame of a camera stream.
    async fn verify_stream(&self, stream_id: &str, frame: Vec<u8>) -> zbus::fdo::Result<String> {
        let verdict = self.engine.verify_stream(stream_id, frame).await.map_err(to_fdo)?;
        to_json(&verdict)
    }

    /// Register a new identity from a reference image.
    async fn register(
        &self,
        image: Vec<u8>,
        name: &str,
        email: &str,
        department: &str,
        position: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, email, "register requested");
        let request = RegistrationRequest {
            name: name.to_string(),
            email: email.to_string(),
            department: optional(department),
            position: optional(position),
        };
        let identity = self.engine.register(image, request).await.map_err(to_fdo)?;
        to_json(&identity.summary())
    }

    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    async fn delete_identity(&self, id: &str) -> zbus::fdo::Result<()> {
        tracing::info!(id, "delete requested");
        self.engine.delete_identity(&IdentityId::from(id)).await.map_err(to_fdo)
    }

    /// Newest verification log entries for one identity.
    async fn verification_history(&self, id: &str, limit: u32) -> zbus::fdo::Result<String> {
        let limit = if limit == 0 { DEFAULT_HISTORY_LIMIT } else { limit as usize };
        let records = self
            .engine
            .verification_history(&IdentityId::from(id), limit)
            .await
            .map_err(to_fdo)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }

    /// Clear adaptation history for `user`, or for everyone when empty.
    async fn reset_history(&self, user: &str) -> zbus::fdo::Result<()> {
        self.engine.reset_history(optional(user).as_deref());
        Ok(())
    }

    async fn set_remote_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        tracing::info!(enabled, "remote provider toggled");
        self.engine.set_provider_enabled(enabled);
        Ok(())
    }

    async fn audit_sync(&self) -> zbus::fdo::Result<String> {
        let report = self
            .engine
            .audit_sync()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        to_json(&report)
    }

    async fn fix_sync(&self) -> zbus::fdo::Result<u64> {
        self.engine
            .fix_sync()
            .await
            .map(|n| n as u64)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn clean_orphans(&self) -> zbus::fdo::Result<u64> {
        self.engine
            .clean_orphans()
            .await
            .map(|n| n as u64)
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn recover_sync(&self) -> zbus::fdo::Result<String> {
        let report = self.engine.recover_sync().await;
        if !report.is_complete() {
            tracing::warn!(failure = ?report.failure, "sync recovery stopped early");
        }
        to_json(&report)
    }
}
