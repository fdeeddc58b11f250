//! Resilience wrapper around one remote recognition provider.
//!
//! Gates run in a fixed order: enabled, circuit, rate limit, single-slot
//! concurrency, input size. Each rejection is a "no opinion" outcome and
//! never counts toward the circuit. Admitted calls run on a dedicated
//! worker thread with its own runtime, which records the result on the
//! breaker before releasing the slot.

use crate::breaker::{BreakerConfig, CircuitBreaker, CircuitEvent, CircuitState, Decision};
use crate::limiter::RateLimiter;
use crate::provider::{verify_remotely, RemoteError, RemoteMatch, RemoteOutcome, RemoteRecognizer};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub enabled: bool,
    pub breaker: BreakerConfig,
    pub rate_limit: u32,
    pub rate_window_ms: u64,
    /// Images smaller than this never reach the provider for verification.
    pub min_image_bytes: usize,
    pub call_timeout_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            breaker: BreakerConfig::default(),
            rate_limit: 200,
            rate_window_ms: 60_000,
            min_image_bytes: 1024,
            call_timeout_ms: 5_000,
        }
    }
}

/// Why the provider gave no opinion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Unavailable {
    Disabled,
    CircuitOpen { retry_after_ms: u64 },
    RateLimited,
    Busy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome<T = Vec<RemoteOutcome>> {
    /// The provider ran. For verification an empty list means it found nothing.
    Completed(T),
    NoOpinion(Unavailable),
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote worker is gone")]
    WorkerGone,
}

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("cannot start remote worker: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStatus {
    pub provider: Option<String>,
    pub enabled: bool,
    pub circuit: &'static str,
    pub consecutive_errors: u32,
    pub window_used: u32,
    pub window_limit: u32,
    pub busy: bool,
}

type Task = Box<dyn FnOnce(Arc<dyn RemoteRecognizer>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

pub struct ExternalServiceGuard {
    provider_name: Option<String>,
    enabled: AtomicBool,
    worker: Option<mpsc::Sender<Task>>,
    breaker: Arc<Mutex<CircuitBreaker>>,
    limiter: Mutex<RateLimiter>,
    slot: Arc<Semaphore>,
    min_image_bytes: usize,
    call_timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExternalServiceGuard {
    /// Build the guard. With no provider every call reports `Disabled`
    /// and no worker thread is started.
    pub fn new(provider: Option<Arc<dyn RemoteRecognizer>>, config: GuardConfig) -> Result<Self, GuardError> {
        let provider_name = provider.as_ref().map(|p| p.name().to_string());
        let breaker = Arc::new(Mutex::new(CircuitBreaker::new(
            provider_name.clone().unwrap_or_else(|| "none".into()),
            config.breaker.clone(),
        )));

        let worker = match provider {
            Some(provider) => Some(spawn_worker(provider)?),
            None => None,
        };

        Ok(Self {
            provider_name,
            enabled: AtomicBool::new(config.enabled),
            worker,
            breaker,
            limiter: Mutex::new(RateLimiter::new(
                config.rate_limit,
                Duration::from_millis(config.rate_window_ms),
            )),
            slot: Arc::new(Semaphore::new(1)),
            min_image_bytes: config.min_image_bytes,
            call_timeout: Duration::from_millis(config.call_timeout_ms),
        })
    }

    /// A guard with no provider.
    pub fn disabled() -> Self {
        Self {
            provider_name: None,
            enabled: AtomicBool::new(false),
            worker: None,
            breaker: Arc::new(Mutex::new(CircuitBreaker::new("none", BreakerConfig::default()))),
            limiter: Mutex::new(RateLimiter::new(0, Duration::from_secs(60))),
            slot: Arc::new(Semaphore::new(1)),
            min_image_bytes: usize::MAX,
            call_timeout: Duration::from_millis(GuardConfig::default().call_timeout_ms),
        }
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider_name.as_deref()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(provider = ?self.provider_name, enabled, "remote provider toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.is_some() && self.enabled.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> GuardStatus {
        let (circuit, consecutive_errors) = {
            let b = lock(&self.breaker);
            let name = match b.state() {
                CircuitState::Closed => "closed",
                CircuitState::Open { .. } => "open",
                CircuitState::HalfOpen => "half_open",
            };
            (name, b.consecutive_errors())
        };
        let (window_used, window_limit) = lock(&self.limiter).usage();
        GuardStatus {
            provider: self.provider_name.clone(),
            enabled: self.is_enabled(),
            circuit,
            consecutive_errors,
            window_used,
            window_limit,
            busy: self.slot.available_permits() == 0,
        }
    }

    fn abandon_trial(&self, trial: bool) {
        if trial {
            lock(&self.breaker).apply(CircuitEvent::TrialAbandoned, Instant::now());
        }
    }

    /// Ask the provider for its opinion on `image`.
    ///
    /// `Err` only when the call was executed and failed.
    pub async fn verify(&self, image: Vec<u8>) -> Result<GuardOutcome, ProviderError> {
        let undersized = (image.len() < self.min_image_bytes).then(Vec::new);
        self.execute("verify", undersized, move |provider| async move {
            verify_remotely(provider.as_ref(), &image).await
        })
        .await
    }

    /// Search the collection for the face in `image`.
    pub async fn search(&self, image: Vec<u8>) -> Result<GuardOutcome<Option<RemoteMatch>>, ProviderError> {
        self.execute("search", None, move |provider| async move { provider.search(&image).await })
            .await
    }

    /// Add the face in `image` to the collection, returning its face id.
    pub async fn index(&self, image: Vec<u8>, correlation_id: String) -> Result<GuardOutcome<String>, ProviderError> {
        self.execute("index", None, move |provider| async move {
            provider.index(&image, &correlation_id).await
        })
        .await
    }

    /// Remove faces from the collection, returning the ids actually deleted.
    pub async fn delete_faces(&self, face_ids: Vec<String>) -> Result<GuardOutcome<Vec<String>>, ProviderError> {
        self.execute("delete", None, move |provider| async move {
            provider.delete_faces(&face_ids).await
        })
        .await
    }

    /// Run `call` on the worker once every gate admits it.
    ///
    /// `undersized` short-circuits to a completed outcome after the slot
    /// gate, without reaching the provider or the circuit.
    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        undersized: Option<T>,
        call: F,
    ) -> Result<GuardOutcome<T>, ProviderError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn RemoteRecognizer>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let Some(worker) = &self.worker else {
            return Ok(GuardOutcome::NoOpinion(Unavailable::Disabled));
        };
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(GuardOutcome::NoOpinion(Unavailable::Disabled));
        }

        let now = Instant::now();
        let trial = match lock(&self.breaker).apply(CircuitEvent::Admit, now) {
            Decision::Trial => true,
            Decision::Rejected { retry_after } => {
                tracing::debug!(
                    operation,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "remote call rejected, circuit open"
                );
                return Ok(GuardOutcome::NoOpinion(Unavailable::CircuitOpen {
                    retry_after_ms: retry_after.as_millis() as u64,
                }));
            }
            Decision::Allowed | Decision::Recorded => false,
        };

        if !lock(&self.limiter).try_acquire(now) {
            self.abandon_trial(trial);
            tracing::debug!(operation, "remote call rejected, rate limit reached");
            return Ok(GuardOutcome::NoOpinion(Unavailable::RateLimited));
        }

        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            self.abandon_trial(trial);
            tracing::debug!(operation, "remote call rejected, provider busy");
            return Ok(GuardOutcome::NoOpinion(Unavailable::Busy));
        };

        if let Some(value) = undersized {
            self.abandon_trial(trial);
            tracing::debug!(operation, "input too small for remote call");
            return Ok(GuardOutcome::Completed(value));
        }

        let (reply, rx) = oneshot::channel();
        let breaker = self.breaker.clone();
        let call_timeout = self.call_timeout;
        let task: Task = Box::new(move |provider: Arc<dyn RemoteRecognizer>| {
            let run = async move {
                let name = provider.name().to_string();
                let result = match tokio::time::timeout(call_timeout, call(provider)).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ProviderError::Remote(e)),
                    Err(_) => Err(ProviderError::Timeout(call_timeout)),
                };

                let event = match &result {
                    Ok(_) => CircuitEvent::Success,
                    Err(e) => {
                        tracing::warn!(provider = %name, operation, error = %e, "remote call failed");
                        CircuitEvent::Failure
                    }
                };
                lock(&breaker).apply(event, Instant::now());
                drop(permit);
                let _ = reply.send(result);
            };
            Box::pin(run) as Pin<Box<dyn Future<Output = ()> + Send>>
        });

        if worker.send(task).await.is_err() {
            self.abandon_trial(trial);
            return Err(ProviderError::WorkerGone);
        }
        match rx.await {
            Ok(result) => result.map(GuardOutcome::Completed),
            Err(_) => Err(ProviderError::WorkerGone),
        }
    }
}

fn spawn_worker(provider: Arc<dyn RemoteRecognizer>) -> Result<mpsc::Sender<Task>, GuardError> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let (tx, mut rx) = mpsc::channel::<Task>(1);
    let name = provider.name().to_string();
    let worker_name = name.clone();

    std::thread::Builder::new()
        .name(format!("facegate-remote-{name}"))
        .spawn(move || {
            tracing::info!(provider = %worker_name, "remote worker started");
            runtime.block_on(async move {
                while let Some(task) = rx.recv().await {
                    task(provider.clone()).await;
                }
            });
            tracing::info!(provider = %worker_name, "remote worker exiting");
        })?;

    Ok(tx)
}
