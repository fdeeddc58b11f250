pub mod azure;
pub mod breaker;
pub mod guard;
pub mod limiter;
pub mod memory;
pub mod provider;

pub use azure::{AzureConfig, AzureFaceClient};
pub use guard::{ExternalServiceGuard, GuardConfig, GuardOutcome, GuardStatus, ProviderError, Unavailable};
pub use memory::MemoryRecognizer;
pub use provider::{
    verify_remotely, FacePage, RemoteDetection, RemoteError, RemoteFace, RemoteMatch, RemoteOutcome, RemoteRecognizer,
};
