use anyhow::{Context, Result};
use facegate_core::detector::FailOpenDetector;
use facegate_core::improvement::SelfImprovementTracker;
use facegate_core::matcher::CosineMatcher;
use facegate_core::pipeline::LocalPipeline;
use facegate_core::recognizer::{ArcFaceExtractor, FeatureExtractor, GridStatsExtractor};
use facegate_core::threshold::AdaptiveThresholdPolicy;
use facegate_core::IdentityStore;
use facegate_remote::{AzureFaceClient, ExternalServiceGuard, MemoryRecognizer, RemoteRecognizer};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod consensus;
mod dbus_interface;
mod engine;
mod object_store;
mod sqlite_store;
mod sync;
mod verification_log;

use config::{BusKind, Config, ExtractorKind, ProviderKind, StoreKind};
use engine::{Engine, EngineParts};
use object_store::FsObjectStore;
use sqlite_store::SqliteIdentityStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = Config::from_env()?;
    let engine = build_engine(&config).await?;

    if config.startup_check {
        if let Err(e) = engine.startup_integrity_check().await {
            tracing::warn!(error = %e, "startup integrity check failed");
        }
    }
    if config.sync_interval_secs > 0 && config.provider != ProviderKind::None {
        spawn_scheduled_audit(engine.clone(), Duration::from_secs(config.sync_interval_secs));
    }

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _connection = builder
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, dbus_interface::FacegateService::new(engine))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = dbus_interface::BUS_NAME, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}

async fn build_engine(config: &Config) -> Result<Arc<Engine>> {
    let database = Arc::new(match config.store {
        StoreKind::Sqlite => SqliteIdentityStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open {}", config.db_path.display()))?,
        StoreKind::Memory => SqliteIdentityStore::open_in_memory().await?,
    });
    let store: Arc<dyn IdentityStore> = database.clone();

    let detector = FailOpenDetector::load_scrfd(&config.scrfd_model_path(), config.detector.clone());
    let detector_available = detector.is_available();

    let extractor: Arc<dyn FeatureExtractor> = match config.extractor {
        ExtractorKind::Grid => Arc::new(GridStatsExtractor::new()),
        ExtractorKind::Arcface => match ArcFaceExtractor::load(&config.arcface_model_path()) {
            Ok(extractor) => Arc::new(extractor),
            Err(e) => {
                tracing::warn!(error = %e, "ArcFace model unavailable, using grid extractor");
                Arc::new(GridStatsExtractor::new())
            }
        },
    };
    tracing::info!(
        extractor = extractor.model_version(),
        detector_available,
        "local models ready"
    );

    let remote: Option<Arc<dyn RemoteRecognizer>> = match config.provider {
        ProviderKind::None => None,
        ProviderKind::Memory => Some(Arc::new(MemoryRecognizer::new(1000))),
        ProviderKind::Azure => Some(Arc::new(
            AzureFaceClient::new(config.azure.clone()).context("failed to build Azure client")?,
        )),
    };
    let guard = Arc::new(ExternalServiceGuard::new(remote.clone(), config.guard.clone())?);

    let pipeline = Arc::new(LocalPipeline::new(
        Arc::new(detector),
        extractor,
        Arc::new(CosineMatcher),
        Arc::new(AdaptiveThresholdPolicy::new(config.thresholds.clone())),
        config.pipeline.clone(),
    ));

    Ok(Engine::new(EngineParts {
        config: config.engine.clone(),
        consensus: config.consensus.clone(),
        pipeline,
        detector_available,
        store: store.clone(),
        logs: database,
        objects: Arc::new(FsObjectStore::new(&config.image_dir)),
        remote,
        guard,
        improvement: Arc::new(SelfImprovementTracker::new(config.improvement.clone(), store)),
    }))
}

fn spawn_scheduled_audit(engine: Arc<Engine>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.audit_sync().await {
                Ok(report) if report.is_consistent() => tracing::info!(%report, "scheduled sync audit"),
                Ok(report) => tracing::warn!(%report, repairable = report.repairable(), "sync drift detected"),
                Err(e) => tracing::warn!(error = %e, "scheduled sync audit failed"),
            }
        }
    });
}
