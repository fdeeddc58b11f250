use crate::consensus::ConsensusConfig;
use crate::engine::EngineConfig;
use facegate_core::detector::DetectorConfig;
use facegate_core::improvement::ImprovementConfig;
use facegate_core::pipeline::PipelineConfig;
use facegate_core::threshold::ThresholdConfig;
use facegate_remote::{AzureConfig, GuardConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorKind {
    /// Model-free grid statistics.
    Grid,
    Arcface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    None,
    Azure,
    Memory,
}

macro_rules! parse_kind {
    ($ty:ident { $($name:literal => $variant:ident),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = ();
            fn from_str(s: &str) -> Result<Self, ()> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok($ty::$variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

parse_kind!(BusKind { "session" => Session, "system" => System });
parse_kind!(ExtractorKind { "grid" => Grid, "arcface" => Arcface });
parse_kind!(StoreKind { "sqlite" => Sqlite, "memory" => Memory });
parse_kind!(ProviderKind { "none" => None, "azure" => Azure, "memory" => Memory });

/// Daemon configuration: an optional TOML file named by `FACEGATE_CONFIG`,
/// then `FACEGATE_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bus: BusKind,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub extractor: ExtractorKind,
    pub store: StoreKind,
    pub db_path: PathBuf,
    /// Reference images are written here.
    pub image_dir: PathBuf,
    pub provider: ProviderKind,
    /// Seconds between scheduled audits; 0 disables the schedule.
    pub sync_interval_secs: u64,
    /// Run the integrity check and an audit at startup.
    pub startup_check: bool,
    pub engine: EngineConfig,
    pub detector: DetectorConfig,
    pub thresholds: ThresholdConfig,
    pub improvement: ImprovementConfig,
    pub pipeline: PipelineConfig,
    pub consensus: ConsensusConfig,
    pub guard: GuardConfig,
    pub azure: AzureConfig,
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate")
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            bus: BusKind::Session,
            model_dir: data_dir.join("models"),
            extractor: ExtractorKind::Grid,
            store: StoreKind::Sqlite,
            db_path: data_dir.join("faces.db"),
            image_dir: data_dir.join("images"),
            provider: ProviderKind::None,
            sync_interval_secs: 0,
            startup_check: true,
            engine: EngineConfig::default(),
            detector: DetectorConfig::default(),
            thresholds: ThresholdConfig::default(),
            improvement: ImprovementConfig::default(),
            pipeline: PipelineConfig::default(),
            consensus: ConsensusConfig::default(),
            guard: GuardConfig::default(),
            azure: AzureConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `FACEGATE_CONFIG` and `FACEGATE_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("FACEGATE_CONFIG") {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: PathBuf) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Apply `FACEGATE_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let env = Env(&lookup);

        env.set("FACEGATE_BUS", &mut self.bus)?;
        env.set_path("FACEGATE_MODEL_DIR", &mut self.model_dir);
        env.set("FACEGATE_EXTRACTOR", &mut self.extractor)?;
        env.set("FACEGATE_STORE", &mut self.store)?;
        env.set_path("FACEGATE_DB_PATH", &mut self.db_path);
        env.set_path("FACEGATE_IMAGE_DIR", &mut self.image_dir);
        env.set("FACEGATE_PROVIDER", &mut self.provider)?;
        env.set("FACEGATE_SYNC_INTERVAL_SECS", &mut self.sync_interval_secs)?;
        env.set_flag("FACEGATE_STARTUP_CHECK", &mut self.startup_check);

        env.set("FACEGATE_VERIFY_TIMEOUT_SECS", &mut self.engine.verify_timeout_secs)?;
        env.set("FACEGATE_STREAM_BUFFER_SIZE", &mut self.engine.stream_buffer_size)?;
        env.set("FACEGATE_STREAM_IDLE_MS", &mut self.engine.stream_idle_ms)?;
        env.set("FACEGATE_REMOTE_THRESHOLD", &mut self.engine.remote_similarity_threshold)?;
        env.set("FACEGATE_DUPLICATE_THRESHOLD", &mut self.engine.duplicate_threshold)?;

        env.set("FACEGATE_DETECTION_THRESHOLD", &mut self.detector.confidence_threshold)?;
        env.set("FACEGATE_MIN_FACE_SIZE", &mut self.detector.min_face_size)?;
        env.set("FACEGATE_SIMILARITY_THRESHOLD", &mut self.thresholds.normal)?;
        env.set("FACEGATE_LIVENESS_THRESHOLD", &mut self.pipeline.liveness_threshold)?;

        env.set("FACEGATE_FRAME_TIMEOUT_MS", &mut self.consensus.frame_timeout_ms)?;
        env.set("FACEGATE_MAJORITY_THRESHOLD", &mut self.consensus.majority_threshold)?;
        env.set_flag("FACEGATE_REQUIRE_MOTION", &mut self.consensus.require_motion);

        env.set_flag("FACEGATE_REMOTE_ENABLED", &mut self.guard.enabled);
        env.set("FACEGATE_REMOTE_RATE_LIMIT", &mut self.guard.rate_limit)?;
        env.set("FACEGATE_REMOTE_TIMEOUT_MS", &mut self.guard.call_timeout_ms)?;

        env.set_string("FACEGATE_AZURE_ENDPOINT", &mut self.azure.endpoint);
        env.set_string("FACEGATE_AZURE_KEY", &mut self.azure.api_key);
        env.set_string("FACEGATE_AZURE_FACE_LIST", &mut self.azure.face_list_id);
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn set<T: FromStr>(&self, key: &'static str, slot: &mut T) -> Result<(), ConfigError> {
        if let Some(value) = (self.0)(key) {
            *slot = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { key, value })?;
        }
        Ok(())
    }

    fn set_flag(&self, key: &str, slot: &mut bool) {
        if let Some(value) = (self.0)(key) {
            *slot = !matches!(value.trim(), "0" | "false" | "no" | "off");
        }
    }

    fn set_path(&self, key: &str, slot: &mut PathBuf) {
        if let Some(value) = (self.0)(key) {
            *slot = PathBuf::from(value);
        }
    }

    fn set_string(&self, key: &str, slot: &mut String) {
        if let Some(value) = (self.0)(key) {
            *slot = value;
        }
    }
}
