use serde::{Deserialize, Serialize};

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_MAX_DECENT_ATTEMPTS: u32 = 8;

/// Controls when a float32 tensor may be handed to a float16 kernel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum), value(rename_all = "snake_case"))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PrecisionMode {
    ForceFp32,
    MustKeepOriginDtype,
    #[default]
    AllowFp32ToFp16,
    ForceFp16,
    AllowMixPrecision,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum), value(rename_all = "snake_case"))]
pub enum BuildMode {
    #[default]
    Normal,
    Tuning,
}

/// The sub-phase of a tuning build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum), value(rename_all = "snake_case"))]
pub enum BuildStep {
    BeforeUbMatch,
    AfterUbMatch,
}

/// Which on-chip memories buffer fusion may plan for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum), value(rename_all = "snake_case"))]
pub enum BufferOptimize {
    L1Optimize,
    #[default]
    L2Optimize,
    OffOptimize,
}

/// Options for one pipeline run. Built once at pipeline entry and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub precision_mode: PrecisionMode,
    pub build_mode: BuildMode,
    pub build_step: Option<BuildStep>,
    pub enable_l1_fusion: bool,
    pub enable_l2_fusion: bool,
    pub buffer_optimize: BufferOptimize,
    pub max_decent_attempts: u32,
    /// If set, a table dump of the graph is written here after every stage.
    pub dump_dir: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },
    #[error("Option max_decent_attempts must be at least 1")]
    ZeroDecentAttempts,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            precision_mode: PrecisionMode::default(),
            build_mode: BuildMode::default(),
            build_step: None,
            enable_l1_fusion: false,
            enable_l2_fusion: false,
            buffer_optimize: BufferOptimize::default(),
            max_decent_attempts: DEFAULT_MAX_DECENT_ATTEMPTS,
            dump_dir: None,
        }
    }
}

impl PipelineConfig {
    /// Parses a string option map. Unrecognized keys are logged and ignored.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = PipelineConfig::default();
        let mut keys: Vec<&String> = options.keys().collect();
        keys.sort();
        for key in keys {
            let value = options[key].trim();
            match key.as_str() {
                "precision_mode" => config.precision_mode = parse(key, value)?,
                "build_mode" => config.build_mode = parse(key, value)?,
                "build_step" => {
                    config.build_step = if value.is_empty() {
                        None
                    } else {
                        Some(parse(key, value)?)
                    }
                }
                "enable_l1_fusion" => config.enable_l1_fusion = parse_bool(key, value)?,
                "enable_l2_fusion" => config.enable_l2_fusion = parse_bool(key, value)?,
                "buffer_optimize" => config.buffer_optimize = parse(key, value)?,
                "max_decent_attempts" => {
                    config.max_decent_attempts = parse(key, value)?;
                    if config.max_decent_attempts == 0 {
                        return Err(ConfigError::ZeroDecentAttempts);
                    }
                }
                "dump_dir" => config.dump_dir = Some(PathBuf::from(value)),
                _ => log::warn!("Ignoring unknown option {key}={value}"),
            }
        }
        Ok(config)
    }

    pub fn l1_fusion_enabled(&self) -> bool {
        self.enable_l1_fusion || self.buffer_optimize == BufferOptimize::L1Optimize
    }

    pub fn l2_fusion_enabled(&self) -> bool {
        self.enable_l2_fusion || self.buffer_optimize == BufferOptimize::L2Optimize
    }

    pub fn is_tuning(&self) -> bool {
        self.build_mode == BuildMode::Tuning
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}
