//! Session configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a controller session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Number of classes the head predicts
    pub num_classes: usize,

    /// Control name per class, in label order
    pub controls: Vec<String>,

    /// Frame capture settings
    pub capture: CaptureConfig,

    /// Head training settings
    pub training: TrainingConfig,

    /// Optional cap on bytes held by the example dataset
    pub memory_budget_bytes: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_classes: 4,
            controls: ["one", "two", "three", "four"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            capture: CaptureConfig::default(),
            training: TrainingConfig::default(),
            memory_budget_bytes: None,
        }
    }
}

impl SessionConfig {
    /// Parse a config from JSON; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that the settings are mutually consistent
    pub fn validate(&self) -> Result<()> {
        if self.num_classes == 0 {
            return Err(Error::InvalidConfig("num_classes must be positive".into()));
        }
        if self.controls.len() != self.num_classes {
            return Err(Error::InvalidConfig(format!(
                "{} controls configured for {} classes",
                self.controls.len(),
                self.num_classes
            )));
        }
        self.training.validate()
    }

    /// Name of the control for `label`
    pub fn control_name(&self, label: usize) -> Option<&str> {
        self.controls.get(label).map(String::as_str)
    }
}

/// Frame capture settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Delay between loop iterations; 0 yields without sleeping
    pub frame_interval_ms: u64,

    /// Width of the video element
    pub width: usize,

    /// Height of the video element
    pub height: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 0,
            width: 224,
            height: 224,
        }
    }
}

impl CaptureConfig {
    /// Delay between loop iterations
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

/// Head training settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Adam learning rate
    pub learning_rate: f32,

    /// Passes over the dataset
    pub epochs: usize,

    /// Batch size as a fraction of the dataset size
    pub batch_size_fraction: f64,

    /// Units in the hidden dense layer
    pub hidden_units: usize,

    /// Seed for weight initialisation and shuffling
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.00001,
            epochs: 20,
            batch_size_fraction: 0.05,
            hidden_units: 100,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Create a training config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the learning rate
    #[must_use]
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the number of epochs
    #[must_use]
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the batch size fraction
    #[must_use]
    pub fn batch_size_fraction(mut self, fraction: f64) -> Self {
        self.batch_size_fraction = fraction;
        self
    }

    /// Set the hidden layer width
    #[must_use]
    pub fn hidden_units(mut self, units: usize) -> Self {
        self.hidden_units = units;
        self
    }

    /// Set the random seed
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidConfig("learning_rate must be positive".into()));
        }
        if !(self.batch_size_fraction.is_finite()
            && self.batch_size_fraction > 0.0
            && self.batch_size_fraction <= 1.0)
        {
            return Err(Error::InvalidConfig(
                "batch_size_fraction must be in (0, 1]".into(),
            ));
        }
        if self.hidden_units == 0 {
            return Err(Error::InvalidConfig("hidden_units must be positive".into()));
        }
        Ok(())
    }
}
