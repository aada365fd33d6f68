//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An
//! example configuration file can be found in the `configs/` directory located in the repository
//! root.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

/// The dataset for which the number of tasks is fixed instead of read from the data source.
pub const IMAGENET1K: &str = "IMAGENET1k";

/// The number of tasks of the [`IMAGENET1K`] dataset.
pub const IMAGENET1K_TASKS: usize = 500;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_settings"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub federated: FederatedSettings,
    #[validate]
    pub client: ClientSettings,
    #[validate]
    pub model: ModelSettings,
    #[validate]
    pub reconstruction: ReconstructionSettings,
    #[validate]
    pub monitor: MonitorSettings,
    #[validate]
    pub data: DataSettings,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("fcl")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Checks the invariants spanning several sections.
    fn validate_settings(&self) -> Result<(), ValidationError> {
        if self.data.num_tasks * self.data.classes_per_task > self.federated.num_classes {
            return Err(ValidationError::new("more task classes than model classes"));
        }
        if self.data.num_clients != self.federated.num_clients {
            return Err(ValidationError::new("data and federation disagree on client count"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_settings(s: &Settings) -> Result<(), ValidationError> {
    s.validate_settings()
}

#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_federated"))]
/// Settings of the task and round orchestration.
pub struct FederatedSettings {
    /// The name of the dataset. [`IMAGENET1K`] fixes the number of tasks to
    /// [`IMAGENET1K_TASKS`].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federated]
    /// dataset = "synthetic"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FCL_FEDERATED__DATASET=synthetic
    /// ```
    pub dataset: String,
    /// The total number of clients.
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// The number of classes of the global model.
    #[validate(range(min = 2))]
    pub num_classes: usize,
    /// The fraction of clients joining a round. The value must be between `0` and `1` (i.e.
    /// `0 < join_ratio <= 1`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [federated]
    /// join_ratio = 0.5
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FCL_FEDERATED__JOIN_RATIO=0.5
    /// ```
    pub join_ratio: f64,
    /// Whether the number of joining clients is drawn at random for every round, between the
    /// `join_ratio` share and all clients.
    #[serde(default)]
    pub random_join_ratio: bool,
    /// The number of communication rounds per task.
    #[validate(range(min = 1))]
    pub global_rounds: usize,
    /// The global model is evaluated every `eval_gap` rounds.
    #[validate(range(min = 1))]
    pub eval_gap: usize,
    /// Whether the round loop of a task stops once the test accuracy converged.
    #[serde(default)]
    pub auto_break: bool,
    /// The number of rounds without a new best accuracy after which the accuracy is considered
    /// converged.
    pub top_cnt: Option<usize>,
    /// The standard deviation below which the last `top_cnt` accuracies are considered converged.
    pub div_value: Option<f64>,
    /// The seed of the client selection.
    #[serde(default)]
    pub seed: u64,
}

impl FederatedSettings {
    fn validate_federated(&self) -> Result<(), ValidationError> {
        if !(0. < self.join_ratio && self.join_ratio <= 1.) {
            return Err(ValidationError::new("join ratio out of range"));
        }
        if self.auto_break && self.top_cnt.is_none() && self.div_value.is_none() {
            return Err(ValidationError::new(
                "auto_break requires top_cnt or div_value",
            ));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_federated(s: &FederatedSettings) -> Result<(), ValidationError> {
    s.validate_federated()
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Settings of the local training of the clients.
pub struct ClientSettings {
    /// The number of local epochs per round.
    #[validate(range(min = 1))]
    pub local_epochs: usize,
    /// The mini-batch size of the local training.
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// The local learning rate.
    pub learning_rate: f32,
    /// Whether the local learning rate decays exponentially after every local training.
    #[serde(default)]
    pub learning_rate_decay: bool,
    /// The decay factor of the local learning rate.
    #[serde(default = "default_decay_gamma")]
    pub learning_rate_decay_gamma: f32,
    /// The total number of exemplars a client keeps of the classes of finished tasks.
    pub memory_num: usize,
    /// The weight of the distillation toward the reference models.
    #[serde(default)]
    pub kd_weight: f32,
    /// The softmax temperature of the distillation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_decay_gamma() -> f32 {
    0.99
}

fn default_temperature() -> f32 {
    2.
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
/// The shape of an input image.
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    /// Gets the number of values of a flattened image.
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Checks whether the shape holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ImageShape {
    fn default() -> Self {
        Self {
            channels: 3,
            height: 32,
            width: 32,
        }
    }
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Settings of the global model.
pub struct ModelSettings {
    /// The shape of the input images.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [model.image]
    /// channels = 3
    /// height = 32
    /// width = 32
    /// ```
    #[serde(default)]
    pub image: ImageShape,
    /// The width of the hidden layer of the global model.
    #[validate(range(min = 1))]
    pub hidden: usize,
    /// The seed of the weight initialization of the global model.
    #[serde(default)]
    pub seed: u64,
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_reconstruction"))]
/// Settings of the gradient-inversion reconstruction.
pub struct ReconstructionSettings {
    /// The number of optimizer steps per reconstructed sample.
    #[serde(default = "default_iterations")]
    #[validate(range(min = 1))]
    pub iterations: usize,
    /// The number of snapshots taken from the final iterations of every reconstructed sample.
    #[serde(default = "default_num_image")]
    pub num_image: usize,
    /// The L-BFGS learning rate.
    #[serde(default = "default_reconstruction_lr")]
    pub learning_rate: f32,
    /// The maximal number of L-BFGS iterations per optimizer step.
    #[serde(default = "default_max_iter")]
    #[validate(range(min = 1))]
    pub max_iter: usize,
    /// The number of curvature pairs L-BFGS keeps.
    #[serde(default = "default_history_size")]
    #[validate(range(min = 1))]
    pub history_size: usize,
    /// L-BFGS stops when the largest gradient entry falls below this value.
    #[serde(default = "default_tolerance_grad")]
    pub tolerance_grad: f32,
    /// L-BFGS stops when the loss or the step changes by less than this value.
    #[serde(default = "default_tolerance_change")]
    pub tolerance_change: f32,
    /// The width of the hidden layer of the frozen encoder.
    #[validate(range(min = 1))]
    pub encoder_hidden: usize,
    /// The seed of the weight initialization of the frozen encoder. Clients and coordinator must
    /// agree on it.
    #[serde(default)]
    pub encoder_seed: u64,
    /// The seed of the random candidate images.
    #[serde(default)]
    pub seed: u64,
    /// Whether the samples are reconstructed in parallel.
    #[serde(default)]
    pub parallel: bool,
}

impl ReconstructionSettings {
    fn validate_reconstruction(&self) -> Result<(), ValidationError> {
        if self.num_image == 0 || self.num_image > self.iterations {
            return Err(ValidationError::new("num_image must be in 1..=iterations"));
        }
        if self.learning_rate <= 0. {
            return Err(ValidationError::new("non-positive learning rate"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_reconstruction(s: &ReconstructionSettings) -> Result<(), ValidationError> {
    s.validate_reconstruction()
}

fn default_iterations() -> usize {
    250
}

fn default_num_image() -> usize {
    20
}

fn default_reconstruction_lr() -> f32 {
    0.1
}

fn default_max_iter() -> usize {
    20
}

fn default_history_size() -> usize {
    100
}

fn default_tolerance_grad() -> f32 {
    1e-7
}

fn default_tolerance_change() -> f32 {
    1e-9
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
/// Settings of the monitor loader.
pub struct MonitorSettings {
    /// The batch size of the monitor loader.
    #[serde(default = "default_monitor_batch")]
    #[validate(range(min = 1))]
    pub batch_size: usize,
}

fn default_monitor_batch() -> usize {
    64
}

#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_data"))]
/// Settings of the synthetic task-partitioned data source.
pub struct DataSettings {
    /// The number of clients the data is partitioned for.
    #[validate(range(min = 1))]
    pub num_clients: usize,
    /// The number of tasks.
    #[validate(range(min = 1))]
    pub num_tasks: usize,
    /// The number of classes introduced by every task.
    #[validate(range(min = 1))]
    pub classes_per_task: usize,
    /// The number of the task classes every client sees.
    #[validate(range(min = 1))]
    pub labels_per_client: usize,
    /// The number of train samples per class and client.
    #[validate(range(min = 1))]
    pub train_per_class: usize,
    /// The number of test samples per class and client.
    #[validate(range(min = 1))]
    pub test_per_class: usize,
    /// The standard deviation of the pixel noise around the class prototypes.
    pub noise: f32,
    /// The seed of the data generation.
    #[serde(default)]
    pub seed: u64,
}

impl DataSettings {
    fn validate_data(&self) -> Result<(), ValidationError> {
        if self.labels_per_client > self.classes_per_task {
            return Err(ValidationError::new(
                "labels_per_client exceeds classes_per_task",
            ));
        }
        if self.noise < 0. {
            return Err(ValidationError::new("negative noise"));
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_data(s: &DataSettings) -> Result<(), ValidationError> {
    s.validate_data()
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FCL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.16/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.16/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruction() -> ReconstructionSettings {
        ReconstructionSettings {
            iterations: 250,
            num_image: 20,
            learning_rate: 0.1,
            max_iter: 20,
            history_size: 100,
            tolerance_grad: 1e-7,
            tolerance_change: 1e-9,
            encoder_hidden: 32,
            encoder_seed: 0,
            seed: 0,
            parallel: false,
        }
    }

    #[test]
    fn test_settings_new() {
        assert!(Settings::new("configs/config.toml").is_ok());
        assert!(Settings::new("").is_err());
    }

    #[test]
    fn test_validate_reconstruction() {
        assert!(reconstruction().validate().is_ok());
        assert!(ReconstructionSettings {
            num_image: 251,
            ..reconstruction()
        }
        .validate()
        .is_err());
        assert!(ReconstructionSettings {
            num_image: 0,
            ..reconstruction()
        }
        .validate()
        .is_err());
        assert!(ReconstructionSettings {
            learning_rate: 0.,
            ..reconstruction()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_federated() {
        let federated = FederatedSettings {
            dataset: "synthetic".into(),
            num_clients: 3,
            num_classes: 10,
            join_ratio: 1.,
            random_join_ratio: false,
            global_rounds: 3,
            eval_gap: 1,
            auto_break: false,
            top_cnt: None,
            div_value: None,
            seed: 0,
        };
        assert!(federated.validate().is_ok());
        assert!(FederatedSettings {
            join_ratio: 0.,
            ..federated.clone()
        }
        .validate()
        .is_err());
        assert!(FederatedSettings {
            join_ratio: 1. + f64::EPSILON,
            ..federated.clone()
        }
        .validate()
        .is_err());
        assert!(FederatedSettings {
            auto_break: true,
            ..federated.clone()
        }
        .validate()
        .is_err());
        assert!(FederatedSettings {
            auto_break: true,
            top_cnt: Some(5),
            ..federated
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_validate_data() {
        let data = DataSettings {
            num_clients: 3,
            num_tasks: 2,
            classes_per_task: 2,
            labels_per_client: 2,
            train_per_class: 4,
            test_per_class: 2,
            noise: 0.1,
            seed: 0,
        };
        assert!(data.validate().is_ok());
        assert!(DataSettings {
            labels_per_client: 3,
            ..data
        }
        .validate()
        .is_err());
    }
}
