//! Config layer: schema-driven model, validation rules, submission config.

pub mod base;
pub mod model;
pub mod rules;
pub mod train;

pub use base::render_base_config;
pub use model::{
    AUX_KEY, ConfigError, ConfigType, ConfigValue, FieldDescriptor, Override, build,
    parse_override, parse_overrides,
};
pub use rules::{Rule, ValidationError, ValidationRules};
pub use train::{SlurmConfig, TrainConfig, load_baseline, load_train_config, parse_train_config};
