pub mod configuration;
pub mod ini;
pub mod loader;
pub mod param;
pub mod registry;
pub mod specification;
pub mod value;

pub use configuration::{Configuration, Published};
pub use param::{Modifiability, Param, ParamKind, PathOptions};
pub use specification::{ConfigValues, ModuleKind, Specification};
pub use value::{DurationUnit, DurationValue, HostPattern, Throttling, Value};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),

    #[error("Unknown parameter: '{0}'")]
    UnknownParameter(String),

    #[error("Mandatory parameter '{0}' is not provided")]
    MissingMandatory(String),

    #[error("Parameter '{name}' cannot be modified at runtime")]
    NotModifiableAtRuntime { name: String },

    #[error("{object}: {source}")]
    Object {
        object: String,
        #[source]
        source: Box<ConfigError>,
    },

    #[error("circular dependency: {0}")]
    CircularDependency(String),

    #[error("Duplicate section '{section}' in {first} and {second}")]
    DuplicateSection {
        section: String,
        first: String,
        second: String,
    },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConfigError::Invalid(msg.into())
    }

    /// Wrap an error with the name of the object it concerns.
    pub fn for_object(self, object: &str) -> Self {
        ConfigError::Object {
            object: object.to_string(),
            source: Box::new(self),
        }
    }
}
