//! Model loading: reads line descriptions from data files and builds an
//! [`Environment`] from them.
//!
//! Files are RON, TOML or JSON; the format is chosen by extension.

use flowline_core::config::{ConfigError, EdgeConfig, ModelConfig};
use flowline_core::engine::{Environment, SimError};
use flowline_core::id::EdgeId;
use log::debug;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur while loading or building a model.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// The model parsed but describes an impossible line.
    #[error("invalid model: {0}")]
    Invalid(#[from] ConfigError),

    /// The environment rejected an edge.
    #[error("failed to build edge '{name}': {source}")]
    Build {
        name: String,
        #[source]
        source: SimError,
    },

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// Deserialization
// ===========================================================================

/// Deserialize `content` in the given format. `origin` names the source in
/// parse errors.
pub fn deserialize_str<T: DeserializeOwned>(
    content: &str,
    format: Format,
    origin: &Path,
) -> Result<T, DataLoadError> {
    let parse_error = |detail: String| DataLoadError::Parse {
        file: origin.to_path_buf(),
        detail,
    };
    match format {
        Format::Ron => ron::from_str(content).map_err(|e| parse_error(e.to_string())),
        Format::Json => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        Format::Toml => toml::from_str(content).map_err(|e| parse_error(e.to_string())),
    }
}

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    deserialize_str(&content, format, path)
}

// ===========================================================================
// Models
// ===========================================================================

/// Parse and validate a model held in memory.
pub fn parse_model(content: &str, format: Format) -> Result<ModelConfig, DataLoadError> {
    let model: ModelConfig = deserialize_str(content, format, Path::new("<inline>"))?;
    model.validate()?;
    Ok(model)
}

/// Load and validate a model file.
pub fn load_model(path: &Path) -> Result<ModelConfig, DataLoadError> {
    let model: ModelConfig = deserialize_file(path)?;
    model.validate()?;
    debug!("loaded {} edges from {}", model.edges.len(), path.display());
    Ok(model)
}

/// Create every edge of `model` in a fresh environment, in declaration
/// order. Returns the environment and the id assigned to each edge name.
pub fn build_environment<T>(
    model: &ModelConfig,
) -> Result<(Environment<T>, HashMap<String, EdgeId>), DataLoadError> {
    model.validate()?;
    let mut env = Environment::new();
    let mut ids = HashMap::with_capacity(model.edges.len());
    for named in &model.edges {
        let id = match &named.edge {
            EdgeConfig::Buffer(buffer) => {
                let delay = buffer.delay_time(&named.name)?;
                env.add_delayed_buffer(buffer.capacity, buffer.mode, delay)
            }
            EdgeConfig::Conveyor(conveyor) => {
                let config = conveyor.to_belt_config(&named.name)?;
                env.add_conveyor(config)
            }
        }
        .map_err(|source| DataLoadError::Build {
            name: named.name.clone(),
            source,
        })?;
        debug!("edge '{}' -> {:?} ({})", named.name, id, named.edge.kind());
        ids.insert(named.name.clone(), id);
    }
    Ok((env, ids))
}
