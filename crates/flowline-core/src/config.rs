//! Serializable model description: the edges of a line and their physical
//! parameters.
//!
//! Constructors on [`crate::engine::Environment`] remain the primary API;
//! these types let a model be written down in a data file and checked
//! before it is built.

use crate::edge::EdgeKind;
use crate::store::StoreMode;
use crate::time::{SimDuration, SimTime};
use crate::transport::BeltConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferConfig {
    pub capacity: usize,
    #[serde(default)]
    pub mode: StoreMode,
    /// Time an item spends in the buffer before it can be taken.
    #[serde(default)]
    pub delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConveyorConfig {
    pub capacity: usize,
    #[serde(default = "default_unit")]
    pub speed: f64,
    #[serde(default = "default_unit")]
    pub item_length: f64,
    #[serde(default)]
    pub accumulating: bool,
}

fn default_unit() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeConfig {
    Buffer(BufferConfig),
    Conveyor(ConveyorConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEdge {
    pub name: String,
    pub edge: EdgeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub edges: Vec<NamedEdge>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate edge name {0:?}")]
    DuplicateName(String),
    #[error("edge {name:?}: capacity must be at least 1")]
    ZeroCapacity { name: String },
    #[error("edge {name:?}: {field} must be a positive finite number, got {value}")]
    NotPositive {
        name: String,
        field: &'static str,
        value: f64,
    },
    #[error("edge {name:?}: {field} must be a non-negative finite number, got {value}")]
    Negative {
        name: String,
        field: &'static str,
        value: f64,
    },
}

impl EdgeConfig {
    pub fn kind(&self) -> EdgeKind {
        match self {
            EdgeConfig::Buffer(_) => EdgeKind::Buffer,
            EdgeConfig::Conveyor(_) => EdgeKind::Conveyor,
        }
    }

    pub fn capacity(&self) -> usize {
        match self {
            EdgeConfig::Buffer(b) => b.capacity,
            EdgeConfig::Conveyor(c) => c.capacity,
        }
    }
}

impl BufferConfig {
    /// The availability delay in fixed point. `name` is only used for error
    /// reporting.
    pub fn delay_time(&self, name: &str) -> Result<SimDuration, ConfigError> {
        SimDuration::checked_from_num(self.delay)
            .filter(|d| *d >= SimDuration::ZERO)
            .ok_or_else(|| ConfigError::Negative {
                name: name.to_string(),
                field: "delay",
                value: self.delay,
            })
    }
}

impl ConveyorConfig {
    /// Convert to fixed-point belt parameters. `name` is only used for error
    /// reporting.
    pub fn to_belt_config(&self, name: &str) -> Result<BeltConfig, ConfigError> {
        let positive = |field: &'static str, value: f64| {
            SimTime::checked_from_num(value)
                .filter(|v| *v > SimTime::ZERO)
                .ok_or_else(|| ConfigError::NotPositive {
                    name: name.to_string(),
                    field,
                    value,
                })
        };
        Ok(BeltConfig::new(
            self.capacity,
            positive("speed", self.speed)?,
            positive("item_length", self.item_length)?,
            self.accumulating,
        ))
    }
}

impl ModelConfig {
    /// Check names are unique, capacities non-zero, buffer delays
    /// non-negative, and belt speeds and lengths representable positive
    /// numbers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for named in &self.edges {
            if !seen.insert(named.name.as_str()) {
                return Err(ConfigError::DuplicateName(named.name.clone()));
            }
            if named.edge.capacity() == 0 {
                return Err(ConfigError::ZeroCapacity {
                    name: named.name.clone(),
                });
            }
            match &named.edge {
                EdgeConfig::Buffer(buffer) => {
                    buffer.delay_time(&named.name)?;
                }
                EdgeConfig::Conveyor(conveyor) => {
                    conveyor.to_belt_config(&named.name)?;
                }
            }
        }
        Ok(())
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeConfig> {
        self.edges.iter().find(|e| e.name == name).map(|e| &e.edge)
    }
}
