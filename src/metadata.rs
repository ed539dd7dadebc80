//! VDS metadata: the typed key/value container attached to a volume, and the
//! document the local store persists next to the bricks

use crate::compression::CompressionMethod;
use crate::error::{Result, VdsError};
use crate::layout::VolumeDataLayout;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// VDS file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdsVersion {
    pub major: u16,
    pub minor: u16,
}

impl VdsVersion {
    pub const CURRENT: Self = Self { major: 3, minor: 0 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for VdsVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// Type tag of a metadata value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataType {
    Int,
    IntVector2,
    Float,
    Double,
    DoubleVector2,
    String,
    BLOB,
}

impl MetadataType {
    const ALL: [MetadataType; 7] = [
        MetadataType::Int,
        MetadataType::IntVector2,
        MetadataType::Float,
        MetadataType::Double,
        MetadataType::DoubleVector2,
        MetadataType::String,
        MetadataType::BLOB,
    ];

    fn name(&self) -> &'static str {
        match self {
            MetadataType::Int => "Int",
            MetadataType::IntVector2 => "IntVector2",
            MetadataType::Float => "Float",
            MetadataType::Double => "Double",
            MetadataType::DoubleVector2 => "DoubleVector2",
            MetadataType::String => "String",
            MetadataType::BLOB => "BLOB",
        }
    }
}

impl fmt::Display for MetadataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MetadataType.{}", self.name())
    }
}

impl FromStr for MetadataType {
    type Err = VdsError;

    /// Accepts both `"Double"` and `"MetadataType.Double"`
    fn from_str(s: &str) -> Result<Self> {
        let name = s.strip_prefix("MetadataType.").unwrap_or(s);
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == name)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|t| t.to_string()).collect();
                VdsError::Metadata(format!(
                    "The type {} was not recognized among: {}",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// A typed metadata value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum MetadataValue {
    Int(i32),
    IntVector2([i32; 2]),
    Float(f32),
    Double(f64),
    DoubleVector2([f64; 2]),
    String(String),
    BLOB(Vec<u8>),
}

impl MetadataValue {
    pub fn metadata_type(&self) -> MetadataType {
        match self {
            MetadataValue::Int(_) => MetadataType::Int,
            MetadataValue::IntVector2(_) => MetadataType::IntVector2,
            MetadataValue::Float(_) => MetadataType::Float,
            MetadataValue::Double(_) => MetadataType::Double,
            MetadataValue::DoubleVector2(_) => MetadataType::DoubleVector2,
            MetadataValue::String(_) => MetadataType::String,
            MetadataValue::BLOB(_) => MetadataType::BLOB,
        }
    }

    /// Decode a JSON value of the given type
    pub fn from_json(metadata_type: MetadataType, value: serde_json::Value) -> Result<Self> {
        let parsed = match metadata_type {
            MetadataType::Int => serde_json::from_value(value).map(MetadataValue::Int),
            MetadataType::IntVector2 => serde_json::from_value(value).map(MetadataValue::IntVector2),
            MetadataType::Float => serde_json::from_value(value).map(MetadataValue::Float),
            MetadataType::Double => serde_json::from_value(value).map(MetadataValue::Double),
            MetadataType::DoubleVector2 => {
                serde_json::from_value(value).map(MetadataValue::DoubleVector2)
            }
            MetadataType::String => serde_json::from_value(value).map(MetadataValue::String),
            MetadataType::BLOB => serde_json::from_value(value).map(MetadataValue::BLOB),
        };
        parsed.map_err(|e| VdsError::Metadata(format!("{} value: {}", metadata_type, e)))
    }

    /// Encode the payload as a plain JSON value (no type tag)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Int(v) => serde_json::json!(v),
            MetadataValue::IntVector2(v) => serde_json::json!(v),
            MetadataValue::Float(v) => serde_json::json!(v),
            MetadataValue::Double(v) => serde_json::json!(v),
            MetadataValue::DoubleVector2(v) => serde_json::json!(v),
            MetadataValue::String(v) => serde_json::json!(v),
            MetadataValue::BLOB(v) => serde_json::json!(v),
        }
    }
}

/// Flat, JSON friendly form of one metadata item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub category: String,
    pub name: String,
    pub value: serde_json::Value,
    #[serde(rename = "type")]
    pub metadata_type: String,
}

/// Metadata items keyed by (category, name)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataContainer {
    items: BTreeMap<String, BTreeMap<String, MetadataValue>>,
}

impl MetadataContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an item
    pub fn set(
        &mut self,
        category: impl Into<String>,
        name: impl Into<String>,
        value: MetadataValue,
    ) {
        self.items
            .entry(category.into())
            .or_default()
            .insert(name.into(), value);
    }

    pub fn get(&self, category: &str, name: &str) -> Option<&MetadataValue> {
        self.items.get(category)?.get(name)
    }

    pub fn get_string(&self, category: &str, name: &str) -> Option<&str> {
        match self.get(category, name)? {
            MetadataValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_double(&self, category: &str, name: &str) -> Option<f64> {
        match self.get(category, name)? {
            MetadataValue::Double(v) => Some(*v),
            MetadataValue::Float(v) => Some(*v as f64),
            MetadataValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Iterate over `(category, name, value)` triples, ordered by category then name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &MetadataValue)> {
        self.items.iter().flat_map(|(category, names)| {
            names
                .iter()
                .map(move |(name, value)| (category.as_str(), name.as_str(), value))
        })
    }

    pub fn len(&self) -> usize {
        self.items.values().map(|names| names.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize to flat JSON entries
    pub fn to_entries(&self) -> Vec<MetadataEntry> {
        self.iter()
            .map(|(category, name, value)| MetadataEntry {
                category: category.to_string(),
                name: name.to_string(),
                value: value.to_json(),
                metadata_type: value.metadata_type().name().to_string(),
            })
            .collect()
    }

    /// Build a container from flat JSON entries
    pub fn from_entries(entries: &[MetadataEntry]) -> Result<Self> {
        let mut container = Self::new();
        for entry in entries {
            let metadata_type: MetadataType = entry.metadata_type.parse()?;
            let value = MetadataValue::from_json(metadata_type, entry.value.clone())?;
            container.set(entry.category.clone(), entry.name.clone(), value);
        }
        Ok(container)
    }
}

/// Document persisted with every volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdsMetadata {
    /// Format version
    pub version: VdsVersion,

    /// Unique id of the volume
    pub volume_id: Uuid,

    /// Volume data layout
    pub layout: VolumeDataLayout,

    /// Compression method used for bricks
    pub compression: CompressionMethod,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last commit timestamp
    pub modified_at: DateTime<Utc>,

    /// User metadata
    pub metadata: MetadataContainer,
}

impl VdsMetadata {
    /// Create new metadata
    pub fn new(layout: VolumeDataLayout, metadata: MetadataContainer) -> Self {
        let now = Utc::now();
        Self {
            version: VdsVersion::default(),
            volume_id: Uuid::new_v4(),
            layout,
            compression: CompressionMethod::default(),
            created_at: now,
            modified_at: now,
            metadata,
        }
    }

    /// Set compression method
    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Fail if the document was written by an incompatible format version
    pub fn check_version(&self) -> Result<()> {
        if VdsVersion::CURRENT.is_compatible(&self.version) {
            Ok(())
        } else {
            Err(VdsError::UnsupportedVersion(self.version.major as u32))
        }
    }
}

/// Header stored in front of every brick payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrickMetadata {
    /// Brick index in the channel
    pub index: usize,

    /// Compression method of the payload
    pub compression: CompressionMethod,

    /// Uncompressed size in bytes
    pub uncompressed_size: usize,

    /// CRC32 of the uncompressed data
    pub checksum: u32,
}
