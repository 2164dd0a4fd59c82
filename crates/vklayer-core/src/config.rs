use std::path::{Path, PathBuf};

use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Top-level layer configuration, loaded from vklayer.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub checks: CheckConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

/// Optional trackers. Object, memory, command buffer, descriptor and
/// pipeline state checks always run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Detect concurrent recording into one command buffer
    #[serde(default = "default_true")]
    pub threading: bool,
    /// Link vertex/fragment interfaces at pipeline creation
    #[serde(default = "default_true")]
    pub shader_interface: bool,
    /// Image extent, layer and resource size limits
    #[serde(default = "default_true")]
    pub device_limits: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Diagnostics retained by the sink for draining
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

/// Properties of the device the trackers validate against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Memory types, indexed by `memoryTypeIndex`
    #[serde(default = "default_memory_types")]
    pub memory_types: Vec<MemoryTypeConfig>,
    #[serde(default)]
    pub limits: DeviceLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTypeConfig {
    #[serde(default)]
    pub device_local: bool,
    #[serde(default)]
    pub host_visible: bool,
    #[serde(default)]
    pub host_coherent: bool,
    #[serde(default)]
    pub host_cached: bool,
}

impl MemoryTypeConfig {
    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        let mut flags = vk::MemoryPropertyFlags::empty();
        if self.device_local {
            flags |= vk::MemoryPropertyFlags::DEVICE_LOCAL;
        }
        if self.host_visible {
            flags |= vk::MemoryPropertyFlags::HOST_VISIBLE;
        }
        if self.host_coherent {
            flags |= vk::MemoryPropertyFlags::HOST_COHERENT;
        }
        if self.host_cached {
            flags |= vk::MemoryPropertyFlags::HOST_CACHED;
        }
        flags
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLimits {
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension_1d: u32,
    #[serde(default = "default_max_image_dimension")]
    pub max_image_dimension_2d: u32,
    #[serde(default = "default_max_image_dimension_3d")]
    pub max_image_dimension_3d: u32,
    #[serde(default = "default_max_image_array_layers")]
    pub max_image_array_layers: u32,
    /// Largest image, in bytes, the device accepts
    #[serde(default = "default_max_resource_size")]
    pub max_resource_size: u64,
    #[serde(default = "default_max_viewports")]
    pub max_viewports: u32,
    #[serde(default = "default_max_bound_descriptor_sets")]
    pub max_bound_descriptor_sets: u32,
    #[serde(default = "default_max_vertex_input_bindings")]
    pub max_vertex_input_bindings: u32,
    #[serde(default = "default_max_update_buffer_size")]
    pub max_update_buffer_size: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            threading: true,
            shader_interface: true,
            device_limits: true,
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_types: default_memory_types(),
            limits: DeviceLimits::default(),
        }
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_image_dimension_1d: default_max_image_dimension(),
            max_image_dimension_2d: default_max_image_dimension(),
            max_image_dimension_3d: default_max_image_dimension_3d(),
            max_image_array_layers: default_max_image_array_layers(),
            max_resource_size: default_max_resource_size(),
            max_viewports: default_max_viewports(),
            max_bound_descriptor_sets: default_max_bound_descriptor_sets(),
            max_vertex_input_bindings: default_max_vertex_input_bindings(),
            max_update_buffer_size: default_max_update_buffer_size(),
        }
    }
}

impl LayerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CoreError> {
        let config: LayerConfig =
            toml::from_str(content).map_err(|e| CoreError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    /// A file that exists but fails to read or parse is logged and skipped.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("ignoring config {}: {} - using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.device.memory_types.is_empty() {
            return Err(CoreError::ConfigError(
                "device.memory_types must list at least one memory type".to_string(),
            ));
        }
        if self.device.memory_types.len() > vk::MAX_MEMORY_TYPES {
            return Err(CoreError::ConfigError(format!(
                "device.memory_types lists {} types, at most {} are supported",
                self.device.memory_types.len(),
                vk::MAX_MEMORY_TYPES
            )));
        }
        Ok(())
    }

    /// Property flags of a memory type, `None` when out of range.
    pub fn memory_properties(&self, memory_type_index: u32) -> Option<vk::MemoryPropertyFlags> {
        self.device
            .memory_types
            .get(memory_type_index as usize)
            .map(MemoryTypeConfig::property_flags)
    }

    /// Bit mask with one bit per configured memory type.
    pub fn memory_type_bits(&self) -> u32 {
        let count = self.device.memory_types.len() as u32;
        if count >= 32 {
            u32::MAX
        } else {
            (1u32 << count) - 1
        }
    }
}

/// Returns the config file path based on platform conventions.
/// Search order:
/// 1. `$VKLAYER_CONFIG`
/// 2. System-wide config: `%PROGRAMDATA%\vklayer\vklayer.toml` (Windows) or `/etc/vklayer/vklayer.toml`
/// 3. Local fallback: `./vklayer.toml`
pub fn default_config_path() -> PathBuf {
    let mut candidates = vklayer_common::platform::config_search_paths();
    let fallback = candidates
        .pop()
        .unwrap_or_else(|| PathBuf::from(vklayer_common::platform::CONFIG_FILE_NAME));
    candidates
        .into_iter()
        .find(|path| path.exists())
        .unwrap_or(fallback)
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> usize {
    256
}

fn default_memory_types() -> Vec<MemoryTypeConfig> {
    vec![
        MemoryTypeConfig {
            device_local: true,
            ..Default::default()
        },
        MemoryTypeConfig {
            device_local: true,
            host_visible: true,
            host_coherent: true,
            host_cached: false,
        },
    ]
}

fn default_max_image_dimension() -> u32 {
    16384
}

fn default_max_image_dimension_3d() -> u32 {
    2048
}

fn default_max_image_array_layers() -> u32 {
    2048
}

fn default_max_resource_size() -> u64 {
    1 << 31
}

fn default_max_viewports() -> u32 {
    16
}

fn default_max_bound_descriptor_sets() -> u32 {
    8
}

fn default_max_vertex_input_bindings() -> u32 {
    32
}

fn default_max_update_buffer_size() -> u64 {
    65536
}
