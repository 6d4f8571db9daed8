use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Method name carried by replayable configuration entries.
pub const CREATE_METHOD: &str = "bdev_iscsi_create";

/// Tunables for the adapter. Every field has a default so partial files are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IscsiBdevConfig {
    /// Period of the connection poller driving pending device creations.
    pub connection_poll_interval_us: u64,
    /// Period of the owner thread's poller; zero runs it on every reactor tick.
    pub active_poll_interval_us: u64,
    /// Period of the fallback poller used while no channel is open.
    pub idle_poll_interval_us: u64,
    pub default_initiator_name: String,
    /// Used when the target advertises UNMAP but reports no usable limit.
    pub default_max_unmap_lba_count: u32,
    /// Block descriptors carried by a single UNMAP command.
    pub max_unmap_block_descriptors: u32,
    /// Capacity-changed retries allowed per I/O before the error reaches the caller.
    pub max_capacity_change_retries: u32,
}

impl Default for IscsiBdevConfig {
    fn default() -> Self {
        Self {
            connection_poll_interval_us: 500,
            active_poll_interval_us: 0,
            idle_poll_interval_us: 10_000,
            default_initiator_name: "iqn.2016-06.io.spdk:init".to_string(),
            default_max_unmap_lba_count: 32_768,
            max_unmap_block_descriptors: 1,
            max_capacity_change_retries: 8,
        }
    }
}

impl IscsiBdevConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let config: Self = serde_json::from_slice(&data).context("decode iscsi bdev config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.default_max_unmap_lba_count > 0,
            "default_max_unmap_lba_count must be non-zero"
        );
        ensure!(
            self.max_unmap_block_descriptors > 0,
            "max_unmap_block_descriptors must be non-zero"
        );
        ensure!(
            !self.default_initiator_name.is_empty(),
            "default_initiator_name must not be empty"
        );
        Ok(())
    }

    pub fn connection_poll_interval(&self) -> Duration {
        Duration::from_micros(self.connection_poll_interval_us)
    }

    pub fn active_poll_interval(&self) -> Duration {
        Duration::from_micros(self.active_poll_interval_us)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_micros(self.idle_poll_interval_us)
    }
}

/// Parameters of a device creation, as replayed from a saved configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDiskParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_iqn: Option<String>,
    pub url: String,
}

/// `{ "method": ..., "params": ... }` entry written for each device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub method: String,
    pub params: CreateDiskParams,
}

impl ConfigEntry {
    pub fn create(params: CreateDiskParams) -> Self {
        Self {
            method: CREATE_METHOD.to_string(),
            params,
        }
    }
}

/// Driver-specific section of the device introspection dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiInfo {
    pub initiator_name: String,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverInfo {
    pub iscsi: IscsiInfo,
}
