//! Sysfs-backed accelerator client.
//!
//! Uses the kernel's SR-IOV sysfs interface (`sriov_numvfs`,
//! `sriov_totalvfs`, `driver_override`, `drivers_probe`) to manage virtual
//! functions, and an external tool to load bitstreams onto the physical
//! function.

use crate::error::DeviceError;
use crate::models::{accelerator_model, AcceleratorInfo, DeviceSnapshot, DeviceTarget};
use crate::programmer_trait::DeviceProgrammer;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Production `DeviceProgrammer` working against a sysfs tree.
#[derive(Debug, Clone)]
pub struct SysfsDeviceClient {
    sysfs_root: PathBuf,
    firmware_dir: PathBuf,
    state_dir: PathBuf,
    bitstream_tool: PathBuf,
}

/// Builder for `SysfsDeviceClient`.
#[derive(Debug, Clone)]
pub struct SysfsDeviceClientBuilder {
    sysfs_root: PathBuf,
    firmware_dir: PathBuf,
    state_dir: PathBuf,
    bitstream_tool: PathBuf,
}

impl Default for SysfsDeviceClientBuilder {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            firmware_dir: PathBuf::from("/sriov_artifacts"),
            state_dir: PathBuf::from("/var/lib/sriov-fec"),
            bitstream_tool: PathBuf::from("pf_bb_config"),
        }
    }
}

impl SysfsDeviceClientBuilder {
    /// Root of the sysfs mount (default `/sys`)
    #[must_use]
    pub fn sysfs_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_root = path.into();
        self
    }

    /// Directory bitstream names are resolved against
    #[must_use]
    pub fn firmware_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.firmware_dir = path.into();
        self
    }

    /// Directory holding the per-device bitstream markers
    #[must_use]
    pub fn state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Executable used to load bitstreams (`<tool> -c <file> -p <pci address>`)
    #[must_use]
    pub fn bitstream_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.bitstream_tool = path.into();
        self
    }

    /// Builds the client.
    pub fn build(self) -> SysfsDeviceClient {
        SysfsDeviceClient {
            sysfs_root: self.sysfs_root,
            firmware_dir: self.firmware_dir,
            state_dir: self.state_dir,
            bitstream_tool: self.bitstream_tool,
        }
    }
}

impl SysfsDeviceClient {
    /// Starts a builder with production defaults.
    pub fn builder() -> SysfsDeviceClientBuilder {
        SysfsDeviceClientBuilder::default()
    }

    fn devices_dir(&self) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices")
    }

    fn marker_path(&self, pci_address: &str) -> PathBuf {
        self.state_dir.join(format!("{}.bitstream", pci_address))
    }

    /// Resolves the device directory, rejecting anything that is not a plain
    /// PCI address so callers cannot escape the sysfs tree.
    async fn device_dir(&self, pci_address: &str) -> Result<PathBuf, DeviceError> {
        if pci_address.is_empty() || pci_address.contains('/') || pci_address.contains("..") {
            return Err(DeviceError::Rejected(format!("invalid PCI address '{}'", pci_address)));
        }
        let dir = self.devices_dir().join(pci_address);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(DeviceError::NotFound(pci_address.to_string()));
        }
        Ok(dir)
    }

    async fn read_u32(path: &Path) -> Result<u32, DeviceError> {
        let raw = tokio::fs::read_to_string(path).await?;
        raw.trim().parse::<u32>().map_err(|e| {
            DeviceError::Rejected(format!("unexpected value '{}' in {}: {}", raw.trim(), path.display(), e))
        })
    }

    /// Reads an optional sysfs attribute, returning 0 when it does not exist.
    async fn read_u32_or_zero(path: &Path) -> Result<u32, DeviceError> {
        match Self::read_u32(path).await {
            Err(DeviceError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(0),
            other => other,
        }
    }

    async fn read_hex_id(path: &Path) -> Option<String> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        Some(raw.trim().trim_start_matches("0x").to_lowercase())
    }

    async fn driver_of(dir: &Path) -> Option<String> {
        let link = tokio::fs::read_link(dir.join("driver")).await.ok()?;
        link.file_name().map(|name| name.to_string_lossy().into_owned())
    }

    async fn write_attr(path: &Path, value: &str) -> Result<(), DeviceError> {
        debug!("Writing '{}' to {}", value, path.display());
        tokio::fs::write(path, value).await.map_err(|e| match e.kind() {
            ErrorKind::PermissionDenied => {
                DeviceError::Rejected(format!("write to {} denied: {}", path.display(), e))
            }
            _ => DeviceError::Io(e),
        })
    }

    /// Binds a PCI function to `driver` unless it is already bound to it.
    async fn bind_driver(&self, dir: &Path, pci_address: &str, driver: &str) -> Result<(), DeviceError> {
        let current = Self::driver_of(dir).await;
        if current.as_deref() == Some(driver) {
            return Ok(());
        }

        info!("Binding {} to driver {} (was {:?})", pci_address, driver, current);
        Self::write_attr(&dir.join("driver_override"), driver).await?;
        if current.is_some() {
            Self::write_attr(&dir.join("driver").join("unbind"), pci_address).await?;
        }
        Self::write_attr(&self.sysfs_root.join("bus/pci/drivers_probe"), pci_address).await
    }

    /// Changes the VF count, going through zero as the kernel requires.
    async fn set_numvfs(dir: &Path, pci_address: &str, vf_amount: u32) -> Result<(), DeviceError> {
        let path = dir.join("sriov_numvfs");
        let current = Self::read_u32(&path).await?;
        if current == vf_amount {
            return Ok(());
        }

        info!("Changing VF count of {} from {} to {}", pci_address, current, vf_amount);
        if current != 0 && vf_amount != 0 {
            Self::write_attr(&path, "0").await?;
        }
        Self::write_attr(&path, &vf_amount.to_string()).await
    }

    async fn program_bitstream(&self, pci_address: &str, bitstream: &str) -> Result<(), DeviceError> {
        if bitstream.is_empty() || bitstream.contains('/') {
            return Err(DeviceError::Firmware(format!("invalid bitstream name '{}'", bitstream)));
        }

        let path = self.firmware_dir.join(bitstream);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DeviceError::Firmware(format!("bitstream {} is not readable: {}", path.display(), e)))?;
        if !metadata.is_file() {
            return Err(DeviceError::Firmware(format!("bitstream {} is not a file", path.display())));
        }

        info!("Loading bitstream {} onto {}", bitstream, pci_address);
        let output = Command::new(&self.bitstream_tool)
            .arg("-c")
            .arg(&path)
            .arg("-p")
            .arg(pci_address)
            .output()
            .await
            .map_err(|e| DeviceError::Tool(format!("failed to run {}: {}", self.bitstream_tool.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeviceError::Tool(format!(
                "{} exited with {}: {}",
                self.bitstream_tool.display(),
                output.status,
                stderr.trim()
            )));
        }

        tokio::fs::create_dir_all(&self.state_dir).await?;
        tokio::fs::write(self.marker_path(pci_address), bitstream).await?;
        Ok(())
    }

    async fn forget_bitstream(&self, pci_address: &str) -> Result<(), DeviceError> {
        match tokio::fs::remove_file(self.marker_path(pci_address)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn loaded_bitstream(&self, pci_address: &str) -> Result<Option<String>, DeviceError> {
        match tokio::fs::read_to_string(self.marker_path(pci_address)).await {
            Ok(raw) => Ok(Some(raw.trim().to_string()).filter(|s| !s.is_empty())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl DeviceProgrammer for SysfsDeviceClient {
    async fn discover(&self) -> Result<Vec<AcceleratorInfo>, DeviceError> {
        let mut entries = match tokio::fs::read_dir(self.devices_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("No PCI devices directory under {}", self.sysfs_root.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let dir = entry.path();
            let (Some(vendor_id), Some(device_id)) = (
                Self::read_hex_id(&dir.join("vendor")).await,
                Self::read_hex_id(&dir.join("device")).await,
            ) else {
                continue;
            };
            let Some(model) = accelerator_model(&vendor_id, &device_id) else {
                continue;
            };

            let pci_address = entry.file_name().to_string_lossy().into_owned();
            debug!("Discovered {} accelerator at {}", model, pci_address);
            found.push(AcceleratorInfo {
                max_virtual_functions: Self::read_u32_or_zero(&dir.join("sriov_totalvfs")).await?,
                virtual_functions: Self::read_u32_or_zero(&dir.join("sriov_numvfs")).await?,
                driver: Self::driver_of(&dir).await,
                pci_address,
                vendor_id,
                device_id,
            });
        }

        found.sort_by(|a, b| a.pci_address.cmp(&b.pci_address));
        Ok(found)
    }

    async fn query(&self, pci_address: &str) -> Result<DeviceSnapshot, DeviceError> {
        let dir = self.device_dir(pci_address).await?;
        let vf_amount = Self::read_u32_or_zero(&dir.join("sriov_numvfs")).await?;
        let vf_driver = if vf_amount > 0 {
            Self::driver_of(&dir.join("virtfn0")).await
        } else {
            None
        };

        Ok(DeviceSnapshot {
            pci_address: pci_address.to_string(),
            pf_driver: Self::driver_of(&dir).await,
            vf_driver,
            vf_amount,
            bitstream: self.loaded_bitstream(pci_address).await?,
        })
    }

    async fn configure(&self, target: &DeviceTarget) -> Result<(), DeviceError> {
        let pci_address = target.pci_address.as_str();
        let dir = self.device_dir(pci_address).await?;

        let total = match Self::read_u32(&dir.join("sriov_totalvfs")).await {
            Ok(total) => total,
            Err(DeviceError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(DeviceError::Rejected(format!("{} does not support SR-IOV", pci_address)));
            }
            Err(e) => return Err(e),
        };
        if target.vf_amount > total {
            return Err(DeviceError::Rejected(format!(
                "{} supports at most {} VFs, {} requested",
                pci_address, total, target.vf_amount
            )));
        }

        if let Some(pf_driver) = &target.pf_driver {
            self.bind_driver(&dir, pci_address, pf_driver).await?;
        }

        match &target.bitstream {
            Some(bitstream) => {
                if self.loaded_bitstream(pci_address).await?.as_deref() != Some(bitstream.as_str()) {
                    self.program_bitstream(pci_address, bitstream).await?;
                }
            }
            None => self.forget_bitstream(pci_address).await?,
        }

        Self::set_numvfs(&dir, pci_address, target.vf_amount).await?;

        for index in 0..target.vf_amount {
            let vf_dir = dir.join(format!("virtfn{}", index));
            let Ok(link) = tokio::fs::read_link(&vf_dir).await else {
                warn!("VF {} of {} has no virtfn link yet, skipping driver bind", index, pci_address);
                continue;
            };
            let Some(vf_address) = link.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            self.bind_driver(&vf_dir, &vf_address, &target.vf_driver).await?;
        }

        Ok(())
    }

    async fn reset(&self, pci_address: &str) -> Result<(), DeviceError> {
        let dir = self.device_dir(pci_address).await?;
        let numvfs = dir.join("sriov_numvfs");
        if tokio::fs::try_exists(&numvfs).await? {
            Self::set_numvfs(&dir, pci_address, 0).await?;
        }
        self.forget_bitstream(pci_address).await
    }
}
