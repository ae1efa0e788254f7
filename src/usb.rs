/*
 * Copyright (C) 2024 The Android Open Source Project
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */
//! Type-C port management and the configfs USB gadget.
//!
//! The port side reads the dual-role class nodes; the gadget side builds
//! the g1 gadget from function symlinks and pulls it up on the UDC once
//! the requested functions are in place.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::sysfs;

pub const USB_SOCKET_NAME: &str = "mata_usb";

pub const DUAL_ROLE_DIR: &str = "/sys/class/dual_role_usb";
pub const GADGET_DIR: &str = "/config/usb_gadget/g1";
pub const FFS_ADB_DIR: &str = "/dev/usb-ffs/adb";
pub const USB_SOUND_CARD_FILE: &str = "/sys/bus/usb/devices/1-1:1.0/sound/card1/id";

const GADGET_NAME: &str = "a800000.dwc3";
const VENDOR_ID: &str = "0x2e17";

// USB-C to 3.5mm adapter with nothing plugged into it; the only device
// allowed to auto-suspend.
const AUTO_SUSPEND_VENDOR_ID: &str = "2e17";
const AUTO_SUSPEND_PRODUCT_ID: &str = "a001";

// Host sees a disconnect while the gadget stays pulled down this long.
const DISCONNECT_WAIT: Duration = Duration::from_micros(10000);

pub const FUNCTION_ADB: u64 = 1;
pub const FUNCTION_ACCESSORY: u64 = 1 << 1;
pub const FUNCTION_MTP: u64 = 1 << 2;
pub const FUNCTION_MIDI: u64 = 1 << 3;
pub const FUNCTION_PTP: u64 = 1 << 4;
pub const FUNCTION_RNDIS: u64 = 1 << 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortPowerRole {
    None,
    Source,
    Sink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDataRole {
    None,
    Host,
    Device,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortMode {
    None,
    Ufp,
    Dfp,
    Drp,
    AudioAccessory,
}

/// One role write to a port's dual-role node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortRole {
    Power(PortPowerRole),
    Data(PortDataRole),
    Mode(PortMode),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port_name: String,
    pub current_power_role: PortPowerRole,
    pub current_data_role: PortDataRole,
    pub current_mode: PortMode,
    pub can_change_power_role: bool,
    pub can_change_data_role: bool,
    pub can_change_mode: bool,
    pub supported_modes: PortMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum UsbRequest {
    QueryPortStatus,
    SwitchRole { port: String, role: PortRole },
    GetCurrentFunctions,
    SetCurrentFunctions { functions: u64 },
    /// Ingress for device hotplug events; auto-suspends allowlisted
    /// devices.
    DeviceAttached { device_path: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum UsbResponse {
    Done,
    PortStatuses(Vec<PortStatus>),
    CurrentFunctions { functions: u64, applied: bool },
}

impl PortRole {
    fn node(&self) -> &'static str {
        match self {
            PortRole::Power(_) => "power_role",
            PortRole::Data(_) => "data_role",
            PortRole::Mode(_) => "mode",
        }
    }

    fn value(&self) -> &'static str {
        match self {
            PortRole::Power(PortPowerRole::Source) => "source",
            PortRole::Power(PortPowerRole::Sink) => "sink",
            PortRole::Data(PortDataRole::Host) => "host",
            PortRole::Data(PortDataRole::Device) => "device",
            PortRole::Mode(PortMode::Ufp) => "ufp",
            PortRole::Mode(PortMode::Dfp) => "dfp",
            _ => "none",
        }
    }
}

#[derive(Default)]
struct GadgetState {
    functions: u64,
    applied: bool,
}

pub struct UsbService {
    dual_role_dir: PathBuf,
    sound_card_file: PathBuf,
    gadget_dir: PathBuf,
    ffs_dir: PathBuf,
    gadget: Mutex<GadgetState>,
}

impl Default for UsbService {
    fn default() -> Self {
        Self::new(DUAL_ROLE_DIR, USB_SOUND_CARD_FILE, GADGET_DIR, FFS_ADB_DIR)
    }
}

impl UsbService {
    pub fn new(
        dual_role_dir: impl Into<PathBuf>,
        sound_card_file: impl Into<PathBuf>,
        gadget_dir: impl Into<PathBuf>,
        ffs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dual_role_dir: dual_role_dir.into(),
            sound_card_file: sound_card_file.into(),
            gadget_dir: gadget_dir.into(),
            ffs_dir: ffs_dir.into(),
            gadget: Mutex::new(GadgetState::default()),
        }
    }

    fn port_names(&self) -> Result<Vec<String>> {
        let entries = self
            .dual_role_dir
            .read_dir()
            .with_context(|| format!("Failed to open {}", self.dual_role_dir.display()))?;
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    fn role_node(&self, port: &str, node: &str) -> PathBuf {
        self.dual_role_dir.join(port).join(node)
    }

    /// An attached sound card marks the peer as an audio accessory.
    fn is_audio_device(&self) -> bool {
        self.sound_card_file.exists()
    }

    fn current_mode(&self, port: &str) -> Result<PortMode> {
        let value = sysfs::read(self.role_node(port, "mode"))?;
        Ok(match value.as_str() {
            "ufp" => PortMode::Ufp,
            "dfp" => PortMode::Dfp,
            "none" => PortMode::None,
            other => {
                if self.is_audio_device() {
                    PortMode::AudioAccessory
                } else {
                    bail!("Unrecognized mode '{other}' on port {port}");
                }
            }
        })
    }

    fn current_power_role(&self, port: &str) -> Result<PortPowerRole> {
        let value = sysfs::read(self.role_node(port, "power_role"))?;
        Ok(match value.as_str() {
            "source" => PortPowerRole::Source,
            "sink" => PortPowerRole::Sink,
            "none" => PortPowerRole::None,
            other => bail!("Unrecognized power role '{other}' on port {port}"),
        })
    }

    fn current_data_role(&self, port: &str) -> Result<PortDataRole> {
        let value = sysfs::read(self.role_node(port, "data_role"))?;
        Ok(match value.as_str() {
            "host" => PortDataRole::Host,
            "device" => PortDataRole::Device,
            "none" => PortDataRole::None,
            other => bail!("Unrecognized data role '{other}' on port {port}"),
        })
    }

    fn supported_modes(&self, port: &str) -> Result<PortMode> {
        let modes = sysfs::read(self.role_node(port, "supported_modes"))?;
        Ok(match modes.as_str() {
            "ufp dfp" => PortMode::Drp,
            "ufp" => PortMode::Ufp,
            "dfp" => PortMode::Dfp,
            other => bail!("Unrecognized supported modes '{other}' on port {port}"),
        })
    }

    fn can_switch(&self, port: &str, node: &str) -> bool {
        fs::OpenOptions::new().write(true).open(self.role_node(port, node)).is_ok()
    }

    pub fn query_port_status(&self) -> Result<Vec<PortStatus>> {
        let mut statuses = Vec::new();
        for name in self.port_names()? {
            statuses.push(PortStatus {
                current_power_role: self.current_power_role(&name)?,
                current_data_role: self.current_data_role(&name)?,
                current_mode: self.current_mode(&name)?,
                can_change_power_role: self.can_switch(&name, "power_role"),
                can_change_data_role: self.can_switch(&name, "data_role"),
                can_change_mode: self.can_switch(&name, "mode"),
                supported_modes: self.supported_modes(&name)?,
                port_name: name,
            });
        }
        Ok(statuses)
    }

    /// Writes the role and confirms it by reading the node back.
    pub fn switch_role(&self, port: &str, role: PortRole) -> Result<()> {
        let node = self.role_node(port, role.node());
        let value = role.value();
        info!("Switching {} to {value}", node.display());
        sysfs::write(&node, value)?;
        let written = sysfs::read(&node)?;
        if written != value {
            bail!("Port {port} reports '{written}' after switching to '{value}'");
        }
        Ok(())
    }

    pub fn device_attached(&self, device_path: &str) {
        let device_path = Path::new(device_path);
        let vendor = sysfs::read(device_path.join("idVendor")).unwrap_or_default();
        let product = sysfs::read(device_path.join("idProduct")).unwrap_or_default();
        if vendor == AUTO_SUSPEND_VENDOR_ID && product == AUTO_SUSPEND_PRODUCT_ID {
            info!("auto suspend usb device {}", device_path.display());
            sysfs::write_best_effort(device_path.join("power/control"), "auto");
        }
    }

    fn pull_up(&self) -> Result<()> {
        sysfs::write(self.gadget_dir.join("UDC"), GADGET_NAME)
    }

    fn tear_down_gadget(&self) -> Result<()> {
        sysfs::write_best_effort(self.gadget_dir.join("UDC"), "none");
        for node in ["bDeviceClass", "bDeviceSubClass", "bDeviceProtocol", "os_desc/use"] {
            sysfs::write(self.gadget_dir.join(node), 0)?;
        }
        let config = self.gadget_dir.join("configs/b.1");
        let entries = config
            .read_dir()
            .with_context(|| format!("Failed to open {}", config.display()))?;
        for entry in entries.flatten() {
            // configfs reports no d_type; filter symlinks by name.
            if entry.file_name().to_string_lossy().contains("function") {
                fs::remove_file(entry.path())
                    .with_context(|| format!("Failed to unlink {}", entry.path().display()))?;
            }
        }
        Ok(())
    }

    fn set_vid_pid(&self, functions: u64) -> Result<()> {
        let pid = match functions {
            FUNCTION_MTP => "0xc033",
            f if f == FUNCTION_ADB | FUNCTION_MTP => "0xc030",
            FUNCTION_RNDIS => "0xc035",
            f if f == FUNCTION_ADB | FUNCTION_RNDIS => "0xc036",
            FUNCTION_PTP => "0xc034",
            f if f == FUNCTION_ADB | FUNCTION_PTP => "0xc031",
            FUNCTION_ADB => "0xc032",
            FUNCTION_MIDI => "0xc041",
            f if f == FUNCTION_ADB | FUNCTION_MIDI => "0xc042",
            FUNCTION_ACCESSORY => "0x2d00",
            f if f == FUNCTION_ADB | FUNCTION_ACCESSORY => "0x2d01",
            _ => bail!("Unsupported function combination 0x{functions:x}"),
        };
        sysfs::write(self.gadget_dir.join("idVendor"), VENDOR_ID)?;
        sysfs::write(self.gadget_dir.join("idProduct"), pid)
    }

    fn link_function(&self, function: &str, index: usize) -> Result<()> {
        let target = self.gadget_dir.join("functions").join(function);
        let link = self.gadget_dir.join(format!("configs/b.1/function{index}"));
        symlink(&target, &link)
            .with_context(|| format!("Failed to link {}", link.display()))
    }

    fn ffs_endpoints_present(&self) -> bool {
        self.ffs_dir.join("ep1").exists() && self.ffs_dir.join("ep2").exists()
    }

    fn setup_functions(&self, functions: u64) -> Result<bool> {
        let mut index = 0;
        let mut link = |function| {
            let result = self.link_function(function, index);
            index += 1;
            result
        };
        if functions & FUNCTION_MTP != 0 {
            link("mtp.gs0")?;
        }
        if functions & FUNCTION_PTP != 0 {
            link("ptp.gs1")?;
        }
        if functions & FUNCTION_MIDI != 0 {
            link("midi.gs5")?;
        }
        if functions & FUNCTION_ACCESSORY != 0 {
            link("accessory.gs2")?;
        }
        if functions & FUNCTION_RNDIS != 0 {
            link("gsi.rndis")?;
        }
        if functions & FUNCTION_ADB == 0 {
            self.pull_up()?;
            return Ok(true);
        }
        link("ffs.adb")?;
        // adbd writes the ffs descriptors after the gadget is configured;
        // pull up only once both endpoints exist.
        if self.ffs_endpoints_present() {
            self.pull_up()?;
            return Ok(true);
        }
        warn!("adb endpoints not present, leaving the gadget down");
        Ok(false)
    }

    pub fn get_current_functions(&self) -> (u64, bool) {
        let gadget = self.gadget.lock().unwrap_or_else(|e| e.into_inner());
        (gadget.functions, gadget.applied)
    }

    pub fn set_current_functions(&self, functions: u64) -> Result<bool> {
        let mut gadget = self.gadget.lock().unwrap_or_else(|e| e.into_inner());
        gadget.functions = functions;
        gadget.applied = false;

        self.tear_down_gadget()?;
        thread::sleep(DISCONNECT_WAIT);
        if functions == 0 {
            info!("Gadget torn down");
            return Ok(true);
        }

        self.set_vid_pid(functions)?;
        let applied = self.setup_functions(functions)?;
        gadget.applied = applied;
        info!("Gadget functions 0x{functions:x} configured, applied: {applied}");
        Ok(applied)
    }

    pub fn handle(&self, request: UsbRequest) -> Result<UsbResponse> {
        match request {
            UsbRequest::QueryPortStatus => {
                Ok(UsbResponse::PortStatuses(self.query_port_status()?))
            }
            UsbRequest::SwitchRole { port, role } => {
                self.switch_role(&port, role)?;
                Ok(UsbResponse::Done)
            }
            UsbRequest::GetCurrentFunctions => {
                let (functions, applied) = self.get_current_functions();
                Ok(UsbResponse::CurrentFunctions { functions, applied })
            }
            UsbRequest::SetCurrentFunctions { functions } => {
                let applied = self.set_current_functions(functions)?;
                let (functions, _) = self.get_current_functions();
                Ok(UsbResponse::CurrentFunctions { functions, applied })
            }
            UsbRequest::DeviceAttached { device_path } => {
                self.device_attached(&device_path);
                Ok(UsbResponse::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_port(dir: &Path, name: &str, power: &str, data: &str, mode: &str, supported: &str) {
        let port = dir.join(name);
        fs::create_dir_all(&port).unwrap();
        fs::write(port.join("power_role"), power).unwrap();
        fs::write(port.join("data_role"), data).unwrap();
        fs::write(port.join("mode"), mode).unwrap();
        fs::write(port.join("supported_modes"), supported).unwrap();
    }

    fn gadget_fixture(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        for node in [
            "UDC",
            "idVendor",
            "idProduct",
            "bDeviceClass",
            "bDeviceSubClass",
            "bDeviceProtocol",
        ] {
            fs::write(dir.join(node), "").unwrap();
        }
        fs::create_dir_all(dir.join("os_desc")).unwrap();
        fs::write(dir.join("os_desc/use"), "").unwrap();
        fs::create_dir_all(dir.join("configs/b.1")).unwrap();
        fs::create_dir_all(dir.join("functions")).unwrap();
    }

    fn fixture() -> (TempDir, UsbService) {
        let dir = TempDir::new().unwrap();
        let ports = dir.path().join("dual_role_usb");
        write_port(&ports, "otg_default", "sink\n", "device\n", "ufp\n", "ufp dfp\n");
        let gadget = dir.path().join("gadget");
        gadget_fixture(&gadget);
        let ffs = dir.path().join("ffs");
        fs::create_dir_all(&ffs).unwrap();
        let service =
            UsbService::new(ports, dir.path().join("sound_card_id"), gadget, ffs);
        (dir, service)
    }

    fn node(dir: &TempDir, rel: &str) -> String {
        fs::read_to_string(dir.path().join(rel)).unwrap()
    }

    #[test]
    fn port_status_reads_roles_and_switchability() {
        let (_dir, service) = fixture();
        let statuses = service.query_port_status().unwrap();
        assert_eq!(statuses.len(), 1);
        let port = &statuses[0];
        assert_eq!(port.port_name, "otg_default");
        assert_eq!(port.current_power_role, PortPowerRole::Sink);
        assert_eq!(port.current_data_role, PortDataRole::Device);
        assert_eq!(port.current_mode, PortMode::Ufp);
        assert_eq!(port.supported_modes, PortMode::Drp);
        assert!(port.can_change_power_role);
        assert!(port.can_change_mode);
    }

    #[test]
    fn unrecognized_mode_is_an_audio_accessory_when_a_sound_card_is_attached() {
        let (dir, service) = fixture();
        fs::write(dir.path().join("dual_role_usb/otg_default/mode"), "audio\n").unwrap();
        assert!(service.query_port_status().is_err());

        fs::write(dir.path().join("sound_card_id"), "USB-Audio\n").unwrap();
        let statuses = service.query_port_status().unwrap();
        assert_eq!(statuses[0].current_mode, PortMode::AudioAccessory);
    }

    #[test]
    fn switch_role_verifies_the_written_value() {
        let (dir, service) = fixture();
        service.switch_role("otg_default", PortRole::Power(PortPowerRole::Source)).unwrap();
        assert_eq!(node(&dir, "dual_role_usb/otg_default/power_role"), "source");
        // A port that does not exist cannot be switched.
        assert!(service.switch_role("ghost", PortRole::Data(PortDataRole::Host)).is_err());
    }

    #[test]
    fn allowlisted_device_is_auto_suspended() {
        let (dir, service) = fixture();
        let device = dir.path().join("usb1/1-1");
        fs::create_dir_all(device.join("power")).unwrap();
        fs::write(device.join("idVendor"), "2e17\n").unwrap();
        fs::write(device.join("idProduct"), "a001\n").unwrap();
        fs::write(device.join("power/control"), "on\n").unwrap();
        service.device_attached(device.to_str().unwrap());
        assert_eq!(fs::read_to_string(device.join("power/control")).unwrap(), "auto");
    }

    #[test]
    fn other_devices_keep_their_power_policy() {
        let (dir, service) = fixture();
        let device = dir.path().join("usb1/1-2");
        fs::create_dir_all(device.join("power")).unwrap();
        fs::write(device.join("idVendor"), "dead\n").unwrap();
        fs::write(device.join("idProduct"), "beef\n").unwrap();
        fs::write(device.join("power/control"), "on\n").unwrap();
        service.device_attached(device.to_str().unwrap());
        assert_eq!(fs::read_to_string(device.join("power/control")).unwrap(), "on\n");
    }

    #[test]
    fn mtp_gadget_is_linked_and_pulled_up() {
        let (dir, service) = fixture();
        let applied = service.set_current_functions(FUNCTION_MTP).unwrap();
        assert!(applied);
        assert_eq!(node(&dir, "gadget/idVendor"), "0x2e17");
        assert_eq!(node(&dir, "gadget/idProduct"), "0xc033");
        assert_eq!(node(&dir, "gadget/UDC"), GADGET_NAME);
        let link = dir.path().join("gadget/configs/b.1/function0");
        assert_eq!(
            fs::read_link(link).unwrap(),
            dir.path().join("gadget/functions/mtp.gs0")
        );
    }

    #[test]
    fn adb_waits_for_the_ffs_endpoints() {
        let (dir, service) = fixture();
        let applied = service.set_current_functions(FUNCTION_ADB | FUNCTION_MTP).unwrap();
        assert!(!applied);
        assert_eq!(node(&dir, "gadget/UDC"), "none");
        assert_eq!(node(&dir, "gadget/idProduct"), "0xc030");
        assert_eq!(service.get_current_functions(), (FUNCTION_ADB | FUNCTION_MTP, false));

        // With adbd's endpoints up, the same request pulls the gadget up.
        fs::write(dir.path().join("ffs/ep1"), "").unwrap();
        fs::write(dir.path().join("ffs/ep2"), "").unwrap();
        let applied = service.set_current_functions(FUNCTION_ADB | FUNCTION_MTP).unwrap();
        assert!(applied);
        assert_eq!(node(&dir, "gadget/UDC"), GADGET_NAME);
    }

    #[test]
    fn clearing_functions_tears_the_gadget_down() {
        let (dir, service) = fixture();
        service.set_current_functions(FUNCTION_MTP).unwrap();
        service.set_current_functions(0).unwrap();
        assert_eq!(node(&dir, "gadget/UDC"), "none");
        assert_eq!(node(&dir, "gadget/bDeviceClass"), "0");
        assert!(!dir.path().join("gadget/configs/b.1/function0").exists());
        assert_eq!(service.get_current_functions(), (0, false));
    }

    #[test]
    fn unsupported_combination_is_rejected() {
        let (_dir, service) = fixture();
        assert!(service.set_current_functions(FUNCTION_MTP | FUNCTION_RNDIS).is_err());
    }
}
