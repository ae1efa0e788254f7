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
//! Thermal service: fixed tsens sensor table plus /proc/stat CPU usage.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{ipc, sysfs};

pub const THERMAL_SOCKET_NAME: &str = "mata_thermal";

pub const THERMAL_ZONE_DIR: &str = "/sys/class/thermal";
pub const CPU_DIR: &str = "/sys/devices/system/cpu";
pub const CPU_USAGE_FILE: &str = "/proc/stat";

pub const CPU_NUM: usize = 8;

// Zone numbering from the thermal-engine config: tsens zones start past the
// board sensors, and the CPU cores are not wired up in core order.
const TSENS_OFFSET: usize = 9;
const CPU_TSENS_OFFSET: [usize; CPU_NUM] = [1, 2, 4, 3, 5, 6, 7, 8];
const GPU_TSENS_OFFSET: usize = 11;
const BATTERY_ZONE: usize = 0;
const SKIN_ZONE: usize = 8;

const CPU_THROTTLING_THRESHOLD: f32 = 95.0;
const CPU_SHUTDOWN_THRESHOLD: f32 = 115.0;
const BATTERY_SHUTDOWN_THRESHOLD: f32 = 60.0;
const SKIN_THROTTLING_THRESHOLD: f32 = 41.0;
const SKIN_SHUTDOWN_THRESHOLD: f32 = 47.0;
const VR_THROTTLED_BELOW_MIN: f32 = 44.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureType {
    Cpu,
    Gpu,
    Battery,
    Skin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Temperature {
    pub temp_type: TemperatureType,
    pub name: String,
    pub current_value: f32,
    pub throttling_threshold: f32,
    pub shutdown_threshold: f32,
    pub vr_throttling_threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub name: String,
    pub active: u64,
    pub total: u64,
    pub is_online: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ThermalRequest {
    GetTemperatures,
    GetCpuUsages,
    GetCoolingDevices,
    /// `socket` is an abstract socket the client listens on for
    /// [`ThermalIndication`]s. One callback slot per daemon.
    RegisterCallback { socket: String },
    UnregisterCallback,
    /// Ingress for the board's thermal engine; forwarded to the registered
    /// callback.
    NotifyThrottling { is_throttling: bool, temperature: Temperature },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum ThermalResponse {
    Done,
    Temperatures(Vec<Temperature>),
    CpuUsages(Vec<CpuUsage>),
    CoolingDevices(Vec<String>),
}

/// Event pushed to the registered callback socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ThermalIndication {
    Throttling { is_throttling: bool, temperature: Temperature },
}

/// Receives throttling events from the thermal engine.
pub trait ThermalCallback: Send {
    fn notify_throttling(&self, is_throttling: bool, temperature: &Temperature) -> Result<()>;
}

/// Builds the callback for a registration request; production connects back
/// to the client's socket.
pub type CallbackFactory = dyn Fn(&str) -> Result<Box<dyn ThermalCallback>> + Send + Sync;

/// Pushes [`ThermalIndication`]s over the client's abstract socket.
pub struct IpcThermalCallback {
    stream: Mutex<UnixStream>,
}

impl IpcThermalCallback {
    pub fn connect(socket: &str) -> Result<Box<dyn ThermalCallback>> {
        Ok(Box::new(IpcThermalCallback { stream: Mutex::new(ipc::connect(socket)?) }))
    }
}

impl ThermalCallback for IpcThermalCallback {
    fn notify_throttling(&self, is_throttling: bool, temperature: &Temperature) -> Result<()> {
        let stream = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let indication =
            ThermalIndication::Throttling { is_throttling, temperature: temperature.clone() };
        serde_json::to_writer(&*stream, &indication).context("Failed to push throttling event")?;
        Ok(())
    }
}

struct Sensor {
    temp_type: TemperatureType,
    name: &'static str,
    zone: usize,
    /// Raw sysfs value per degree celsius.
    scale: f32,
    throttling: f32,
    shutdown: f32,
    vr_throttling: Option<f32>,
}

fn sensor_table() -> Vec<Sensor> {
    let mut sensors = Vec::with_capacity(CPU_NUM + 3);
    const CPU_LABEL: [&str; CPU_NUM] = ["CPU0", "CPU1", "CPU2", "CPU3", "CPU4", "CPU5", "CPU6", "CPU7"];
    for (i, label) in CPU_LABEL.iter().enumerate() {
        sensors.push(Sensor {
            temp_type: TemperatureType::Cpu,
            name: label,
            zone: TSENS_OFFSET + CPU_TSENS_OFFSET[i],
            scale: 10.0,
            throttling: CPU_THROTTLING_THRESHOLD,
            shutdown: CPU_SHUTDOWN_THRESHOLD,
            vr_throttling: None,
        });
    }
    sensors.push(Sensor {
        temp_type: TemperatureType::Gpu,
        name: "GPU",
        zone: TSENS_OFFSET + GPU_TSENS_OFFSET,
        scale: 10.0,
        throttling: CPU_THROTTLING_THRESHOLD,
        shutdown: CPU_SHUTDOWN_THRESHOLD,
        vr_throttling: None,
    });
    sensors.push(Sensor {
        temp_type: TemperatureType::Battery,
        name: "battery",
        zone: BATTERY_ZONE,
        scale: 1000.0,
        throttling: BATTERY_SHUTDOWN_THRESHOLD,
        shutdown: BATTERY_SHUTDOWN_THRESHOLD,
        vr_throttling: None,
    });
    sensors.push(Sensor {
        temp_type: TemperatureType::Skin,
        name: "skin",
        zone: SKIN_ZONE,
        scale: 10.0,
        throttling: SKIN_THROTTLING_THRESHOLD,
        shutdown: SKIN_SHUTDOWN_THRESHOLD,
        vr_throttling: Some(VR_THROTTLED_BELOW_MIN),
    });
    sensors
}

pub struct ThermalService {
    zone_dir: PathBuf,
    cpu_dir: PathBuf,
    cpu_usage_file: PathBuf,
    enabled: bool,
    callback: Mutex<Option<Box<dyn ThermalCallback>>>,
    make_callback: Box<CallbackFactory>,
}

impl ThermalService {
    pub fn new(
        zone_dir: impl Into<PathBuf>,
        cpu_dir: impl Into<PathBuf>,
        cpu_usage_file: impl Into<PathBuf>,
        make_callback: Box<CallbackFactory>,
    ) -> Self {
        let zone_dir = zone_dir.into();
        let enabled = zone_dir.join(format!("thermal_zone{BATTERY_ZONE}")).exists();
        if !enabled {
            warn!("no thermal zones under {}, thermal HAL disabled", zone_dir.display());
        }
        Self {
            zone_dir,
            cpu_dir: cpu_dir.into(),
            cpu_usage_file: cpu_usage_file.into(),
            enabled,
            callback: Mutex::new(None),
            make_callback,
        }
    }

    fn zone_temp(&self, zone: usize) -> Result<f32> {
        let raw: f32 = sysfs::read_parsed(self.zone_dir.join(format!("thermal_zone{zone}/temp")))?;
        Ok(raw)
    }

    pub fn get_temperatures(&self) -> Result<Vec<Temperature>> {
        if !self.enabled {
            bail!("Unsupported hardware");
        }
        let mut temperatures = Vec::new();
        for sensor in sensor_table() {
            let raw = self.zone_temp(sensor.zone)?;
            let temperature = Temperature {
                temp_type: sensor.temp_type,
                name: sensor.name.to_string(),
                current_value: raw / sensor.scale,
                throttling_threshold: sensor.throttling,
                shutdown_threshold: sensor.shutdown,
                vr_throttling_threshold: sensor.vr_throttling,
            };
            debug!(
                "getTemperatures type: {:?} name: {} current: {}",
                temperature.temp_type, temperature.name, temperature.current_value
            );
            temperatures.push(temperature);
        }
        Ok(temperatures)
    }

    pub fn get_cpu_usages(&self) -> Result<Vec<CpuUsage>> {
        if !self.enabled {
            bail!("Unsupported hardware");
        }
        let stat = sysfs::read(&self.cpu_usage_file)
            .with_context(|| format!("Failed to read {}", self.cpu_usage_file.display()))?;
        let mut usages = parse_cpu_usages(&stat)?;
        for (i, usage) in usages.iter_mut().enumerate() {
            usage.is_online = self.cpu_online(i);
        }
        Ok(usages)
    }

    pub fn get_cooling_devices(&self) -> Result<Vec<String>> {
        if !self.enabled {
            bail!("Unsupported hardware");
        }
        debug!("No cooling device");
        Ok(Vec::new())
    }

    fn cpu_online(&self, cpu: usize) -> bool {
        let path = self.cpu_dir.join(format!("cpu{cpu}/online"));
        match sysfs::read_parsed::<i32>(&path) {
            Ok(online) => online != 0,
            Err(e) => {
                warn!("failed to read {}: {e:#}", path.display());
                false
            }
        }
    }

    pub fn register_callback(&self, callback: Option<Box<dyn ThermalCallback>>) {
        let registered = callback.is_some();
        *self.callback.lock().unwrap() = callback;
        if registered {
            info!("ThermalCallback registered");
        } else {
            info!("ThermalCallback unregistered");
        }
    }

    /// Forwards a throttling event from the thermal engine to the
    /// registered client, unlinking the callback if delivery fails.
    pub fn notify_throttling(&self, is_throttling: bool, temperature: &Temperature) {
        let mut callback = self.callback.lock().unwrap();
        match callback.as_ref() {
            Some(cb) => {
                if let Err(e) = cb.notify_throttling(is_throttling, temperature) {
                    warn!("Dropped throttling event, ThermalCallback died: {e:#}");
                    *callback = None;
                }
            }
            None => warn!("Dropped throttling event, no ThermalCallback registered"),
        }
    }

    pub fn handle(&self, request: ThermalRequest) -> Result<ThermalResponse> {
        match request {
            ThermalRequest::GetTemperatures => {
                Ok(ThermalResponse::Temperatures(self.get_temperatures()?))
            }
            ThermalRequest::GetCpuUsages => Ok(ThermalResponse::CpuUsages(self.get_cpu_usages()?)),
            ThermalRequest::GetCoolingDevices => {
                Ok(ThermalResponse::CoolingDevices(self.get_cooling_devices()?))
            }
            ThermalRequest::RegisterCallback { socket } => {
                let callback = (self.make_callback)(&socket)
                    .with_context(|| format!("Failed to reach callback socket {socket}"))?;
                self.register_callback(Some(callback));
                Ok(ThermalResponse::Done)
            }
            ThermalRequest::UnregisterCallback => {
                self.register_callback(None);
                Ok(ThermalResponse::Done)
            }
            ThermalRequest::NotifyThrottling { is_throttling, temperature } => {
                self.notify_throttling(is_throttling, &temperature);
                Ok(ThermalResponse::Done)
            }
        }
    }
}

impl Default for ThermalService {
    fn default() -> Self {
        Self::new(
            THERMAL_ZONE_DIR,
            CPU_DIR,
            CPU_USAGE_FILE,
            Box::new(IpcThermalCallback::connect),
        )
    }
}

/// Parses the per-core `cpuN ...` lines of /proc/stat. Active time is
/// user + nice + system; total adds idle.
fn parse_cpu_usages(stat: &str) -> Result<Vec<CpuUsage>> {
    let mut usages = vec![
        CpuUsage { name: String::new(), active: 0, total: 0, is_online: false };
        CPU_NUM
    ];
    for (i, usage) in usages.iter_mut().enumerate() {
        usage.name = format!("CPU{i}");
    }

    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else { continue };
        let Some(cpu) = label.strip_prefix("cpu").and_then(|n| n.parse::<usize>().ok()) else {
            continue;
        };
        if cpu >= CPU_NUM {
            bail!("unexpected cpu index {cpu} in stat line '{line}'");
        }
        let mut values = [0u64; 4];
        for value in values.iter_mut() {
            *value = fields
                .next()
                .with_context(|| format!("truncated stat line '{line}'"))?
                .parse()?;
        }
        let [user, nice, system, idle] = values;
        usages[cpu].active = user + nice + system;
        usages[cpu].total = user + nice + system + idle;
    }
    Ok(usages)
}
