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
//! Power service: hint handling, perf modes and low-power statistics.

pub mod interaction;
pub mod perf;
pub mod stats;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::sysfs;
use interaction::{BoostConfig, InteractionHandler};
use perf::{check_handle, PerfLock, StubPerfLock};
use stats::{PlatformSleepState, SubsystemStats};

pub const POWER_SOCKET_NAME: &str = "mata_power";

pub const SCALING_GOVERNOR_PATH: &str =
    "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";

const SCHEDUTIL_GOVERNOR: &str = "schedutil";
const SCHED_GOVERNOR: &str = "sched";
const INTERACTIVE_GOVERNOR: &str = "interactive";

// Resource opcode sets from the vendor perflock tables. The sustained and
// VR sets cap both cluster max frequencies; the combined set sits between
// the two.
const SUSTAINED_PERF_RES: [i32; 4] = [0x40800000, 1209600, 0x40800100, 1209600];
const VR_MODE_RES: [i32; 4] = [0x40800000, 1574400, 0x40800100, 1574400];
const VR_SUSTAINED_PERF_RES: [i32; 4] = [0x40800000, 1440000, 0x40800100, 1440000];
const DISPLAY_OFF_RES: [i32; 2] = [0x32D, 0x77];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerHint {
    Vsync,
    Interaction,
    VideoEncode,
    VideoDecode,
    LowPower,
    SustainedPerformance,
    VrMode,
    Launch,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PowerRequest {
    SetInteractive { interactive: bool },
    PowerHint { hint: PowerHint, data: i32 },
    SetFeature { feature: i32, activate: bool },
    GetPlatformLowPowerStats,
    GetSubsystemLowPowerStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PowerResponse {
    Done,
    PlatformStats(Vec<PlatformSleepState>),
    SubsystemStats(Vec<SubsystemStats>),
}

#[derive(Default)]
struct PerfModes {
    sustained: bool,
    vr: bool,
    sustained_handle: i32,
    vr_handle: i32,
}

#[derive(Default)]
struct DisplayHint {
    sent: bool,
    handle: i32,
}

pub struct PowerService {
    governor_path: PathBuf,
    rpm_stats_file: PathBuf,
    wlan_stats_file: PathBuf,
    perf: Arc<dyn PerfLock>,
    modes: Mutex<PerfModes>,
    display: Mutex<DisplayHint>,
    interaction: InteractionHandler,
}

impl Default for PowerService {
    fn default() -> Self {
        Self::new(
            SCALING_GOVERNOR_PATH,
            stats::RPM_SYSTEM_STAT,
            stats::WLAN_POWER_STAT,
            Arc::new(StubPerfLock),
            BoostConfig::default(),
        )
    }
}

impl PowerService {
    pub fn new(
        governor_path: impl Into<PathBuf>,
        rpm_stats_file: impl Into<PathBuf>,
        wlan_stats_file: impl Into<PathBuf>,
        perf: Arc<dyn PerfLock>,
        boost: BoostConfig,
    ) -> Self {
        Self {
            governor_path: governor_path.into(),
            rpm_stats_file: rpm_stats_file.into(),
            wlan_stats_file: wlan_stats_file.into(),
            perf: Arc::clone(&perf),
            modes: Mutex::new(PerfModes::default()),
            display: Mutex::new(DisplayHint::default()),
            interaction: InteractionHandler::new(perf, boost),
        }
    }

    /// Only EAS 1.2, legacy EAS and HMP are supported.
    fn is_supported_governor(&self) -> bool {
        let governor = sysfs::read(&self.governor_path).unwrap_or_default();
        if governor == SCHEDUTIL_GOVERNOR
            || governor == SCHED_GOVERNOR
            || governor == INTERACTIVE_GOVERNOR
        {
            true
        } else {
            error!("Governor not supported by powerHAL, skipping");
            false
        }
    }

    pub fn set_interactive(&self, interactive: bool) {
        if !self.is_supported_governor() {
            return;
        }
        debug!("Got set_interactive hint");
        let governor = sysfs::read(&self.governor_path).unwrap_or_default();
        let mut display = self.display.lock().unwrap();
        if !interactive {
            // Display off: only the interactive governor takes a hint, an
            // indefinite lock held until the display comes back.
            if governor == INTERACTIVE_GOVERNOR && !display.sent {
                let handle = self.perf.acquire(0, 0, &DISPLAY_OFF_RES);
                if check_handle(handle) {
                    display.handle = handle;
                    display.sent = true;
                } else {
                    error!("Failed to acquire display-off lock");
                }
            }
        } else if display.sent {
            self.perf.release(display.handle);
            display.sent = false;
        }
    }

    pub fn power_hint(&self, hint: PowerHint, data: i32) {
        if !self.is_supported_governor() {
            return;
        }
        match hint {
            PowerHint::Interaction => self.interaction.acquire(data),
            PowerHint::SustainedPerformance => {
                let mut modes = self.modes.lock().unwrap();
                self.process_sustained_perf_hint(&mut modes, data);
            }
            PowerHint::VrMode => {
                let mut modes = self.modes.lock().unwrap();
                self.process_vr_mode_hint(&mut modes, data);
            }
            _ => {}
        }
    }

    fn process_sustained_perf_hint(&self, modes: &mut PerfModes, data: i32) {
        if data != 0 && !modes.sustained {
            if !modes.vr {
                // Sustained mode only.
                let handle = self.perf.acquire(modes.sustained_handle, 0, &SUSTAINED_PERF_RES);
                if !check_handle(handle) {
                    error!("Failed to acquire sustained mode lock");
                    return;
                }
                modes.sustained_handle = handle;
            } else {
                // Sustained + VR mode.
                self.perf.release(modes.vr_handle);
                let handle =
                    self.perf.acquire(modes.sustained_handle, 0, &VR_SUSTAINED_PERF_RES);
                if !check_handle(handle) {
                    error!("Failed to acquire combined sustained+VR lock");
                    return;
                }
                modes.sustained_handle = handle;
            }
            modes.sustained = true;
        } else if modes.sustained {
            self.perf.release(modes.sustained_handle);
            if modes.vr {
                // Switch back to VR mode.
                let handle = self.perf.acquire(modes.vr_handle, 0, &VR_MODE_RES);
                if !check_handle(handle) {
                    error!("Failed to reacquire VR mode lock");
                    return;
                }
                modes.vr_handle = handle;
            }
            modes.sustained = false;
        }
    }

    fn process_vr_mode_hint(&self, modes: &mut PerfModes, data: i32) {
        if data != 0 && !modes.vr {
            if !modes.sustained {
                // VR mode only.
                let handle = self.perf.acquire(modes.vr_handle, 0, &VR_MODE_RES);
                if !check_handle(handle) {
                    error!("Failed to acquire VR mode lock");
                    return;
                }
                modes.vr_handle = handle;
            } else {
                // Sustained + VR mode.
                self.perf.release(modes.sustained_handle);
                let handle = self.perf.acquire(modes.vr_handle, 0, &VR_SUSTAINED_PERF_RES);
                if !check_handle(handle) {
                    error!("Failed to acquire combined sustained+VR lock");
                    return;
                }
                modes.vr_handle = handle;
            }
            modes.vr = true;
        } else if modes.vr {
            self.perf.release(modes.vr_handle);
            if modes.sustained {
                // Switch back to sustained mode.
                let handle = self.perf.acquire(modes.sustained_handle, 0, &SUSTAINED_PERF_RES);
                if !check_handle(handle) {
                    error!("Failed to reacquire sustained mode lock");
                    return;
                }
                modes.sustained_handle = handle;
            }
            modes.vr = false;
        }
    }

    /// Stats queries are best-effort: an unreadable dump yields an empty
    /// list, never a wire error.
    pub fn get_platform_low_power_stats(&self) -> Vec<PlatformSleepState> {
        match sysfs::read(&self.rpm_stats_file) {
            Ok(text) => stats::parse_platform_stats(&text),
            Err(e) => {
                warn!("failed to read {}: {e:#}", self.rpm_stats_file.display());
                Vec::new()
            }
        }
    }

    pub fn get_subsystem_low_power_stats(&self) -> Vec<SubsystemStats> {
        match sysfs::read(&self.wlan_stats_file) {
            Ok(text) => vec![stats::parse_wlan_stats(&text)],
            Err(e) => {
                warn!("failed to read {}: {e:#}", self.wlan_stats_file.display());
                Vec::new()
            }
        }
    }

    pub fn handle(&self, request: PowerRequest) -> Result<PowerResponse> {
        match request {
            PowerRequest::SetInteractive { interactive } => {
                self.set_interactive(interactive);
                Ok(PowerResponse::Done)
            }
            PowerRequest::PowerHint { hint, data } => {
                self.power_hint(hint, data);
                Ok(PowerResponse::Done)
            }
            PowerRequest::SetFeature { .. } => Ok(PowerResponse::Done),
            PowerRequest::GetPlatformLowPowerStats => {
                Ok(PowerResponse::PlatformStats(self.get_platform_low_power_stats()))
            }
            PowerRequest::GetSubsystemLowPowerStats => {
                Ok(PowerResponse::SubsystemStats(self.get_subsystem_low_power_stats()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::interaction::tests::{Event, RecordingPerfLock};
    use std::fs;
    use tempfile::TempDir;

    fn fixture(governor: &str) -> (TempDir, Arc<RecordingPerfLock>, PowerService) {
        let dir = TempDir::new().unwrap();
        let governor_path = dir.path().join("scaling_governor");
        fs::write(&governor_path, format!("{governor}\n")).unwrap();
        let perf = Arc::new(RecordingPerfLock::default());
        let service = PowerService::new(
            governor_path,
            dir.path().join("system_stats"),
            dir.path().join("power_stats"),
            perf.clone(),
            BoostConfig::default(),
        );
        (dir, perf, service)
    }

    fn resources_of(event: &Event) -> Vec<i32> {
        match event {
            Event::Acquire { resources, .. } => resources.clone(),
            Event::Release(_) => panic!("expected an acquire"),
        }
    }

    #[test]
    fn unsupported_governor_skips_hints() {
        let (_dir, perf, service) = fixture("ondemand");
        service.power_hint(PowerHint::SustainedPerformance, 1);
        service.set_interactive(false);
        assert!(perf.events().is_empty());
    }

    #[test]
    fn sustained_mode_acquires_and_releases() {
        let (_dir, perf, service) = fixture("schedutil");
        service.power_hint(PowerHint::SustainedPerformance, 1);
        service.power_hint(PowerHint::SustainedPerformance, 0);
        let events = perf.events();
        assert_eq!(events.len(), 2);
        assert_eq!(resources_of(&events[0]), SUSTAINED_PERF_RES.to_vec());
        let Event::Acquire { handle, .. } = events[0] else { unreachable!() };
        assert_eq!(events[1], Event::Release(handle));
    }

    #[test]
    fn vr_on_top_of_sustained_switches_to_the_combined_set() {
        let (_dir, perf, service) = fixture("schedutil");
        service.power_hint(PowerHint::SustainedPerformance, 1);
        service.power_hint(PowerHint::VrMode, 1);
        let events = perf.events();
        assert_eq!(events.len(), 3);
        let Event::Acquire { handle: sustained_handle, .. } = events[0] else { unreachable!() };
        // Entering VR releases the sustained handle and grabs the combined set.
        assert_eq!(events[1], Event::Release(sustained_handle));
        assert_eq!(resources_of(&events[2]), VR_SUSTAINED_PERF_RES.to_vec());
    }

    #[test]
    fn leaving_vr_falls_back_to_sustained() {
        let (_dir, perf, service) = fixture("sched");
        service.power_hint(PowerHint::SustainedPerformance, 1);
        service.power_hint(PowerHint::VrMode, 1);
        service.power_hint(PowerHint::VrMode, 0);
        let events = perf.events();
        assert_eq!(events.len(), 5);
        assert!(matches!(events[3], Event::Release(_)));
        assert_eq!(resources_of(&events[4]), SUSTAINED_PERF_RES.to_vec());
    }

    #[test]
    fn display_off_hint_is_sent_once_and_undone() {
        let (_dir, perf, service) = fixture("interactive");
        service.set_interactive(false);
        service.set_interactive(false);
        assert_eq!(perf.acquires(), 1);
        service.set_interactive(true);
        let events = perf.events();
        let Event::Acquire { handle, .. } = events[0] else { unreachable!() };
        assert_eq!(*events.last().unwrap(), Event::Release(handle));
    }

    #[test]
    fn missing_stats_files_yield_empty_lists() {
        let (_dir, _perf, service) = fixture("schedutil");
        assert!(service.get_platform_low_power_stats().is_empty());
        assert!(service.get_subsystem_low_power_stats().is_empty());
    }

    #[test]
    fn stats_files_are_parsed_end_to_end() {
        let (dir, _perf, service) = fixture("schedutil");
        fs::write(
            dir.path().join("system_stats"),
            "RPM Mode:vlow\n count:4\n actual last sleep(msec):77\nRPM Mode:vmin\n count:1\n actual last sleep(msec):5\n",
        )
        .unwrap();
        let states = service.get_platform_low_power_stats();
        assert_eq!(states[0].total_transitions, 4);
        assert_eq!(states[1].residency_in_msec_since_boot, 5);
    }
}
