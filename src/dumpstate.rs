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
//! Board diagnostic dump: a fixed list of kernel debug files and
//! directory listings streamed as titled sections.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use log::{error, warn};
use serde::{Deserialize, Serialize};

use crate::sysfs;

pub const DUMPSTATE_SOCKET_NAME: &str = "mata_dumpstate";

const SIDECAR_ATTACHED_PATH: &str = "sys/class/sidecar/attached";
const SIDECAR_POWER_CONTROL_PATH: &str = "sys/class/sidecar/power_control";
const SIDECAR_TTY_PATH: &str = "dev/ttyACM0";

#[derive(Debug, Serialize, Deserialize)]
pub enum DumpstateRequest {
    DumpstateBoard,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum DumpstateResponse {
    Dump(String),
}

pub struct DumpstateService {
    root: PathBuf,
}

impl Default for DumpstateService {
    fn default() -> Self {
        Self::new("/")
    }
}

fn section_header(out: &mut String, title: &str, path: &Path) {
    let _ = writeln!(out, "------ {title} ({}) ------", path.display());
}

impl DumpstateService {
    /// `root` is prepended to every dumped path; production uses `/`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dump_file(&self, out: &mut String, title: &str, path: &str) {
        let full = self.root.join(path);
        section_header(out, title, &full);
        match sysfs::read(&full) {
            Ok(contents) => {
                out.push_str(&contents);
                out.push('\n');
            }
            Err(e) => {
                warn!("dumpstate: {e:#}");
                let _ = writeln!(out, "*** {}: {e:#}", full.display());
            }
        }
    }

    /// `--- file` plus contents for every file under every directory in
    /// `dir`, mirroring the ION heap walk.
    fn dump_nested_dir(&self, out: &mut String, title: &str, dir: &str) {
        let full = self.root.join(dir);
        section_header(out, title, &full);
        let Ok(entries) = full.read_dir() else {
            let _ = writeln!(out, "*** {}: unreadable", full.display());
            return;
        };
        let mut subdirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        subdirs.sort();
        for subdir in subdirs {
            let Ok(files) = subdir.read_dir() else { continue };
            let mut files: Vec<PathBuf> = files.flatten().map(|e| e.path()).collect();
            files.sort();
            for file in files {
                let _ = writeln!(out, "--- {}", file.display());
                if let Ok(contents) = sysfs::read(&file) {
                    out.push_str(&contents);
                    out.push('\n');
                }
            }
        }
    }

    /// `type: temp` for every thermal zone.
    fn dump_temperatures(&self, out: &mut String) {
        let full = self.root.join("sys/class/thermal");
        section_header(out, "Temperatures", &full);
        let Ok(entries) = full.read_dir() else {
            let _ = writeln!(out, "*** {}: unreadable", full.display());
            return;
        };
        let mut zones: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        zones.sort();
        for zone in zones {
            let (Ok(zone_type), Ok(temp)) =
                (sysfs::read(zone.join("type")), sysfs::read(zone.join("temp")))
            else {
                continue;
            };
            let _ = writeln!(out, "{zone_type}: {temp}");
        }
    }

    /// `state-dir: name desc time usage` for every cpuidle state of `cpu`.
    fn dump_cpuidle(&self, out: &mut String, title: &str, cpu: usize) {
        let full = self.root.join(format!("sys/devices/system/cpu/cpu{cpu}/cpuidle"));
        section_header(out, title, &full);
        let Ok(entries) = full.read_dir() else {
            let _ = writeln!(out, "*** {}: unreadable", full.display());
            return;
        };
        let mut states: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("state")))
            .collect();
        states.sort();
        for state in states {
            let field = |name: &str| sysfs::read(state.join(name)).unwrap_or_default();
            let _ = writeln!(
                out,
                "{}: {} {} {} {}",
                state.display(),
                field("name"),
                field("desc"),
                field("time"),
                field("usage")
            );
        }
    }

    fn dump_sidecar(&self, out: &mut String) {
        let attached_path = self.root.join(SIDECAR_ATTACHED_PATH);
        let attached = match sysfs::read_parsed::<i32>(&attached_path) {
            Ok(attached) => attached,
            Err(e) => {
                error!("Failed to open {}: {e:#}", attached_path.display());
                return;
            }
        };
        self.dump_file(out, "Accessory attached", SIDECAR_ATTACHED_PATH);

        let power_control_path = self.root.join(SIDECAR_POWER_CONTROL_PATH);
        if sysfs::read(&power_control_path).is_err() {
            error!("Failed to open {}", power_control_path.display());
            return;
        }
        self.dump_file(out, "Accessory power control", SIDECAR_POWER_CONTROL_PATH);

        if attached == 0 {
            error!("No accessory currently connected");
        } else {
            self.dump_file(out, "Accessory", SIDECAR_TTY_PATH);
        }
    }

    pub fn dumpstate_board(&self) -> String {
        let mut out = String::new();
        self.dump_file(&mut out, "CPU present", "sys/devices/system/cpu/present");
        self.dump_file(&mut out, "CPU online", "sys/devices/system/cpu/online");
        self.dump_file(&mut out, "INTERRUPTS", "proc/interrupts");
        self.dump_file(&mut out, "RPM Stats", "d/rpm_stats");
        self.dump_file(&mut out, "Power Management Stats", "d/rpm_master_stats");
        self.dump_file(&mut out, "CNSS Pre-Alloc", "d/cnss-prealloc/status");
        self.dump_file(&mut out, "SMD Log", "d/ipc_logging/smd/log");
        self.dump_file(&mut out, "BT Logs", "d/ipc_logging/c171000.uart_pwr/log");
        self.dump_nested_dir(&mut out, "ION HEAPS", "d/ion");
        self.dump_file(&mut out, "dmabuf info", "d/dma_buf/bufinfo");
        self.dump_temperatures(&mut out);
        self.dump_file(
            &mut out,
            "cpu0-3 time-in-state",
            "sys/devices/system/cpu/cpu0/cpufreq/stats/time_in_state",
        );
        self.dump_cpuidle(&mut out, "cpu0-3 cpuidle", 0);
        self.dump_file(
            &mut out,
            "cpu4-7 time-in-state",
            "sys/devices/system/cpu/cpu4/cpufreq/stats/time_in_state",
        );
        self.dump_cpuidle(&mut out, "cpu4-7 cpuidle", 4);
        self.dump_file(&mut out, "MDP xlogs", "data/vendor/display/mdp_xlog");
        self.dump_sidecar(&mut out);
        out
    }

    pub fn handle(&self, request: DumpstateRequest) -> Result<DumpstateResponse> {
        match request {
            DumpstateRequest::DumpstateBoard => {
                Ok(DumpstateResponse::Dump(self.dumpstate_board()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn sections_carry_title_and_path_headers() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "sys/devices/system/cpu/present", "0-7\n");
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        let expected =
            format!("------ CPU present ({}/sys/devices/system/cpu/present) ------\n0-7\n", dir.path().display());
        assert!(dump.starts_with(&expected), "dump was: {dump}");
    }

    #[test]
    fn unreadable_files_are_noted_and_do_not_abort_the_dump() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "proc/interrupts", "IRQ data\n");
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        // First two sections are missing; the third still dumps.
        assert!(dump.contains("*** "));
        assert!(dump.contains("IRQ data"));
        assert!(dump.contains("------ MDP xlogs ("));
    }

    #[test]
    fn temperatures_list_every_zone() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "sys/class/thermal/thermal_zone0/type", "battery\n");
        write(dir.path(), "sys/class/thermal/thermal_zone0/temp", "30000\n");
        write(dir.path(), "sys/class/thermal/thermal_zone1/type", "quiet_therm\n");
        write(dir.path(), "sys/class/thermal/thermal_zone1/temp", "380\n");
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        assert!(dump.contains("battery: 30000\n"));
        assert!(dump.contains("quiet_therm: 380\n"));
    }

    #[test]
    fn ion_heaps_walk_nested_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "d/ion/heaps/system", "total 1024\n");
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        assert!(dump.contains("--- "));
        assert!(dump.contains("total 1024"));
    }

    #[test]
    fn sidecar_tty_only_dumped_when_attached() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "sys/class/sidecar/attached", "0\n");
        write(dir.path(), "sys/class/sidecar/power_control", "auto\n");
        write(dir.path(), "dev/ttyACM0", "accessory log\n");
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        assert!(dump.contains("------ Accessory attached ("));
        assert!(dump.contains("------ Accessory power control ("));
        assert!(!dump.contains("accessory log"));

        write(dir.path(), "sys/class/sidecar/attached", "1\n");
        let dump = service.dumpstate_board();
        assert!(dump.contains("accessory log"));
    }

    #[test]
    fn missing_sidecar_is_skipped_entirely() {
        let dir = TempDir::new().unwrap();
        let service = DumpstateService::new(dir.path());
        let dump = service.dumpstate_board();
        assert!(!dump.contains("Accessory"));
    }
}
