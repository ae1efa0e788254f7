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
//! Health service: battery counter backup/restore plus UFS storage health.

pub mod cycle_count;
pub mod learned_capacity;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::sysfs;
use cycle_count::CycleCountBackupRestore;
use learned_capacity::LearnedCapacityBackupRestore;

pub const HEALTH_SOCKET_NAME: &str = "mata_health";

pub const CYCLE_COUNT_SRAM_PATH: &str = "/sys/class/power_supply/bms/device/cycle_counts_bins";
pub const CYCLE_COUNT_PERSIST_PATH: &str = "/mnt/vendor/persist/battery/qcom_cycle_counts_bins";
pub const CHARGE_FULL_SRAM_PATH: &str = "/sys/class/power_supply/bms/charge_full";
pub const CHARGE_FULL_PERSIST_PATH: &str = "/mnt/vendor/persist/battery/qcom_charge_full";

const UFS_HEALTH_FILE: &str = "/sys/kernel/debug/ufshcd0/dump_health_desc";
const UFS_VERSION_FILE: &str = "/sys/kernel/debug/ufshcd0/show_hba";
const DISK_STATS_FILE: &str = "/sys/block/sda/stat";
const UFS_NAME: &str = "UFS0";

/// Requests understood by the health daemon.
#[derive(Debug, Serialize, Deserialize)]
pub enum HealthRequest {
    /// Battery properties snapshot was taken; run the periodic backups.
    BatteryUpdate { level: i32 },
    GetStorageInfo,
    GetDiskStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum HealthResponse {
    Done,
    StorageInfo(StorageInfo),
    DiskStats(DiskStats),
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub is_internal: bool,
    pub is_boot_device: bool,
    pub name: String,
    pub version: String,
    pub eol: u16,
    pub lifetime_a: u16,
    pub lifetime_b: u16,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStats {
    pub reads: u64,
    pub read_merges: u64,
    pub read_sectors: u64,
    pub read_ticks: u64,
    pub writes: u64,
    pub write_merges: u64,
    pub write_sectors: u64,
    pub write_ticks: u64,
    pub io_in_flight: u64,
    pub io_ticks: u64,
    pub io_in_queue: u64,
}

pub struct HealthService {
    cycle_count: Mutex<CycleCountBackupRestore>,
    learned_capacity: Mutex<LearnedCapacityBackupRestore>,
    ufs_health_file: PathBuf,
    ufs_version_file: PathBuf,
    disk_stats_file: PathBuf,
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new(
            CycleCountBackupRestore::new(CYCLE_COUNT_SRAM_PATH, CYCLE_COUNT_PERSIST_PATH),
            LearnedCapacityBackupRestore::new(CHARGE_FULL_SRAM_PATH, CHARGE_FULL_PERSIST_PATH),
            UFS_HEALTH_FILE,
            UFS_VERSION_FILE,
            DISK_STATS_FILE,
        )
    }
}

impl HealthService {
    pub fn new(
        cycle_count: CycleCountBackupRestore,
        learned_capacity: LearnedCapacityBackupRestore,
        ufs_health_file: impl Into<PathBuf>,
        ufs_version_file: impl Into<PathBuf>,
        disk_stats_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cycle_count: Mutex::new(cycle_count),
            learned_capacity: Mutex::new(learned_capacity),
            ufs_health_file: ufs_health_file.into(),
            ufs_version_file: ufs_version_file.into(),
            disk_stats_file: disk_stats_file.into(),
        }
    }

    /// Boot-time restore of both battery counters.
    pub fn init(&self) {
        self.cycle_count.lock().unwrap().restore();
        self.learned_capacity.lock().unwrap().restore();
    }

    pub fn battery_update(&self, level: i32) {
        info!("battery update at level {level}");
        self.cycle_count.lock().unwrap().backup();
        self.learned_capacity.lock().unwrap().backup();
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        let mut info = StorageInfo {
            is_internal: true,
            is_boot_device: true,
            name: UFS_NAME.to_string(),
            ..Default::default()
        };

        let version = sysfs::read(&self.ufs_version_file)?;
        info.version = parse_ufs_version(&version)
            .with_context(|| format!("No UFS version in {}", self.ufs_version_file.display()))?;

        let health = sysfs::read(&self.ufs_health_file)?;
        parse_health_descriptor(&health, &mut info);
        Ok(info)
    }

    pub fn disk_stats(&self) -> Result<DiskStats> {
        let buf = sysfs::read(&self.disk_stats_file)?;
        parse_disk_stats(&buf)
    }

    pub fn handle(&self, request: HealthRequest) -> Result<HealthResponse> {
        match request {
            HealthRequest::BatteryUpdate { level } => {
                self.battery_update(level);
                Ok(HealthResponse::Done)
            }
            HealthRequest::GetStorageInfo => Ok(HealthResponse::StorageInfo(self.storage_info()?)),
            HealthRequest::GetDiskStats => Ok(HealthResponse::DiskStats(self.disk_stats()?)),
        }
    }
}

/// Finds `hba->ufs_version = 0x<rev>` in the hba dump and renders it as
/// `ufs <rev>`.
fn parse_ufs_version(dump: &str) -> Option<String> {
    for line in dump.lines() {
        if let Some(rest) = line.trim().strip_prefix("hba->ufs_version = 0x") {
            let rev: String = rest.chars().take(7).take_while(|c| c.is_ascii_hexdigit()).collect();
            if !rev.is_empty() {
                return Some(format!("ufs {rev}"));
            }
        }
    }
    None
}

/// Pulls the pre-EOL and lifetime estimates out of the health descriptor
/// dump. Lines look like:
/// `Health Descriptor[Byte offset 0x2]: bPreEOLInfo = 0x1`
fn parse_health_descriptor(dump: &str, info: &mut StorageInfo) {
    for line in dump.lines().skip(1) {
        let Some((_, rest)) = line.split_once("]: ") else { continue };
        let Some((token, value)) = rest.split_once(" = 0x") else { continue };
        let Ok(value) = u16::from_str_radix(value.trim(), 16) else { continue };
        match token.trim() {
            "bPreEOLInfo" => info.eol = value,
            "bDeviceLifeTimeEstA" => info.lifetime_a = value,
            "bDeviceLifeTimeEstB" => info.lifetime_b = value,
            _ => {}
        }
    }
}

fn parse_disk_stats(line: &str) -> Result<DiskStats> {
    let mut fields = line.split_whitespace().map(|f| f.parse::<u64>());
    let mut next = || -> Result<u64> {
        match fields.next() {
            Some(value) => Ok(value?),
            None => bail!("disk stats line too short: '{line}'"),
        }
    };
    Ok(DiskStats {
        reads: next()?,
        read_merges: next()?,
        read_sectors: next()?,
        read_ticks: next()?,
        writes: next()?,
        write_merges: next()?,
        write_sectors: next()?,
        write_ticks: next()?,
        io_in_flight: next()?,
        io_ticks: next()?,
        io_in_queue: next()?,
    })
}
