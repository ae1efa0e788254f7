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
//! Learned full-charge capacity reconciliation.
//!
//! Unlike the cycle-count bins, capacity only degrades: when both sides
//! hold a non-zero value the lower one is authoritative.

use std::path::PathBuf;

use log::{error, info};

use crate::health::cycle_count::SyncOutcome;
use crate::sysfs;

pub struct LearnedCapacityBackupRestore {
    sram_path: PathBuf,
    persist_path: PathBuf,
    hw_cap: i32,
    sw_cap: i32,
}

impl LearnedCapacityBackupRestore {
    pub fn new(sram_path: impl Into<PathBuf>, persist_path: impl Into<PathBuf>) -> Self {
        Self { sram_path: sram_path.into(), persist_path: persist_path.into(), hw_cap: 0, sw_cap: 0 }
    }

    pub fn restore(&mut self) -> SyncOutcome {
        self.read_from_storage();
        self.read_from_sram();
        self.update_and_save()
    }

    pub fn backup(&mut self) -> SyncOutcome {
        self.read_from_sram();
        self.update_and_save()
    }

    fn read_from_storage(&mut self) {
        match sysfs::read_parsed::<i32>(&self.persist_path) {
            Ok(cap) => {
                info!("Storage data: {cap}");
                self.sw_cap = cap;
            }
            Err(e) => error!("Cannot read the storage file: {e:#}"),
        }
    }

    fn read_from_sram(&mut self) {
        match sysfs::read_parsed::<i32>(&self.sram_path) {
            Ok(cap) => {
                info!("SRAM data: {cap}");
                self.hw_cap = cap;
            }
            Err(e) => error!("Read learned capacity error: {e:#}"),
        }
    }

    fn save_to_storage(&self) {
        info!("Save to storage: {}", self.sw_cap);
        if let Err(e) = sysfs::write(&self.persist_path, self.sw_cap) {
            error!("Write file error: {e:#}");
        }
    }

    fn save_to_sram(&self) {
        info!("Save to SRAM: {}", self.hw_cap);
        if let Err(e) = sysfs::write(&self.sram_path, self.hw_cap) {
            error!("Write data error: {e:#}");
        }
    }

    fn update_and_save(&mut self) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        // A zeroed fuel gauge reports nothing worth propagating.
        if self.hw_cap != 0 {
            if self.hw_cap < self.sw_cap || self.sw_cap == 0 {
                self.sw_cap = self.hw_cap;
                outcome.backed_up = true;
            } else if self.hw_cap > self.sw_cap {
                self.hw_cap = self.sw_cap;
                outcome.restored = true;
            }
        }
        if outcome.restored {
            self.save_to_sram();
        }
        if outcome.backed_up {
            self.save_to_storage();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(sram: &str, persist: &str) -> (TempDir, LearnedCapacityBackupRestore) {
        let dir = TempDir::new().unwrap();
        let sram_path = dir.path().join("charge_full");
        let persist_path = dir.path().join("qcom_charge_full");
        fs::write(&sram_path, sram).unwrap();
        fs::write(&persist_path, persist).unwrap();
        (dir, LearnedCapacityBackupRestore::new(sram_path, persist_path))
    }

    #[test]
    fn lower_nonzero_capacity_wins() {
        let (dir, mut lc) = fixture("3000000\n", "2900000\n");
        let outcome = lc.restore();
        assert_eq!(outcome, SyncOutcome { backed_up: false, restored: true });
        assert_eq!(fs::read_to_string(dir.path().join("charge_full")).unwrap(), "2900000");
    }

    #[test]
    fn zero_persisted_value_adopts_hardware() {
        let (dir, mut lc) = fixture("3000000\n", "0\n");
        let outcome = lc.restore();
        assert_eq!(outcome, SyncOutcome { backed_up: true, restored: false });
        assert_eq!(
            fs::read_to_string(dir.path().join("qcom_charge_full")).unwrap(),
            "3000000"
        );
    }

    #[test]
    fn zero_hardware_value_is_ignored() {
        let (_dir, mut lc) = fixture("0\n", "2900000\n");
        assert_eq!(lc.restore(), SyncOutcome::default());
    }

    #[test]
    fn equal_values_write_nothing() {
        let (_dir, mut lc) = fixture("2950000\n", "2950000\n");
        assert_eq!(lc.backup(), SyncOutcome::default());
    }
}
