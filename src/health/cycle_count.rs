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
//! Battery cycle-count bin reconciliation.
//!
//! The fuel gauge keeps eight cycle-count bins in SRAM that survive reboots
//! but not reflashes; a copy lives on the persist partition. The two are
//! reconciled with a per-bin "maximum wins" rule so counts never regress.

use std::fmt::Write as _;
use std::path::PathBuf;

use anyhow::{bail, Result};
use log::{error, info};

use crate::sysfs;

pub const BUCKET_COUNT: usize = 8;

/// Which stores a reconciliation pass wrote back.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Persist copy was stale and has been rewritten.
    pub backed_up: bool,
    /// SRAM copy was stale and has been rewritten.
    pub restored: bool,
}

pub struct CycleCountBackupRestore {
    sram_path: PathBuf,
    persist_path: PathBuf,
    hw_bins: [i32; BUCKET_COUNT],
    sw_bins: [i32; BUCKET_COUNT],
}

fn parse_bins(buf: &str) -> Result<[i32; BUCKET_COUNT]> {
    let mut bins = [0; BUCKET_COUNT];
    let mut fields = buf.split_whitespace();
    for bin in bins.iter_mut() {
        match fields.next() {
            Some(field) => *bin = field.parse()?,
            None => bail!("expected {} bins, got fewer: '{}'", BUCKET_COUNT, buf),
        }
    }
    Ok(bins)
}

fn format_bins(bins: &[i32; BUCKET_COUNT]) -> String {
    let mut out = String::new();
    for (i, bin) in bins.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{bin}");
    }
    out
}

impl CycleCountBackupRestore {
    pub fn new(sram_path: impl Into<PathBuf>, persist_path: impl Into<PathBuf>) -> Self {
        Self {
            sram_path: sram_path.into(),
            persist_path: persist_path.into(),
            hw_bins: [0; BUCKET_COUNT],
            sw_bins: [0; BUCKET_COUNT],
        }
    }

    /// Boot-time path: pick up the persisted copy before reconciling, so a
    /// fresh fuel gauge is seeded from storage.
    pub fn restore(&mut self) -> SyncOutcome {
        self.read_from_storage();
        self.read_from_sram();
        self.update_and_save()
    }

    /// Periodic path: only the hardware side may have moved.
    pub fn backup(&mut self) -> SyncOutcome {
        self.read_from_sram();
        self.update_and_save()
    }

    fn read_from_storage(&mut self) {
        let buf = match sysfs::read(&self.persist_path) {
            Ok(buf) => buf,
            Err(e) => {
                error!("Cannot read the storage file: {e:#}");
                return;
            }
        };
        match parse_bins(&buf) {
            Ok(bins) => {
                info!("Storage data: {buf}");
                self.sw_bins = bins;
            }
            Err(e) => error!("data format is wrong in the storage file: {e:#}"),
        }
    }

    fn read_from_sram(&mut self) {
        let buf = match sysfs::read(&self.sram_path) {
            Ok(buf) => buf,
            Err(e) => {
                error!("Read cycle counter error: {e:#}");
                return;
            }
        };
        match parse_bins(&buf) {
            Ok(bins) => {
                info!("SRAM data: {buf}");
                self.hw_bins = bins;
            }
            Err(e) => error!("Failed to parse SRAM bins: {e:#}"),
        }
    }

    fn save_to_storage(&self) {
        let data = format_bins(&self.sw_bins);
        info!("Save to storage: {data}");
        if let Err(e) = sysfs::write(&self.persist_path, &data) {
            error!("Write file error: {e:#}");
        }
    }

    fn save_to_sram(&self) {
        let data = format_bins(&self.hw_bins);
        info!("Save to SRAM: {data}");
        if let Err(e) = sysfs::write(&self.sram_path, &data) {
            error!("Write data error: {e:#}");
        }
    }

    fn update_and_save(&mut self) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        for i in 0..BUCKET_COUNT {
            if self.hw_bins[i] < self.sw_bins[i] {
                self.hw_bins[i] = self.sw_bins[i];
                outcome.restored = true;
            } else if self.hw_bins[i] > self.sw_bins[i] {
                self.sw_bins[i] = self.hw_bins[i];
                outcome.backed_up = true;
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
