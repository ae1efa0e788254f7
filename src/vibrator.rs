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
//! QPNP haptics vibrator: direct mode, amplitude control and buffered
//! waveform effects.
//!
//! In buffer mode the controller plays a whole 8-byte buffer at a time.
//! Each byte is a voltage value: Voltage = 0.116mV * (VALUE >> 1), doubled
//! when 0x40 is set. Each byte plays for the period set in the DTSI
//! (qcom,play-rate-us).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::sysfs;

pub const VIBRATOR_SOCKET_NAME: &str = "mata_vibrator";

pub const VIBRATOR_DIR: &str = "/sys/class/timed_output/vibrator";

const MIN_VTG_INPUT: i32 = 120;
const MAX_VTG_INPUT: i32 = 2750;

const MODE_DIRECT: &str = "direct";
const MODE_BUFFER: &str = "buffer";

const WAVEFORM_NODES: usize = 8;

pub const WAVEFORM_CLICK_EFFECT_MS: u32 = 16;
const WAVEFORM_CLICK_EFFECT_SEQ: [u8; WAVEFORM_NODES] =
    [0x24, 0x30, 0x34, 0x68, 0x7e, 0x00, 0x00, 0x00];

pub const WAVEFORM_TICK_EFFECT_MS: u32 = 8;
const WAVEFORM_TICK_EFFECT_SEQ: [u8; WAVEFORM_NODES] =
    [0x68, 0x00, 0x30, 0x30, 0x20, 0x08, 0x00, 0x00];

const WAVEFORM_DOUBLE_CLICK_EFFECT_MS: u32 = 128;
const WAVEFORM_DOUBLE_CLICK_EFFECT_SEQ: [u8; WAVEFORM_NODES] =
    [0x68, 0x30, 0x00, 0x00, 0x00, 0x00, 0x68, 0x30];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Effect {
    Click,
    DoubleClick,
    Tick,
}

/// Accepted on the wire for contract compatibility; the waveforms are not
/// strength-scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectStrength {
    Light,
    Medium,
    Strong,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum VibratorRequest {
    On { timeout_ms: u32 },
    Off,
    SupportsAmplitudeControl,
    SetAmplitude { amplitude: u8 },
    Perform { effect: Effect, strength: EffectStrength },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum VibratorResponse {
    Done,
    AmplitudeControl(bool),
    Performed { duration_ms: u32 },
}

pub struct VibratorService {
    dir: PathBuf,
    click_duration_ms: u32,
    tick_duration_ms: u32,
}

impl Default for VibratorService {
    fn default() -> Self {
        Self::new(VIBRATOR_DIR, WAVEFORM_CLICK_EFFECT_MS, WAVEFORM_TICK_EFFECT_MS)
    }
}

impl VibratorService {
    pub fn new(dir: impl Into<PathBuf>, click_duration_ms: u32, tick_duration_ms: u32) -> Self {
        Self { dir: dir.into(), click_duration_ms, tick_duration_ms }
    }

    fn activate(&self, timeout_ms: u32, is_waveform: bool) -> Result<()> {
        let mode = if is_waveform { MODE_BUFFER } else { MODE_DIRECT };
        sysfs::write_best_effort(self.dir.join("mode"), mode);
        sysfs::write(self.dir.join("enable"), timeout_ms).context("Failed to activate")
    }

    pub fn on(&self, timeout_ms: u32) -> Result<()> {
        self.activate(timeout_ms, false)
    }

    pub fn off(&self) -> Result<()> {
        sysfs::write(self.dir.join("enable"), 0).context("Failed to turn vibrator off")
    }

    pub fn supports_amplitude_control(&self) -> bool {
        self.dir.join("vtg_input").exists()
    }

    pub fn set_amplitude(&self, amplitude: u8) -> Result<()> {
        if amplitude == 0 {
            bail!("amplitude 0 is out of range");
        }
        let voltage = ((amplitude - 1) as f64 / 254.0 * (MAX_VTG_INPUT - MIN_VTG_INPUT) as f64)
            .round() as i32
            + MIN_VTG_INPUT;
        sysfs::write(self.dir.join("vtg_input"), voltage).context("Failed to set amplitude")?;
        info!("Voltage set to: {voltage}");
        Ok(())
    }

    pub fn perform(&self, effect: Effect, _strength: EffectStrength) -> Result<u32> {
        let (sequence, duration_ms) = match effect {
            Effect::Click => (WAVEFORM_CLICK_EFFECT_SEQ, self.click_duration_ms),
            Effect::Tick => (WAVEFORM_TICK_EFFECT_SEQ, self.tick_duration_ms),
            Effect::DoubleClick => {
                (WAVEFORM_DOUBLE_CLICK_EFFECT_SEQ, WAVEFORM_DOUBLE_CLICK_EFFECT_MS)
            }
        };
        for (i, byte) in sequence.iter().enumerate() {
            sysfs::write_best_effort(self.dir.join(format!("wf_s{i}")), format!("{byte:x}"));
        }
        sysfs::write_best_effort(self.dir.join("buffer_update"), 1);
        self.activate(duration_ms, true)?;
        Ok(duration_ms)
    }

    pub fn handle(&self, request: VibratorRequest) -> Result<VibratorResponse> {
        match request {
            VibratorRequest::On { timeout_ms } => {
                self.on(timeout_ms)?;
                Ok(VibratorResponse::Done)
            }
            VibratorRequest::Off => {
                self.off()?;
                Ok(VibratorResponse::Done)
            }
            VibratorRequest::SupportsAmplitudeControl => {
                Ok(VibratorResponse::AmplitudeControl(self.supports_amplitude_control()))
            }
            VibratorRequest::SetAmplitude { amplitude } => {
                self.set_amplitude(amplitude)?;
                Ok(VibratorResponse::Done)
            }
            VibratorRequest::Perform { effect, strength } => {
                let duration_ms = self.perform(effect, strength)?;
                Ok(VibratorResponse::Performed { duration_ms })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, VibratorService) {
        let dir = TempDir::new().unwrap();
        for node in ["enable", "mode", "vtg_input", "buffer_update"] {
            fs::write(dir.path().join(node), "").unwrap();
        }
        for i in 0..WAVEFORM_NODES {
            fs::write(dir.path().join(format!("wf_s{i}")), "").unwrap();
        }
        let service = VibratorService::new(
            dir.path(),
            WAVEFORM_CLICK_EFFECT_MS,
            WAVEFORM_TICK_EFFECT_MS,
        );
        (dir, service)
    }

    fn node(dir: &TempDir, name: &str) -> String {
        fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn on_runs_in_direct_mode() {
        let (dir, service) = fixture();
        service.on(400).unwrap();
        assert_eq!(node(&dir, "mode"), "direct");
        assert_eq!(node(&dir, "enable"), "400");
    }

    #[test]
    fn off_zeroes_the_duration() {
        let (dir, service) = fixture();
        service.on(400).unwrap();
        service.off().unwrap();
        assert_eq!(node(&dir, "enable"), "0");
    }

    #[test]
    fn amplitude_maps_linearly_onto_the_voltage_range() {
        let (dir, service) = fixture();
        service.set_amplitude(1).unwrap();
        assert_eq!(node(&dir, "vtg_input"), "120");
        service.set_amplitude(255).unwrap();
        assert_eq!(node(&dir, "vtg_input"), "2750");
        service.set_amplitude(128).unwrap();
        assert_eq!(node(&dir, "vtg_input"), "1435");
    }

    #[test]
    fn zero_amplitude_is_rejected() {
        let (_dir, service) = fixture();
        assert!(service.set_amplitude(0).is_err());
    }

    #[test]
    fn amplitude_control_tracks_the_voltage_node() {
        let (dir, service) = fixture();
        assert!(service.supports_amplitude_control());
        fs::remove_file(dir.path().join("vtg_input")).unwrap();
        assert!(!service.supports_amplitude_control());
    }

    #[test]
    fn click_programs_the_waveform_buffer() {
        let (dir, service) = fixture();
        let duration = service.perform(Effect::Click, EffectStrength::Medium).unwrap();
        assert_eq!(duration, WAVEFORM_CLICK_EFFECT_MS);
        assert_eq!(node(&dir, "wf_s0"), "24");
        assert_eq!(node(&dir, "wf_s4"), "7e");
        assert_eq!(node(&dir, "wf_s7"), "0");
        assert_eq!(node(&dir, "buffer_update"), "1");
        assert_eq!(node(&dir, "mode"), "buffer");
        assert_eq!(node(&dir, "enable"), "16");
    }

    #[test]
    fn tick_duration_is_overridable() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("enable"), "").unwrap();
        let service = VibratorService::new(dir.path(), 20, 10);
        let duration = service.perform(Effect::Tick, EffectStrength::Light).unwrap();
        assert_eq!(duration, 10);
    }

    #[test]
    fn double_click_uses_its_fixed_duration() {
        let (_dir, service) = fixture();
        let duration = service.perform(Effect::DoubleClick, EffectStrength::Strong).unwrap();
        assert_eq!(duration, 128);
    }
}
