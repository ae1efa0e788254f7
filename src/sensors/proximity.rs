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
//! VL53L0 time-of-flight proximity shim.
//!
//! The ranging driver reports each measurement as a burst of EV_ABS events
//! closed by EV_SYN: HAT0X/HAT0Y/HAT1X carry the distance, signal rate and
//! ambient rate, HAT1Y the ranging error code, HAT3Y the dmax estimate and
//! ABS_GAS marks a completed flush.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, warn};
use zerocopy::FromBytes;

use crate::sensors::{
    EventBuffer, InputEvent, ABS_DISTANCE, ABS_GAS, ABS_HAT0X, ABS_HAT0Y, ABS_HAT1X, ABS_HAT1Y,
    ABS_HAT2X, ABS_HAT2Y, ABS_HAT3X, ABS_HAT3Y, ABS_PRESSURE, ABS_WHEEL, EV_ABS, EV_SYN,
    INPUT_EVENT_SIZE, SYN_DROPPED, SYN_REPORT,
};
use crate::sysfs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangingStatus {
    Valid,
    /// Nothing in range; `dmax_mm` bounds how far the sensor could see.
    OutOfRange,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProximitySample {
    pub distance_mm: f32,
    pub signal_rate_mcps: f32,
    pub ambient_rate_kcps: f32,
    pub status: RangingStatus,
    pub dmax_mm: f32,
    /// Conversion time and crosstalk words, reported as-is.
    pub aux: [f32; 5],
    pub error_code: i32,
    pub timestamp_ns: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Sample(ProximitySample),
    FlushComplete,
}

/// Accumulates the EV_ABS words of one measurement until EV_SYN closes it.
#[derive(Default)]
struct EventDecoder {
    distance_mm: f32,
    signal_rate_mcps: f32,
    ambient_rate_kcps: f32,
    aux: [f32; 5],
    error_code: i32,
    dmax_mm: f32,
    flush_pending: bool,
}

impl EventDecoder {
    fn process(&mut self, event: &InputEvent) -> Option<SensorEvent> {
        match event.event_type {
            EV_ABS => {
                match event.code {
                    ABS_GAS => self.flush_pending = true,
                    ABS_HAT0X => self.distance_mm = event.value as f32,
                    ABS_HAT0Y => self.signal_rate_mcps = event.value as f32,
                    ABS_HAT1X => self.ambient_rate_kcps = event.value as f32,
                    ABS_HAT1Y => self.error_code = event.value,
                    ABS_HAT2X => self.aux[0] = event.value as f32,
                    ABS_HAT2Y => self.aux[1] = event.value as f32,
                    ABS_HAT3X => self.aux[2] = event.value as f32,
                    ABS_WHEEL => self.aux[3] = event.value as f32,
                    ABS_PRESSURE => self.aux[4] = event.value as f32,
                    ABS_HAT3Y => self.dmax_mm = event.value as f32,
                    // Legacy distance word, superseded by ABS_HAT0X.
                    ABS_DISTANCE => {}
                    code => debug!("unknown ABS code 0x{code:x}"),
                }
                None
            }
            EV_SYN => match event.code {
                SYN_DROPPED => {
                    // The input subsystem overran its buffer; this
                    // measurement is incomplete.
                    warn!("proximity input device buffer overrun");
                    *self = Self { flush_pending: self.flush_pending, ..Self::default() };
                    None
                }
                SYN_REPORT => {
                    if self.flush_pending {
                        self.flush_pending = false;
                        return Some(SensorEvent::FlushComplete);
                    }
                    let (status, dmax_mm) = match self.error_code {
                        0 => (RangingStatus::Valid, 0.0),
                        e if e <= 4 => (RangingStatus::OutOfRange, self.dmax_mm),
                        _ => (RangingStatus::Invalid, 0.0),
                    };
                    Some(SensorEvent::Sample(ProximitySample {
                        distance_mm: self.distance_mm,
                        signal_rate_mcps: self.signal_rate_mcps,
                        ambient_rate_kcps: self.ambient_rate_kcps,
                        status,
                        dmax_mm,
                        aux: self.aux,
                        error_code: self.error_code,
                        timestamp_ns: event.timestamp_ns(),
                    }))
                }
                code => {
                    debug!("unknown SYN code {code}");
                    None
                }
            },
            event_type => {
                debug!("unknown event (type={event_type}, code={})", event.code);
                None
            }
        }
    }
}

pub struct ProximitySensor<R: Read + Send + Sync> {
    sysfs_dir: PathBuf,
    enabled: bool,
    events: EventBuffer<R>,
    decoder: EventDecoder,
}

impl<R: Read + Send + Sync> ProximitySensor<R> {
    /// `sysfs_dir` is the driver's input node, `/sys/class/input/input<N>`;
    /// `event_source` its character device.
    pub fn new(sysfs_dir: impl Into<PathBuf>, event_source: R) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            enabled: false,
            events: EventBuffer::new(event_source),
            decoder: EventDecoder::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self, enable: bool) -> Result<()> {
        if enable != self.enabled {
            sysfs::write(self.sysfs_dir.join("enable_ps_sensor"), enable as i32)
                .context("Failed to enable proximity sensor")?;
            self.enabled = enable;
        }
        Ok(())
    }

    pub fn batch(&self, period_ns: i64) -> Result<()> {
        if period_ns > 0 {
            sysfs::write(self.sysfs_dir.join("set_delay_ms"), period_ns / 1_000_000)
                .context("Failed to set proximity delay")?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        sysfs::write(self.sysfs_dir.join("do_flush"), 1).context("Failed to request flush")
    }

    /// Reads whatever the driver has queued and decodes the complete
    /// records. Events arriving while the sensor is disabled are decoded
    /// and discarded.
    pub fn read_events(&mut self) -> Result<Vec<SensorEvent>> {
        self.events.read_ahead()?;
        let mut decoded = Vec::new();
        loop {
            let buffer = self.events.buffer();
            if buffer.len() < INPUT_EVENT_SIZE {
                break;
            }
            let Ok(event) = InputEvent::read_from_bytes(&buffer[..INPUT_EVENT_SIZE]) else {
                break;
            };
            if let Some(sensor_event) = self.decoder.process(&event) {
                if self.enabled {
                    decoded.push(sensor_event);
                }
            }
            self.events.consume(INPUT_EVENT_SIZE);
        }
        Ok(decoded)
    }
}
