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
//! Lights service: LCD backlight plus the tri-color notification LED.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{bail, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::sysfs;

pub const LIGHTS_SOCKET_NAME: &str = "mata_lights";

pub const LEDS_PATH: &str = "/sys/class/leds";

const RAMP_STEPS: usize = 8;
const RAMP_STEP_DURATION_MS: i32 = 50;
/// Duty percent (0 - 100) for each pwm ramp step.
const BRIGHTNESS_RAMP: [u32; RAMP_STEPS] = [0, 12, 25, 37, 50, 72, 85, 100];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightType {
    Backlight,
    Keyboard,
    Buttons,
    Battery,
    Notifications,
    Attention,
    Bluetooth,
    Wifi,
}

impl LightType {
    fn from_id(id: i32) -> Option<LightType> {
        Some(match id {
            0 => LightType::Backlight,
            1 => LightType::Keyboard,
            2 => LightType::Buttons,
            3 => LightType::Battery,
            4 => LightType::Notifications,
            5 => LightType::Attention,
            6 => LightType::Bluetooth,
            7 => LightType::Wifi,
            _ => return None,
        })
    }

    fn id(self) -> i32 {
        match self {
            LightType::Backlight => 0,
            LightType::Keyboard => 1,
            LightType::Buttons => 2,
            LightType::Battery => 3,
            LightType::Notifications => 4,
            LightType::Attention => 5,
            LightType::Bluetooth => 6,
            LightType::Wifi => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashMode {
    #[default]
    None,
    Timed,
    Hardware,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LightState {
    /// AARRGGBB.
    pub color: u32,
    pub flash_mode: FlashMode,
    pub flash_on_ms: i32,
    pub flash_off_ms: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwLight {
    pub id: i32,
    pub ordinal: i32,
    pub light_type: LightType,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum LightsRequest {
    SetLightState { id: i32, state: LightState },
    GetLights,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum LightsResponse {
    Done,
    Lights(Vec<HwLight>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Handler {
    Notification,
    Backlight,
}

struct Backend {
    light_type: LightType,
    handler: Handler,
    state: LightState,
}

pub struct LightsService {
    root: PathBuf,
    // Serializes state updates against concurrent callers.
    backends: Mutex<Vec<Backend>>,
}

fn is_lit(state: &LightState) -> bool {
    state.color & 0x00ff_ffff != 0
}

/// Scales each duty-percent ramp step by the channel brightness.
fn scaled_ramp(brightness: u32) -> String {
    let mut ramp = String::new();
    for (i, step) in BRIGHTNESS_RAMP.iter().enumerate() {
        if i > 0 {
            ramp.push(',');
        }
        let _ = write!(ramp, "{}", step * brightness / 0xff);
    }
    ramp
}

fn set_channel_blink(led: &Path, ordinal: usize, brightness: u32, pause_lo: i32, pause_hi: i32, step_ms: i32) {
    sysfs::write_best_effort(led.join("start_idx"), ordinal * RAMP_STEPS);
    sysfs::write_best_effort(led.join("duty_pcts"), scaled_ramp(brightness));
    sysfs::write_best_effort(led.join("pause_lo"), pause_lo);
    sysfs::write_best_effort(led.join("pause_hi"), pause_hi);
    sysfs::write_best_effort(led.join("ramp_step_ms"), step_ms);
}

impl LightsService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        // Keep sorted in the order of importance.
        let backends = vec![
            Backend {
                light_type: LightType::Attention,
                handler: Handler::Notification,
                state: LightState::default(),
            },
            Backend {
                light_type: LightType::Notifications,
                handler: Handler::Notification,
                state: LightState::default(),
            },
            Backend {
                light_type: LightType::Battery,
                handler: Handler::Notification,
                state: LightState::default(),
            },
            Backend {
                light_type: LightType::Backlight,
                handler: Handler::Backlight,
                state: LightState::default(),
            },
        ];
        Self { root: root.into(), backends: Mutex::new(backends) }
    }

    pub fn set_light_state(&self, id: i32, state: LightState) -> Result<()> {
        info!("set light state for id={} to color {:#010x}", id, state.color);
        let Some(light_type) = LightType::from_id(id) else {
            bail!("unsupported light id {id}");
        };

        let mut backends = self.backends.lock().unwrap();

        let mut handler = None;
        for backend in backends.iter_mut() {
            if backend.light_type == light_type {
                backend.state = state;
                handler = Some(backend.handler);
            }
        }
        let Some(handler) = handler else {
            bail!("unsupported light type {light_type:?}");
        };

        // Light up the type with the highest priority that matches the
        // current handler.
        for backend in backends.iter() {
            if backend.handler == handler && is_lit(&backend.state) {
                self.apply(handler, &backend.state);
                return Ok(());
            }
        }

        // Nothing is lit; turn the hardware off.
        self.apply(handler, &state);
        Ok(())
    }

    pub fn get_lights(&self) -> Vec<HwLight> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(ordinal, backend)| HwLight {
                id: backend.light_type.id(),
                ordinal: ordinal as i32,
                light_type: backend.light_type,
            })
            .collect()
    }

    pub fn handle(&self, request: LightsRequest) -> Result<LightsResponse> {
        match request {
            LightsRequest::SetLightState { id, state } => {
                self.set_light_state(id, state)?;
                Ok(LightsResponse::Done)
            }
            LightsRequest::GetLights => Ok(LightsResponse::Lights(self.get_lights())),
        }
    }

    fn apply(&self, handler: Handler, state: &LightState) {
        match handler {
            Handler::Backlight => self.handle_backlight(state),
            Handler::Notification => self.handle_notification(state),
        }
    }

    fn handle_backlight(&self, state: &LightState) {
        let brightness = state.color & 0xff;
        sysfs::write_best_effort(self.root.join("lcd-backlight/brightness"), brightness);
    }

    fn handle_notification(&self, state: &LightState) {
        let mut red = (state.color >> 16) & 0xff;
        let mut green = (state.color >> 8) & 0xff;
        let mut blue = state.color & 0xff;
        let alpha = (state.color >> 24) & 0xff;

        // Scale the channels when the alpha brightness is meaningful.
        if alpha > 0 && alpha < 255 {
            red = red * alpha / 0xff;
            green = green * alpha / 0xff;
            blue = blue * alpha / 0xff;
        }

        let rgb = self.root.join("rgb");
        sysfs::write_best_effort(rgb.join("rgb_blink"), 0);

        if state.flash_mode == FlashMode::Timed {
            // If flash_on_ms is too short to fit ramping up and down at the
            // default step duration, the step duration shrinks to fit.
            let mut step_ms = RAMP_STEP_DURATION_MS;
            let mut pause_hi = state.flash_on_ms - step_ms * (RAMP_STEPS as i32) * 2;
            let pause_lo = state.flash_off_ms;
            if pause_hi < 0 {
                step_ms = state.flash_on_ms / (RAMP_STEPS as i32 * 2);
                pause_hi = 0;
            }

            set_channel_blink(&self.root.join("red"), 0, red, pause_lo, pause_hi, step_ms);
            set_channel_blink(&self.root.join("green"), 1, green, pause_lo, pause_hi, step_ms);
            set_channel_blink(&self.root.join("blue"), 2, blue, pause_lo, pause_hi, step_ms);

            sysfs::write_best_effort(rgb.join("rgb_blink"), 1);
        } else {
            sysfs::write_best_effort(self.root.join("red/brightness"), red);
            sysfs::write_best_effort(self.root.join("green/brightness"), green);
            sysfs::write_best_effort(self.root.join("blue/brightness"), blue);
        }
    }
}

impl Default for LightsService {
    fn default() -> Self {
        Self::new(LEDS_PATH)
    }
}
