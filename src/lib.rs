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
//! HAL service implementations for the mata (MSM8998) board.
//!
//! Every module is an independent adapter from a fixed service contract to
//! a handful of kernel sysfs nodes, ioctls, or the vendor perflock client.
//! There is no shared runtime; `sysfs` and `ipc` are leaf helpers.

pub mod dumpstate;
pub mod health;
pub mod ipc;
pub mod lights;
pub mod location;
pub mod power;
pub mod power_stats;
pub mod recovery;
pub mod sensors;
pub mod sysfs;
pub mod thermal;
pub mod usb;
pub mod vibrator;
