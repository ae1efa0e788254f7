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
//! Wire messages between location clients and the daemon.
//!
//! Requests carry the client's own listening socket name; the daemon keys
//! its client registry on it and pushes indications back over that socket.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::engine::{BatchingMode, GeofenceInfo, GeofenceOptions, TrackingOptions};

/// One geofence in an add request: the client picks `client_id`, the engine
/// mints the session id the daemon maps it to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceData {
    pub client_id: u32,
    pub options: GeofenceOptions,
    pub info: GeofenceInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Suspend,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocationRequest {
    ClientRegister { client: String },
    ClientDeregister { client: String },
    UpdateCallbacks { client: String, mask: u32 },
    StartTracking { client: String, options: TrackingOptions },
    StopTracking { client: String },
    UpdateTrackingOptions { client: String, options: TrackingOptions },
    StartBatching { client: String, options: TrackingOptions, mode: BatchingMode },
    StopBatching { client: String },
    UpdateBatchingOptions { client: String, options: TrackingOptions, mode: BatchingMode },
    AddGeofences { client: String, fences: Vec<GeofenceData> },
    RemoveGeofences { client: String, client_ids: Vec<u32> },
    ModifyGeofences { client: String, fences: Vec<(u32, GeofenceOptions)> },
    PauseGeofences { client: String, client_ids: Vec<u32> },
    ResumeGeofences { client: String, client_ids: Vec<u32> },
    PingTest { client: String },
    PowerEvent { state: PowerState },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationResponse {
    Ack,
}

/// Unsolicited messages pushed to a client's own socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocationIndication {
    Capabilities { mask: u32 },
    Ping,
}

/// Push channel back to one client. Production connects to the client's
/// abstract socket; tests substitute a recorder.
pub trait IndicationSender: Send {
    fn send(&mut self, indication: &LocationIndication) -> Result<()>;
}

/// Builds the push channel for a newly registered client, from the socket
/// name it sent in its register request.
pub type SenderFactory = dyn Fn(&str) -> Result<Box<dyn IndicationSender>> + Send;

pub struct IpcIndicationSender {
    stream: std::os::unix::net::UnixStream,
}

impl IpcIndicationSender {
    pub fn connect(socket_name: &str) -> Result<Box<dyn IndicationSender>> {
        let stream = crate::ipc::connect(socket_name)?;
        Ok(Box::new(IpcIndicationSender { stream }))
    }
}

impl IndicationSender for IpcIndicationSender {
    fn send(&mut self, indication: &LocationIndication) -> Result<()> {
        serde_json::to_writer(&self.stream, indication)?;
        Ok(())
    }
}
