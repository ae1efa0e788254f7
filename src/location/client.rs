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
//! Per-client session bookkeeping.

use std::collections::HashMap;

use anyhow::Result;
use log::{debug, warn};

use super::engine::{
    supported_tbf_ms, BatchingMode, GeofenceOptions, LocationEngine, SessionId, TrackingOptions,
    LOCATION_SESSION_ALL_INFO_MASK,
};
use super::msg::{IndicationSender, LocationIndication};

pub struct ClientHandler {
    name: String,
    sender: Box<dyn IndicationSender>,
    subscription_mask: u32,
    capability_mask: u32,
    /// Tracking was requested; survives an engine suspend so the session can
    /// be resumed with the preserved options.
    pub tracking: bool,
    pub batching: bool,
    pub batching_mode: BatchingMode,
    session_id: SessionId,
    batching_id: SessionId,
    options: TrackingOptions,
    /// Geofence id translation, client id -> engine session id.
    geofence_ids: HashMap<u32, SessionId>,
}

impl ClientHandler {
    pub fn new(name: &str, sender: Box<dyn IndicationSender>) -> Self {
        ClientHandler {
            name: name.to_string(),
            sender,
            subscription_mask: 0,
            capability_mask: 0,
            tracking: false,
            batching: false,
            batching_mode: BatchingMode::NoAutoReport,
            session_id: 0,
            batching_id: 0,
            options: TrackingOptions { min_interval_ms: 0, min_distance_m: 0 },
            geofence_ids: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscription_mask(&self) -> u32 {
        self.subscription_mask
    }

    pub fn update_subscription(&mut self, mask: u32) {
        self.subscription_mask = mask;
    }

    /// Stopping the location session drops every session-bound callback.
    pub fn unsubscribe_location_session_cb(&mut self) {
        self.subscription_mask &= !LOCATION_SESSION_ALL_INFO_MASK;
    }

    /// Starts a tracking session with the given options; the requested
    /// interval is rounded to an engine-supported rate. A session that is
    /// already running keeps its id.
    pub fn start_tracking(
        &mut self,
        engine: &mut dyn LocationEngine,
        options: TrackingOptions,
    ) -> SessionId {
        if self.session_id == 0 {
            self.options = options;
            self.options.min_interval_ms = supported_tbf_ms(options.min_interval_ms);
            self.session_id = engine.start_tracking(&self.options);
        }
        self.session_id
    }

    /// Restarts tracking with the options preserved from before a suspend.
    pub fn resume_tracking(&mut self, engine: &mut dyn LocationEngine) -> SessionId {
        if self.session_id == 0 {
            self.session_id = engine.start_tracking(&self.options);
        }
        self.session_id
    }

    pub fn stop_tracking(&mut self, engine: &mut dyn LocationEngine) {
        if self.session_id != 0 {
            engine.stop_tracking(self.session_id);
            self.session_id = 0;
        }
    }

    pub fn update_tracking_options(
        &mut self,
        engine: &mut dyn LocationEngine,
        options: TrackingOptions,
    ) {
        if self.session_id != 0 {
            self.options = options;
            self.options.min_interval_ms = supported_tbf_ms(options.min_interval_ms);
            engine.update_tracking_options(self.session_id, &self.options);
        }
    }

    pub fn start_batching(
        &mut self,
        engine: &mut dyn LocationEngine,
        options: TrackingOptions,
        mode: BatchingMode,
    ) -> SessionId {
        if self.batching_id == 0 {
            self.batching_id = engine.start_batching(&options, mode);
        }
        self.batching_id
    }

    pub fn stop_batching(&mut self, engine: &mut dyn LocationEngine) {
        if self.batching_id != 0 {
            engine.stop_batching(self.batching_id);
            self.batching_id = 0;
        }
    }

    pub fn update_batching_options(
        &mut self,
        engine: &mut dyn LocationEngine,
        options: TrackingOptions,
        mode: BatchingMode,
    ) {
        if self.batching_id != 0 {
            engine.update_batching_options(self.batching_id, &options, mode);
        }
    }

    /// Stops any engine sessions this client still owns.
    pub fn cleanup(&mut self, engine: &mut dyn LocationEngine) {
        self.stop_tracking(engine);
        self.stop_batching(engine);
        let sessions: Vec<SessionId> = self.geofence_ids.values().copied().collect();
        if !sessions.is_empty() {
            engine.remove_geofences(&sessions);
            self.geofence_ids.clear();
        }
    }

    pub fn set_geofence_ids(&mut self, client_ids: &[u32], sessions: &[SessionId]) {
        for (client_id, session) in client_ids.iter().zip(sessions) {
            self.geofence_ids.insert(*client_id, *session);
        }
    }

    pub fn erase_geofence_ids(&mut self, client_ids: &[u32]) {
        for client_id in client_ids {
            self.geofence_ids.remove(client_id);
        }
    }

    /// Translates client geofence ids to engine session ids. Stale ids are
    /// dropped from the result and from the map.
    pub fn session_ids(&mut self, client_ids: &[u32]) -> Vec<SessionId> {
        let mut sessions = Vec::with_capacity(client_ids.len());
        for client_id in client_ids {
            match self.geofence_ids.get(client_id) {
                Some(session) => sessions.push(*session),
                None => {
                    warn!("Client {}: unknown geofence id {client_id}", self.name);
                    self.geofence_ids.remove(client_id);
                }
            }
        }
        sessions
    }

    /// Translates and pairs geofence ids with their new options, dropping
    /// stale ids.
    pub fn sessions_with_options(
        &mut self,
        fences: &[(u32, GeofenceOptions)],
    ) -> (Vec<SessionId>, Vec<GeofenceOptions>) {
        let mut sessions = Vec::with_capacity(fences.len());
        let mut options = Vec::with_capacity(fences.len());
        for (client_id, opts) in fences {
            match self.geofence_ids.get(client_id) {
                Some(session) => {
                    sessions.push(*session);
                    options.push(*opts);
                }
                None => warn!("Client {}: unknown geofence id {client_id}", self.name),
            }
        }
        (sessions, options)
    }

    /// Pushes the new capability mask when it changed. Err means the client
    /// is unreachable and should be purged.
    pub fn on_capabilities(&mut self, mask: u32) -> Result<()> {
        if mask == self.capability_mask {
            debug!("Client {}: capability mask unchanged 0x{mask:x}", self.name);
            return Ok(());
        }
        self.capability_mask = mask;
        self.sender.send(&LocationIndication::Capabilities { mask })
    }

    pub fn ping(&mut self) -> Result<()> {
        self.sender.send(&LocationIndication::Ping)
    }
}
