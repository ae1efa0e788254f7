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
//! Seam to the vendor positioning engine. The daemon only does session and
//! client bookkeeping; fixes, batching and geofence evaluation happen behind
//! this trait.

use serde::{Deserialize, Serialize};

/// Engine-minted session id. 0 means no session.
pub type SessionId = u32;

/// Callback subscription bits, also used to select which indications a
/// client receives.
pub const CB_DISTANCE_BASED_TRACKING: u32 = 1 << 0;
pub const CB_GNSS_LOCATION_INFO: u32 = 1 << 1;
pub const CB_GNSS_SV: u32 = 1 << 2;
pub const CB_GNSS_NMEA: u32 = 1 << 3;
pub const CB_GNSS_DATA: u32 = 1 << 4;
pub const CB_SYSTEM_INFO: u32 = 1 << 5;
pub const CB_BATCHING: u32 = 1 << 6;
pub const CB_BATCHING_STATUS: u32 = 1 << 7;
pub const CB_GEOFENCE_BREACH: u32 = 1 << 8;
pub const CB_ENGINE_LOCATIONS_INFO: u32 = 1 << 9;
pub const CB_SIMPLE_LOCATION_INFO: u32 = 1 << 10;
pub const CB_GNSS_MEAS: u32 = 1 << 11;

/// Callbacks tied to a running location session; dropped as a group when the
/// client stops its session.
pub const LOCATION_SESSION_ALL_INFO_MASK: u32 = CB_DISTANCE_BASED_TRACKING
    | CB_GNSS_LOCATION_INFO
    | CB_GNSS_SV
    | CB_GNSS_NMEA
    | CB_GNSS_DATA
    | CB_GNSS_MEAS
    | CB_ENGINE_LOCATIONS_INFO
    | CB_SIMPLE_LOCATION_INFO;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub min_interval_ms: u32,
    pub min_distance_m: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchingMode {
    Routine,
    Trip,
    NoAutoReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceOptions {
    pub breach_type_mask: u32,
    pub responsiveness_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeofenceInfo {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

/// The vendor positioning engine. Session ids are minted by the engine;
/// a returned id of 0 means the session could not be started.
pub trait LocationEngine: Send {
    fn capabilities(&self) -> u32;

    fn start_tracking(&mut self, options: &TrackingOptions) -> SessionId;
    fn stop_tracking(&mut self, session: SessionId);
    fn update_tracking_options(&mut self, session: SessionId, options: &TrackingOptions);

    fn start_batching(&mut self, options: &TrackingOptions, mode: BatchingMode) -> SessionId;
    fn stop_batching(&mut self, session: SessionId);
    fn update_batching_options(
        &mut self,
        session: SessionId,
        options: &TrackingOptions,
        mode: BatchingMode,
    );

    /// One engine session id per requested fence, in order.
    fn add_geofences(&mut self, fences: &[(GeofenceOptions, GeofenceInfo)]) -> Vec<SessionId>;
    fn remove_geofences(&mut self, sessions: &[SessionId]);
    fn modify_geofences(&mut self, sessions: &[SessionId], options: &[GeofenceOptions]);
    fn pause_geofences(&mut self, sessions: &[SessionId]);
    fn resume_geofences(&mut self, sessions: &[SessionId]);
}

/// Placeholder engine used when the vendor positioning library is not
/// present. Sessions are minted and remembered but produce no fixes.
#[derive(Default)]
pub struct StubEngine {
    last_session: SessionId,
}

impl StubEngine {
    fn mint(&mut self) -> SessionId {
        self.last_session += 1;
        self.last_session
    }
}

impl LocationEngine for StubEngine {
    fn capabilities(&self) -> u32 {
        0
    }

    fn start_tracking(&mut self, options: &TrackingOptions) -> SessionId {
        log::info!(
            "stub engine: start tracking, interval {}ms distance {}m",
            options.min_interval_ms,
            options.min_distance_m
        );
        self.mint()
    }

    fn stop_tracking(&mut self, session: SessionId) {
        log::info!("stub engine: stop tracking session {session}");
    }

    fn update_tracking_options(&mut self, session: SessionId, options: &TrackingOptions) {
        log::info!(
            "stub engine: session {session} now interval {}ms distance {}m",
            options.min_interval_ms,
            options.min_distance_m
        );
    }

    fn start_batching(&mut self, _options: &TrackingOptions, _mode: BatchingMode) -> SessionId {
        self.mint()
    }

    fn stop_batching(&mut self, session: SessionId) {
        log::info!("stub engine: stop batching session {session}");
    }

    fn update_batching_options(
        &mut self,
        _session: SessionId,
        _options: &TrackingOptions,
        _mode: BatchingMode,
    ) {
    }

    fn add_geofences(&mut self, fences: &[(GeofenceOptions, GeofenceInfo)]) -> Vec<SessionId> {
        fences.iter().map(|_| self.mint()).collect()
    }

    fn remove_geofences(&mut self, _sessions: &[SessionId]) {}
    fn modify_geofences(&mut self, _sessions: &[SessionId], _options: &[GeofenceOptions]) {}
    fn pause_geofences(&mut self, _sessions: &[SessionId]) {}
    fn resume_geofences(&mut self, _sessions: &[SessionId]) {}
}

/// Rounds a requested time-between-fixes to what the engine supports:
/// 100ms, 200ms, 500ms, or whole seconds.
pub fn supported_tbf_ms(tbf_ms: u32) -> u32 {
    if tbf_ms < 200 {
        100
    } else if tbf_ms < 500 {
        200
    } else if tbf_ms < 1000 {
        500
    } else if tbf_ms > u32::MAX - 999 {
        u32::MAX / 1000 * 1000
    } else {
        (tbf_ms + 999) / 1000 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tbf_rounds_to_supported_rates() {
        assert_eq!(supported_tbf_ms(0), 100);
        assert_eq!(supported_tbf_ms(199), 100);
        assert_eq!(supported_tbf_ms(200), 200);
        assert_eq!(supported_tbf_ms(499), 200);
        assert_eq!(supported_tbf_ms(500), 500);
        assert_eq!(supported_tbf_ms(999), 500);
        assert_eq!(supported_tbf_ms(1000), 1000);
        assert_eq!(supported_tbf_ms(1001), 2000);
        assert_eq!(supported_tbf_ms(u32::MAX), u32::MAX / 1000 * 1000);
    }
}
