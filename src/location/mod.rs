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
//! Location daemon: client registry and message dispatch over the
//! positioning engine.

pub mod client;
pub mod engine;
pub mod msg;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use log::{error, info};

use crate::ipc;
use client::ClientHandler;
use engine::LocationEngine;
use msg::{LocationRequest, LocationResponse, PowerState, SenderFactory};

pub const LOCATION_SOCKET_NAME: &str = "mata_locationd";

struct ServiceState {
    engine: Box<dyn LocationEngine>,
    clients: HashMap<String, ClientHandler>,
    make_sender: Box<SenderFactory>,
}

pub struct LocationApiService {
    state: Mutex<ServiceState>,
}

impl ServiceState {
    fn client(&mut self, name: &str) -> Result<&mut ClientHandler> {
        self.clients.get_mut(name).with_context(|| format!("Unknown client {name}"))
    }

    fn register_client(&mut self, name: &str) -> Result<()> {
        if self.clients.contains_key(name) {
            info!("Client {name} already registered, resetting its state");
            self.delete_client(name);
        }
        let sender = (self.make_sender)(name)
            .with_context(|| format!("Failed to reach client {name}"))?;
        let mut handler = ClientHandler::new(name, sender);
        // A fresh client learns the current capabilities right away.
        if let Err(e) = handler.on_capabilities(self.engine.capabilities()) {
            bail!("Failed to send capabilities to client {name}: {e:#}");
        }
        self.clients.insert(name.to_string(), handler);
        info!("Registered new client {name}");
        Ok(())
    }

    fn delete_client(&mut self, name: &str) {
        match self.clients.remove(name) {
            Some(mut handler) => {
                handler.cleanup(self.engine.as_mut());
                info!("Deleted client {name}");
            }
            None => error!("Cannot delete unknown client {name}"),
        }
    }

    fn suspend_all_tracking_sessions(&mut self) {
        let ServiceState { engine, clients, .. } = self;
        for handler in clients.values_mut() {
            // The tracking flag stays set so the session resumes later.
            if handler.tracking {
                handler.stop_tracking(engine.as_mut());
                info!("Suspended tracking for client {}", handler.name());
            }
        }
    }

    fn resume_all_tracking_sessions(&mut self) {
        let ServiceState { engine, clients, .. } = self;
        for handler in clients.values_mut() {
            if handler.tracking {
                if handler.resume_tracking(engine.as_mut()) == 0 {
                    error!("Failed to resume tracking for client {}", handler.name());
                    continue;
                }
                info!("Resumed tracking for client {}", handler.name());
            }
        }
    }

    fn broadcast_capabilities(&mut self, mask: u32) {
        let unreachable: Vec<String> = self
            .clients
            .values_mut()
            .filter_map(|handler| {
                if let Err(e) = handler.on_capabilities(mask) {
                    error!("Failed to send capabilities to {}: {e:#}", handler.name());
                    Some(handler.name().to_string())
                } else {
                    None
                }
            })
            .collect();
        for name in unreachable {
            self.delete_client(&name);
        }
    }
}

impl LocationApiService {
    pub fn new(engine: Box<dyn LocationEngine>, make_sender: Box<SenderFactory>) -> Self {
        LocationApiService {
            state: Mutex::new(ServiceState { engine, clients: HashMap::new(), make_sender }),
        }
    }

    /// Engine glue calls this when the underlying capabilities change; every
    /// registered client gets the new mask.
    pub fn on_capabilities_changed(&self, mask: u32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.broadcast_capabilities(mask);
    }

    /// Drops a client whose connection went away.
    pub fn on_client_hangup(&self, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.delete_client(name);
    }

    pub fn handle(&self, request: LocationRequest) -> Result<LocationResponse> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match request {
            LocationRequest::ClientRegister { client } => {
                state.register_client(&client)?;
            }
            LocationRequest::ClientDeregister { client } => {
                state.client(&client)?;
                state.delete_client(&client);
            }
            LocationRequest::UpdateCallbacks { client, mask } => {
                state.client(&client)?.update_subscription(mask);
                info!("Updated subscription for {client}, mask 0x{mask:x}");
            }
            LocationRequest::StartTracking { client, options } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                if handler.start_tracking(engine.as_mut(), options) == 0 {
                    bail!("Failed to start tracking session for {client}");
                }
                handler.tracking = true;
                info!("Started tracking session for {client}");
            }
            LocationRequest::StopTracking { client } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                handler.tracking = false;
                handler.unsubscribe_location_session_cb();
                handler.stop_tracking(engine.as_mut());
                info!("Stopped tracking session for {client}");
            }
            LocationRequest::UpdateTrackingOptions { client, options } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                handler.update_tracking_options(engine.as_mut(), options);
            }
            LocationRequest::StartBatching { client, options, mode } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                if handler.start_batching(engine.as_mut(), options, mode) == 0 {
                    bail!("Failed to start batching session for {client}");
                }
                handler.batching = true;
                handler.batching_mode = mode;
                info!("Started batching session for {client}");
            }
            LocationRequest::StopBatching { client } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                handler.batching = false;
                handler.batching_mode = engine::BatchingMode::NoAutoReport;
                handler.update_subscription(0);
                handler.stop_batching(engine.as_mut());
                info!("Stopped batching session for {client}");
            }
            LocationRequest::UpdateBatchingOptions { client, options, mode } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                handler.update_batching_options(engine.as_mut(), options, mode);
            }
            LocationRequest::AddGeofences { client, fences } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                let requests: Vec<_> = fences.iter().map(|f| (f.options, f.info)).collect();
                let sessions = engine.add_geofences(&requests);
                if sessions.iter().all(|id| *id == 0) {
                    bail!("Failed to add geofences for {client}");
                }
                let client_ids: Vec<u32> = fences.iter().map(|f| f.client_id).collect();
                handler.set_geofence_ids(&client_ids, &sessions);
                info!("Added {} geofences for {client}", sessions.len());
            }
            LocationRequest::RemoveGeofences { client, client_ids } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                let sessions = handler.session_ids(&client_ids);
                if !sessions.is_empty() {
                    engine.remove_geofences(&sessions);
                    handler.erase_geofence_ids(&client_ids);
                }
            }
            LocationRequest::ModifyGeofences { client, fences } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                let (sessions, options) = handler.sessions_with_options(&fences);
                if !sessions.is_empty() {
                    engine.modify_geofences(&sessions, &options);
                }
            }
            LocationRequest::PauseGeofences { client, client_ids } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                let sessions = handler.session_ids(&client_ids);
                if !sessions.is_empty() {
                    engine.pause_geofences(&sessions);
                }
            }
            LocationRequest::ResumeGeofences { client, client_ids } => {
                let ServiceState { engine, clients, .. } = &mut *state;
                let handler =
                    clients.get_mut(&client).with_context(|| format!("Unknown client {client}"))?;
                let sessions = handler.session_ids(&client_ids);
                if !sessions.is_empty() {
                    engine.resume_geofences(&sessions);
                }
            }
            LocationRequest::PingTest { client } => {
                if let Err(e) = state.client(&client)?.ping() {
                    error!("Ping failed, purging client {client}: {e:#}");
                    state.delete_client(&client);
                    bail!("Client {client} is unreachable");
                }
            }
            LocationRequest::PowerEvent { state: power_state } => {
                info!("Power event: {power_state:?}");
                match power_state {
                    PowerState::Suspend | PowerState::Shutdown => {
                        state.suspend_all_tracking_sessions()
                    }
                    PowerState::Resume => state.resume_all_tracking_sessions(),
                }
            }
        }
        Ok(LocationResponse::Ack)
    }
}

/// One daemon connection. Tracks the client names registered over it so a
/// dropped connection tears their sessions down.
pub struct LocationSession {
    service: Arc<LocationApiService>,
    registered: HashSet<String>,
}

impl LocationSession {
    pub fn new(service: Arc<LocationApiService>) -> Self {
        LocationSession { service, registered: HashSet::new() }
    }
}

impl ipc::ClientSession for LocationSession {
    type Request = LocationRequest;
    type Response = LocationResponse;

    fn handle(&mut self, request: LocationRequest) -> Result<LocationResponse> {
        let registration = match &request {
            LocationRequest::ClientRegister { client } => Some((client.clone(), true)),
            LocationRequest::ClientDeregister { client } => Some((client.clone(), false)),
            _ => None,
        };
        let response = self.service.handle(request)?;
        if let Some((client, registered)) = registration {
            if registered {
                self.registered.insert(client);
            } else {
                self.registered.remove(&client);
            }
        }
        Ok(response)
    }

    fn hangup(&mut self) {
        for client in self.registered.drain() {
            info!("Connection closed, dropping client {client}");
            self.service.on_client_hangup(&client);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine::{
        BatchingMode, GeofenceInfo, GeofenceOptions, SessionId, TrackingOptions,
        CB_GNSS_LOCATION_INFO, CB_SYSTEM_INFO,
    };
    use msg::{GeofenceData, IndicationSender, LocationIndication};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum EngineCall {
        StartTracking(TrackingOptions),
        StopTracking(SessionId),
        UpdateTracking(SessionId, TrackingOptions),
        StartBatching(TrackingOptions, BatchingMode),
        StopBatching(SessionId),
        AddGeofences(usize),
        RemoveGeofences(Vec<SessionId>),
        PauseGeofences(Vec<SessionId>),
        ResumeGeofences(Vec<SessionId>),
        ModifyGeofences(Vec<SessionId>),
    }

    #[derive(Default)]
    struct FakeEngineInner {
        calls: Vec<EngineCall>,
        next_session: SessionId,
        fail_tracking: bool,
    }

    #[derive(Clone, Default)]
    struct FakeEngine(Arc<Mutex<FakeEngineInner>>);

    impl FakeEngine {
        fn new() -> Self {
            let engine = FakeEngine::default();
            engine.0.lock().unwrap().next_session = 100;
            engine
        }

        fn calls(&self) -> std::sync::MutexGuard<'_, FakeEngineInner> {
            self.0.lock().unwrap()
        }
    }

    impl LocationEngine for FakeEngine {
        fn capabilities(&self) -> u32 {
            0xab
        }

        fn start_tracking(&mut self, options: &TrackingOptions) -> SessionId {
            let mut inner = self.0.lock().unwrap();
            inner.calls.push(EngineCall::StartTracking(*options));
            if inner.fail_tracking {
                return 0;
            }
            inner.next_session += 1;
            inner.next_session
        }

        fn stop_tracking(&mut self, session: SessionId) {
            self.0.lock().unwrap().calls.push(EngineCall::StopTracking(session));
        }

        fn update_tracking_options(&mut self, session: SessionId, options: &TrackingOptions) {
            self.0.lock().unwrap().calls.push(EngineCall::UpdateTracking(session, *options));
        }

        fn start_batching(&mut self, options: &TrackingOptions, mode: BatchingMode) -> SessionId {
            let mut inner = self.0.lock().unwrap();
            inner.calls.push(EngineCall::StartBatching(*options, mode));
            inner.next_session += 1;
            inner.next_session
        }

        fn stop_batching(&mut self, session: SessionId) {
            self.0.lock().unwrap().calls.push(EngineCall::StopBatching(session));
        }

        fn update_batching_options(
            &mut self,
            _session: SessionId,
            _options: &TrackingOptions,
            _mode: BatchingMode,
        ) {
        }

        fn add_geofences(
            &mut self,
            fences: &[(GeofenceOptions, GeofenceInfo)],
        ) -> Vec<SessionId> {
            let mut inner = self.0.lock().unwrap();
            inner.calls.push(EngineCall::AddGeofences(fences.len()));
            fences
                .iter()
                .map(|_| {
                    inner.next_session += 1;
                    inner.next_session
                })
                .collect()
        }

        fn remove_geofences(&mut self, sessions: &[SessionId]) {
            self.0.lock().unwrap().calls.push(EngineCall::RemoveGeofences(sessions.to_vec()));
        }

        fn modify_geofences(&mut self, sessions: &[SessionId], _options: &[GeofenceOptions]) {
            self.0.lock().unwrap().calls.push(EngineCall::ModifyGeofences(sessions.to_vec()));
        }

        fn pause_geofences(&mut self, sessions: &[SessionId]) {
            self.0.lock().unwrap().calls.push(EngineCall::PauseGeofences(sessions.to_vec()));
        }

        fn resume_geofences(&mut self, sessions: &[SessionId]) {
            self.0.lock().unwrap().calls.push(EngineCall::ResumeGeofences(sessions.to_vec()));
        }
    }

    #[derive(Clone, Default)]
    struct Inbox {
        messages: Arc<Mutex<Vec<(String, LocationIndication)>>>,
        fail: Arc<AtomicBool>,
    }

    struct InboxSender {
        client: String,
        inbox: Inbox,
    }

    impl IndicationSender for InboxSender {
        fn send(&mut self, indication: &LocationIndication) -> Result<()> {
            if self.inbox.fail.load(Ordering::SeqCst) {
                bail!("peer closed");
            }
            self.inbox.messages.lock().unwrap().push((self.client.clone(), indication.clone()));
            Ok(())
        }
    }

    fn service_with(engine: FakeEngine, inbox: Inbox) -> LocationApiService {
        LocationApiService::new(
            Box::new(engine),
            Box::new(move |name| {
                Ok(Box::new(InboxSender { client: name.to_string(), inbox: inbox.clone() }))
            }),
        )
    }

    fn register(service: &LocationApiService, client: &str) {
        service
            .handle(LocationRequest::ClientRegister { client: client.to_string() })
            .unwrap();
    }

    const OPTIONS: TrackingOptions = TrackingOptions { min_interval_ms: 950, min_distance_m: 0 };

    #[test]
    fn register_pushes_current_capabilities() {
        let inbox = Inbox::default();
        let service = service_with(FakeEngine::new(), inbox.clone());
        register(&service, "lca1");
        let messages = inbox.messages.lock().unwrap();
        assert_eq!(
            *messages,
            vec![("lca1".to_string(), LocationIndication::Capabilities { mask: 0xab })]
        );
    }

    #[test]
    fn requests_from_unknown_clients_are_errors() {
        let service = service_with(FakeEngine::new(), Inbox::default());
        let result = service.handle(LocationRequest::StopTracking { client: "ghost".into() });
        assert!(result.is_err());
        let result = service.handle(LocationRequest::PingTest { client: "ghost".into() });
        assert!(result.is_err());
    }

    #[test]
    fn tracking_interval_is_rounded_to_supported_tbf() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        service
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();
        let inner = engine.calls();
        // 950ms rounds down to the 500ms supported rate.
        assert!(inner.calls.contains(&EngineCall::StartTracking(TrackingOptions {
            min_interval_ms: 500,
            min_distance_m: 0,
        })));
    }

    #[test]
    fn stop_tracking_unsubscribes_session_callbacks() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        service
            .handle(LocationRequest::UpdateCallbacks {
                client: "lca1".into(),
                mask: CB_GNSS_LOCATION_INFO | CB_SYSTEM_INFO,
            })
            .unwrap();
        service
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();
        service.handle(LocationRequest::StopTracking { client: "lca1".into() }).unwrap();

        let state = service.state.lock().unwrap();
        let mask = state.clients["lca1"].subscription_mask();
        // Session callbacks are gone, the system-info subscription survives.
        assert_eq!(mask, CB_SYSTEM_INFO);
        drop(state);
        assert!(engine.calls().calls.contains(&EngineCall::StopTracking(101)));
    }

    #[test]
    fn failed_tracking_start_is_an_error_and_leaves_no_session() {
        let engine = FakeEngine::new();
        engine.calls().fail_tracking = true;
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        let result =
            service.handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS });
        assert!(result.is_err());
        let state = service.state.lock().unwrap();
        assert!(!state.clients["lca1"].tracking);
    }

    #[test]
    fn reregistering_resets_client_state() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        service
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();
        register(&service, "lca1");
        // The old engine session was torn down with the old state.
        assert!(engine.calls().calls.contains(&EngineCall::StopTracking(101)));
        let state = service.state.lock().unwrap();
        assert!(!state.clients["lca1"].tracking);
    }

    #[test]
    fn suspend_stops_sessions_and_resume_restarts_with_preserved_options() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        register(&service, "lca2");
        service
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();

        service.handle(LocationRequest::PowerEvent { state: PowerState::Suspend }).unwrap();
        {
            let state = service.state.lock().unwrap();
            // Still marked tracking so the session resumes.
            assert!(state.clients["lca1"].tracking);
        }
        assert!(engine.calls().calls.contains(&EngineCall::StopTracking(101)));

        service.handle(LocationRequest::PowerEvent { state: PowerState::Resume }).unwrap();
        let inner = engine.calls();
        let starts: Vec<_> = inner
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::StartTracking(_)))
            .collect();
        // One initial start plus one resume, both with the rounded options.
        assert_eq!(starts.len(), 2);
        assert_eq!(
            *starts[1],
            EngineCall::StartTracking(TrackingOptions { min_interval_ms: 500, min_distance_m: 0 })
        );
    }

    #[test]
    fn geofence_ids_are_translated_and_stale_ids_ignored() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        let fence = GeofenceData {
            client_id: 7,
            options: GeofenceOptions { breach_type_mask: 3, responsiveness_ms: 1000 },
            info: GeofenceInfo { latitude: 37.4, longitude: -122.0, radius_m: 50.0 },
        };
        service
            .handle(LocationRequest::AddGeofences { client: "lca1".into(), fences: vec![fence] })
            .unwrap();
        // Client id 7 mapped to engine session 101; 99 was never added.
        service
            .handle(LocationRequest::PauseGeofences {
                client: "lca1".into(),
                client_ids: vec![7, 99],
            })
            .unwrap();
        service
            .handle(LocationRequest::RemoveGeofences {
                client: "lca1".into(),
                client_ids: vec![7],
            })
            .unwrap();
        // Removing again finds nothing and must not reach the engine.
        service
            .handle(LocationRequest::RemoveGeofences {
                client: "lca1".into(),
                client_ids: vec![7],
            })
            .unwrap();

        let inner = engine.calls();
        assert!(inner.calls.contains(&EngineCall::PauseGeofences(vec![101])));
        let removes: Vec<_> = inner
            .calls
            .iter()
            .filter(|c| matches!(c, EngineCall::RemoveGeofences(_)))
            .collect();
        assert_eq!(removes.len(), 1);
        assert_eq!(*removes[0], EngineCall::RemoveGeofences(vec![101]));
    }

    #[test]
    fn stop_batching_clears_subscription_and_mode() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        service
            .handle(LocationRequest::StartBatching {
                client: "lca1".into(),
                options: OPTIONS,
                mode: BatchingMode::Routine,
            })
            .unwrap();
        service.handle(LocationRequest::StopBatching { client: "lca1".into() }).unwrap();

        let state = service.state.lock().unwrap();
        let handler = &state.clients["lca1"];
        assert!(!handler.batching);
        assert_eq!(handler.batching_mode, BatchingMode::NoAutoReport);
        assert_eq!(handler.subscription_mask(), 0);
        drop(state);
        assert!(engine.calls().calls.contains(&EngineCall::StopBatching(101)));
    }

    #[test]
    fn capability_change_reaches_every_client_and_purges_dead_ones() {
        let inbox = Inbox::default();
        let service = service_with(FakeEngine::new(), inbox.clone());
        register(&service, "lca1");
        register(&service, "lca2");
        inbox.messages.lock().unwrap().clear();

        service.on_capabilities_changed(0xff);
        {
            let messages = inbox.messages.lock().unwrap();
            assert_eq!(messages.len(), 2);
            assert!(messages
                .iter()
                .all(|(_, m)| *m == LocationIndication::Capabilities { mask: 0xff }));
        }

        // A dead client is purged on the next broadcast.
        inbox.fail.store(true, Ordering::SeqCst);
        service.on_capabilities_changed(0x1);
        let state = service.state.lock().unwrap();
        assert!(state.clients.is_empty());
    }

    #[test]
    fn failed_ping_purges_the_client() {
        let inbox = Inbox::default();
        let service = service_with(FakeEngine::new(), inbox.clone());
        register(&service, "lca1");
        inbox.fail.store(true, Ordering::SeqCst);
        let result = service.handle(LocationRequest::PingTest { client: "lca1".into() });
        assert!(result.is_err());
        let state = service.state.lock().unwrap();
        assert!(!state.clients.contains_key("lca1"));
    }

    #[test]
    fn hangup_drops_the_client_and_its_sessions() {
        let engine = FakeEngine::new();
        let service = service_with(engine.clone(), Inbox::default());
        register(&service, "lca1");
        service
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();
        service.on_client_hangup("lca1");
        let state = service.state.lock().unwrap();
        assert!(state.clients.is_empty());
        drop(state);
        assert!(engine.calls().calls.contains(&EngineCall::StopTracking(101)));
    }

    #[test]
    fn dropped_connection_tears_down_the_clients_it_registered() {
        use crate::ipc::ClientSession;

        let engine = FakeEngine::new();
        let service = Arc::new(service_with(engine.clone(), Inbox::default()));
        let mut session = LocationSession::new(service.clone());
        session.handle(LocationRequest::ClientRegister { client: "lca1".into() }).unwrap();
        session
            .handle(LocationRequest::StartTracking { client: "lca1".into(), options: OPTIONS })
            .unwrap();
        // A cleanly deregistered client is forgotten by the session.
        session.handle(LocationRequest::ClientRegister { client: "lca2".into() }).unwrap();
        session.handle(LocationRequest::ClientDeregister { client: "lca2".into() }).unwrap();

        session.hangup();
        let state = service.state.lock().unwrap();
        assert!(state.clients.is_empty());
        drop(state);
        assert!(engine.calls().calls.contains(&EngineCall::StopTracking(101)));
    }
}
