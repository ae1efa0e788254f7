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
//! Touch interaction boost with a dedicated release thread.
//!
//! Boost requests coalesce: a request whose deadline falls inside the
//! current boost window is dropped instead of re-acquiring the lock.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::power::perf::{check_handle, PerfLock};

const INTERACTION_BOOST_RES: [i32; 3] = [0x702, 0x20F, 0x30F];

#[derive(Debug, Clone, Copy)]
pub struct BoostConfig {
    /// Settle time in the Waiting phase before the lock is dropped.
    pub wait_ms: u64,
    pub min_duration_ms: i32,
    pub max_duration_ms: i32,
    /// Added to every requested duration before clamping.
    pub pad_ms: i32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self { wait_ms: 100, min_duration_ms: 1400, max_duration_ms: 5650, pad_ms: 650 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Interaction,
    Waiting,
    Exit,
}

struct State {
    phase: Phase,
    duration: Duration,
    boosted_at: Instant,
    handle: i32,
}

struct Inner {
    perf: Arc<dyn PerfLock>,
    config: BoostConfig,
    state: Mutex<State>,
    cond: Condvar,
}

pub struct InteractionHandler {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl InteractionHandler {
    pub fn new(perf: Arc<dyn PerfLock>, config: BoostConfig) -> Self {
        let inner = Arc::new(Inner {
            perf,
            config,
            state: Mutex::new(State {
                phase: Phase::Idle,
                duration: Duration::ZERO,
                boosted_at: Instant::now(),
                handle: 0,
            }),
            cond: Condvar::new(),
        });
        let routine_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("interaction".to_string())
            .spawn(move || routine(routine_inner));
        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("failed to start interaction release thread: {e}");
                None
            }
        };
        Self { inner, thread }
    }

    pub fn acquire(&self, duration_ms: i32) {
        let config = &self.inner.config;
        let padded = duration_ms.saturating_add(config.pad_ms);
        let final_ms = padded.clamp(config.min_duration_ms, config.max_duration_ms);
        let final_duration = Duration::from_millis(final_ms as u64);

        let mut state = self.inner.state.lock().unwrap();
        let now = Instant::now();
        if state.phase != Phase::Idle && final_duration <= state.duration {
            let elapsed = now.duration_since(state.boosted_at);
            if elapsed <= state.duration - final_duration {
                debug!("ignoring {duration_ms}ms interaction, covered by the current boost");
                return;
            }
        }
        state.boosted_at = now;
        state.duration = final_duration;
        if state.phase == Phase::Idle {
            let handle = self.inner.perf.acquire(state.handle, 0, &INTERACTION_BOOST_RES);
            if check_handle(handle) {
                state.handle = handle;
            } else {
                warn!("failed to acquire interaction boost lock");
            }
        }
        state.phase = Phase::Interaction;
        self.inner.cond.notify_all();
    }
}

fn routine(inner: Arc<Inner>) {
    let mut state = inner.state.lock().unwrap();
    loop {
        match state.phase {
            Phase::Exit => break,
            Phase::Idle => {
                state = inner.cond.wait(state).unwrap();
            }
            Phase::Interaction => {
                let deadline = state.boosted_at + state.duration;
                let now = Instant::now();
                if now >= deadline {
                    state.phase = Phase::Waiting;
                    continue;
                }
                let (guard, _) = inner.cond.wait_timeout(state, deadline - now).unwrap();
                state = guard;
            }
            Phase::Waiting => {
                let (guard, timeout) = inner
                    .cond
                    .wait_timeout(state, Duration::from_millis(inner.config.wait_ms))
                    .unwrap();
                state = guard;
                if timeout.timed_out() && state.phase == Phase::Waiting {
                    inner.perf.release(state.handle);
                    state.phase = Phase::Idle;
                }
            }
        }
    }
}

impl Drop for InteractionHandler {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.phase = Phase::Exit;
            self.inner.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
