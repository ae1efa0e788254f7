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
//! Perflock client seam.

use log::info;

/// Vendor perflock acquire/release interface.
pub trait PerfLock: Send + Sync {
    /// Acquires (or refreshes, when `handle` is a live handle) a perflock
    /// for `duration_ms` milliseconds over the given resource opcodes.
    /// A duration of 0 holds the lock until release. Returns the handle,
    /// or -1 on failure.
    fn acquire(&self, handle: i32, duration_ms: i32, resources: &[i32]) -> i32;

    fn release(&self, handle: i32);
}

/// Handle handed out by the perfd client stub.
pub const STUB_HANDLE: i32 = 233;

/// Stand-in for the vendor perfd client: logs the request and hands out a
/// fixed handle.
pub struct StubPerfLock;

impl PerfLock for StubPerfLock {
    fn acquire(&self, handle: i32, duration_ms: i32, resources: &[i32]) -> i32 {
        info!(
            "perf_lock_acq: handle: {handle}, duration: {duration_ms}, resources: {resources:#x?}"
        );
        if handle > 0 {
            handle
        } else {
            STUB_HANDLE
        }
    }

    fn release(&self, handle: i32) {
        info!("perf_lock_rel: handle: {handle}");
    }
}

pub fn check_handle(handle: i32) -> bool {
    handle > 0 && handle != -1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_mints_and_then_reuses_a_handle() {
        let perf = StubPerfLock;
        let handle = perf.acquire(0, 0, &[0x702]);
        assert_eq!(handle, STUB_HANDLE);
        assert_eq!(perf.acquire(handle, 100, &[0x702]), handle);
        assert!(check_handle(handle));
        assert!(!check_handle(-1));
        assert!(!check_handle(0));
    }
}
