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
//! Kernel input-event plumbing shared by the sensor shims.

pub mod proximity;

use std::io::Read;

use anyhow::{bail, Context, Result};
use log::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const EV_SYN: u16 = 0x00;
pub const EV_ABS: u16 = 0x03;

pub const SYN_REPORT: u16 = 0;
pub const SYN_DROPPED: u16 = 3;

pub const ABS_WHEEL: u16 = 0x08;
pub const ABS_GAS: u16 = 0x09;
pub const ABS_HAT0X: u16 = 0x10;
pub const ABS_HAT0Y: u16 = 0x11;
pub const ABS_HAT1X: u16 = 0x12;
pub const ABS_HAT1Y: u16 = 0x13;
pub const ABS_HAT2X: u16 = 0x14;
pub const ABS_HAT2Y: u16 = 0x15;
pub const ABS_HAT3X: u16 = 0x16;
pub const ABS_HAT3Y: u16 = 0x17;
pub const ABS_PRESSURE: u16 = 0x18;
pub const ABS_DISTANCE: u16 = 0x19;

/// struct input_event as the 64-bit kernel lays it out.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable)]
#[repr(C)]
pub struct InputEvent {
    pub tv_sec: i64,
    pub tv_usec: i64,
    pub event_type: u16,
    pub code: u16,
    pub value: i32,
}

pub const INPUT_EVENT_SIZE: usize = std::mem::size_of::<InputEvent>();

impl InputEvent {
    pub fn timestamp_ns(&self) -> i64 {
        self.tv_sec * 1_000_000_000 + self.tv_usec * 1_000
    }
}

/// Buffers reads from an event device so partial records survive until the
/// rest arrives. std::io::BufReader can't be used because it provides no way
/// to read more bytes when only a partial event has been read.
pub struct EventBuffer<R: Read + Send + Sync> {
    buf: [u8; 4096],
    size: usize,
    reader: R,
}

impl<R: Read + Send + Sync> EventBuffer<R> {
    pub fn new(reader: R) -> EventBuffer<R> {
        EventBuffer { buf: [0u8; 4096], size: 0, reader }
    }

    /// Reads available bytes from the underlying reader.
    pub fn read_ahead(&mut self) -> Result<()> {
        if self.size == self.buf.len() {
            bail!("Event buffer is full");
        }
        let read = self.reader.read(&mut self.buf[self.size..]).context("Failed to read events")?;
        trace!("Read {} bytes", read);
        if read == 0 {
            bail!("Event source closed");
        }
        self.size += read;
        Ok(())
    }

    /// Returns a slice with the available bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// Remove consumed bytes from the buffer, making more space for future
    /// reads.
    pub fn consume(&mut self, count: usize) {
        self.buf.copy_within(count..self.size, 0);
        self.size -= count;
    }
}
