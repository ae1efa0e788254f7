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
//! Helpers for reading and writing kernel sysfs nodes.

use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::warn;

/// Reads a sysfs node and returns its contents with trailing whitespace
/// removed.
pub fn read(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let buf = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(buf.trim().to_string())
}

/// Reads a sysfs node and parses it as a single value.
pub fn read_parsed<T>(path: impl AsRef<Path>) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let path = path.as_ref();
    let buf = read(path)?;
    buf.parse().with_context(|| format!("Failed to parse '{}' from {}", buf, path.display()))
}

/// Writes a value to a sysfs node.
pub fn write(path: impl AsRef<Path>, value: impl Display) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, value.to_string()).with_context(|| format!("Failed to write {}", path.display()))
}

/// Writes a value to a sysfs node, logging a warning instead of failing.
/// Used where the contract does not allow reporting node-level errors.
pub fn write_best_effort(path: impl AsRef<Path>, value: impl Display) {
    let path = path.as_ref();
    if let Err(e) = write(path, &value) {
        warn!("failed to write {} to {}: {:#}", value, path.display(), e);
    }
}
