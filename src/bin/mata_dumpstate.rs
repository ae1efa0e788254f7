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
//! Dumpstate HAL daemon.

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;

use mata_hal::dumpstate::{DumpstateService, DUMPSTATE_SOCKET_NAME};
use mata_hal::ipc;

/// Dumpstate HAL server.
#[derive(Parser, Debug)]
#[command(about = None, long_about = None)]
struct Args {
    /// Log verbosity, one of Off, Error, Warning, Info, Debug, Trace.
    #[arg(short, long, default_value_t = String::from("Info"))]
    verbosity: String,
}

fn init_logging(verbosity: &str) -> Result<()> {
    env_logger::builder()
        .format_timestamp_secs()
        .filter_level(
            LevelFilter::from_str(verbosity)
                .with_context(|| format!("Invalid log level: {}", verbosity))?,
        )
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.verbosity)?;

    let service = DumpstateService::default();
    ipc::serve(DUMPSTATE_SOCKET_NAME, move |request| service.handle(request))
}
