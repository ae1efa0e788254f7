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
//! Power-entity state residency aggregation.
//!
//! Entities are registered once at startup; each is backed by a residency
//! data provider that re-reads its stats file per query.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::power::stats::{self, parse_stat_value, RPM_CLK};
use crate::sysfs;

pub const POWER_STATS_SOCKET_NAME: &str = "mata_power_stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerEntityType {
    PowerDomain,
    Subsystem,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntityInfo {
    pub id: u32,
    pub name: String,
    pub entity_type: PowerEntityType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntityStateInfo {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntityStateSpace {
    pub entity_id: u32,
    pub states: Vec<PowerEntityStateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResidencyData {
    pub state_id: u32,
    pub total_time_in_ms: u64,
    pub total_state_entry_count: u64,
    pub last_entry_timestamp_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResidencyResult {
    pub entity_id: u32,
    pub state_residency_data: Vec<StateResidencyData>,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PowerStatsRequest {
    GetPowerEntityInfo,
    GetPowerEntityStateInfo,
    /// Empty `entity_ids` selects every registered entity.
    GetPowerEntityStateResidencyData { entity_ids: Vec<u32> },
}

#[derive(Debug, Serialize, Deserialize)]
pub enum PowerStatsResponse {
    EntityInfo(Vec<PowerEntityInfo>),
    StateInfo(Vec<PowerEntityStateSpace>),
    ResidencyData(Vec<StateResidencyResult>),
}

pub trait StateResidencyDataProvider: Send + Sync {
    fn get_state_spaces(&self) -> Vec<PowerEntityStateSpace>;

    /// Residency results keyed by entity id. A read failure fails the whole
    /// provider; the service drops its entities from the response.
    fn get_results(&self) -> Result<HashMap<u32, StateResidencyResult>>;
}

/// Per-state extraction rules for [`GenericStateResidencyDataProvider`].
#[derive(Clone)]
pub struct StateResidencyConfig {
    pub name: &'static str,
    /// Line the state's block starts at; `None` means the block starts at
    /// the entity header.
    pub header: Option<&'static str>,
    pub entry_count_prefix: Option<&'static str>,
    pub total_time_prefix: Option<&'static str>,
    pub total_time_transform: Option<fn(u64) -> u64>,
    pub last_entry_prefix: Option<&'static str>,
}

pub struct PowerEntityConfig {
    /// Line the entity's block starts at; `None` starts at the top of the
    /// file (state headers carry the structure instead).
    pub header: Option<&'static str>,
    pub states: Vec<StateResidencyConfig>,
}

/// Scans a stats dump for an entity header line, then pulls each state's
/// entry count / total time / last entry by line prefix.
pub struct GenericStateResidencyDataProvider {
    path: PathBuf,
    entities: Vec<(u32, PowerEntityConfig)>,
}

fn find_line(lines: &[&str], from: usize, needle: &str) -> Option<usize> {
    lines[from..]
        .iter()
        .position(|line| line.trim_start().starts_with(needle))
        .map(|i| from + i)
}

fn value_after(lines: &[&str], from: usize, prefix: &str) -> Option<u64> {
    lines[from..]
        .iter()
        .find_map(|line| line.trim_start().strip_prefix(prefix))
        .map(parse_stat_value)
}

impl GenericStateResidencyDataProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), entities: Vec::new() }
    }

    pub fn add_entity(&mut self, id: u32, config: PowerEntityConfig) {
        self.entities.push((id, config));
    }

    fn parse_entity(
        lines: &[&str],
        config: &PowerEntityConfig,
    ) -> Option<Vec<StateResidencyData>> {
        let mut pos = match config.header {
            Some(header) => find_line(lines, 0, header)? + 1,
            None => 0,
        };
        let mut data = Vec::with_capacity(config.states.len());
        for (state_id, state) in config.states.iter().enumerate() {
            if let Some(header) = state.header {
                pos = find_line(lines, pos, header)? + 1;
            }
            let entry_count = match state.entry_count_prefix {
                Some(prefix) => value_after(lines, pos, prefix)?,
                None => 0,
            };
            let total_time = match state.total_time_prefix {
                Some(prefix) => {
                    let raw = value_after(lines, pos, prefix)?;
                    state.total_time_transform.map_or(raw, |f| f(raw))
                }
                None => 0,
            };
            let last_entry = match state.last_entry_prefix {
                Some(prefix) => value_after(lines, pos, prefix)?,
                None => 0,
            };
            data.push(StateResidencyData {
                state_id: state_id as u32,
                total_time_in_ms: total_time,
                total_state_entry_count: entry_count,
                last_entry_timestamp_ms: last_entry,
            });
        }
        Some(data)
    }
}

impl StateResidencyDataProvider for GenericStateResidencyDataProvider {
    fn get_state_spaces(&self) -> Vec<PowerEntityStateSpace> {
        self.entities
            .iter()
            .map(|(id, config)| PowerEntityStateSpace {
                entity_id: *id,
                states: config
                    .states
                    .iter()
                    .enumerate()
                    .map(|(i, s)| PowerEntityStateInfo { id: i as u32, name: s.name.to_string() })
                    .collect(),
            })
            .collect()
    }

    fn get_results(&self) -> Result<HashMap<u32, StateResidencyResult>> {
        let text = sysfs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let lines: Vec<&str> = text.lines().collect();
        let mut results = HashMap::new();
        for (id, config) in &self.entities {
            match Self::parse_entity(&lines, config) {
                Some(data) => {
                    results
                        .insert(*id, StateResidencyResult { entity_id: *id, state_residency_data: data });
                }
                None => warn!("entity {id} missing from {}", self.path.display()),
            }
        }
        Ok(results)
    }
}

/// WLAN driver `key: value` power stats.
pub struct WlanStateResidencyDataProvider {
    entity_id: u32,
    path: PathBuf,
}

impl WlanStateResidencyDataProvider {
    pub fn new(entity_id: u32, path: impl Into<PathBuf>) -> Self {
        Self { entity_id, path: path.into() }
    }
}

impl StateResidencyDataProvider for WlanStateResidencyDataProvider {
    fn get_state_spaces(&self) -> Vec<PowerEntityStateSpace> {
        vec![PowerEntityStateSpace {
            entity_id: self.entity_id,
            states: vec![
                PowerEntityStateInfo { id: 0, name: "Active".to_string() },
                PowerEntityStateInfo { id: 1, name: "Deep-Sleep".to_string() },
            ],
        }]
    }

    fn get_results(&self) -> Result<HashMap<u32, StateResidencyResult>> {
        let text = sysfs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let wlan = stats::parse_wlan_stats(&text);
        let data = wlan
            .states
            .iter()
            .enumerate()
            .map(|(i, state)| StateResidencyData {
                state_id: i as u32,
                total_time_in_ms: state.residency_in_msec_since_boot,
                total_state_entry_count: state.total_transitions,
                last_entry_timestamp_ms: state.last_entry_timestamp_ms,
            })
            .collect();
        let mut results = HashMap::new();
        results.insert(
            self.entity_id,
            StateResidencyResult { entity_id: self.entity_id, state_residency_data: data },
        );
        Ok(results)
    }
}

pub struct PowerStatsService {
    entities: Vec<PowerEntityInfo>,
    providers: Vec<Box<dyn StateResidencyDataProvider>>,
}

fn rpm_ticks_to_ms(ticks: u64) -> u64 {
    ticks / RPM_CLK
}

impl PowerStatsService {
    pub fn empty() -> Self {
        Self { entities: Vec::new(), providers: Vec::new() }
    }

    /// The board's entity set: the four RPM subsystem voters, the SoC sleep
    /// modes and WLAN.
    pub fn for_board(rpm_stats_file: impl Into<PathBuf>, wlan_stats_file: impl Into<PathBuf>) -> Self {
        let rpm_stats_file: PathBuf = rpm_stats_file.into();
        let mut service = Self::empty();

        let voter_states = |header: Option<&'static str>| StateResidencyConfig {
            name: "XO_shutdown",
            header,
            entry_count_prefix: Some("XO Count:"),
            total_time_prefix: Some("Accumulated XO duration:"),
            total_time_transform: Some(rpm_ticks_to_ms as fn(u64) -> u64),
            last_entry_prefix: None,
        };

        let mut rpm = GenericStateResidencyDataProvider::new(rpm_stats_file.clone());
        for name in ["APSS", "MPSS", "ADSP", "SLPI"] {
            let id = service.add_power_entity(name, PowerEntityType::Subsystem);
            rpm.add_entity(
                id,
                PowerEntityConfig { header: Some(name), states: vec![voter_states(None)] },
            );
        }
        service.add_provider(Box::new(rpm));

        let soc_state = |name: &'static str, header: &'static str| StateResidencyConfig {
            name,
            header: Some(header),
            entry_count_prefix: Some("count:"),
            total_time_prefix: Some("actual last sleep(msec):"),
            total_time_transform: None,
            last_entry_prefix: None,
        };
        let mut soc = GenericStateResidencyDataProvider::new(rpm_stats_file.clone());
        let soc_id = service.add_power_entity("SoC", PowerEntityType::PowerDomain);
        soc.add_entity(
            soc_id,
            PowerEntityConfig {
                header: None,
                states: vec![
                    soc_state("XO_shutdown", "RPM Mode:vlow"),
                    soc_state("VMIN", "RPM Mode:vmin"),
                ],
            },
        );
        service.add_provider(Box::new(soc));

        let wlan_id = service.add_power_entity("WLAN", PowerEntityType::Subsystem);
        service.add_provider(Box::new(WlanStateResidencyDataProvider::new(
            wlan_id,
            wlan_stats_file,
        )));

        service
    }

    pub fn add_power_entity(&mut self, name: &str, entity_type: PowerEntityType) -> u32 {
        let id = self.entities.len() as u32;
        self.entities.push(PowerEntityInfo { id, name: name.to_string(), entity_type });
        id
    }

    pub fn add_provider(&mut self, provider: Box<dyn StateResidencyDataProvider>) {
        self.providers.push(provider);
    }

    pub fn get_power_entity_info(&self) -> Vec<PowerEntityInfo> {
        self.entities.clone()
    }

    pub fn get_power_entity_state_info(&self) -> Vec<PowerEntityStateSpace> {
        self.providers.iter().flat_map(|p| p.get_state_spaces()).collect()
    }

    pub fn get_power_entity_state_residency_data(
        &self,
        entity_ids: &[u32],
    ) -> Vec<StateResidencyResult> {
        let mut merged = HashMap::new();
        for provider in &self.providers {
            match provider.get_results() {
                Ok(results) => merged.extend(results),
                Err(e) => warn!("residency provider failed: {e:#}"),
            }
        }
        let mut results: Vec<StateResidencyResult> = merged
            .into_values()
            .filter(|r| entity_ids.is_empty() || entity_ids.contains(&r.entity_id))
            .collect();
        results.sort_by_key(|r| r.entity_id);
        results
    }

    pub fn handle(&self, request: PowerStatsRequest) -> Result<PowerStatsResponse> {
        match request {
            PowerStatsRequest::GetPowerEntityInfo => {
                Ok(PowerStatsResponse::EntityInfo(self.get_power_entity_info()))
            }
            PowerStatsRequest::GetPowerEntityStateInfo => {
                Ok(PowerStatsResponse::StateInfo(self.get_power_entity_state_info()))
            }
            PowerStatsRequest::GetPowerEntityStateResidencyData { entity_ids } => {
                Ok(PowerStatsResponse::ResidencyData(
                    self.get_power_entity_state_residency_data(&entity_ids),
                ))
            }
        }
    }
}

impl Default for PowerStatsService {
    fn default() -> Self {
        Self::for_board(stats::RPM_SYSTEM_STAT, stats::WLAN_POWER_STAT)
    }
}
