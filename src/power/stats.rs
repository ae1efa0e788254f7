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
//! RPM and WLAN low-power stats parsing.

use serde::{Deserialize, Serialize};

pub const RPM_SYSTEM_STAT: &str = "/d/system_stats";
pub const WLAN_POWER_STAT: &str = "/d/wlan0/power_stats";

/* RPM runs at 19.2Mhz. Divide by 19200 for msec */
pub const RPM_CLK: u64 = 19200;

const RPM_STAT_PARAMS: [&str; 2] = ["count", "actual last sleep(msec)"];
const MASTER_STAT_PARAMS: [&str; 2] = ["Accumulated XO duration", "XO Count"];
const XO_VOTERS: [&str; 4] = ["APSS", "MPSS", "ADSP", "SLPI"];

const WLAN_STAT_HEADER: &str = "POWER DEBUG STATS";
const WLAN_STAT_PARAMS: [&str; 4] = [
    "cumulative_sleep_time_ms",
    "cumulative_total_on_time_ms",
    "deep_sleep_enter_counter",
    "last_deep_sleep_enter_tstamp_ms",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub name: String,
    pub total_time_in_msec_voted_for_since_boot: u64,
    pub total_number_of_times_voted_since_boot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSleepState {
    pub name: String,
    pub residency_in_msec_since_boot: u64,
    pub total_transitions: u64,
    pub supported_only_in_suspend: bool,
    pub voters: Vec<Voter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemSleepState {
    pub name: String,
    pub residency_in_msec_since_boot: u64,
    pub total_transitions: u64,
    pub last_entry_timestamp_ms: u64,
    pub supported_only_in_suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemStats {
    pub name: String,
    pub states: Vec<SubsystemSleepState>,
}

/// strtoull-style parse: optional 0x prefix, stops at the first non-digit,
/// empty input reads as 0.
pub(crate) fn parse_stat_value(value: &str) -> u64 {
    let value = value.trim_start();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
        return u64::from_str_radix(&digits, 16).unwrap_or(0);
    }
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().unwrap_or(0)
}

/// Finds the line starting with `label` and collects the named `key: value`
/// parameters from the lines after it. Missing parameters stay 0, matching
/// how the kernel omits stats it has not recorded yet.
fn scan_section(text: &str, label: &str, params: &[&str]) -> Vec<u64> {
    let mut values = vec![0u64; params.len()];
    let mut lines = text.lines();
    if !lines.any(|line| line.trim_start().starts_with(label)) {
        return values;
    }
    let mut read = 0;
    for line in lines {
        if read == params.len() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else { continue };
        let key = key.trim_start();
        if let Some(i) = params.iter().position(|p| *p == key) {
            values[i] = parse_stat_value(value);
            read += 1;
        }
    }
    values
}

/// Parses the RPM system stats dump into the XO_shutdown and VMIN platform
/// sleep states. XO_shutdown carries the four subsystem voters; voter
/// durations are RPM clock ticks and convert to milliseconds here.
pub fn parse_platform_stats(text: &str) -> Vec<PlatformSleepState> {
    let xo = scan_section(text, "RPM Mode:vlow", &RPM_STAT_PARAMS);
    let vmin = scan_section(text, "RPM Mode:vmin", &RPM_STAT_PARAMS);

    let voters = XO_VOTERS
        .iter()
        .map(|name| {
            let values = scan_section(text, name, &MASTER_STAT_PARAMS);
            Voter {
                name: name.to_string(),
                total_time_in_msec_voted_for_since_boot: values[0] / RPM_CLK,
                total_number_of_times_voted_since_boot: values[1],
            }
        })
        .collect();

    vec![
        PlatformSleepState {
            name: "XO_shutdown".to_string(),
            total_transitions: xo[0],
            residency_in_msec_since_boot: xo[1],
            supported_only_in_suspend: false,
            voters,
        },
        PlatformSleepState {
            name: "VMIN".to_string(),
            total_transitions: vmin[0],
            residency_in_msec_since_boot: vmin[1],
            supported_only_in_suspend: false,
            voters: Vec::new(),
        },
    ]
}

/// Parses the WLAN power stats dump into Active and Deep-Sleep states.
pub fn parse_wlan_stats(text: &str) -> SubsystemStats {
    let values = scan_section(text, WLAN_STAT_HEADER, &WLAN_STAT_PARAMS);
    let [sleep_ms, on_ms, deep_sleep_count, last_deep_sleep_ms] =
        [values[0], values[1], values[2], values[3]];
    SubsystemStats {
        name: "wlan".to_string(),
        states: vec![
            SubsystemSleepState {
                name: "Active".to_string(),
                residency_in_msec_since_boot: on_ms,
                total_transitions: deep_sleep_count,
                last_entry_timestamp_ms: 0,
                supported_only_in_suspend: false,
            },
            SubsystemSleepState {
                name: "Deep-Sleep".to_string(),
                residency_in_msec_since_boot: sleep_ms,
                total_transitions: deep_sleep_count,
                last_entry_timestamp_ms: last_deep_sleep_ms,
                supported_only_in_suspend: false,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RPM_DUMP: &str = "\
RPM Mode:vlow
\t count:52
\t total sleep duration(sec):1000
\t actual last sleep(msec):123456
RPM Mode:vmin
\t count:7
\t actual last sleep(msec):4242
APSS
\tVersion:0x1
\tSleep Count:0x34
\tSleep Last Entered At:0x1122
\tSleep Last Exited At:0x3344
\tAccumulated XO duration:0x249f00
\tXO Count:0x10
MPSS
\tAccumulated XO duration:38400
\tXO Count:2
ADSP
\tAccumulated XO duration:0
\tXO Count:0
SLPI
\tAccumulated XO duration:19200
\tXO Count:1
";

    #[test]
    fn rpm_modes_and_voters_are_extracted() {
        let states = parse_platform_stats(RPM_DUMP);
        assert_eq!(states.len(), 2);

        let xo = &states[0];
        assert_eq!(xo.name, "XO_shutdown");
        assert_eq!(xo.total_transitions, 52);
        assert_eq!(xo.residency_in_msec_since_boot, 123456);
        assert_eq!(xo.voters.len(), 4);
        // 0x249f00 ticks = 2400000 / 19200 = 125ms.
        assert_eq!(xo.voters[0].name, "APSS");
        assert_eq!(xo.voters[0].total_time_in_msec_voted_for_since_boot, 125);
        assert_eq!(xo.voters[0].total_number_of_times_voted_since_boot, 0x10);
        assert_eq!(xo.voters[1].total_time_in_msec_voted_for_since_boot, 2);
        assert_eq!(xo.voters[3].name, "SLPI");
        assert_eq!(xo.voters[3].total_time_in_msec_voted_for_since_boot, 1);

        let vmin = &states[1];
        assert_eq!(vmin.name, "VMIN");
        assert_eq!(vmin.total_transitions, 7);
        assert_eq!(vmin.residency_in_msec_since_boot, 4242);
        assert!(vmin.voters.is_empty());
    }

    #[test]
    fn missing_sections_read_as_zero() {
        let states = parse_platform_stats("RPM Mode:vlow\n count:3\n");
        assert_eq!(states[0].total_transitions, 3);
        assert_eq!(states[0].residency_in_msec_since_boot, 0);
        assert_eq!(states[1].total_transitions, 0);
    }

    #[test]
    fn wlan_states_are_extracted() {
        let dump = "\
POWER DEBUG STATS
cumulative_sleep_time_ms: 100200
cumulative_total_on_time_ms: 300400
deep_sleep_enter_counter: 96
last_deep_sleep_enter_tstamp_ms: 7788990
";
        let wlan = parse_wlan_stats(dump);
        assert_eq!(wlan.name, "wlan");
        let active = &wlan.states[0];
        assert_eq!(active.name, "Active");
        assert_eq!(active.residency_in_msec_since_boot, 300400);
        assert_eq!(active.total_transitions, 96);
        assert_eq!(active.last_entry_timestamp_ms, 0);
        let deep = &wlan.states[1];
        assert_eq!(deep.name, "Deep-Sleep");
        assert_eq!(deep.residency_in_msec_since_boot, 100200);
        assert_eq!(deep.last_entry_timestamp_ms, 7788990);
    }

    #[test]
    fn stat_values_parse_like_strtoull() {
        assert_eq!(parse_stat_value(" 123abc"), 123);
        assert_eq!(parse_stat_value("0x1f"), 31);
        assert_eq!(parse_stat_value(""), 0);
        assert_eq!(parse_stat_value("junk"), 0);
    }
}
