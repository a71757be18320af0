// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/spinwatch

//! Usage rollups over closed sessions. Hours are UTC start hours.

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::core::{MachineState, UsageSession};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourCount {
    pub hour: u32,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStatistics {
    pub total_sessions: usize,
    /// Mean duration in whole seconds
    pub average_duration: i64,
    pub total_usage_time: i64,
    /// Busiest start hours, most sessions first
    pub busiest_hours: Vec<HourCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub hour: u32,
    /// "HH:00 - HH:00"
    pub time_range: String,
    pub usage_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestTimes {
    pub recommended_times: Vec<TimeSlot>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyAvailability {
    pub hour: u32,
    pub time_range: String,
    pub avg_available: f64,
    pub avg_in_use: f64,
}

pub fn time_range(hour: u32) -> String {
    format!("{:02}:00 - {:02}:00", hour, (hour + 1) % 24)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Closed sessions per start hour
fn hour_histogram(sessions: &[UsageSession]) -> [usize; 24] {
    let mut counts = [0usize; 24];
    for session in sessions.iter().filter(|s| !s.is_open()) {
        counts[session.start_time.hour() as usize] += 1;
    }
    counts
}

pub fn usage_statistics(sessions: &[UsageSession], busiest_slots: usize) -> UsageStatistics {
    let closed: Vec<&UsageSession> = sessions.iter().filter(|s| !s.is_open()).collect();
    if closed.is_empty() {
        return UsageStatistics {
            total_sessions: 0,
            average_duration: 0,
            total_usage_time: 0,
            busiest_hours: Vec::new(),
        };
    }

    let total_usage_time: i64 = closed.iter().filter_map(|s| s.duration_secs).sum();

    let mut busiest: Vec<HourCount> = hour_histogram(sessions)
        .iter()
        .enumerate()
        .filter(|&(_, &count)| count > 0)
        .map(|(hour, &count)| HourCount { hour: hour as u32, count })
        .collect();
    // Stable sort keeps earlier hours first among ties
    busiest.sort_by(|a, b| b.count.cmp(&a.count));
    busiest.truncate(busiest_slots);

    UsageStatistics {
        total_sessions: closed.len(),
        average_duration: total_usage_time / closed.len() as i64,
        total_usage_time,
        busiest_hours: busiest,
    }
}

/// The `slots` quietest start hours, listed in clock order
pub fn best_times(sessions: &[UsageSession], slots: usize, days: u32) -> BestTimes {
    let counts = hour_histogram(sessions);

    if counts.iter().all(|&c| c == 0) {
        return BestTimes {
            recommended_times: (0..24)
                .map(|hour| TimeSlot { hour, time_range: time_range(hour), usage_count: 0 })
                .collect(),
            message: "No historical data available. All times are equally good.".to_string(),
        };
    }

    let mut hours: Vec<u32> = (0..24).collect();
    hours.sort_by_key(|&h| counts[h as usize]);
    hours.truncate(slots);
    hours.sort_unstable();

    BestTimes {
        recommended_times: hours
            .into_iter()
            .map(|hour| TimeSlot {
                hour,
                time_range: time_range(hour),
                usage_count: counts[hour as usize],
            })
            .collect(),
        message: format!("These are the least busy times based on the last {} days of data.", days),
    }
}

/// Average machines in use and free for each hour of the day
pub fn hourly_availability(sessions: &[UsageSession], machine_count: usize, days: u32) -> Vec<HourlyAvailability> {
    let counts = hour_histogram(sessions);

    (0..24u32)
        .map(|hour| {
            let avg_in_use = if days > 0 {
                counts[hour as usize] as f64 / days as f64
            } else {
                0.0
            };
            let avg_available = (machine_count as f64 - avg_in_use).max(0.0);

            HourlyAvailability {
                hour,
                time_range: time_range(hour),
                avg_available: round1(avg_available),
                avg_in_use: round1(avg_in_use),
            }
        })
        .collect()
}

pub fn available_machines(states: &[MachineState]) -> Vec<MachineState> {
    states.iter().filter(|m| !m.is_running).cloned().collect()
}
