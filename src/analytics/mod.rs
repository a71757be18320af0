//! Analytics module - usage rollups and recommendations

mod usage;

pub use usage::*;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AnalyticsConfig;
use crate::core::{MachineState, UsageSession};

/// Everything `--report` prints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub generated_at: DateTime<Utc>,
    pub window_days: u32,
    pub machines: Vec<MachineState>,
    pub available_machines: Vec<MachineState>,
    pub usage: UsageStatistics,
    pub best_times: BestTimes,
    pub hourly_availability: Vec<HourlyAvailability>,
}

/// Roll up sessions that started within the configured window before `now`
pub fn build_report(
    states: &[MachineState],
    sessions: &[UsageSession],
    config: &AnalyticsConfig,
    now: DateTime<Utc>,
) -> UsageReport {
    let since = now - Duration::days(config.window_days as i64);
    let window: Vec<UsageSession> = sessions
        .iter()
        .filter(|s| s.start_time >= since && !s.is_open())
        .cloned()
        .collect();

    UsageReport {
        generated_at: now,
        window_days: config.window_days,
        machines: states.to_vec(),
        available_machines: available_machines(states),
        usage: usage_statistics(&window, config.busiest_slots),
        best_times: best_times(&window, config.recommended_slots, config.window_days),
        hourly_availability: hourly_availability(&window, states.len(), config.window_days),
    }
}
