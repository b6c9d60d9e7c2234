//! Operator profiling pass
//!
//! Runs a short fixed schedule after the measured loop: `wait` idle steps,
//! `warmup` steps with capture off, then `active` captured steps. The captured
//! operator table never feeds back into the latency summary.

use std::collections::HashMap;

use tracing::{info, warn};

use super::BenchmarkRunner;
use crate::error::{ExternalContext, Result};
use crate::provider::{CausalLm, OpTiming, TextTokenizer};

/// Phase of a profiling step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilePhase {
    /// Step runs, nothing is recorded
    Wait,
    /// Step runs to warm the profiler, nothing is kept
    Warmup,
    /// Step is captured
    Active,
}

/// Step schedule of the profiling pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileSchedule {
    /// Idle steps
    pub wait: usize,
    /// Warm-up steps
    pub warmup: usize,
    /// Captured steps
    pub active: usize,
}

impl Default for ProfileSchedule {
    fn default() -> Self {
        Self {
            wait: 1,
            warmup: 3,
            active: 1,
        }
    }
}

impl ProfileSchedule {
    /// Total number of steps
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.wait + self.warmup + self.active
    }

    /// Phase of the given step
    #[must_use]
    pub fn phase(&self, step: usize) -> ProfilePhase {
        if step < self.wait {
            ProfilePhase::Wait
        } else if step < self.wait + self.warmup {
            ProfilePhase::Warmup
        } else {
            ProfilePhase::Active
        }
    }
}

/// Merge rows by operator name and sort by self time, largest first
#[must_use]
pub fn key_averages(timings: Vec<OpTiming>) -> Vec<OpTiming> {
    let mut merged: HashMap<String, OpTiming> = HashMap::new();
    for row in timings {
        merged
            .entry(row.name.clone())
            .and_modify(|acc| {
                acc.self_time += row.self_time;
                acc.total_time += row.total_time;
                acc.calls += row.calls;
            })
            .or_insert(row);
    }
    let mut table: Vec<OpTiming> = merged.into_values().collect();
    table.sort_by(|a, b| b.self_time.cmp(&a.self_time).then_with(|| a.name.cmp(&b.name)));
    table
}

/// Run the profiling schedule and return the captured operator table
///
/// Returns `Ok(None)` without running anything when the model cannot
/// capture operator timings.
///
/// # Errors
///
/// Propagates any collaborator failure.
pub fn run_profile_pass<M: CausalLm, T: TextTokenizer>(
    runner: &mut BenchmarkRunner<'_, M, T>,
    schedule: ProfileSchedule,
) -> Result<Option<Vec<OpTiming>>> {
    if !runner.model_mut().capabilities().profiling {
        warn!("model does not support operator profiling, skipping profile pass");
        return Ok(None);
    }

    info!(steps = schedule.total_steps(), "running profile pass");
    let mut captured = Vec::new();
    for step in 0..schedule.total_steps() {
        let active = schedule.phase(step) == ProfilePhase::Active;
        if active {
            runner.model_mut().set_op_capture(true).during("profiler start")?;
        }
        runner.run_iteration(step, true)?;
        if active {
            let model = runner.model_mut();
            model.set_op_capture(false).during("profiler stop")?;
            captured.extend(model.take_op_timings().during("profiler collect")?);
        }
    }

    Ok(Some(key_averages(captured)))
}
