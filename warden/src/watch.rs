//! Interval loop for `warden watch`.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info};

use crate::cycle::{CycleDeps, CycleReport, run_cycle};
use crate::io::config::WardenConfig;
use crate::io::health::HealthPinger;
use crate::io::notify::Notifier;
use crate::io::supervisor::Supervisor;
use crate::io::test_gate::TestRunner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Run the first cycle right away instead of after one interval.
    pub immediate: bool,
    /// Stop after this many cycles. `None` runs until an error.
    pub max_cycles: Option<u64>,
}

/// Summary of a bounded watch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOutcome {
    pub cycles_run: u64,
    pub restarts: u64,
    pub relaunches: u64,
    /// Cycles that ended with the process not online.
    pub unhealthy_cycles: u64,
}

/// Sleep the configured interval, run a cycle, repeat.
///
/// `sleep` is injected so tests can run many cycles without waiting. The loop
/// only stops early on persistence errors; everything else is recorded per cycle.
pub fn run_watch<S, H, N, T, Z, F>(
    process: &str,
    cfg: &WardenConfig,
    deps: &CycleDeps<'_, S, H, N, T>,
    opts: WatchOptions,
    mut sleep: Z,
    mut on_cycle: F,
) -> Result<WatchOutcome>
where
    S: Supervisor,
    H: HealthPinger,
    N: Notifier,
    T: TestRunner,
    Z: FnMut(Duration),
    F: FnMut(&CycleReport),
{
    let interval = cfg.interval();
    info!(
        process,
        interval_secs = interval.as_secs(),
        immediate = opts.immediate,
        max_cycles = ?opts.max_cycles,
        "watch started"
    );

    let mut outcome = WatchOutcome {
        cycles_run: 0,
        restarts: 0,
        relaunches: 0,
        unhealthy_cycles: 0,
    };
    loop {
        if let Some(max) = opts.max_cycles
            && outcome.cycles_run >= max
        {
            info!(cycles = outcome.cycles_run, "max cycles reached");
            return Ok(outcome);
        }

        if outcome.cycles_run > 0 || !opts.immediate {
            debug!(secs = interval.as_secs(), "sleeping until next cycle");
            sleep(interval);
        }

        let report = run_cycle(process, cfg, deps)?;
        outcome.cycles_run += 1;
        if report.restarted {
            outcome.restarts += 1;
        }
        if report.relaunched {
            outcome.relaunches += 1;
        }
        if !report.is_online() {
            outcome.unhealthy_cycles += 1;
        }
        on_cycle(&report);
    }
}
