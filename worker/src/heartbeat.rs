use std::time::Duration;

use hikibridge_core::{cancel::CancellationToken, HEARTBEAT_MARKER};

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

pub fn heartbeat_line(iteration: u64) -> String {
    format!("{} {}", HEARTBEAT_MARKER, iteration)
}

/// Log the heartbeat line once per `period` until cancelled. Return the last
/// iteration number.
pub fn beat(cancel: &CancellationToken, period: Duration) -> u64 {
    let mut iteration = 0;
    loop {
        iteration += 1;
        log::info!("{}", heartbeat_line(iteration));
        if !cancel.sleep_unless(period, |cancel| cancel.is_cancelled()) {
            break;
        }
    }
    iteration
}
