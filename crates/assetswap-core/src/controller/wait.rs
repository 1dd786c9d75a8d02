use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

use crate::domain::WaitOutcome;
use crate::server::OnceFlag;

/// Poll `flag` every `poll` until it is set or `limit` has elapsed.
pub async fn wait_for_confirmation(flag: &OnceFlag, limit: Duration, poll: Duration) -> WaitOutcome {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if flag.is_set() {
            return WaitOutcome::Confirmed;
        }
        if started.elapsed() >= limit {
            return WaitOutcome::TimedOut;
        }
    }
}
