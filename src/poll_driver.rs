use std::time::Duration;

use tracing::{debug, info};

use crate::request::ActorHandle;

/// Background task enqueueing `Request::Poll` onto the actor's queue at a
/// fixed cadence. The broker needs periodic polls to maintain group
/// membership and heartbeats even when nothing is being fetched, so this
/// runs independently of demand — see `Actor::handle_poll`'s no-demand path.
///
/// Exits once the actor's queue is closed, i.e. the last `ActorHandle` (and
/// the actor itself) has been dropped.
pub fn spawn_poll_driver(handle: ActorHandle, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(?interval, "poll driver started");
        loop {
            ticker.tick().await;
            if handle.poll().is_err() {
                debug!("poll driver stopping: actor queue closed");
                break;
            }
        }
    })
}
