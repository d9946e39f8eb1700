//! Poll timers.
//!
//! One interval task per pipeline (statuses, direct messages), each sending
//! a tick command into the engine. The engine decides which sessions are
//! eligible when the tick is processed; the timers know nothing about
//! sessions, so a slow cycle never stacks fetches.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::session::CursorKind;
use crate::session::handle::EngineHandle;

/// The two interval tasks. Dropping the struct does not stop them; they end
/// on the shutdown signal or when the engine goes away.
pub struct Poller {
    tasks: Vec<JoinHandle<()>>,
}

impl Poller {
    /// Start both timers. Intervals are independent; either may be much
    /// longer than the other.
    pub fn spawn(
        engine: EngineHandle,
        status_interval: Duration,
        dm_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let tasks = vec![
            tokio::spawn(tick_loop(
                engine.clone(),
                CursorKind::Status,
                status_interval,
                shutdown.clone(),
            )),
            tokio::spawn(tick_loop(
                engine,
                CursorKind::DirectMessage,
                dm_interval,
                shutdown,
            )),
        ];
        Poller { tasks }
    }

    /// Wait for both timer tasks to finish.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn tick_loop(
    engine: EngineHandle,
    kind: CursorKind,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    // First tick after one full period, not immediately: login already
    // schedules the initial roster fetch, and a burst at startup would land
    // before sessions exist anyway.
    let mut interval = time::interval_at(time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(kind = %kind, period_secs = period.as_secs(), "Poll timer started");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                if engine.poll_tick(kind).await.is_err() {
                    debug!(kind = %kind, "Engine gone, stopping poll timer");
                    break;
                }
            }
        }
    }
    info!(kind = %kind, "Poll timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    use crate::session::events::EngineCommand;

    #[tokio::test(start_paused = true)]
    async fn ticks_arrive_at_the_configured_period() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = EngineHandle::new(tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let _poller = Poller::spawn(
            engine,
            Duration::from_secs(60),
            Duration::from_secs(90),
            shutdown_rx,
        );

        // 3 minutes in small steps so every scheduled tick fires on time:
        // three status ticks, two direct-message ticks.
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(30)).await;
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
        }

        let mut status = 0;
        let mut dm = 0;
        while let Ok(command) = rx.try_recv() {
            match command {
                EngineCommand::PollTick {
                    kind: CursorKind::Status,
                } => status += 1,
                EngineCommand::PollTick {
                    kind: CursorKind::DirectMessage,
                } => dm += 1,
                other => panic!("unexpected command {other:?}"),
            }
        }
        assert_eq!(status, 3);
        assert_eq!(dm, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_timers() {
        let (tx, mut rx) = mpsc::channel(8);
        let engine = EngineHandle::new(tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poller = Poller::spawn(
            engine,
            Duration::from_secs(60),
            Duration::from_secs(60),
            shutdown_rx,
        );

        shutdown_tx.send(true).ok();
        poller.join().await;

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
