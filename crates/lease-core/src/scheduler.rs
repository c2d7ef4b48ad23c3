use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::worker::Command;

/// Chains maintenance cycles: the next one is requested only after the
/// previous one has finished, then `interval` later.
///
/// A slow store therefore stretches the period instead of piling up cycles.
pub(crate) async fn run(queue: mpsc::UnboundedSender<Command>, interval: Duration) {
    loop {
        let (done_tx, done_rx) = oneshot::channel();
        if queue
            .send(Command::Maintain {
                done: Some(done_tx),
            })
            .is_err()
        {
            break;
        }
        if done_rx.await.is_err() {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    debug!("Maintenance scheduler exiting: work queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_each_cycle_before_scheduling_the_next() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = tokio::spawn(run(tx, Duration::from_millis(10)));

        // Hold the first request without acknowledging it.
        let Some(Command::Maintain { done: Some(first) }) = rx.recv().await else {
            panic!("expected a maintenance request");
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err(), "scheduler must not overlap cycles");

        first.send(()).unwrap();
        let Some(Command::Maintain { done: Some(second) }) = rx.recv().await else {
            panic!("expected a second maintenance request");
        };
        drop(second);

        // A dropped acknowledgement means the worker is gone.
        scheduler.await.unwrap();
    }
}
