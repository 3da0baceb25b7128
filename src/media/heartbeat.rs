use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Emits a steady tick used to drive per-frame maintenance work without
/// depending on a timer the host may throttle. Delivery is in send order;
/// absolute timing is best-effort.
pub struct HeartbeatDriver {
    cancel: CancellationToken,
    running: watch::Sender<bool>,
}

impl HeartbeatDriver {
    /// Start ticking at the given rate. Ticks that find the receiver full
    /// are dropped rather than queued.
    pub fn start(ticks_per_second: u32) -> (Self, mpsc::Receiver<()>) {
        let cancel = CancellationToken::new();
        let (running, running_rx) = watch::channel(true);
        let (tick_tx, tick_rx) = mpsc::channel(4);

        let period = Duration::from_secs_f64(1.0 / ticks_per_second.max(1) as f64);
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        break;
                    },
                    _ = interval.tick() => {
                        if !*running_rx.borrow() {
                            continue;
                        }
                        match tick_tx.try_send(()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {}
                            Err(mpsc::error::TrySendError::Closed(_)) => break,
                        }
                    },
                }
            }
        });

        (Self { cancel, running }, tick_rx)
    }

    /// Pause tick delivery. The underlying task keeps running so resuming is
    /// cheap.
    pub fn suspend(&self) {
        let _ = self.running.send(false);
    }

    pub fn resume(&self) {
        let _ = self.running.send(true);
    }

    pub fn is_suspended(&self) -> bool {
        !*self.running.borrow()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for HeartbeatDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_rate() {
        let (driver, mut ticks) = HeartbeatDriver::start(10);

        tokio::time::advance(Duration::from_millis(150)).await;
        // first interval tick is immediate, then one per 100ms; the channel
        // holds at most 4
        assert!(ticks.recv().await.is_some());
        assert!(ticks.recv().await.is_some());

        driver.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_and_resume() {
        let (driver, mut ticks) = HeartbeatDriver::start(10);

        tokio::time::advance(Duration::from_millis(110)).await;
        while ticks.try_recv().is_ok() {}

        driver.suspend();
        assert!(driver.is_suspended());
        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(ticks.try_recv().is_err());

        driver.resume();
        assert!(!driver.is_suspended());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(ticks.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_channel() {
        let (driver, mut ticks) = HeartbeatDriver::start(10);
        driver.stop();
        tokio::time::advance(Duration::from_millis(500)).await;
        // drain whatever landed before the stop, then observe the close
        loop {
            match ticks.recv().await {
                Some(()) => continue,
                None => break,
            }
        }
    }
}
