//! Liveness probing of admitted connections.
//!
//! A background task enqueues a [`RegistryCommand::LivenessTick`] at a fixed
//! interval. The registry actor then assesses every connection against its
//! [`ProbeState`]: connections silent for at least the timeout are evicted,
//! everything else is sent a WebSocket ping. Any inbound frame counts as an
//! acknowledgment, not just pongs.
//!
//! Timestamps use `tokio::time::Instant` so paused-clock tests drive
//! eviction deterministically.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::RelayConfig;
use crate::registry::RegistryCommand;

/// Per-connection probe bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeState {
    /// Last time any frame arrived from the peer.
    pub last_ack: Instant,
    /// A ping has been sent since the last acknowledgment.
    pub awaiting_ack: bool,
}

impl ProbeState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_ack: now,
            awaiting_ack: false,
        }
    }

    /// Records an acknowledgment.
    pub fn acknowledge(&mut self, now: Instant) {
        self.last_ack = now;
        self.awaiting_ack = false;
    }

    /// Marks that a probe was just sent.
    pub fn mark_probed(&mut self) {
        self.awaiting_ack = true;
    }
}

/// Outcome of assessing one connection on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Silent for too long; tear the connection down.
    Evict,
    /// Still within the timeout; send a ping.
    Probe,
}

/// Decides eviction and owns the tick schedule.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    interval: Duration,
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.heartbeat_interval(), config.heartbeat_timeout())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Evict once the time since the last acknowledgment reaches the timeout.
    pub fn assess(&self, probe: &ProbeState, now: Instant) -> Verdict {
        if now.saturating_duration_since(probe.last_ack) >= self.timeout {
            Verdict::Evict
        } else {
            Verdict::Probe
        }
    }

    /// Spawns the task that feeds liveness ticks into the registry.
    ///
    /// The first tick fires one interval after spawning. The task exits
    /// when the registry's command channel closes.
    pub fn spawn_ticker(&self, sender: mpsc::Sender<RegistryCommand>) {
        let period = self.interval;
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() completes its first tick immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;

                if sender.send(RegistryCommand::LivenessTick).await.is_err() {
                    debug!("Liveness ticker stopping: registry channel closed");
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> LivenessMonitor {
        LivenessMonitor::new(Duration::from_secs(10), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_connection_is_probed() {
        let probe = ProbeState::new(Instant::now());
        assert_eq!(monitor().assess(&probe, Instant::now()), Verdict::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_at_timeout() {
        let start = Instant::now();
        let probe = ProbeState::new(start);
        let m = monitor();

        assert_eq!(m.assess(&probe, start + Duration::from_secs(29)), Verdict::Probe);
        assert_eq!(m.assess(&probe, start + Duration::from_secs(30)), Verdict::Evict);
        assert_eq!(m.assess(&probe, start + Duration::from_secs(45)), Verdict::Evict);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledgment_resets_clock() {
        let start = Instant::now();
        let mut probe = ProbeState::new(start);
        probe.mark_probed();
        assert!(probe.awaiting_ack);

        probe.acknowledge(start + Duration::from_secs(25));
        assert!(!probe.awaiting_ack);
        assert_eq!(
            monitor().assess(&probe, start + Duration::from_secs(40)),
            Verdict::Probe
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_sends_ticks_until_closed() {
        let (tx, mut rx) = mpsc::channel(4);
        monitor().spawn_ticker(tx);

        tokio::time::sleep(Duration::from_secs(10)).await;
        let cmd = rx.recv().await.unwrap();
        assert!(matches!(cmd, RegistryCommand::LivenessTick));

        drop(rx);
        // Ticker notices the closed channel on its next send and exits.
        tokio::time::sleep(Duration::from_secs(20)).await;
    }

    #[test]
    fn test_from_config() {
        let m = LivenessMonitor::from_config(&RelayConfig::default());
        assert_eq!(m.interval(), Duration::from_secs(10));
        assert_eq!(m.timeout(), Duration::from_secs(30));
    }
}
