use std::future::Future;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;

use crate::classifier::{SignalSample, Thresholds};
use crate::config::{AppConfig, TrackedDevice};
use crate::error::SampleError;
use crate::locker::{LockOutcome, Locker};
use crate::messages::PresenceAnnouncement;
use crate::mqtt::MqttClient;
use crate::scanner::Sampler;
use crate::state::{self, Action, MonitorState};

/// Runs sample → classify → decide → act once per interval.
///
/// Ticks never overlap: the next one is only scheduled after the previous
/// one has finished, so `state` has a single writer.
pub struct Manager {
    device: TrackedDevice,
    thresholds: Thresholds,
    trigger_count: u32,
    interval: Duration,
    sample_timeout: Duration,
    sampler: Box<dyn Sampler>,
    locker: Box<dyn Locker>,
    mqtt_client: Option<MqttClient>,
    state: MonitorState,
}

impl Manager {
    pub fn new(
        config: &AppConfig,
        sampler: Box<dyn Sampler>,
        locker: Box<dyn Locker>,
        mqtt_client: Option<MqttClient>,
    ) -> Self {
        Manager {
            device: config.device.clone(),
            thresholds: config.proximity.thresholds(),
            trigger_count: config.proximity.trigger_count,
            interval: config.scan.interval(),
            sample_timeout: config.scan.sample_timeout(),
            sampler,
            locker,
            mqtt_client,
            state: MonitorState::default(),
        }
    }

    pub fn state(&self) -> &MonitorState {
        &self.state
    }

    /// Ticks until `shutdown` resolves. A pending wait between ticks is
    /// abandoned immediately; a tick already running is allowed to finish.
    pub async fn run_loop(&mut self, shutdown: impl Future<Output = ()>) {
        info!(
            "Monitoring {} ({}) every {:?} with the {} sampler",
            self.device.display_name(),
            self.device.address,
            self.interval,
            self.sampler.name()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping monitor");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        if let Some(client) = &self.mqtt_client {
            if let Err(err) = client.disconnect().await {
                warn!("Error disconnecting MQTT client: {:?}", err);
            }
        }
    }

    /// One pass of the pipeline. Returns the action that was decided on.
    pub async fn tick(&mut self) -> Action {
        let sample = self.sample().await;
        let band = self.thresholds.classify(sample, self.state.last_signal_band);

        let previous = self.state;
        let (next, action) = state::advance(previous, band, self.trigger_count);
        self.state = next;

        debug!(
            "rssi {:?} -> {} ({} misses, phase {})",
            sample.rssi(),
            band,
            next.consecutive_misses,
            next.phase
        );

        if next.consecutive_failures == self.trigger_count {
            warn!(
                "No reading from {} for {} ticks in a row",
                self.device.address, next.consecutive_failures
            );
        }

        if next.phase != previous.phase {
            info!(
                "{} is now {} ({})",
                self.device.display_name(),
                next.phase,
                band
            );
            self.announce(sample).await;
        }

        if action == Action::Lock {
            self.lock().await;
        }

        action
    }

    async fn sample(&self) -> SignalSample {
        let read = tokio::time::timeout(self.sample_timeout, self.sampler.read_rssi(self.device.address));
        let result = match read.await {
            Ok(result) => result,
            Err(_) => Err(SampleError::Timeout(self.sample_timeout)),
        };

        match result {
            Ok(rssi) => SignalSample::Present(rssi),
            Err(err @ SampleError::Unreachable(_)) => {
                debug!("No reading: {}", err);
                SignalSample::Absent
            }
            Err(err) => {
                warn!("Sampling {} failed: {}", self.device.address, err);
                SignalSample::Absent
            }
        }
    }

    async fn lock(&self) {
        info!(
            "{} left after {} consecutive misses, locking session",
            self.device.display_name(),
            self.state.consecutive_misses
        );
        match self.locker.lock().await {
            Ok(LockOutcome::Locked(method)) => info!("Session locked via {}", method),
            Ok(LockOutcome::AlreadyLocked) => info!("Session already locked"),
            Ok(LockOutcome::DryRun) => {}
            // Not retried; the next departure episode gets a fresh attempt
            Err(err) => error!("Failed to lock session: {}", err),
        }
    }

    async fn announce(&self, sample: SignalSample) {
        let Some(client) = &self.mqtt_client else {
            return;
        };
        let announcement = PresenceAnnouncement::new(&self.device, &self.state, sample.rssi());
        if let Err(err) = client.announce(&announcement).await {
            error!("Error announcing presence: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use mac_address::MacAddress;

    use super::*;
    use crate::classifier::ProximityBand;
    use crate::error::LockError;
    use crate::state::Phase;

    enum Reading {
        Rssi(i16),
        Fail,
        Hang,
    }

    /// Replays scripted readings; once exhausted, the device is unreachable.
    #[derive(Clone, Default)]
    struct ScriptedSampler {
        readings: Arc<Mutex<VecDeque<Reading>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedSampler {
        fn push(&self, readings: impl IntoIterator<Item = Reading>) {
            self.readings.lock().unwrap().extend(readings);
        }

        fn push_rssi(&self, values: &[i16]) {
            self.push(values.iter().map(|v| Reading::Rssi(*v)));
        }
    }

    #[async_trait]
    impl Sampler for ScriptedSampler {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn read_rssi(&self, address: MacAddress) -> Result<i16, SampleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.readings.lock().unwrap().pop_front();
            match next {
                Some(Reading::Rssi(rssi)) => Ok(rssi),
                Some(Reading::Fail) => Err(SampleError::Query("radio busy".to_string())),
                Some(Reading::Hang) => std::future::pending().await,
                None => Err(SampleError::Unreachable(address.to_string())),
            }
        }
    }

    #[derive(Clone, Default)]
    struct CountingLocker {
        attempts: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Locker for CountingLocker {
        async fn lock(&self) -> Result<LockOutcome, LockError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(LockError::AllMethodsFailed)
            } else {
                Ok(LockOutcome::Locked("test"))
            }
        }

        async fn is_locked(&self) -> Result<bool, LockError> {
            Ok(false)
        }
    }

    fn manager(sampler: &ScriptedSampler, locker: &CountingLocker) -> Manager {
        let config = AppConfig::parse("[device]\naddress = \"AA:BB:CC:DD:EE:FF\"\n", "test").unwrap();
        Manager::new(
            &config,
            Box::new(sampler.clone()),
            Box::new(locker.clone()),
            None,
        )
    }

    async fn tick_n(manager: &mut Manager, n: usize) -> Vec<Action> {
        let mut actions = Vec::with_capacity(n);
        for _ in 0..n {
            actions.push(manager.tick().await);
        }
        actions
    }

    fn lock_ticks(actions: &[Action]) -> Vec<usize> {
        actions
            .iter()
            .enumerate()
            .filter(|(_, a)| **a == Action::Lock)
            .map(|(i, _)| i + 1)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_departure_locks_on_third_far_tick() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        sampler.push_rssi(&[-50, -50, -85, -85, -85]);
        let actions = tick_n(&mut manager, 5).await;

        assert_eq!(lock_ticks(&actions), vec![5]);
        assert_eq!(locker.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().phase, Phase::Departed);
        assert_eq!(manager.state().band, ProximityBand::VeryFar);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_departure_is_ignored() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        sampler.push_rssi(&[-85, -85, -50]);
        let actions = tick_n(&mut manager, 3).await;

        assert!(lock_ticks(&actions).is_empty());
        assert_eq!(manager.state().consecutive_misses, 0);
        assert_eq!(manager.state().phase, Phase::Home);
        assert_eq!(locker.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_after_lock_rearms() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        sampler.push_rssi(&[-50, -85, -85, -85, -85, -85, -50]);
        let actions = tick_n(&mut manager, 7).await;
        assert_eq!(lock_ticks(&actions), vec![4]);
        assert_eq!(manager.state().phase, Phase::Home);
        assert!(!manager.state().locked_for_this_departure);

        sampler.push_rssi(&[-85, -85, -85]);
        let actions = tick_n(&mut manager, 3).await;
        assert_eq!(lock_ticks(&actions), vec![3]);
        assert_eq!(locker.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_failures_lock_like_distance() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        sampler.push([Reading::Rssi(-50), Reading::Fail, Reading::Fail, Reading::Fail]);
        let actions = tick_n(&mut manager, 4).await;

        assert_eq!(lock_ticks(&actions), vec![4]);
        assert_eq!(manager.state().band, ProximityBand::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropout_keeps_hysteresis() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        // -79 is Far on a fresh read, but not coming from VeryFar
        sampler.push([Reading::Rssi(-85), Reading::Fail, Reading::Rssi(-79)]);
        let actions = tick_n(&mut manager, 3).await;

        assert_eq!(lock_ticks(&actions), vec![3]);
        assert_eq!(manager.state().band, ProximityBand::VeryFar);
        assert_eq!(manager.state().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_sampler_times_out_as_absent() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        sampler.push([Reading::Rssi(-50), Reading::Hang, Reading::Hang, Reading::Hang]);
        let start = tokio::time::Instant::now();
        let actions = tick_n(&mut manager, 4).await;

        assert_eq!(lock_ticks(&actions), vec![4]);
        // three timeouts of sample_timeout_seconds each
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(24) && elapsed < Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lock_is_not_retried_within_episode() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker {
            fail: true,
            ..Default::default()
        };
        let mut manager = manager(&sampler, &locker);

        sampler.push_rssi(&[-50]);
        tick_n(&mut manager, 10).await;

        assert_eq!(locker.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state().phase, Phase::Departed);
        assert_eq!(manager.state().consecutive_misses, 9);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_ticks_on_interval() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let mut manager = manager(&sampler, &locker);

        // Ticks at 0s, 10s, 20s and 30s
        manager
            .run_loop(tokio::time::sleep(Duration::from_secs(35)))
            .await;

        assert_eq!(sampler.calls.load(Ordering::SeqCst), 4);
        assert_eq!(locker.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_wait() {
        let sampler = ScriptedSampler::default();
        let locker = CountingLocker::default();
        let config = AppConfig::parse(
            "[device]\naddress = \"AA:BB:CC:DD:EE:FF\"\n[scan]\ninterval_seconds = 3600\n",
            "test",
        )
        .unwrap();
        let mut manager = Manager::new(
            &config,
            Box::new(sampler.clone()),
            Box::new(locker.clone()),
            None,
        );

        let start = tokio::time::Instant::now();
        manager
            .run_loop(tokio::time::sleep(Duration::from_secs(1)))
            .await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 1);
    }
}
