//! ---
//! pvsim_section: "05-services"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter emitter service."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pvsim_common::{is_cancelled, sleep_or_cancel, unix_now, AppConfig, SimulatedClock};
use pvsim_curve::CurveModel;
use pvsim_msg::{connect_with_retry, Frame, RetryPolicy, Transport, TransportError};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Where the emitter is in its day loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    AwaitingConnection,
    EmittingStart,
    EmittingData(u32),
    EmittingEnd,
    Stopped,
}

/// Mutable loop context: current day and state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmitterSession {
    pub day: u64,
    pub state: EmitterState,
}

impl EmitterSession {
    pub fn new(initial_day: u64) -> Self {
        Self {
            day: initial_day,
            state: EmitterState::Idle,
        }
    }
}

/// Counters reported when the emitter stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitterStats {
    pub days_completed: u64,
    pub frames_published: u64,
    pub publish_retries: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmitterSettings {
    pub delimiter: char,
    pub time_iter: u32,
    pub total_iterations: u32,
    pub day_pause: Duration,
    pub initial_day: u64,
    /// Stop after this many complete days; `None` runs until cancelled.
    pub max_days: Option<u64>,
}

impl EmitterSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let delimiter = config
            .reading
            .delimiter_byte()
            .map(char::from)
            .ok_or_else(|| anyhow!("delimiter {:?} is not a single byte", config.reading.delimiter))?;
        Ok(Self {
            delimiter,
            time_iter: config.reading.time_iter,
            total_iterations: config.reading.total_iterations(),
            day_pause: config.emitter.day_pause,
            initial_day: config.emitter.initial_day,
            max_days: config.emitter.max_days,
        })
    }
}

enum DayOutcome {
    Completed,
    Cancelled,
}

/// Publishes `Start`, one `Data` per iteration and `End` for each simulated day.
pub struct MeterEmitter<T: Transport> {
    transport: T,
    model: CurveModel,
    settings: EmitterSettings,
    retry: RetryPolicy,
    session: EmitterSession,
    stats: EmitterStats,
}

impl<T: Transport> MeterEmitter<T> {
    pub fn new(transport: T, model: CurveModel, settings: EmitterSettings, retry: RetryPolicy) -> Self {
        let session = EmitterSession::new(settings.initial_day);
        Self {
            transport,
            model,
            settings,
            retry,
            session,
            stats: EmitterStats::default(),
        }
    }

    pub fn from_config(transport: T, config: &AppConfig) -> Result<Self> {
        let model = CurveModel::from_config(config).context("failed to build meter curve")?;
        let settings = EmitterSettings::from_config(config)?;
        Ok(Self::new(transport, model, settings, RetryPolicy::from(&config.retry)))
    }

    pub fn session(&self) -> EmitterSession {
        self.session
    }

    pub fn stats(&self) -> EmitterStats {
        self.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Emit days until cancelled or the day limit is reached, then close the
    /// transport. A day interrupted by cancellation gets no `End` frame.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<EmitterStats> {
        let outcome = self.run_days(&mut shutdown).await;
        self.session.state = EmitterState::Stopped;
        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "failed to close transport");
        }
        info!(
            days_completed = self.stats.days_completed,
            frames_published = self.stats.frames_published,
            publish_retries = self.stats.publish_retries,
            "meter stopped"
        );
        outcome.map(|()| self.stats)
    }

    async fn run_days(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if !self.transport.is_connected() {
            self.session.state = EmitterState::AwaitingConnection;
            connect_with_retry(&mut self.transport, &self.retry)
                .await
                .context("meter could not reach the broker")?;
        }
        self.session.state = EmitterState::Idle;

        loop {
            if is_cancelled(shutdown) {
                return Ok(());
            }
            if let Some(limit) = self.settings.max_days {
                if self.stats.days_completed >= limit {
                    info!(days = limit, "day limit reached");
                    return Ok(());
                }
            }
            match self.run_day(shutdown).await? {
                DayOutcome::Completed => {}
                DayOutcome::Cancelled => return Ok(()),
            }
            if self.settings.max_days == Some(self.stats.days_completed) {
                continue;
            }
            if sleep_or_cancel(self.settings.day_pause, shutdown).await {
                return Ok(());
            }
        }
    }

    async fn run_day(&mut self, shutdown: &watch::Receiver<bool>) -> Result<DayOutcome> {
        let day = self.session.day;
        let total = self.settings.total_iterations;
        info!(day, iterations = total, "starting day");

        self.session.state = EmitterState::EmittingStart;
        self.publish(Frame::Start {
            timestamp: unix_now(),
        })
        .await?;

        for iteration in 1..=total {
            if is_cancelled(shutdown) {
                warn!(day, iteration, "shutdown requested; abandoning day without END");
                return Ok(DayOutcome::Cancelled);
            }
            self.session.state = EmitterState::EmittingData(iteration);
            let clock = SimulatedClock::at_iteration(iteration, self.settings.time_iter);
            let value = self
                .model
                .meter_value(clock)
                .with_context(|| format!("meter reading failed at day {day} iteration {iteration}"))?;
            self.publish(Frame::Data {
                day,
                iteration,
                value,
            })
            .await?;
        }

        self.session.state = EmitterState::EmittingEnd;
        self.publish(Frame::End {
            day,
            iteration: total,
            sentinel: 0,
        })
        .await?;

        self.session.day += 1;
        self.session.state = EmitterState::Idle;
        self.stats.days_completed += 1;
        info!(day, "day complete");
        Ok(DayOutcome::Completed)
    }

    /// Publish one frame, reconnecting and re-publishing on failure.
    async fn publish(&mut self, frame: Frame) -> Result<()> {
        let payload = frame.encode(self.settings.delimiter);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = if self.transport.is_connected() {
                self.transport.publish(payload.as_bytes()).await
            } else {
                Err(TransportError::NotConnected)
            };
            match result {
                Ok(()) => {
                    self.stats.frames_published += 1;
                    debug!(frame = %payload, "frame published");
                    return Ok(());
                }
                Err(err) if attempt < self.retry.max_attempts => {
                    self.stats.publish_retries += 1;
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        frame = %payload,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "publish failed; reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                    if let Err(err) = self.transport.connect().await {
                        warn!(error = %err, "reconnect failed");
                    }
                }
                Err(err) => {
                    error!(frame = %payload, attempt, error = %err, "publish failed; giving up");
                    return Err(err).context(format!("failed to publish {}", payload));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvsim_common::{shutdown_channel, StrategyKind};
    use pvsim_curve::{CurveParameters, ReadingStrategy};
    use async_trait::async_trait;
    use pvsim_msg::{Delivery, InMemoryTransport};

    fn settings(time_iter: u32, max_days: Option<u64>) -> EmitterSettings {
        EmitterSettings {
            delimiter: ';',
            time_iter,
            total_iterations: pvsim_common::total_iterations(time_iter),
            day_pause: Duration::ZERO,
            initial_day: 0,
            max_days,
        }
    }

    fn model() -> CurveModel {
        let strategy =
            ReadingStrategy::build(StrategyKind::Curve, &CurveParameters::default()).unwrap();
        CurveModel::new(strategy, Some(5))
    }

    #[tokio::test]
    async fn one_day_is_framed_by_start_and_end() {
        let queue = InMemoryTransport::new();
        let mut emitter = MeterEmitter::new(
            queue.clone(),
            model(),
            settings(3600, Some(1)),
            RetryPolicy::immediate(1),
        );
        let (_tx, rx) = shutdown_channel();
        let stats = emitter.run(rx).await.unwrap();

        assert_eq!(stats.days_completed, 1);
        assert_eq!(stats.frames_published, 26);
        assert_eq!(emitter.session().state, EmitterState::Stopped);
        assert_eq!(emitter.session().day, 1);

        let frames = queue.snapshot();
        assert_eq!(frames.len(), 26);
        assert!(frames[0].starts_with("START::"));
        for (index, frame) in frames[1..25].iter().enumerate() {
            assert!(frame.starts_with(&format!("DATA::0;{};", index + 1)), "{frame}");
        }
        assert_eq!(frames[25], "END::0;24;0");
    }

    #[tokio::test]
    async fn initial_day_offsets_the_counter() {
        let queue = InMemoryTransport::new();
        let mut cfg = settings(43_200, Some(2));
        cfg.initial_day = 7;
        let mut emitter = MeterEmitter::new(queue.clone(), model(), cfg, RetryPolicy::immediate(1));
        let (_tx, rx) = shutdown_channel();
        emitter.run(rx).await.unwrap();

        let frames = queue.snapshot();
        assert_eq!(frames.len(), 8);
        assert_eq!(frames[3], "END::7;2;0");
        assert_eq!(frames[7], "END::8;2;0");
    }

    #[tokio::test]
    async fn publish_failures_are_retried_after_reconnect() {
        let queue = InMemoryTransport::new();
        let mut emitter = MeterEmitter::new(
            queue.clone(),
            model(),
            settings(43_200, Some(1)),
            RetryPolicy::immediate(3),
        );
        queue.fail_next_publishes(2);
        let (_tx, rx) = shutdown_channel();
        let stats = emitter.run(rx).await.unwrap();

        assert_eq!(stats.publish_retries, 2);
        assert_eq!(stats.frames_published, 4);
        assert_eq!(queue.published(), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_stop_the_emitter() {
        let queue = InMemoryTransport::new();
        let mut emitter = MeterEmitter::new(
            queue.clone(),
            model(),
            settings(43_200, None),
            RetryPolicy::immediate(2),
        );
        queue.fail_next_publishes(5);
        let (_tx, rx) = shutdown_channel();
        assert!(emitter.run(rx).await.is_err());
        assert_eq!(queue.published(), 0);
        assert_eq!(emitter.session().state, EmitterState::Stopped);
    }

    #[tokio::test]
    async fn cancelled_emitter_publishes_nothing() {
        let queue = InMemoryTransport::new();
        let mut emitter =
            MeterEmitter::new(queue.clone(), model(), settings(60, None), RetryPolicy::immediate(1));
        let (tx, rx) = shutdown_channel();
        tx.send(true).unwrap();
        let stats = emitter.run(rx).await.unwrap();
        assert_eq!(stats, EmitterStats::default());
        assert_eq!(queue.pending(), 0);
    }

    /// Raises the shutdown flag once `publishes_left` frames went through.
    struct InterruptAfter {
        inner: InMemoryTransport,
        publishes_left: usize,
        shutdown: watch::Sender<bool>,
    }

    #[async_trait]
    impl Transport for InterruptAfter {
        async fn connect(&mut self) -> pvsim_msg::Result<()> {
            self.inner.connect().await
        }

        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }

        async fn publish(&mut self, payload: &[u8]) -> pvsim_msg::Result<()> {
            self.inner.publish(payload).await?;
            self.publishes_left = self.publishes_left.saturating_sub(1);
            if self.publishes_left == 0 {
                let _ = self.shutdown.send(true);
            }
            Ok(())
        }

        async fn next_delivery(&mut self) -> pvsim_msg::Result<Option<Delivery>> {
            self.inner.next_delivery().await
        }

        async fn ack(&mut self, tag: u64) -> pvsim_msg::Result<()> {
            self.inner.ack(tag).await
        }

        async fn reject(&mut self, tag: u64, requeue: bool) -> pvsim_msg::Result<()> {
            self.inner.reject(tag, requeue).await
        }

        async fn close(&mut self) -> pvsim_msg::Result<()> {
            self.inner.close().await
        }

        fn name(&self) -> &'static str {
            "interrupt-after"
        }
    }

    #[tokio::test]
    async fn shutdown_mid_day_leaves_day_without_end() {
        let queue = InMemoryTransport::new();
        let (tx, rx) = shutdown_channel();
        let transport = InterruptAfter {
            inner: queue.clone(),
            publishes_left: 5,
            shutdown: tx,
        };
        let mut emitter =
            MeterEmitter::new(transport, model(), settings(3600, None), RetryPolicy::immediate(1));
        let stats = emitter.run(rx).await.unwrap();

        assert_eq!(stats.days_completed, 0);
        assert_eq!(stats.frames_published, 5);
        let frames = queue.snapshot();
        assert_eq!(frames.len(), 5);
        assert!(frames[0].starts_with("START::"));
        assert!(frames[1..].iter().all(|frame| frame.starts_with("DATA::0;")));
        assert!(!frames.iter().any(|frame| frame.starts_with("END::")));
        assert_eq!(emitter.session().state, EmitterState::Stopped);
    }

    #[tokio::test]
    async fn readings_stay_within_bounds() {
        let queue = InMemoryTransport::new();
        let mut emitter =
            MeterEmitter::new(queue.clone(), model(), settings(60, Some(1)), RetryPolicy::immediate(1));
        let (_tx, rx) = shutdown_channel();
        emitter.run(rx).await.unwrap();

        let frames = queue.snapshot();
        assert_eq!(frames.len(), 1442);
        let mut previous = 0;
        for wire in &frames[1..1441] {
            match Frame::decode(wire, ';').unwrap() {
                Frame::Data {
                    day,
                    iteration,
                    value,
                } => {
                    assert_eq!(day, 0);
                    assert_eq!(iteration, previous + 1);
                    assert!((0..=9000).contains(&value));
                    previous = iteration;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }
}
