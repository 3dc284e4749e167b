//! ---
//! pvsim_section: "05-services"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "PV aggregator service."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use pvsim_common::{
    cancelled, is_cancelled, sleep_or_cancel, unix_now, AppConfig, SignConvention, SimulatedClock,
};
use pvsim_curve::CurveModel;
use pvsim_msg::{connect_with_retry, Delivery, Frame, FrameError, RetryPolicy, Transport};
use pvsim_persistence::{DayRecordWriter, DayRow, ExecutionLog};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counters reported when the aggregator stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub frames_received: u64,
    pub rows_written: u64,
    pub out_of_range: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub days_finalized: u64,
    pub days_abandoned: u64,
    pub requeued: u64,
    /// Days whose execution time exceeded `max_execution_time`.
    pub over_budget: u64,
}

/// What happened to a delivery after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSettings {
    pub output_file: PathBuf,
    pub execution_log: PathBuf,
    pub delimiter: char,
    pub pv_min: i64,
    pub pv_max: i64,
    pub time_iter: u32,
    pub sign_convention: SignConvention,
    pub max_execution_time: Duration,
    /// Wait between polls when the queue is empty.
    pub idle_poll: Duration,
}

impl AggregatorSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let delimiter = config
            .reading
            .delimiter_byte()
            .map(char::from)
            .ok_or_else(|| anyhow!("delimiter {:?} is not a single byte", config.reading.delimiter))?;
        Ok(Self {
            output_file: config.aggregator.output_file.clone(),
            execution_log: config.aggregator.execution_log.clone(),
            delimiter,
            pv_min: config.reading.pv_min,
            pv_max: config.reading.pv_max,
            time_iter: config.reading.time_iter,
            sign_convention: config.aggregator.sign_convention,
            max_execution_time: config.aggregator.max_execution_time,
            idle_poll: Duration::from_millis(100),
        })
    }

    fn in_range(&self, value: i64) -> bool {
        (self.pv_min..=self.pv_max).contains(&value)
    }
}

/// Execution-time line owed for a finalized day.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingLog {
    day: u64,
    filename: String,
    elapsed_secs: i64,
}

/// Per-day bookkeeping owned by the consumer loop.
#[derive(Default)]
pub struct DayState {
    start_ts: Option<i64>,
    open: Option<DayRecordWriter>,
    closed: BTreeSet<u64>,
    pending_log: Option<PendingLog>,
}

impl DayState {
    /// Day with an open (not yet finalized) record.
    pub fn open_day(&self) -> Option<u64> {
        self.open.as_ref().map(DayRecordWriter::day)
    }

    pub fn is_closed(&self, day: u64) -> bool {
        self.closed.contains(&day)
    }

    /// Timestamp carried by the last `Start` frame of the current day.
    pub fn start_ts(&self) -> Option<i64> {
        self.start_ts
    }

    /// Finalized day whose execution-time line is not written yet.
    pub fn unlogged_day(&self) -> Option<u64> {
        self.pending_log.as_ref().map(|pending| pending.day)
    }
}

/// Consumes meter frames one at a time, adds the solar reading and persists
/// one record per day. Each delivery is acknowledged only after it has been
/// handled; file errors requeue it.
pub struct PvAggregator<T: Transport> {
    transport: T,
    model: CurveModel,
    settings: AggregatorSettings,
    retry: RetryPolicy,
    execution_log: ExecutionLog,
    state: DayState,
    stats: AggregatorStats,
}

impl<T: Transport> PvAggregator<T> {
    pub fn new(transport: T, model: CurveModel, settings: AggregatorSettings, retry: RetryPolicy) -> Self {
        let execution_log = ExecutionLog::new(settings.execution_log.clone());
        Self {
            transport,
            model,
            settings,
            retry,
            execution_log,
            state: DayState::default(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn from_config(transport: T, config: &AppConfig) -> Result<Self> {
        let model = CurveModel::from_config(config).context("failed to build solar curve")?;
        let settings = AggregatorSettings::from_config(config)?;
        Ok(Self::new(transport, model, settings, RetryPolicy::from(&config.retry)))
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn state(&self) -> &DayState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Consume until cancelled, then drop any partial day and close the transport.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<AggregatorStats> {
        let outcome = self.consume(&mut shutdown).await;
        if let Some(open) = self.state.open.take() {
            if let Err(err) = self.abandon(open, "shutdown before END") {
                warn!(error = %err, "failed to remove partial record");
            }
        }
        if let Err(err) = self.transport.close().await {
            warn!(error = %err, "failed to close transport");
        }
        info!(stats = ?self.stats, "pv stopped");
        outcome.map(|()| self.stats)
    }

    /// Handle everything currently queued and return the number of deliveries
    /// processed. Stops early when a delivery had to be requeued.
    pub async fn drain(&mut self) -> Result<usize> {
        if !self.transport.is_connected() {
            connect_with_retry(&mut self.transport, &self.retry).await?;
        }
        let mut handled = 0;
        while let Some(delivery) = self.transport.next_delivery().await? {
            handled += 1;
            if self.handle_delivery(delivery).await? == Disposition::Requeued {
                break;
            }
        }
        Ok(handled)
    }

    async fn consume(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if !self.transport.is_connected() {
            connect_with_retry(&mut self.transport, &self.retry)
                .await
                .context("pv service could not reach the broker")?;
        }

        let mut requeue_streak = 0;
        loop {
            if is_cancelled(shutdown) {
                return Ok(());
            }
            let next = tokio::select! {
                _ = cancelled(shutdown) => return Ok(()),
                next = self.transport.next_delivery() => next,
            };
            let result = match next {
                Ok(Some(delivery)) => match self.handle_delivery(delivery).await {
                    Ok(Disposition::Acked) => {
                        requeue_streak = 0;
                        Ok(())
                    }
                    Ok(Disposition::Requeued) => {
                        requeue_streak += 1;
                        // The same frame comes straight back; wait before pulling it.
                        let delay = self.retry.backoff(requeue_streak).max(self.settings.idle_poll);
                        warn!(
                            streak = requeue_streak,
                            delay_ms = delay.as_millis() as u64,
                            "backing off before redelivery"
                        );
                        if sleep_or_cancel(delay, shutdown).await {
                            return Ok(());
                        }
                        Ok(())
                    }
                    Err(err) => Err(err),
                },
                Ok(None) => {
                    if sleep_or_cancel(self.settings.idle_poll, shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!(error = %err, "transport failure; reconnecting");
                connect_with_retry(&mut self.transport, &self.retry)
                    .await
                    .context("pv service lost the broker")?;
            }
        }
    }

    /// Decode, apply and acknowledge one delivery.
    pub async fn handle_delivery(&mut self, delivery: Delivery) -> pvsim_msg::Result<Disposition> {
        self.stats.frames_received += 1;
        let frame = match Frame::decode_bytes(&delivery.payload, self.settings.delimiter) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.malformed += 1;
                match &err {
                    FrameError::UnknownTag(tag) => warn!(tag = %tag, "dropping frame with unknown tag"),
                    FrameError::Malformed { .. } => warn!(error = %err, "dropping malformed frame"),
                }
                self.transport.ack(delivery.tag).await?;
                return Ok(Disposition::Acked);
            }
        };
        debug!(
            kind = frame.tag(),
            day = ?frame.day(),
            delivery_tag = delivery.tag,
            redelivered = delivery.redelivered,
            "frame received"
        );

        match self.apply_frame(frame) {
            Ok(()) => {
                self.transport.ack(delivery.tag).await?;
                Ok(Disposition::Acked)
            }
            Err(err) => {
                self.stats.requeued += 1;
                error!(
                    kind = frame.tag(),
                    day = ?frame.day(),
                    frame = %frame,
                    error = %err,
                    "failed to persist frame; requeueing"
                );
                self.transport.reject(delivery.tag, true).await?;
                Ok(Disposition::Requeued)
            }
        }
    }

    /// Apply one decoded frame to the day state.
    pub fn apply_frame(&mut self, frame: Frame) -> pvsim_persistence::Result<()> {
        match frame {
            Frame::Start { timestamp } => {
                self.record_execution_time()?;
                if let Some(open) = self.state.open.take() {
                    self.abandon(open, "START received before END")?;
                }
                self.state.start_ts = Some(timestamp);
                info!(start_ts = timestamp, "day started");
                Ok(())
            }
            Frame::Data {
                day,
                iteration,
                value,
            } => self.apply_data(day, iteration, value),
            Frame::End { day, iteration, .. } => self.finalize_day(day, iteration),
        }
    }

    fn apply_data(&mut self, day: u64, iteration: u32, value: i64) -> pvsim_persistence::Result<()> {
        if self.state.is_closed(day) {
            self.stats.duplicates += 1;
            warn!(day, iteration, "data for a finalized day dropped");
            return Ok(());
        }
        if !self.settings.in_range(value) {
            self.stats.out_of_range += 1;
            warn!(
                day,
                iteration,
                value,
                pv_min = self.settings.pv_min,
                pv_max = self.settings.pv_max,
                "meter reading out of range; skipped"
            );
            return Ok(());
        }

        self.ensure_open(day)?;
        if let Some(writer) = self.state.open.as_mut() {
            if writer.last_iteration().is_some_and(|last| iteration <= last) {
                self.stats.duplicates += 1;
                debug!(day, iteration, "duplicate data frame skipped");
                return Ok(());
            }
            let clock = SimulatedClock::at_iteration(iteration, self.settings.time_iter);
            let pv = self.model.solar_value(clock);
            let row = DayRow::combine(iteration, value, pv, self.settings.sign_convention);
            writer.append(&row)?;
            self.stats.rows_written += 1;
        }
        Ok(())
    }

    fn finalize_day(&mut self, day: u64, iteration: u32) -> pvsim_persistence::Result<()> {
        if self.state.is_closed(day) {
            if self.state.unlogged_day() == Some(day) {
                return self.record_execution_time();
            }
            self.stats.duplicates += 1;
            debug!(day, "END for a finalized day ignored");
            return Ok(());
        }
        self.ensure_open(day)?;
        let Some(writer) = self.state.open.as_mut() else {
            return Ok(());
        };
        let summary = writer.finalize()?;
        self.state.open = None;
        self.state.closed.insert(day);
        self.stats.days_finalized += 1;

        let elapsed = match self.state.start_ts.take() {
            Some(start) => (unix_now() - start).max(0),
            None => {
                warn!(day, "no START seen for day; recording zero execution time");
                0
            }
        };
        let filename = summary
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| summary.path.display().to_string());
        info!(
            day,
            last_iteration = iteration,
            rows = summary.rows,
            meter_total = summary.meter_total,
            pv_total = summary.pv_total,
            net_total = summary.net_total,
            elapsed_secs = elapsed,
            path = %summary.path.display(),
            "day finalized"
        );
        self.state.pending_log = Some(PendingLog {
            day,
            filename,
            elapsed_secs: elapsed,
        });
        self.record_execution_time()
    }

    /// Write the owed execution-time line, if any. It stays owed on error so
    /// the redelivered `End` can try again.
    fn record_execution_time(&mut self) -> pvsim_persistence::Result<()> {
        let Some(pending) = self.state.pending_log.as_ref() else {
            return Ok(());
        };
        self.execution_log.record(&pending.filename, pending.elapsed_secs)?;

        let budget = self.settings.max_execution_time.as_secs();
        if u64::try_from(pending.elapsed_secs).unwrap_or(0) > budget {
            self.stats.over_budget += 1;
            warn!(
                day = pending.day,
                elapsed_secs = pending.elapsed_secs,
                budget_secs = budget,
                "day exceeded execution time budget"
            );
        }
        self.state.pending_log = None;
        Ok(())
    }

    /// Make sure the open record belongs to `day`, abandoning a stale one.
    fn ensure_open(&mut self, day: u64) -> pvsim_persistence::Result<()> {
        let writer = match self.state.open.take() {
            Some(writer) if writer.day() == day => writer,
            Some(stale) => {
                self.abandon(stale, "frame for a different day arrived")?;
                self.open_record(day)?
            }
            None => self.open_record(day)?,
        };
        self.state.open = Some(writer);
        Ok(())
    }

    fn open_record(&self, day: u64) -> pvsim_persistence::Result<DayRecordWriter> {
        let delimiter = u8::try_from(self.settings.delimiter).map_err(|_| {
            pvsim_persistence::PersistenceError::InvalidDelimiter(self.settings.delimiter.to_string())
        })?;
        let writer = DayRecordWriter::open(&self.settings.output_file, day, delimiter)?;
        info!(day, path = %writer.temp_path().display(), "day record opened");
        Ok(writer)
    }

    fn abandon(&mut self, writer: DayRecordWriter, reason: &str) -> pvsim_persistence::Result<()> {
        self.stats.days_abandoned += 1;
        warn!(day = writer.day(), rows = writer.rows(), reason, "abandoning partial day record");
        writer.abandon()
    }
}
