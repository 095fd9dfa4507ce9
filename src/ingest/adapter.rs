//! Stream adapter - pulls records from one source and feeds its classifiers
//!
//! The adapter is a typestate machine:
//!
//! ```text
//! Ready ──start()──► Consuming ──shutdown()──► Stopped
//!                    (run loop)
//! ```
//!
//! It runs on its own OS thread because sources block while waiting for
//! records. Events leave through [`EventBus::submit`], which never blocks.

use chrono::Local;
use statum::{machine, state};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{IngestError, IngestSettings, RawRecord, ReadingSource};
use crate::broadcast::EventBus;
use crate::gesture::{ClassifierBank, ClassifierSettings, Reading};

/// Counters kept per adapter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub records: u64,
    pub malformed: u64,
    pub events: u64,
    pub ack_failures: u64,
    pub transport_errors: u64,
}

/// What one pull from the source amounted to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing arrived within the poll timeout
    Idle,
    Processed,
    Exhausted,
}

#[state]
#[derive(Debug, Clone)]
pub enum AdapterState {
    Ready,
    Consuming,
    Stopped,
}

#[machine]
#[derive(Debug)]
pub struct StreamAdapter<S: AdapterState> {
    source: Box<dyn ReadingSource>,

    // Classifier state, exclusively owned by this adapter
    bank: ClassifierBank,

    bus: EventBus,

    settings: IngestSettings,

    stats: AdapterStats,
}

// Methods available in all states
impl<S: AdapterState> StreamAdapter<S> {
    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    pub fn bank(&self) -> &ClassifierBank {
        &self.bank
    }
}

impl StreamAdapter<Ready> {
    pub fn create(
        source: Box<dyn ReadingSource>,
        classifier: ClassifierSettings,
        settings: IngestSettings,
        bus: EventBus,
    ) -> Self {
        debug!(
            "Creating adapter for source {} with {:?}",
            source.name(),
            classifier
        );
        Self::new(
            source,
            ClassifierBank::new(classifier),
            bus,
            settings,
            AdapterStats::default(),
        )
    }

    pub fn start(self) -> StreamAdapter<Consuming> {
        let streams: Vec<String> = self
            .source
            .streams()
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            "Adapter {} consuming streams [{}]",
            self.source.name(),
            streams.join(", ")
        );
        self.transition()
    }
}

impl StreamAdapter<Consuming> {
    /// Pulls at most one record and carries it through parse, classify,
    /// submit and acknowledge.
    pub fn poll_once(&mut self) -> Result<PollOutcome, IngestError> {
        let record = match self.source.next_record(self.settings.poll_timeout()) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(PollOutcome::Idle),
            Err(IngestError::Exhausted) => return Ok(PollOutcome::Exhausted),
            Err(e) => return Err(e),
        };

        self.process_record(&record);

        // Only now is the record consumed; a crash before this line means redelivery
        if let Err(e) = self.source.acknowledge(record) {
            warn!("Adapter {}: {}", self.source.name(), e);
            self.stats.ack_failures += 1;
        }

        Ok(PollOutcome::Processed)
    }

    fn process_record(&mut self, record: &RawRecord) {
        self.stats.records += 1;

        let reading = match Reading::parse(&record.payload) {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Stream {}: dropping record: {}", record.stream, e);
                self.stats.malformed += 1;
                return;
            }
        };

        debug!("Stream {}: reading {}", record.stream, reading);
        if let Some(event) = self.bank.classify(&record.stream, &reading) {
            info!(
                "Stream {} gesture {} at {}",
                event.stream,
                event.direction,
                event.timestamp.format("%H:%M:%S.%3f")
            );
            self.stats.events += 1;
            self.bus.submit(event);
        }
    }

    /// Consumes until cancelled or the source runs dry. Transport errors are
    /// logged and retried after a pause; they never end the loop.
    pub fn run(&mut self, cancel: &CancellationToken) {
        info!("Starting adapter loop for {}", self.source.name());

        let stats_interval = self.settings.stats_interval();
        let mut last_stats = Instant::now();
        let mut window_start = self.stats;

        while !cancel.is_cancelled() {
            match self.poll_once() {
                Ok(PollOutcome::Exhausted) => {
                    info!("Source {} exhausted", self.source.name());
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Adapter {}: {}", self.source.name(), e);
                    self.stats.transport_errors += 1;
                    backoff(self.settings.error_backoff(), self.settings.poll_timeout(), cancel);
                }
            }

            if last_stats.elapsed() >= stats_interval {
                info!(
                    "Adapter {} stats at {}: {} records, {} malformed, {} events in last {}s",
                    self.source.name(),
                    Local::now().format("%H:%M:%S"),
                    self.stats.records - window_start.records,
                    self.stats.malformed - window_start.malformed,
                    self.stats.events - window_start.events,
                    stats_interval.as_secs()
                );
                window_start = self.stats;
                last_stats = Instant::now();
            }
        }

        if cancel.is_cancelled() {
            info!("Adapter {} cancelled", self.source.name());
        }
    }

    pub fn shutdown(mut self) -> StreamAdapter<Stopped> {
        self.source.close();
        info!(
            "Adapter {} stopped: {:?}, {} streams seen",
            self.source.name(),
            self.stats,
            self.bank.len()
        );
        self.transition()
    }
}

// Sleeps in poll-sized slices so cancellation is still noticed
fn backoff(total: Duration, slice: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + total;
    while !cancel.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        std::thread::sleep(remaining.min(slice));
    }
}

/// Adapter running on its own named thread
pub struct IngestHandle {
    name: String,
    thread: std::thread::JoinHandle<AdapterStats>,
}

impl IngestHandle {
    /// Opens the source on a fresh thread and starts consuming. Resolves once
    /// the source is open; a transport that cannot be reached is returned as
    /// an error rather than retried.
    pub async fn spawn<F>(
        name: &str,
        open: F,
        classifier: ClassifierSettings,
        settings: IngestSettings,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Result<Self, IngestError>
    where
        F: FnOnce() -> Result<Box<dyn ReadingSource>, IngestError> + Send + 'static,
    {
        info!("Spawning ingestion adapter {}", name);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("ingest-{}", name))
            .spawn(move || {
                let source = match open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return AdapterStats::default();
                    }
                };

                let mut adapter = StreamAdapter::create(source, classifier, settings, bus).start();
                adapter.run(&cancel);
                adapter.shutdown().stats()
            })
            .map_err(|e| IngestError::Thread(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                name: name.to_string(),
                thread,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(IngestError::Thread(format!(
                "adapter {} exited before opening its source",
                name
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the adapter thread without blocking the runtime.
    pub async fn join(self) -> AdapterStats {
        let name = self.name;
        let thread = self.thread;
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(stats)) => stats,
            Ok(Err(_)) => {
                error!("Adapter {} panicked", name);
                AdapterStats::default()
            }
            Err(e) => {
                error!("Failed to join adapter {}: {}", name, e);
                AdapterStats::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture::{Direction, StreamId};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted source; `None` entries simulate poll timeouts
    #[derive(Debug, Default)]
    struct ScriptedSource {
        script: VecDeque<Option<RawRecord>>,
        acked: Arc<Mutex<Vec<String>>>,
        closed: Arc<Mutex<bool>>,
        fail_first_poll: bool,
    }

    impl ScriptedSource {
        fn new(records: &[(&str, &str)]) -> Self {
            Self {
                script: records
                    .iter()
                    .map(|(stream, payload)| Some(RawRecord::new(StreamId::from(*stream), *payload)))
                    .collect(),
                ..Self::default()
            }
        }
    }

    impl ReadingSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
        }

        fn streams(&self) -> Vec<StreamId> {
            Vec::new()
        }

        fn next_record(&mut self, _timeout: Duration) -> Result<Option<RawRecord>, IngestError> {
            if self.fail_first_poll {
                self.fail_first_poll = false;
                return Err(IngestError::Transport("broker hiccup".into()));
            }
            match self.script.pop_front() {
                Some(entry) => Ok(entry),
                None => Err(IngestError::Exhausted),
            }
        }

        fn acknowledge(&mut self, record: RawRecord) -> Result<(), IngestError> {
            self.acked.lock().unwrap().push(record.payload);
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn fast_settings() -> IngestSettings {
        IngestSettings {
            poll_timeout_ms: 5,
            stats_interval_secs: 30,
            error_backoff_ms: 5,
        }
    }

    #[test]
    fn gestures_are_submitted_and_records_acked() {
        let source = ScriptedSource::new(&[
            ("controller-1", "-8 0 0"),
            ("controller-1", "8 0 0"),
            ("controller-1", "0 0 8"),
        ]);
        let acked = source.acked.clone();
        let closed = source.closed.clone();
        let (bus, mut rx) = EventBus::channel();

        let mut adapter = StreamAdapter::create(
            Box::new(source),
            ClassifierSettings::default(),
            fast_settings(),
            bus,
        )
        .start();
        adapter.run(&CancellationToken::new());
        let stopped = adapter.shutdown();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.direction, Direction::Up);
        assert_eq!(event.stream, StreamId::from("controller-1"));
        assert!(rx.try_recv().is_err());

        assert_eq!(*acked.lock().unwrap(), vec!["-8 0 0", "8 0 0", "0 0 8"]);
        assert!(*closed.lock().unwrap());
        assert_eq!(stopped.stats().records, 3);
        assert_eq!(stopped.stats().events, 1);
    }

    #[test]
    fn malformed_records_are_acked_and_leave_latches_alone() {
        let source = ScriptedSource::new(&[
            ("controller-1", "-8 0 0"),
            ("controller-1", "garbage"),
            ("controller-1", "1 2"),
            ("controller-1", "8 0 0"),
        ]);
        let acked = source.acked.clone();
        let (bus, mut rx) = EventBus::channel();

        let mut adapter = StreamAdapter::create(
            Box::new(source),
            ClassifierSettings::default(),
            fast_settings(),
            bus,
        )
        .start();
        adapter.run(&CancellationToken::new());

        assert_eq!(adapter.stats().malformed, 2);
        assert_eq!(acked.lock().unwrap().len(), 4);
        // the armed backward latch survived the bad records
        assert_eq!(rx.try_recv().unwrap().direction, Direction::Up);
    }

    #[test]
    fn streams_from_one_source_keep_separate_state() {
        let source = ScriptedSource::new(&[
            ("controller-1", "-8 0 0"),
            ("controller-2", "8 0 0"),
            ("controller-2", "-8 0 0"),
            ("controller-1", "8 0 0"),
        ]);
        let (bus, mut rx) = EventBus::channel();

        let mut adapter = StreamAdapter::create(
            Box::new(source),
            ClassifierSettings::default(),
            fast_settings(),
            bus,
        )
        .start();
        adapter.run(&CancellationToken::new());

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(
            (first.stream.as_str(), first.direction),
            ("controller-2", Direction::Down)
        );
        assert_eq!(
            (second.stream.as_str(), second.direction),
            ("controller-1", Direction::Up)
        );
        assert_eq!(adapter.bank().len(), 2);
    }

    #[test]
    fn idle_polls_and_transport_errors_do_not_stop_the_loop() {
        let mut source = ScriptedSource::new(&[("controller-1", "-8 0 0")]);
        source.fail_first_poll = true;
        source.script.push_back(None);
        source
            .script
            .push_back(Some(RawRecord::new(StreamId::from("controller-1"), "8 0 0")));
        let (bus, mut rx) = EventBus::channel();

        let mut adapter = StreamAdapter::create(
            Box::new(source),
            ClassifierSettings::default(),
            fast_settings(),
            bus,
        )
        .start();
        assert!(matches!(adapter.poll_once(), Err(IngestError::Transport(_))));
        adapter.run(&CancellationToken::new());

        assert_eq!(adapter.stats().records, 2);
        assert_eq!(rx.try_recv().unwrap().direction, Direction::Up);
    }

    #[test]
    fn cancelled_adapter_stops_before_pulling() {
        let source = ScriptedSource::new(&[("controller-1", "-8 0 0")]);
        let acked = source.acked.clone();
        let (bus, _rx) = EventBus::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut adapter = StreamAdapter::create(
            Box::new(source),
            ClassifierSettings::default(),
            fast_settings(),
            bus,
        )
        .start();
        adapter.run(&cancel);
        adapter.shutdown();

        assert!(acked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawned_adapter_runs_on_its_own_thread() {
        let (bus, mut rx) = EventBus::channel();
        let handle = IngestHandle::spawn(
            "scripted",
            || {
                Ok(Box::new(ScriptedSource::new(&[
                    ("controller-1", "0 0 -8"),
                    ("controller-1", "0 0 8"),
                ])) as Box<dyn ReadingSource>)
            },
            ClassifierSettings::default(),
            fast_settings(),
            bus,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(handle.name(), "scripted");
        let stats = handle.join().await;
        assert_eq!(stats.events, 1);
        assert_eq!(rx.recv().await.unwrap().direction, Direction::Right);
    }

    #[tokio::test]
    async fn open_failure_is_reported_by_spawn() {
        let (bus, _rx) = EventBus::channel();
        let result = IngestHandle::spawn(
            "broken",
            || {
                Err(IngestError::TransportUnavailable {
                    source_name: "broken".into(),
                    reason: "connection refused".into(),
                })
            },
            ClassifierSettings::default(),
            fast_settings(),
            bus,
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(IngestError::TransportUnavailable { .. })
        ));
    }
}
