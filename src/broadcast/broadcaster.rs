use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{ClientRegistry, Frame};
use crate::gesture::{Direction, DirectionEvent};

/// Settings for fan-out to connected clients
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    /// Outbound frames buffered per client before new frames are dropped for it
    pub client_buffer: usize,

    /// Adds the producing stream identity to every wire event
    pub include_stream: bool,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            client_buffer: 64,
            include_stream: false,
        }
    }
}

/// JSON object pushed to clients: `{"direction":"up"}`
#[derive(Debug, Serialize, PartialEq)]
pub struct WireEvent<'a> {
    pub direction: Direction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<&'a str>,
}

impl<'a> WireEvent<'a> {
    pub fn from_event(event: &'a DirectionEvent, include_stream: bool) -> Self {
        Self {
            direction: event.direction,
            stream: include_stream.then(|| event.stream.as_str()),
        }
    }
}

/// Thread-safe submit side of the bridge between ingestion threads and the
/// broadcasting runtime. Submitting never blocks and never fails from the
/// caller's point of view.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: mpsc::UnboundedSender<DirectionEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DirectionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn submit(&self, event: DirectionEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("Broadcaster stopped, dropping {} event", e.0.direction);
        }
    }
}

/// Result of offering one frame to one client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Client buffer full; frame skipped for this client only
    Dropped,
    /// Client transport gone; client removed from the registry
    Disconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

impl DeliveryReport {
    fn record(&mut self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.delivered += 1,
            DeliveryOutcome::Dropped => self.dropped += 1,
            DeliveryOutcome::Disconnected => self.disconnected += 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events: usize,
    pub deliveries: usize,
    pub removed_clients: usize,
}

/// Single consumption loop draining the event bus in submission order
pub struct Broadcaster {
    receiver: mpsc::UnboundedReceiver<DirectionEvent>,
    registry: ClientRegistry,
    settings: BroadcastSettings,
}

impl Broadcaster {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<DirectionEvent>,
        registry: ClientRegistry,
        settings: BroadcastSettings,
    ) -> Self {
        Self {
            receiver,
            registry,
            settings,
        }
    }

    /// Serialises once and offers the same frame to every live client.
    pub fn deliver(&self, event: &DirectionEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let frame: Frame = match serde_json::to_string(&WireEvent::from_event(
            event,
            self.settings.include_stream,
        )) {
            Ok(json) => json.into(),
            Err(e) => {
                error!("Failed to serialize {} event: {}", event.direction, e);
                return report;
            }
        };

        for client in self.registry.snapshot() {
            let outcome = match client.sender.try_send(frame.clone()) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("{} is not keeping up, dropping {} event", client.id, event.direction);
                    DeliveryOutcome::Dropped
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("{} disconnected during broadcast, removing", client.id);
                    self.registry.unregister(client.id);
                    DeliveryOutcome::Disconnected
                }
            };
            report.record(outcome);
        }

        debug!(
            "Broadcast {} from {}: {:?}",
            event.direction, event.stream, report
        );
        report
    }

    pub async fn run(mut self, cancel: CancellationToken) -> BroadcastStats {
        info!("Broadcaster started");
        let mut stats = BroadcastStats::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Broadcaster cancelled");
                    break;
                }
                event = self.receiver.recv() => event,
            };

            let Some(event) = event else {
                info!("All event producers gone, broadcaster stopping");
                break;
            };

            let report = self.deliver(&event);
            stats.events += 1;
            stats.deliveries += report.delivered;
            stats.removed_clients += report.disconnected;
        }

        info!(
            "Broadcaster finished: {} events, {} deliveries, {} clients removed",
            stats.events, stats.deliveries, stats.removed_clients
        );
        stats
    }
}

/// Running broadcaster task and the bus that feeds it
pub struct BroadcasterHandle {
    bus: EventBus,
    task: JoinHandle<BroadcastStats>,
}

impl BroadcasterHandle {
    pub fn spawn(
        registry: ClientRegistry,
        settings: BroadcastSettings,
        cancel: CancellationToken,
    ) -> Self {
        info!("Spawning broadcaster with settings: {:?}", settings);
        let (bus, receiver) = EventBus::channel();
        let broadcaster = Broadcaster::new(receiver, registry, settings);
        let task = tokio::spawn(broadcaster.run(cancel));
        Self { bus, task }
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// Drops this handle's bus and waits for the loop to end.
    pub async fn join(self) -> BroadcastStats {
        let Self { bus, task } = self;
        drop(bus);
        match task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Broadcaster task failed: {}", e);
                BroadcastStats::default()
            }
        }
    }
}
