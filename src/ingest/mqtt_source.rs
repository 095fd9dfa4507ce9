use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, Publish, QoS,
    RecvTimeoutError, SubAck, SubscribeReasonCode,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AckToken, IngestError, RawRecord, ReadingSource};
use crate::gesture::StreamId;

/// Binds a stream identity to the topic its controller publishes on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBinding {
    pub id: StreamId,
    pub topic: String,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSourceConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    pub streams: Vec<StreamBinding>,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "tiltstep".to_string()
}

fn default_keep_alive() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    5000
}

// Keeps the password out of logs
impl fmt::Debug for MqttSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSourceConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client_id", &self.client_id)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("streams", &self.streams)
            .finish()
    }
}

/// MQTT subscriber with QoS 1 and manual acknowledgment.
///
/// The session is persistent (`clean_session = false`), so records that were
/// delivered but never acknowledged come back after a restart.
pub struct MqttSource {
    name: String,
    client: Client,
    connection: Connection,
    routes: HashMap<String, StreamId>,
    // Publishes that arrived while subscriptions were still being confirmed
    backlog: VecDeque<Publish>,
}

impl MqttSource {
    pub fn connect(config: &MqttSourceConfig) -> Result<Self, IngestError> {
        info!(
            "Connecting source {} to {}:{}",
            config.name, config.host, config.port
        );
        let unavailable = |reason: String| IngestError::TransportUnavailable {
            source_name: config.name.clone(),
            reason,
        };

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options
            .set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)))
            .set_manual_acks(true)
            .set_clean_session(false);
        if let Some(user) = &config.user {
            options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, mut connection) = Client::new(options, 100);

        // Wait for the broker to accept us before subscribing
        let deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(unavailable("timed out waiting for CONNACK".to_string()));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code == ConnectReturnCode::Success {
                        debug!("Source {} connected (session present: {})", config.name, ack.session_present);
                        break;
                    }
                    return Err(unavailable(format!("broker refused connection: {:?}", ack.code)));
                }
                Ok(Ok(event)) => debug!("Ignoring event before CONNACK: {:?}", event),
                Ok(Err(e)) => return Err(unavailable(e.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(unavailable("timed out waiting for CONNACK".to_string()))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(unavailable("event loop stopped".to_string()))
                }
            }
        }

        let mut routes = HashMap::new();
        for binding in &config.streams {
            client
                .subscribe(binding.topic.as_str(), QoS::AtLeastOnce)
                .map_err(|e| unavailable(format!("subscribe to {} failed: {}", binding.topic, e)))?;
            routes.insert(binding.topic.clone(), binding.id.clone());
        }

        // A queued SUBSCRIBE says nothing about the broker granting it
        let deadline = Instant::now() + Duration::from_millis(config.connect_timeout_ms);
        let mut pending = config.streams.len();
        let mut backlog = VecDeque::new();
        while pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(unavailable(format!("{} SUBACKs still missing", pending)));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    check_suback(&ack).map_err(unavailable)?;
                    pending = pending.saturating_sub(1);
                }
                Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => backlog.push_back(publish),
                Ok(Ok(event)) => debug!("Ignoring event before SUBACK: {:?}", event),
                Ok(Err(e)) => return Err(unavailable(e.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(unavailable(format!("{} SUBACKs still missing", pending)))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(unavailable("event loop stopped".to_string()))
                }
            }
        }
        for binding in &config.streams {
            info!(
                "Source {} subscribed to {} for stream {}",
                config.name, binding.topic, binding.id
            );
        }

        Ok(Self {
            name: config.name.clone(),
            client,
            connection,
            routes,
            backlog,
        })
    }

    // Maps a publish to its stream; unbound topics are released right away
    fn route(&mut self, publish: Publish) -> Option<RawRecord> {
        let Some(stream) = self.routes.get(publish.topic.as_str()).cloned() else {
            warn!("Source {}: message on unbound topic {}", self.name, publish.topic);
            if let Err(e) = self.client.ack(&publish) {
                warn!("Failed to ack unbound message: {}", e);
            }
            return None;
        };
        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
        Some(RawRecord {
            stream,
            payload,
            ack: AckToken::Mqtt(Box::new(publish)),
        })
    }
}

/// Fails if the broker refused any filter of one SUBSCRIBE.
fn check_suback(ack: &SubAck) -> Result<(), String> {
    if ack
        .return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
    {
        return Err(format!("broker refused subscription (packet {})", ack.pkid));
    }
    Ok(())
}

impl ReadingSource for MqttSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn streams(&self) -> Vec<StreamId> {
        self.routes.values().cloned().collect()
    }

    fn next_record(&mut self, timeout: Duration) -> Result<Option<RawRecord>, IngestError> {
        if let Some(publish) = self.backlog.pop_front() {
            return Ok(self.route(publish));
        }
        match self.connection.recv_timeout(timeout) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => Ok(self.route(publish)),
            Ok(Ok(event)) => {
                debug!("Source {}: {:?}", self.name, event);
                Ok(None)
            }
            Ok(Err(e)) => Err(IngestError::Transport(e.to_string())),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(IngestError::Exhausted),
        }
    }

    fn acknowledge(&mut self, record: RawRecord) -> Result<(), IngestError> {
        match record.ack {
            AckToken::Mqtt(publish) => self
                .client
                .ack(&publish)
                .map_err(|e| IngestError::Acknowledge(e.to_string())),
            AckToken::Immediate => Ok(()),
        }
    }

    fn close(&mut self) {
        info!("Disconnecting source {}", self.name);
        if let Err(e) = self.client.disconnect() {
            warn!("Source {}: disconnect failed: {}", self.name, e);
            return;
        }
        // Let the event loop flush pending acks and the DISCONNECT packet
        for _ in 0..10 {
            match self.connection.recv_timeout(Duration::from_millis(100)) {
                Ok(Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect))) => break,
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
    }
}

impl fmt::Debug for MqttSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSource")
            .field("name", &self.name)
            .field("routes", &self.routes)
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_fill_optional_fields() {
        let config: MqttSourceConfig = toml::from_str(
            r#"
            name = "broker"
            host = "localhost"
            streams = [{ id = "controller-1", topic = "tiltstep/controller-1" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "tiltstep");
        assert_eq!(config.keep_alive_secs, 5);
        assert!(config.user.is_none());
        assert_eq!(config.streams[0].id, StreamId::from("controller-1"));
    }

    #[test]
    fn debug_output_hides_password() {
        let config = MqttSourceConfig {
            name: "broker".into(),
            host: "localhost".into(),
            port: 1883,
            client_id: "tiltstep".into(),
            user: Some("admin".into()),
            password: Some("hunter2".into()),
            keep_alive_secs: 5,
            connect_timeout_ms: 100,
            streams: Vec::new(),
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }

    #[test]
    fn granted_subscription_passes() {
        let ack = SubAck {
            pkid: 1,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        };
        assert!(check_suback(&ack).is_ok());
    }

    #[test]
    fn refused_subscription_fails() {
        let ack = SubAck {
            pkid: 7,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtMostOnce),
                SubscribeReasonCode::Failure,
            ],
        };
        let reason = check_suback(&ack).unwrap_err();
        assert!(reason.contains("refused"));
        assert!(reason.contains('7'));
    }

    #[test]
    fn unreachable_broker_is_transport_unavailable() {
        let config = MqttSourceConfig {
            name: "nowhere".into(),
            host: "127.0.0.1".into(),
            // Port 1 is reserved and nothing listens there
            port: 1,
            client_id: "tiltstep-test".into(),
            user: None,
            password: None,
            keep_alive_secs: 5,
            connect_timeout_ms: 2000,
            streams: Vec::new(),
        };
        match MqttSource::connect(&config) {
            Err(IngestError::TransportUnavailable { source_name, .. }) => {
                assert_eq!(source_name, "nowhere")
            }
            other => panic!("expected TransportUnavailable, got {:?}", other.map(|_| ())),
        }
    }
}
