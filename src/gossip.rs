//! Authenticated gossip overlay for attestations and discovery.
//!
//! A libp2p swarm over TCP with noise encryption and yamux multiplexing,
//! running gossipsub in strict (signed) mode plus identify and ping. The
//! node's overlay identity is a fresh ed25519 keypair per start, distinct
//! from both attestation keys.
//!
//! Three topics: attestations, transfers, validator-announce. Envelopes
//! are JSON; anything older than the drift horizon or carrying our own
//! validator id is dropped on receipt. No configured peers means the node
//! runs standalone, which is a valid single-validator deployment. The
//! overlay keeps no durable queue; publishes that cannot reach a peer are
//! logged and dropped.

use futures_util::StreamExt;
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{Multiaddr, gossipsub, identify, noise, ping, tcp, yamux};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::coordinator::NodeEvent;
use crate::types::{Attestation, TransferEvent, UnixMillis};

pub const TOPIC_ATTESTATIONS: &str = "bridge/attestations/1";
pub const TOPIC_TRANSFERS: &str = "bridge/transfers/1";
pub const TOPIC_ANNOUNCE: &str = "bridge/validator-announce/1";

/// Envelopes older than this are dropped without processing.
pub const DRIFT_HORIZON_MS: u64 = 10 * 60 * 1000;

/// Periodic liveness beacon published on the announce topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub validator_id: String,
    pub node_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waves_watermark: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit0_watermark: Option<u64>,
}

/// Message kinds carried by the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum EnvelopeBody {
    Attestation(Attestation),
    Transfer(TransferEvent),
    Announce(Announce),
}

/// The unit of gossip: a typed payload plus sender identity and send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub sender_validator_id: String,
    pub sent_at: UnixMillis,
}

impl Envelope {
    pub fn new(body: EnvelopeBody, sender_validator_id: String) -> Self {
        Envelope {
            body,
            sender_validator_id,
            sent_at: UnixMillis::now(),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self.body {
            EnvelopeBody::Attestation(_) => TOPIC_ATTESTATIONS,
            EnvelopeBody::Transfer(_) => TOPIC_TRANSFERS,
            EnvelopeBody::Announce(_) => TOPIC_ANNOUNCE,
        }
    }

    pub fn is_stale(&self, now: UnixMillis) -> bool {
        self.sent_at.saturating_age_ms(now) > DRIFT_HORIZON_MS
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("Failed to start gossip overlay: {0}")]
    Init(String),
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub listen_port: u16,
    pub bootstrap_peers: Vec<String>,
    /// Our primary validator identity, used to discard self-echoes.
    pub validator_id: String,
}

/// Handle the coordinator publishes through.
#[derive(Debug, Clone)]
pub struct GossipHandle {
    outbound: mpsc::Sender<Envelope>,
    peer_count: Arc<AtomicUsize>,
}

impl GossipHandle {
    /// Queue an envelope for publication. Best-effort: the overlay has no
    /// durable queue and drops under overload.
    pub async fn publish(&self, envelope: Envelope) {
        if self.outbound.send(envelope).await.is_err() {
            tracing::debug!("Gossip task gone; dropping outbound envelope");
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }
}

#[derive(NetworkBehaviour)]
struct OverlayBehaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

/// Build the swarm and spawn its event loop. Returns the publish handle.
pub fn spawn(
    config: GossipConfig,
    inbound: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) -> Result<GossipHandle, GossipError> {
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let local_peer_id = keypair.public().to_peer_id();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| GossipError::Init(e.to_string()))?
        .with_behaviour(|key| {
            // Content-address messages so identical envelopes gossiped by
            // several validators deduplicate in the mesh.
            let message_id_fn = |message: &gossipsub::Message| {
                let digest: [u8; 32] = Sha256::digest(&message.data).into();
                gossipsub::MessageId::from(digest.to_vec())
            };
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(10))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .message_id_fn(message_id_fn)
                .build()?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;
            let identify = identify::Behaviour::new(identify::Config::new(
                "/bridge-validator/1".to_string(),
                key.public(),
            ));
            let ping = ping::Behaviour::default();
            Ok(OverlayBehaviour {
                gossipsub,
                identify,
                ping,
            })
        })
        .map_err(|e| GossipError::Init(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();

    for topic in [TOPIC_ATTESTATIONS, TOPIC_TRANSFERS, TOPIC_ANNOUNCE] {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic))
            .map_err(|e| GossipError::Init(e.to_string()))?;
    }

    let listen_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| GossipError::Init(e.to_string()))?;
    swarm
        .listen_on(listen_addr)
        .map_err(|e| GossipError::Init(e.to_string()))?;

    for peer in &config.bootstrap_peers {
        match peer.parse::<Multiaddr>() {
            Ok(addr) => {
                if let Err(e) = swarm.dial(addr) {
                    tracing::warn!(%peer, error = %e, "Failed to dial bootstrap peer");
                }
            }
            Err(e) => tracing::warn!(%peer, error = %e, "Ignoring malformed bootstrap multiaddr"),
        }
    }
    if config.bootstrap_peers.is_empty() {
        tracing::info!("No bootstrap peers configured; running standalone");
    }
    tracing::info!(%local_peer_id, port = config.listen_port, "Gossip overlay listening");

    let (outbound_tx, outbound_rx) = mpsc::channel(256);
    let peer_count = Arc::new(AtomicUsize::new(0));
    let handle = GossipHandle {
        outbound: outbound_tx,
        peer_count: peer_count.clone(),
    };

    tokio::spawn(event_loop(
        swarm,
        config,
        outbound_rx,
        inbound,
        peer_count,
        cancel,
    ));
    Ok(handle)
}

async fn event_loop(
    mut swarm: libp2p::Swarm<OverlayBehaviour>,
    config: GossipConfig,
    mut outbound: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<NodeEvent>,
    peer_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else { break };
                publish(&mut swarm, &envelope);
            }
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &config, &inbound, &peer_count);
            }
        }
    }
    tracing::info!("Gossip overlay stopped");
}

fn publish(swarm: &mut libp2p::Swarm<OverlayBehaviour>, envelope: &Envelope) {
    let topic = gossipsub::IdentTopic::new(envelope.topic());
    let data = match serde_json::to_vec(envelope) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode envelope");
            return;
        }
    };
    match swarm.behaviour_mut().gossipsub.publish(topic, data) {
        Ok(_) => {}
        Err(gossipsub::PublishError::InsufficientPeers) => {
            // Standalone operation; nothing to do.
            tracing::debug!("No peers to publish to");
        }
        Err(e) => tracing::warn!(error = %e, "Gossip publish failed"),
    }
}

fn handle_swarm_event(
    event: SwarmEvent<OverlayBehaviourEvent>,
    config: &GossipConfig,
    inbound: &mpsc::Sender<NodeEvent>,
    peer_count: &AtomicUsize,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(%address, "Overlay listening");
        }
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            peer_count.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%peer_id, "Peer connected");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            peer_count.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(%peer_id, "Peer disconnected");
        }
        SwarmEvent::Behaviour(OverlayBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let envelope: Envelope = match serde_json::from_slice(&message.data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(%propagation_source, error = %e, "Discarding undecodable envelope");
                    return;
                }
            };
            if envelope.sender_validator_id == config.validator_id {
                return;
            }
            if envelope.is_stale(UnixMillis::now()) {
                tracing::debug!(
                    sender = %envelope.sender_validator_id,
                    "Dropping envelope past the drift horizon"
                );
                return;
            }
            let node_event = match envelope.body {
                EnvelopeBody::Attestation(attestation) => NodeEvent::PeerAttestation(attestation),
                EnvelopeBody::Transfer(event) => NodeEvent::PeerTransfer(event),
                EnvelopeBody::Announce(announce) => NodeEvent::PeerAnnounce(announce),
            };
            // No durable queue: under overload the envelope is dropped and
            // the mesh re-delivers through other peers or not at all.
            if inbound.try_send(node_event).is_err() {
                tracing::debug!("Coordinator queue unavailable; dropping inbound envelope");
            }
        }
        SwarmEvent::Behaviour(OverlayBehaviourEvent::Identify(identify::Event::Received {
            peer_id,
            info,
            ..
        })) => {
            tracing::debug!(%peer_id, agent = %info.agent_version, "Identified peer");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChainId;

    fn announce_envelope(sent_at: UnixMillis) -> Envelope {
        Envelope {
            body: EnvelopeBody::Announce(Announce {
                validator_id: "0xv1".into(),
                node_version: "0.4.2".into(),
                waves_watermark: Some(100),
                unit0_watermark: None,
            }),
            sender_validator_id: "0xv1".into(),
            sent_at,
        }
    }

    #[test]
    fn test_envelope_topics() {
        let attestation = Attestation {
            transfer_id: "t".into(),
            source: ChainId::Waves(b'W'),
            destination: ChainId::Unit0(88811),
            validator_id: "0xv1".into(),
            signature: vec![0u8; 65],
            public_key: None,
            message_digest: vec![0u8; 32],
            produced_at: UnixMillis(1),
        };
        let envelope = Envelope::new(EnvelopeBody::Attestation(attestation), "0xv1".into());
        assert_eq!(envelope.topic(), TOPIC_ATTESTATIONS);
        assert_eq!(announce_envelope(UnixMillis(1)).topic(), TOPIC_ANNOUNCE);
    }

    #[test]
    fn test_envelope_roundtrip_keeps_tagged_shape() {
        let envelope = announce_envelope(UnixMillis(1_700_000_000_000));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "announce");
        assert_eq!(json["sender_validator_id"], "0xv1");
        assert_eq!(json["payload"]["validator_id"], "0xv1");
        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn test_drift_horizon() {
        let now = UnixMillis(DRIFT_HORIZON_MS * 3);
        let fresh = announce_envelope(UnixMillis(now.0 - DRIFT_HORIZON_MS));
        assert!(!fresh.is_stale(now));
        let stale = announce_envelope(UnixMillis(now.0 - DRIFT_HORIZON_MS - 1));
        assert!(stale.is_stale(now));
        // Clock skew into the future is tolerated.
        let ahead = announce_envelope(UnixMillis(now.0 + 5_000));
        assert!(!ahead.is_stale(now));
    }
}
