//! Message dispatcher
//!
//! Inbound frames are decoded and routed to the handler registered for the
//! message's discriminant. Outbound messages are encoded once per protocol
//! version in use and fanned out to every recipient concurrently.
//!
//! Every frame starts with a four byte header: the ordinal of the layout the
//! payload was encoded with, then the newest ordinal the sender speaks. The
//! second value lets members pick the layout for their replies.

use crate::codec::MessageCodec;
use crate::error::{MembershipError, Result};
use crate::message::{Message, MessageKind, ProtocolVersion, Recipients};
use crate::stats::ConnectionStatistics;
use crate::transport::{Datagram, Transport};
use crate::view::View;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};

pub const FRAME_HEADER_LEN: usize = 4;

/// Receiver of decoded messages of one or more kinds
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message, from: SocketAddr) -> Result<()>;
}

/// Outcome of a fan-out send
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<SocketAddr>,
    pub failed: Vec<(SocketAddr, MembershipError)>,
}

impl DeliveryReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

pub struct MessageDispatcher {
    codec: Arc<dyn MessageCodec>,
    transport: Arc<dyn Transport>,
    stats: Arc<dyn ConnectionStatistics>,
    views: watch::Receiver<Option<Arc<View>>>,
    local_version: ProtocolVersion,
    handlers: HashMap<u32, Arc<dyn MessageHandler>>,
    peer_versions: RwLock<HashMap<SocketAddr, ProtocolVersion>>,
    /// View number the version map was last pruned against
    pruned_at: AtomicU64,
}

impl MessageDispatcher {
    pub fn new(
        codec: Arc<dyn MessageCodec>,
        transport: Arc<dyn Transport>,
        stats: Arc<dyn ConnectionStatistics>,
        views: watch::Receiver<Option<Arc<View>>>,
        local_version: ProtocolVersion,
    ) -> Self {
        Self {
            codec,
            transport,
            stats,
            views,
            local_version,
            handlers: HashMap::new(),
            peer_versions: RwLock::new(HashMap::new()),
            pruned_at: AtomicU64::new(0),
        }
    }

    /// Route messages of `kind` to `handler`
    pub fn with_handler(mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind.dsfid(), handler);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind.dsfid())
    }

    /// Layout used for frames sent to `peer`
    pub async fn peer_version(&self, peer: SocketAddr) -> ProtocolVersion {
        let known = self.peer_versions.read().await.get(&peer).copied();
        known.map_or(self.local_version, |version| version.min(self.local_version))
    }

    /// Hand a decoded message to its handler
    pub async fn dispatch(&self, message: Message, from: SocketAddr) -> Result<()> {
        let dsfid = message.dsfid();
        let handler = self
            .handlers
            .get(&dsfid)
            .ok_or(MembershipError::UnknownMessageType(dsfid))?;

        tracing::trace!("Dispatching {} from {}", message, from);
        handler.handle(message, from).await
    }

    /// Decode one inbound frame and dispatch it. Failures are logged and
    /// the frame dropped.
    pub async fn receive(&self, datagram: Datagram) {
        self.stats.message_received(datagram.payload.len());

        let message = match self.decode_frame(datagram.from, &datagram.payload).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping frame from {}: {}", datagram.from, e);
                return;
            }
        };

        if let Err(e) = self.dispatch(message, datagram.from).await {
            match e {
                MembershipError::UnknownMessageType(_) => {
                    tracing::warn!("Dropping message from {}: {}", datagram.from, e)
                }
                _ => tracing::warn!("Handler failed for message from {}: {}", datagram.from, e),
            }
        }
    }

    pub async fn decode_frame(&self, from: SocketAddr, frame: &[u8]) -> Result<Message> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(MembershipError::malformed(format!(
                "frame of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let encoded_with = u16::from_be_bytes([frame[0], frame[1]]);
        let newest = u16::from_be_bytes([frame[2], frame[3]]);

        let peer = ProtocolVersion::negotiate(newest)?;
        let version = ProtocolVersion::from_ordinal(encoded_with)
            .filter(|version| *version <= self.local_version)
            .ok_or(MembershipError::UnsupportedVersion {
                kind: "frame",
                required: encoded_with,
                peer: self.local_version.ordinal(),
            })?;

        let message = self.codec.decode(&frame[FRAME_HEADER_LEN..], version)?;
        self.record_peer_version(from, peer).await;
        Ok(message)
    }

    /// Remember what `from` speaks. Peers outside the installed view are
    /// forgotten whenever the view changes.
    async fn record_peer_version(&self, from: SocketAddr, version: ProtocolVersion) {
        let members = self.members_if_view_changed();
        let mut versions = self.peer_versions.write().await;
        if let Some(members) = members {
            versions.retain(|addr, _| members.contains(addr));
        }
        versions.insert(from, version);
    }

    fn members_if_view_changed(&self) -> Option<HashSet<SocketAddr>> {
        let views = self.views.borrow();
        let view = views.as_ref()?;
        let number = view.view_number();
        if self.pruned_at.swap(number, Ordering::AcqRel) == number {
            return None;
        }
        Some(view.members().iter().map(|member| member.socket_addr()).collect())
    }

    fn encode_frame(&self, message: &Message, version: ProtocolVersion) -> Result<Bytes> {
        let payload = self.codec.encode(message, version)?;
        let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.put_u16(version.ordinal());
        frame.put_u16(self.local_version.ordinal());
        frame.extend_from_slice(&payload);
        Ok(frame.freeze())
    }

    /// Addresses a message goes to; broadcasts use the installed view
    pub fn resolve(&self, recipients: &Recipients) -> Vec<SocketAddr> {
        let local = self.local_addr();
        let mut targets: Vec<SocketAddr> = match recipients.members() {
            Some(members) => members.iter().map(|member| member.socket_addr()).collect(),
            None => self
                .views
                .borrow()
                .as_ref()
                .map(|view| view.members().iter().map(|member| member.socket_addr()).collect())
                .unwrap_or_default(),
        };
        targets.retain(|addr| *addr != local);
        targets.sort();
        targets.dedup();
        targets
    }

    /// Send to the message's recipients
    pub async fn send(&self, message: &Message) -> DeliveryReport {
        let targets = self.resolve(&message.recipients);
        self.send_to(message, &targets).await
    }

    /// Send to explicit addresses, e.g. locators before joining
    pub async fn send_to(&self, message: &Message, targets: &[SocketAddr]) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        let mut by_version: BTreeMap<ProtocolVersion, Vec<SocketAddr>> = BTreeMap::new();
        for target in targets {
            by_version.entry(self.peer_version(*target).await).or_default().push(*target);
        }

        let mut sends = JoinSet::new();
        for (version, addrs) in by_version {
            let frame = match self.encode_frame(message, version) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("Cannot encode {} for protocol {}: {}", message, version, e);
                    let reason = e.to_string();
                    for addr in addrs {
                        report.failed.push((addr, MembershipError::transport(reason.clone())));
                    }
                    continue;
                }
            };

            for addr in addrs {
                let transport = self.transport.clone();
                let frame = frame.clone();
                sends.spawn(async move {
                    let len = frame.len();
                    (addr, len, transport.send(addr, frame).await)
                });
            }
        }

        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((addr, len, Ok(()))) => {
                    self.stats.message_sent(len);
                    report.delivered.push(addr);
                }
                Ok((addr, _, Err(e))) => {
                    tracing::debug!("Failed to send {} to {}: {}", message.kind(), addr, e);
                    report.failed.push((addr, e));
                }
                Err(e) => tracing::error!("Send task failed: {}", e),
            }
        }

        if !report.is_complete() {
            tracing::warn!(
                "{} reached {} of {} recipients",
                message.kind(),
                report.delivered.len(),
                report.attempted()
            );
        }
        report
    }

    /// Feed inbound frames to [`receive`](Self::receive) until the channel
    /// closes
    pub fn spawn_receiver(self: Arc<Self>, mut inbound: mpsc::Receiver<Datagram>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(datagram) = inbound.recv().await {
                self.receive(datagram).await;
            }
            tracing::debug!("Inbound channel closed, dispatcher stopping");
        })
    }
}
