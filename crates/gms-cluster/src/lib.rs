//! Cluster Group Membership
//!
//! This crate maintains an agreed, numbered sequence of membership views for
//! a cluster of processes: members join through locators, leave or get
//! removed, and a coordinator installs each new view with a two-phase
//! prepare/install exchange. A heartbeat failure detector suspects silent
//! members and drives their removal.
//!
//! [`MembershipService`] is the entry point; the protocol cores
//! ([`ViewManager`], [`FailureDetector`]) are plain state machines that can be
//! driven directly.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failure_detector;
pub mod member;
pub mod message;
pub mod registry;
pub mod service;
pub mod stats;
pub mod transport;
pub mod view;
pub mod view_manager;

pub use codec::{BinaryCodec, JsonCodec, MessageCodec};
pub use config::MembershipConfig;
pub use dispatcher::{DeliveryReport, MessageDispatcher, MessageHandler};
pub use error::{MembershipError, Result};
pub use failure_detector::{DetectorEvent, FailureDetector, SuspicionPolicy};
pub use member::{MemberIdentifier, MemberRole};
pub use message::{Message, MessageBody, MessageKind, ProtocolVersion, Recipients, ViewPhase};
pub use registry::{Authenticator, AuthenticatorRegistry, CodecRegistry};
pub use service::{MembershipEvent, MembershipService, ServiceComponents, ServiceStatus};
pub use stats::{AtomicConnectionStatistics, ConnectionStatistics, StatisticsSnapshot};
pub use transport::{Datagram, InMemoryNetwork, MemoryTransport, Transport, UdpTransport};
pub use view::{View, ViewDiff};
pub use view_manager::{AckPolicy, InstallationPolicy, ManagerState, ViewAction, ViewManager};
