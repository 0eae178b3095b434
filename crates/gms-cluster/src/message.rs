//! Membership protocol messages
//!
//! Every message kind has a fixed discriminant (DSFID) and a schema listing
//! the protocol versions at which its wire layout changed. The codec picks
//! the layout from the schema for the negotiated peer version.

use crate::error::{MembershipError, Result};
use crate::member::MemberIdentifier;
use crate::view::View;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Membership protocol versions, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Initial protocol
    #[serde(rename = "1.0")]
    V1_0,
    /// Adds join credentials, suspicion reasons, heartbeat view numbers, view
    /// resynchronization and competing candidates in refused acknowledgments
    #[serde(rename = "1.1")]
    V1_1,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V1_1;
    pub const OLDEST: ProtocolVersion = ProtocolVersion::V1_0;

    const ALL: [ProtocolVersion; 2] = [ProtocolVersion::V1_0, ProtocolVersion::V1_1];

    pub fn ordinal(&self) -> u16 {
        match self {
            Self::V1_0 => 10,
            Self::V1_1 => 11,
        }
    }

    pub fn from_ordinal(ordinal: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.ordinal() == ordinal)
    }

    /// Highest version both sides understand. Peers newer than us are
    /// spoken to at our current version.
    pub fn negotiate(peer_ordinal: u16) -> Result<Self> {
        Self::ALL
            .iter()
            .rev()
            .copied()
            .find(|v| v.ordinal() <= peer_ordinal)
            .ok_or(MembershipError::UnsupportedVersion {
                kind: "protocol",
                required: Self::OLDEST.ordinal(),
                peer: peer_ordinal,
            })
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V1_0 => write!(f, "1.0"),
            Self::V1_1 => write!(f, "1.1"),
        }
    }
}

/// Discriminant of each message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinRequest,
    JoinRejected,
    LeaveRequest,
    RemoveMember,
    SuspectMembers,
    View,
    ViewAck,
    ViewResyncRequest,
    Heartbeat,
}

/// Static wire schema of a message kind
#[derive(Debug)]
pub struct MessageSchema {
    pub kind: MessageKind,
    pub dsfid: u32,
    pub name: &'static str,
    /// Oldest protocol version that knows this kind
    pub since: ProtocolVersion,
    /// Versions at which the field layout changed, oldest first
    pub revisions: &'static [ProtocolVersion],
}

impl MessageSchema {
    /// Layout to use when talking to a peer at `peer`
    pub fn layout_for(&self, peer: ProtocolVersion) -> Result<ProtocolVersion> {
        self.revisions
            .iter()
            .rev()
            .copied()
            .find(|revision| *revision <= peer)
            .ok_or(MembershipError::UnsupportedVersion {
                kind: self.name,
                required: self.since.ordinal(),
                peer: peer.ordinal(),
            })
    }
}

use ProtocolVersion::{V1_0, V1_1};

static SCHEMAS: [MessageSchema; 9] = [
    MessageSchema {
        kind: MessageKind::JoinRequest,
        dsfid: 0x0101,
        name: "JoinRequest",
        since: V1_0,
        revisions: &[V1_0, V1_1],
    },
    MessageSchema {
        kind: MessageKind::JoinRejected,
        dsfid: 0x0102,
        name: "JoinRejected",
        since: V1_0,
        revisions: &[V1_0],
    },
    MessageSchema {
        kind: MessageKind::LeaveRequest,
        dsfid: 0x0103,
        name: "LeaveRequest",
        since: V1_0,
        revisions: &[V1_0],
    },
    MessageSchema {
        kind: MessageKind::RemoveMember,
        dsfid: 0x0104,
        name: "RemoveMember",
        since: V1_0,
        revisions: &[V1_0],
    },
    MessageSchema {
        kind: MessageKind::SuspectMembers,
        dsfid: 0x0105,
        name: "SuspectMembers",
        since: V1_0,
        revisions: &[V1_0, V1_1],
    },
    MessageSchema {
        kind: MessageKind::View,
        dsfid: 0x0106,
        name: "View",
        since: V1_0,
        revisions: &[V1_0],
    },
    MessageSchema {
        kind: MessageKind::ViewAck,
        dsfid: 0x0107,
        name: "ViewAck",
        since: V1_0,
        revisions: &[V1_0, V1_1],
    },
    MessageSchema {
        kind: MessageKind::ViewResyncRequest,
        dsfid: 0x0108,
        name: "ViewResyncRequest",
        since: V1_1,
        revisions: &[V1_1],
    },
    MessageSchema {
        kind: MessageKind::Heartbeat,
        dsfid: 0x0109,
        name: "Heartbeat",
        since: V1_0,
        revisions: &[V1_0, V1_1],
    },
];

impl MessageKind {
    pub const ALL: [MessageKind; 9] = [
        MessageKind::JoinRequest,
        MessageKind::JoinRejected,
        MessageKind::LeaveRequest,
        MessageKind::RemoveMember,
        MessageKind::SuspectMembers,
        MessageKind::View,
        MessageKind::ViewAck,
        MessageKind::ViewResyncRequest,
        MessageKind::Heartbeat,
    ];

    pub fn schema(&self) -> &'static MessageSchema {
        let index = match self {
            Self::JoinRequest => 0,
            Self::JoinRejected => 1,
            Self::LeaveRequest => 2,
            Self::RemoveMember => 3,
            Self::SuspectMembers => 4,
            Self::View => 5,
            Self::ViewAck => 6,
            Self::ViewResyncRequest => 7,
            Self::Heartbeat => 8,
        };
        &SCHEMAS[index]
    }

    pub fn dsfid(&self) -> u32 {
        self.schema().dsfid
    }

    pub fn from_dsfid(dsfid: u32) -> Option<Self> {
        SCHEMAS.iter().find(|schema| schema.dsfid == dsfid).map(|schema| schema.kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.schema().name)
    }
}

/// Addressees of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipients {
    /// Every member of the sender's installed view
    Broadcast,
    Single(MemberIdentifier),
    List(Vec<MemberIdentifier>),
}

impl Recipients {
    /// Explicit recipients, `None` for broadcast
    pub fn members(&self) -> Option<&[MemberIdentifier]> {
        match self {
            Self::Broadcast => None,
            Self::Single(member) => Some(std::slice::from_ref(member)),
            Self::List(members) => Some(members),
        }
    }

    pub fn includes(&self, member: &MemberIdentifier) -> bool {
        match self.members() {
            None => true,
            Some(members) => members.contains(member),
        }
    }
}

/// Phase of a view broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewPhase {
    /// Candidate view, to be acknowledged
    Prepare,
    /// Committed view, to be installed
    Install,
    /// Installed view sent in answer to a resync request
    Sync,
}

impl ViewPhase {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Prepare => 0,
            Self::Install => 1,
            Self::Sync => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Prepare),
            1 => Ok(Self::Install),
            2 => Ok(Self::Sync),
            other => Err(MembershipError::malformed(format!("invalid view phase {}", other))),
        }
    }
}

impl fmt::Display for ViewPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Install => write!(f, "install"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    JoinRequest {
        candidate: MemberIdentifier,
        /// Authentication token, since 1.1
        credentials: Option<String>,
    },
    JoinRejected {
        candidate: MemberIdentifier,
        reason: String,
    },
    LeaveRequest {
        member: MemberIdentifier,
        reason: String,
    },
    RemoveMember {
        target: MemberIdentifier,
        reason: String,
    },
    SuspectMembers {
        reporter: MemberIdentifier,
        suspects: Vec<MemberIdentifier>,
        /// Since 1.1, empty from older peers
        reason: String,
    },
    View {
        phase: ViewPhase,
        sender: MemberIdentifier,
        view: View,
    },
    ViewAck {
        sender: MemberIdentifier,
        view_number: u64,
        accepted: bool,
        /// Acknowledger's installed view number
        installed: u64,
        /// Different candidate with the same number the acknowledger already
        /// accepted from another coordinator, since 1.1
        #[serde(default)]
        prepared: Option<View>,
    },
    ViewResyncRequest {
        requester: MemberIdentifier,
        installed: u64,
    },
    Heartbeat {
        sender: MemberIdentifier,
        sequence: u64,
        /// Sender's installed view number, since 1.1, zero from older peers
        view_number: u64,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::JoinRequest { .. } => MessageKind::JoinRequest,
            Self::JoinRejected { .. } => MessageKind::JoinRejected,
            Self::LeaveRequest { .. } => MessageKind::LeaveRequest,
            Self::RemoveMember { .. } => MessageKind::RemoveMember,
            Self::SuspectMembers { .. } => MessageKind::SuspectMembers,
            Self::View { .. } => MessageKind::View,
            Self::ViewAck { .. } => MessageKind::ViewAck,
            Self::ViewResyncRequest { .. } => MessageKind::ViewResyncRequest,
            Self::Heartbeat { .. } => MessageKind::Heartbeat,
        }
    }

    /// Member that originated the message, when the payload names one
    pub fn origin(&self) -> Option<&MemberIdentifier> {
        match self {
            Self::JoinRequest { candidate, .. } => Some(candidate),
            Self::LeaveRequest { member, .. } => Some(member),
            Self::SuspectMembers { reporter, .. } => Some(reporter),
            Self::View { sender, .. } | Self::ViewAck { sender, .. } | Self::Heartbeat { sender, .. } => {
                Some(sender)
            }
            Self::ViewResyncRequest { requester, .. } => Some(requester),
            Self::JoinRejected { .. } | Self::RemoveMember { .. } => None,
        }
    }
}

/// A membership protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub recipients: Recipients,
    pub body: MessageBody,
}

impl Message {
    pub fn new(recipients: Recipients, body: MessageBody) -> Self {
        Self { recipients, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn dsfid(&self) -> u32 {
        self.kind().dsfid()
    }

    /// Removal request for `target` addressed to a single member, usually
    /// the coordinator
    pub fn remove_member<T: Into<String>>(
        recipient: MemberIdentifier,
        target: MemberIdentifier,
        reason: T,
    ) -> Self {
        Self::new(
            Recipients::Single(recipient),
            MessageBody::RemoveMember {
                target,
                reason: reason.into(),
            },
        )
    }

    /// Removal request for `target` addressed to several members
    pub fn remove_member_from_all<T: Into<String>>(
        recipients: Vec<MemberIdentifier>,
        target: MemberIdentifier,
        reason: T,
    ) -> Self {
        Self::new(
            Recipients::List(recipients),
            MessageBody::RemoveMember {
                target,
                reason: reason.into(),
            },
        )
    }

    pub fn join_request(recipient: Recipients, candidate: MemberIdentifier, credentials: Option<String>) -> Self {
        Self::new(recipient, MessageBody::JoinRequest { candidate, credentials })
    }

    pub fn leave_request<T: Into<String>>(recipient: MemberIdentifier, member: MemberIdentifier, reason: T) -> Self {
        Self::new(
            Recipients::Single(recipient),
            MessageBody::LeaveRequest {
                member,
                reason: reason.into(),
            },
        )
    }

    pub fn suspect_members<T: Into<String>>(
        recipients: Recipients,
        reporter: MemberIdentifier,
        suspects: Vec<MemberIdentifier>,
        reason: T,
    ) -> Self {
        Self::new(
            recipients,
            MessageBody::SuspectMembers {
                reporter,
                suspects,
                reason: reason.into(),
            },
        )
    }

    pub fn view(recipients: Recipients, phase: ViewPhase, sender: MemberIdentifier, view: View) -> Self {
        Self::new(recipients, MessageBody::View { phase, sender, view })
    }

    pub fn heartbeat(recipients: Recipients, sender: MemberIdentifier, sequence: u64, view_number: u64) -> Self {
        Self::new(
            recipients,
            MessageBody::Heartbeat {
                sender,
                sequence,
                view_number,
            },
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            MessageBody::JoinRequest { candidate, .. } => write!(f, "JoinRequest({})", candidate),
            MessageBody::JoinRejected { candidate, reason } => {
                write!(f, "JoinRejected({}; reason={})", candidate, reason)
            }
            MessageBody::LeaveRequest { member, reason } => write!(f, "LeaveRequest({}; reason={})", member, reason),
            MessageBody::RemoveMember { target, reason } => write!(f, "RemoveMember({}; reason={})", target, reason),
            MessageBody::SuspectMembers { reporter, suspects, .. } => {
                write!(f, "SuspectMembers(from={}; suspects={})", reporter, suspects.len())
            }
            MessageBody::View { phase, view, .. } => write!(f, "View({}; {})", phase, view),
            MessageBody::ViewAck {
                sender,
                view_number,
                accepted,
                ..
            } => write!(f, "ViewAck({}; view={}; accepted={})", sender, view_number, accepted),
            MessageBody::ViewResyncRequest { requester, installed } => {
                write!(f, "ViewResyncRequest({}; installed={})", requester, installed)
            }
            MessageBody::Heartbeat { sender, sequence, .. } => write!(f, "Heartbeat({}; seq={})", sender, sequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn member(port: u16) -> MemberIdentifier {
        MemberIdentifier::with_start_time(SocketAddr::from(([10, 0, 0, 1], port)), 7)
    }

    #[test]
    fn test_dsfids_are_unique_and_resolvable() {
        let mut seen = HashSet::new();
        for kind in MessageKind::ALL {
            assert!(seen.insert(kind.dsfid()), "duplicate dsfid for {}", kind);
            assert_eq!(MessageKind::from_dsfid(kind.dsfid()), Some(kind));
            assert_eq!(kind.schema().kind, kind);
        }
        assert_eq!(MessageKind::from_dsfid(0xffff), None);
    }

    #[test]
    fn test_schema_revisions_are_ordered() {
        for kind in MessageKind::ALL {
            let schema = kind.schema();
            assert_eq!(schema.revisions.first(), Some(&schema.since));
            assert!(schema.revisions.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn test_layout_selection() {
        let heartbeat = MessageKind::Heartbeat.schema();
        assert_eq!(heartbeat.layout_for(ProtocolVersion::V1_0).unwrap(), ProtocolVersion::V1_0);
        assert_eq!(heartbeat.layout_for(ProtocolVersion::V1_1).unwrap(), ProtocolVersion::V1_1);

        let remove = MessageKind::RemoveMember.schema();
        assert_eq!(remove.layout_for(ProtocolVersion::V1_1).unwrap(), ProtocolVersion::V1_0);

        let resync = MessageKind::ViewResyncRequest.schema();
        assert!(matches!(
            resync.layout_for(ProtocolVersion::V1_0),
            Err(MembershipError::UnsupportedVersion { required: 11, peer: 10, .. })
        ));
    }

    #[test]
    fn test_version_negotiation() {
        assert_eq!(ProtocolVersion::negotiate(10).unwrap(), ProtocolVersion::V1_0);
        assert_eq!(ProtocolVersion::negotiate(11).unwrap(), ProtocolVersion::V1_1);
        assert_eq!(ProtocolVersion::negotiate(42).unwrap(), ProtocolVersion::CURRENT);
        assert!(ProtocolVersion::negotiate(9).is_err());
        assert_eq!(ProtocolVersion::from_ordinal(11), Some(ProtocolVersion::V1_1));
        assert_eq!(ProtocolVersion::V1_1.to_string(), "1.1");
    }

    #[test]
    fn test_remove_member_constructors() {
        let single = Message::remove_member(member(1), member(2), "admin request");
        assert_eq!(single.kind(), MessageKind::RemoveMember);
        assert_eq!(single.recipients.members(), Some(&[member(1)][..]));
        assert_eq!(
            single.to_string(),
            "RemoveMember(10.0.0.1:2#7; reason=admin request)"
        );

        let many = Message::remove_member_from_all(vec![member(1), member(3)], member(2), "");
        assert!(many.recipients.includes(&member(3)));
        assert!(!many.recipients.includes(&member(2)));
        assert!(Recipients::Broadcast.includes(&member(2)));
    }

    #[test]
    fn test_origin() {
        let heartbeat = Message::heartbeat(Recipients::Broadcast, member(4), 1, 1);
        assert_eq!(heartbeat.body.origin(), Some(&member(4)));

        let remove = Message::remove_member(member(1), member(2), "x");
        assert_eq!(remove.body.origin(), None);
    }
}
