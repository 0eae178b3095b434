//! Wire codecs for membership messages
//!
//! Binary frame layout:
//!
//! ```text
//! dsfid(u32) | recipients | body
//! recipients: tag(u8) 0=broadcast | 1=single member | 2=count(u32) members
//! member:     family(u8) addr(4|16) port(u16) start(u64) role(u8) name(opt string)
//! string:     len(u32) utf-8 bytes
//! opt:        flag(u8) value
//! ```
//!
//! The body layout is chosen from the message schema for the negotiated
//! peer version. All integers are big-endian.

use crate::error::{MembershipError, Result};
use crate::member::{MemberIdentifier, MemberRole};
use crate::message::{Message, MessageBody, MessageKind, ProtocolVersion, Recipients, ViewPhase};
use crate::view::View;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Smallest possible encoded member: v4 family, address, port, start, role, no name
const MIN_MEMBER_LEN: usize = 1 + 4 + 2 + 8 + 1 + 1;

/// Encodes and decodes membership messages for a peer protocol version
pub trait MessageCodec: Send + Sync {
    /// Registry key of this codec
    fn name(&self) -> &'static str;

    fn encode(&self, message: &Message, peer: ProtocolVersion) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8], peer: ProtocolVersion) -> Result<Message>;
}

/// Compact versioned binary codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl BinaryCodec {
    pub const NAME: &'static str = "binary";
}

impl MessageCodec for BinaryCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode(&self, message: &Message, peer: ProtocolVersion) -> Result<Bytes> {
        let schema = message.kind().schema();
        let layout = schema.layout_for(peer)?;

        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(schema.dsfid);
        put_recipients(&mut buf, &message.recipients)?;
        put_body(&mut buf, &message.body, layout)?;
        Ok(buf.freeze())
    }

    fn decode(&self, bytes: &[u8], peer: ProtocolVersion) -> Result<Message> {
        let mut reader = Reader::new(bytes);
        let dsfid = reader.u32()?;
        let kind = MessageKind::from_dsfid(dsfid).ok_or(MembershipError::UnknownMessageType(dsfid))?;
        let layout = kind.schema().layout_for(peer)?;

        let recipients = reader.recipients()?;
        let body = reader.body(kind, layout)?;

        if reader.remaining() > 0 {
            return Err(MembershipError::malformed(format!(
                "{} trailing bytes after {}",
                reader.remaining(),
                kind
            )));
        }

        Ok(Message { recipients, body })
    }
}

fn put_body(buf: &mut BytesMut, body: &MessageBody, layout: ProtocolVersion) -> Result<()> {
    use ProtocolVersion::{V1_0, V1_1};

    match (body, layout) {
        (MessageBody::JoinRequest { candidate, .. }, V1_0) => {
            put_member(buf, candidate)?;
        }
        (MessageBody::JoinRequest { candidate, credentials }, V1_1) => {
            put_member(buf, candidate)?;
            put_opt_string(buf, credentials.as_deref())?;
        }
        (MessageBody::JoinRejected { candidate, reason }, _) => {
            put_member(buf, candidate)?;
            put_string(buf, reason)?;
        }
        (MessageBody::LeaveRequest { member, reason }, _) => {
            put_member(buf, member)?;
            put_string(buf, reason)?;
        }
        (MessageBody::RemoveMember { target, reason }, _) => {
            put_member(buf, target)?;
            put_string(buf, reason)?;
        }
        (MessageBody::SuspectMembers { reporter, suspects, .. }, V1_0) => {
            put_member(buf, reporter)?;
            put_members(buf, suspects)?;
        }
        (MessageBody::SuspectMembers { reporter, suspects, reason }, V1_1) => {
            put_member(buf, reporter)?;
            put_members(buf, suspects)?;
            put_string(buf, reason)?;
        }
        (MessageBody::View { phase, sender, view }, _) => {
            buf.put_u8(phase.to_wire());
            put_member(buf, sender)?;
            put_view(buf, view)?;
        }
        (
            MessageBody::ViewAck {
                sender,
                view_number,
                accepted,
                installed,
                prepared,
            },
            _,
        ) => {
            put_member(buf, sender)?;
            buf.put_u64(*view_number);
            buf.put_u8(u8::from(*accepted));
            buf.put_u64(*installed);
            if layout >= V1_1 {
                match prepared {
                    Some(view) => {
                        buf.put_u8(1);
                        put_view(buf, view)?;
                    }
                    None => buf.put_u8(0),
                }
            }
        }
        (MessageBody::ViewResyncRequest { requester, installed }, _) => {
            put_member(buf, requester)?;
            buf.put_u64(*installed);
        }
        (MessageBody::Heartbeat { sender, sequence, .. }, V1_0) => {
            put_member(buf, sender)?;
            buf.put_u64(*sequence);
        }
        (
            MessageBody::Heartbeat {
                sender,
                sequence,
                view_number,
            },
            V1_1,
        ) => {
            put_member(buf, sender)?;
            buf.put_u64(*sequence);
            buf.put_u64(*view_number);
        }
    }
    Ok(())
}

fn put_recipients(buf: &mut BytesMut, recipients: &Recipients) -> Result<()> {
    match recipients {
        Recipients::Broadcast => buf.put_u8(0),
        Recipients::Single(member) => {
            buf.put_u8(1);
            put_member(buf, member)?;
        }
        Recipients::List(members) => {
            buf.put_u8(2);
            put_members(buf, members)?;
        }
    }
    Ok(())
}

fn put_member(buf: &mut BytesMut, member: &MemberIdentifier) -> Result<()> {
    match member.address() {
        IpAddr::V4(addr) => {
            buf.put_u8(4);
            buf.put_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            buf.put_u8(6);
            buf.put_slice(&addr.octets());
        }
    }
    buf.put_u16(member.port());
    buf.put_u64(member.start_time());
    buf.put_u8(member.role().to_wire());
    put_opt_string(buf, member.name())
}

fn put_members(buf: &mut BytesMut, members: &[MemberIdentifier]) -> Result<()> {
    put_len(buf, members.len())?;
    for member in members {
        put_member(buf, member)?;
    }
    Ok(())
}

fn put_view(buf: &mut BytesMut, view: &View) -> Result<()> {
    buf.put_u64(view.view_number());
    match view.coordinator() {
        Some(coordinator) => {
            buf.put_u8(1);
            put_member(buf, coordinator)?;
        }
        None => buf.put_u8(0),
    }
    put_members(buf, view.members())?;
    put_len(buf, view.shunned().len())?;
    for member in view.shunned() {
        put_member(buf, member)?;
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_len(buf, value.len())?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_opt_string(buf: &mut BytesMut, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_string(buf, value)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn put_len(buf: &mut BytesMut, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| MembershipError::malformed(format!("length {} exceeds u32", len)))?;
    buf.put_u32(len);
    Ok(())
}

/// Bounds-checked reader; every short read is a `MalformedMessage`
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(MembershipError::malformed(format!(
                "truncated {}: need {} bytes, have {}",
                what,
                len,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2, "u16")?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4, "u32")?);
        Ok(u32::from_be_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8, "u64")?);
        Ok(u64::from_be_bytes(raw))
    }

    fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(MembershipError::malformed(format!("invalid bool {}", other))),
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len, "string")?;
        String::from_utf8(bytes.to_vec()).map_err(|e| MembershipError::malformed(format!("invalid utf-8: {}", e)))
    }

    fn opt_string(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    /// Element count, checked against the bytes left so a corrupt length
    /// cannot force a huge allocation
    fn count(&mut self, min_element_len: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        if count.saturating_mul(min_element_len) > self.remaining() {
            return Err(MembershipError::malformed(format!(
                "count {} exceeds remaining {} bytes",
                count,
                self.remaining()
            )));
        }
        Ok(count)
    }

    fn member(&mut self) -> Result<MemberIdentifier> {
        let address = match self.u8()? {
            4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(self.take(4, "ipv4 address")?);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16, "ipv6 address")?);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => return Err(MembershipError::malformed(format!("invalid address family {}", other))),
        };
        let port = self.u16()?;
        let start_time = self.u64()?;
        let role = MemberRole::from_wire(self.u8()?)?;
        let name = self.opt_string()?;

        let mut member = MemberIdentifier::with_start_time(SocketAddr::new(address, port), start_time).with_role(role);
        if let Some(name) = name {
            member = member.with_name(name);
        }
        Ok(member)
    }

    fn members(&mut self) -> Result<Vec<MemberIdentifier>> {
        let count = self.count(MIN_MEMBER_LEN)?;
        (0..count).map(|_| self.member()).collect()
    }

    fn recipients(&mut self) -> Result<Recipients> {
        match self.u8()? {
            0 => Ok(Recipients::Broadcast),
            1 => Ok(Recipients::Single(self.member()?)),
            2 => Ok(Recipients::List(self.members()?)),
            other => Err(MembershipError::malformed(format!("invalid recipients tag {}", other))),
        }
    }

    fn view(&mut self) -> Result<View> {
        let view_number = self.u64()?;
        let coordinator = if self.bool()? { Some(self.member()?) } else { None };
        let members = self.members()?;
        let shunned: BTreeSet<MemberIdentifier> = self.members()?.into_iter().collect();
        View::from_parts(view_number, coordinator, members, shunned)
    }

    fn body(&mut self, kind: MessageKind, layout: ProtocolVersion) -> Result<MessageBody> {
        use ProtocolVersion::{V1_0, V1_1};

        let body = match (kind, layout) {
            (MessageKind::JoinRequest, V1_0) => MessageBody::JoinRequest {
                candidate: self.member()?,
                credentials: None,
            },
            (MessageKind::JoinRequest, V1_1) => MessageBody::JoinRequest {
                candidate: self.member()?,
                credentials: self.opt_string()?,
            },
            (MessageKind::JoinRejected, _) => MessageBody::JoinRejected {
                candidate: self.member()?,
                reason: self.string()?,
            },
            (MessageKind::LeaveRequest, _) => MessageBody::LeaveRequest {
                member: self.member()?,
                reason: self.string()?,
            },
            (MessageKind::RemoveMember, _) => MessageBody::RemoveMember {
                target: self.member()?,
                reason: self.string()?,
            },
            (MessageKind::SuspectMembers, V1_0) => MessageBody::SuspectMembers {
                reporter: self.member()?,
                suspects: self.members()?,
                reason: String::new(),
            },
            (MessageKind::SuspectMembers, V1_1) => MessageBody::SuspectMembers {
                reporter: self.member()?,
                suspects: self.members()?,
                reason: self.string()?,
            },
            (MessageKind::View, _) => MessageBody::View {
                phase: ViewPhase::from_wire(self.u8()?)?,
                sender: self.member()?,
                view: self.view()?,
            },
            (MessageKind::ViewAck, V1_0) => MessageBody::ViewAck {
                sender: self.member()?,
                view_number: self.u64()?,
                accepted: self.bool()?,
                installed: self.u64()?,
                prepared: None,
            },
            (MessageKind::ViewAck, V1_1) => MessageBody::ViewAck {
                sender: self.member()?,
                view_number: self.u64()?,
                accepted: self.bool()?,
                installed: self.u64()?,
                prepared: if self.bool()? { Some(self.view()?) } else { None },
            },
            (MessageKind::ViewResyncRequest, _) => MessageBody::ViewResyncRequest {
                requester: self.member()?,
                installed: self.u64()?,
            },
            (MessageKind::Heartbeat, V1_0) => MessageBody::Heartbeat {
                sender: self.member()?,
                sequence: self.u64()?,
                view_number: 0,
            },
            (MessageKind::Heartbeat, V1_1) => MessageBody::Heartbeat {
                sender: self.member()?,
                sequence: self.u64()?,
                view_number: self.u64()?,
            },
        };
        Ok(body)
    }
}

/// Human-readable JSON codec for debugging and tooling
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const NAME: &'static str = "json";
}

#[derive(Serialize)]
struct JsonEnvelopeRef<'a> {
    dsfid: u32,
    #[serde(flatten)]
    message: &'a Message,
}

#[derive(Deserialize)]
struct JsonHeader {
    dsfid: u32,
}

#[derive(Deserialize)]
struct JsonEnvelope {
    #[serde(flatten)]
    message: Message,
}

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn encode(&self, message: &Message, peer: ProtocolVersion) -> Result<Bytes> {
        let schema = message.kind().schema();
        schema.layout_for(peer)?;

        let envelope = JsonEnvelopeRef {
            dsfid: schema.dsfid,
            message,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    fn decode(&self, bytes: &[u8], peer: ProtocolVersion) -> Result<Message> {
        let header: JsonHeader =
            serde_json::from_slice(bytes).map_err(|e| MembershipError::malformed(format!("invalid json: {}", e)))?;
        let kind = MessageKind::from_dsfid(header.dsfid).ok_or(MembershipError::UnknownMessageType(header.dsfid))?;
        kind.schema().layout_for(peer)?;

        let envelope: JsonEnvelope =
            serde_json::from_slice(bytes).map_err(|e| MembershipError::malformed(format!("invalid json: {}", e)))?;
        if envelope.message.kind() != kind {
            return Err(MembershipError::malformed(format!(
                "dsfid {:#06x} does not match body {}",
                header.dsfid,
                envelope.message.kind()
            )));
        }
        Ok(envelope.message)
    }
}
