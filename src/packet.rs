//! BGP UPDATE wire encoding.
//!
//! Renders address deltas into UPDATE message bodies:
//!
//! ```text
//! +---------------+-----------------+------------------+------------------+---------+
//! | WithdrawnLen  | Withdrawn[]     | PathAttrLen      | PathAttr[]       | NLRI[]  |
//! | u16 BE        | prefix-encoded  | u16 BE           | attr-encoded     | prefix  |
//! +---------------+-----------------+------------------+------------------+---------+
//! ```
//!
//! Only IPv4 /32 host routes are produced. The 19-byte BGP message header is
//! the session layer's concern; this module emits bodies.

use bytes::{BufMut, BytesMut};
use std::net::Ipv4Addr;

use crate::error::Error;

/// Attribute flags: well-known, transitive.
const FLAG_WELL_KNOWN_TRANSITIVE: u8 = 0x40;

const ORIGIN_ATTR_TYPE: u8 = 1;
const AS_PATH_ATTR_TYPE: u8 = 2;
const NEXT_HOP_ATTR_TYPE: u8 = 3;
const LOCAL_PREF_ATTR_TYPE: u8 = 5;

/// AS_PATH segment type: ordered sequence.
const AS_SEQUENCE: u8 = 2;

/// Host route prefix length.
const HOST_PREFIX_BITS: u8 = 32;

/// Encoded size of one /32 prefix: length octet plus four address octets.
const HOST_PREFIX_LEN: usize = 5;

/// Largest UPDATE body handed to the session layer: the 4096-byte message
/// ceiling minus the fixed header it adds.
const MAX_BODY_LEN: usize = 4096 - 19;

/// End-of-RIB marker: an UPDATE with no withdrawn routes, no attributes and
/// no NLRI.
pub const END_OF_RIB: [u8; 4] = [0, 0, 0, 0];

/// ORIGIN attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Learned from an interior protocol.
    Igp,
    /// Learned from an exterior protocol.
    Egp,
    /// Origin unknown.
    Incomplete,
}

impl Origin {
    /// Parse a configuration value ("igp", "egp", "incomplete").
    pub fn from_config(value: &str) -> Result<Self, Error> {
        match value.to_ascii_lowercase().as_str() {
            "igp" => Ok(Self::Igp),
            "egp" => Ok(Self::Egp),
            "incomplete" => Ok(Self::Incomplete),
            other => Err(Error::Config(format!("unknown origin {other:?}"))),
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Igp => 0,
            Self::Egp => 1,
            Self::Incomplete => 2,
        }
    }
}

/// The path attributes attached to every announced route.
#[derive(Debug, Clone)]
pub struct PathAttributes {
    /// ORIGIN attribute.
    pub origin: Origin,
    /// AS_PATH; empty for iBGP self-origination.
    pub as_path: Vec<u16>,
    /// NEXT_HOP address.
    pub next_hop: Ipv4Addr,
    /// LOCAL_PREF value.
    pub local_pref: u32,
}

impl PathAttributes {
    /// Render the attribute block.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut buf = BytesMut::with_capacity(32);

        buf.put_u8(FLAG_WELL_KNOWN_TRANSITIVE);
        buf.put_u8(ORIGIN_ATTR_TYPE);
        buf.put_u8(1);
        buf.put_u8(self.origin.code());

        self.put_as_path(&mut buf)?;

        buf.put_u8(FLAG_WELL_KNOWN_TRANSITIVE);
        buf.put_u8(NEXT_HOP_ATTR_TYPE);
        buf.put_u8(4);
        buf.put_slice(&self.next_hop.octets());

        buf.put_u8(FLAG_WELL_KNOWN_TRANSITIVE);
        buf.put_u8(LOCAL_PREF_ATTR_TYPE);
        buf.put_u8(4);
        buf.put_u32(self.local_pref);

        Ok(buf.to_vec())
    }

    fn put_as_path(&self, buf: &mut BytesMut) -> Result<(), Error> {
        if self.as_path.is_empty() {
            buf.put_u8(FLAG_WELL_KNOWN_TRANSITIVE);
            buf.put_u8(AS_PATH_ATTR_TYPE);
            buf.put_u8(0);
            return Ok(());
        }

        // Segment header plus two octets per ASN must fit the one-octet
        // attribute length.
        let value_len = 2 + self.as_path.len() * 2;
        if value_len > u8::MAX as usize {
            return Err(Error::Encode(format!(
                "AS_PATH of {} ASNs does not fit a single segment",
                self.as_path.len()
            )));
        }

        buf.put_u8(FLAG_WELL_KNOWN_TRANSITIVE);
        buf.put_u8(AS_PATH_ATTR_TYPE);
        buf.put_u8(value_len as u8);
        buf.put_u8(AS_SEQUENCE);
        buf.put_u8(self.as_path.len() as u8);
        for asn in &self.as_path {
            buf.put_u16(*asn);
        }

        Ok(())
    }
}

fn put_host_prefix(buf: &mut BytesMut, address: Ipv4Addr) {
    buf.put_u8(HOST_PREFIX_BITS);
    buf.put_slice(&address.octets());
}

fn build_frame(withdrawn: &[Ipv4Addr], nlri: &[Ipv4Addr], attrs: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(
        4 + attrs.len() + HOST_PREFIX_LEN * (withdrawn.len() + nlri.len()),
    );

    buf.put_u16((withdrawn.len() * HOST_PREFIX_LEN) as u16);
    for address in withdrawn {
        put_host_prefix(&mut buf, *address);
    }

    buf.put_u16(attrs.len() as u16);
    buf.put_slice(attrs);

    for address in nlri {
        put_host_prefix(&mut buf, *address);
    }

    buf.to_vec()
}

/// Encode a delta into UPDATE bodies, splitting across frames so no body
/// exceeds the message ceiling. Withdrawals fill frames first, then NLRI;
/// every frame carries the full attribute block. An empty delta yields no
/// frames.
pub fn encode_delta(
    to_add: &[Ipv4Addr],
    to_remove: &[Ipv4Addr],
    attrs: &PathAttributes,
) -> Result<Vec<Vec<u8>>, Error> {
    if to_add.is_empty() && to_remove.is_empty() {
        return Ok(Vec::new());
    }

    let attr_bytes = attrs.to_bytes()?;
    let per_frame = (MAX_BODY_LEN - 4 - attr_bytes.len()) / HOST_PREFIX_LEN;
    debug_assert!(per_frame > 0);

    let mut removes = to_remove;
    let mut adds = to_add;
    let mut frames = Vec::new();

    while !removes.is_empty() || !adds.is_empty() {
        let withdrawn_count = removes.len().min(per_frame);
        let (withdrawn, rest) = removes.split_at(withdrawn_count);
        removes = rest;

        let nlri_count = adds.len().min(per_frame - withdrawn_count);
        let (nlri, rest) = adds.split_at(nlri_count);
        adds = rest;

        frames.push(build_frame(withdrawn, nlri, &attr_bytes));
    }

    Ok(frames)
}
