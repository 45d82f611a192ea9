//! A narrow STUN (RFC 5389) subset: Binding Request/Response with
//! MESSAGE-INTEGRITY and XOR-MAPPED-ADDRESS. This is the only STUN message
//! pair the core needs — for server-reflexive candidate discovery (§4.2)
//! and connectivity-check nomination (§4.3) — so a full third-party STUN
//! parser would be unneeded weight; `hmac`+`sha1` cover the integrity
//! check and `rand` the transaction id, matching the crates the retrieval
//! pack's RTP-handling examples already pull in for similar jobs.

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::address::Address;
use crate::error::StunError;

type HmacSha1 = Hmac<Sha1>;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const TYPE_BINDING_REQUEST: u16 = 0x0001;
const TYPE_BINDING_RESPONSE: u16 = 0x0101;

const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
    rand::random()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    BindingRequest,
    BindingResponse,
}

/// Build a Binding Request, with a MESSAGE-INTEGRITY attribute keyed by
/// `key` (the session password per §4.3).
pub fn encode_binding_request(transaction_id: &TransactionId, key: &[u8]) -> BytesMut {
    encode_message(TYPE_BINDING_REQUEST, transaction_id, key, |_| {})
}

/// Build a Binding Response carrying the reflexive address the request was
/// observed from, with a MESSAGE-INTEGRITY attribute keyed by `key`.
pub fn encode_binding_response(
    transaction_id: &TransactionId,
    mapped: Address,
    key: &[u8],
) -> BytesMut {
    encode_message(TYPE_BINDING_RESPONSE, transaction_id, key, |buf| {
        encode_xor_mapped_address(buf, transaction_id, mapped);
    })
}

fn encode_message(
    msg_type: u16,
    transaction_id: &TransactionId,
    key: &[u8],
    write_attrs: impl FnOnce(&mut BytesMut),
) -> BytesMut {
    let mut body = BytesMut::new();
    write_attrs(&mut body);

    // MESSAGE-INTEGRITY covers the header with the length field set as if
    // the integrity attribute (24 bytes: 4 header + 20 digest) were already
    // appended, per RFC 5389 §15.4.
    let mut header = BytesMut::with_capacity(HEADER_LEN);
    header.put_u16(msg_type);
    header.put_u16((body.len() + 24) as u16);
    header.put_u32(MAGIC_COOKIE);
    header.put_slice(transaction_id);

    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&header);
    mac.update(&body);
    let digest = mac.finalize().into_bytes();

    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len() + 24);
    out.put_slice(&header);
    out.put_slice(&body);
    out.put_u16(ATTR_MESSAGE_INTEGRITY);
    out.put_u16(20);
    out.put_slice(&digest);
    out
}

fn encode_xor_mapped_address(buf: &mut BytesMut, transaction_id: &TransactionId, addr: Address) {
    let mut value = BytesMut::new();
    value.put_u8(0);
    let xport = addr.port() ^ ((MAGIC_COOKIE >> 16) as u16);
    match addr.ip() {
        std::net::IpAddr::V4(ip) => {
            value.put_u8(FAMILY_IPV4);
            value.put_u16(xport);
            let xaddr = u32::from(ip) ^ MAGIC_COOKIE;
            value.put_u32(xaddr);
        }
        std::net::IpAddr::V6(ip) => {
            value.put_u8(FAMILY_IPV6);
            value.put_u16(xport);
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let octets = ip.octets();
            let mut xaddr = [0u8; 16];
            for i in 0..16 {
                xaddr[i] = octets[i] ^ xor_key[i];
            }
            value.put_slice(&xaddr);
        }
    }
    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(value.len() as u16);
    buf.put_slice(&value);
    pad_to_4(buf, value.len());
}

fn pad_to_4(buf: &mut BytesMut, value_len: usize) {
    let padding = (4 - (value_len % 4)) % 4;
    for _ in 0..padding {
        buf.put_u8(0);
    }
}

/// Quick classification of an inbound datagram as STUN or not, without
/// fully parsing it — used by `demux` to route datagrams before DTLS sees
/// them.
pub fn looks_like_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN
        && (buf[0] & 0xC0) == 0
        && u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) == MAGIC_COOKIE
}

pub struct ParsedMessage {
    pub class: MessageClass,
    pub transaction_id: TransactionId,
    pub mapped_address: Option<Address>,
}

/// Parse a STUN message, verifying MESSAGE-INTEGRITY against `key`.
pub fn parse_message(buf: &[u8], key: &[u8]) -> Result<ParsedMessage, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::TooShort(buf.len()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    let length = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadMagicCookie);
    }
    let mut transaction_id = [0u8; 12];
    transaction_id.copy_from_slice(&buf[8..20]);

    let class = match msg_type {
        TYPE_BINDING_REQUEST => MessageClass::BindingRequest,
        TYPE_BINDING_RESPONSE => MessageClass::BindingResponse,
        other => return Err(StunError::UnexpectedType(other)),
    };

    if buf.len() < HEADER_LEN + length {
        return Err(StunError::TruncatedAttribute(buf.len()));
    }
    let attrs = &buf[HEADER_LEN..HEADER_LEN + length];

    let mut mapped_address = None;
    let mut integrity_verified = false;
    let mut cursor = attrs;
    let mut consumed = 0usize;
    while cursor.len() >= 4 {
        let attr_type = u16::from_be_bytes([cursor[0], cursor[1]]);
        let attr_len = u16::from_be_bytes([cursor[2], cursor[3]]) as usize;
        if cursor.len() < 4 + attr_len {
            return Err(StunError::TruncatedAttribute(consumed));
        }
        let value = &cursor[4..4 + attr_len];

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                mapped_address = Some(decode_xor_mapped_address(value, &transaction_id)?);
            }
            ATTR_MESSAGE_INTEGRITY => {
                if attr_len != 20 {
                    return Err(StunError::MissingIntegrity);
                }
                // Integrity covers everything up to (not including) this attribute.
                let covered_len = HEADER_LEN + consumed;
                let mut mac = HmacSha1::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(&buf[0..covered_len]);
                mac.verify_slice(value)
                    .map_err(|_| StunError::IntegrityMismatch)?;
                integrity_verified = true;
                break;
            }
            _ => {}
        }

        let padded = 4 + attr_len + ((4 - (attr_len % 4)) % 4);
        cursor.advance(padded.min(cursor.len()));
        consumed += padded;
    }

    if !integrity_verified {
        return Err(StunError::MissingIntegrity);
    }

    if class == MessageClass::BindingResponse && mapped_address.is_none() {
        return Err(StunError::MissingMappedAddress);
    }

    Ok(ParsedMessage {
        class,
        transaction_id,
        mapped_address,
    })
}

fn decode_xor_mapped_address(value: &[u8], transaction_id: &TransactionId) -> Result<Address, StunError> {
    if value.len() < 4 {
        return Err(StunError::TruncatedAttribute(0));
    }
    let family = value[1];
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);
    match family {
        FAMILY_IPV4 => {
            if value.len() < 8 {
                return Err(StunError::TruncatedAttribute(0));
            }
            let xaddr = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
            let addr = xaddr ^ MAGIC_COOKIE;
            Ok(Address::new(std::net::IpAddr::V4(addr.into()), port))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::TruncatedAttribute(0));
            }
            let mut xor_key = [0u8; 16];
            xor_key[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            xor_key[4..16].copy_from_slice(transaction_id);
            let mut octets = [0u8; 16];
            for i in 0..16 {
                octets[i] = value[4 + i] ^ xor_key[i];
            }
            Ok(Address::new(std::net::IpAddr::V6(octets.into()), port))
        }
        _ => Err(StunError::MissingMappedAddress),
    }
}
