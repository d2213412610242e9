use std::borrow::Cow;

use anyhow::{anyhow, Result};
use bytes::{BufMut, Bytes, BytesMut};

mod parsers;

pub const HEADER_LEN: usize = 12;

pub const TYPE_NS: u16 = 2;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

#[derive(Debug, Clone)]
pub struct Query {
    request: Bytes,
    header: Header,
}

impl Query {
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let header = Header::from_packet(&bytes)?;
        if matches!(header.flags.message_type, MessageType::Query) {
            Ok(Self {
                request: bytes,
                header,
            })
        } else {
            Err(anyhow!("Got dns response"))
        }
    }

    /// Builds a single-question query. `name` is dotted, `"."` is the root.
    pub fn build(id: u16, name: &str, type_: u16, recursion_desired: bool) -> Result<Self> {
        let mut packet = BytesMut::with_capacity(HEADER_LEN + name.len() + 6);
        packet.put_u16(id);
        packet.put_u16(if recursion_desired { RD_BIT } else { 0 });
        packet.put_u16(1);
        packet.put_u16(0);
        packet.put_u16(0);
        packet.put_u16(0);
        for label in name.split('.').filter(|l| !l.is_empty()) {
            if label.len() > 63 {
                return Err(anyhow!("Label {} is longer than 63 bytes", label));
            }
            packet.put_u8(label.len() as u8);
            packet.put_slice(label.as_bytes());
        }
        packet.put_u8(0);
        packet.put_u16(type_);
        packet.put_u16(CLASS_IN);
        Self::from_bytes(packet.freeze())
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.request
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    response: Bytes,
    header: Header,
    rcode: u16,
}

impl Response {
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        let header = Header::from_packet(&bytes)?;
        if !matches!(header.flags.message_type, MessageType::Response) {
            return Err(anyhow!("Got dns query"));
        }
        // A body that does not parse leaves the header rcode in place.
        let extended = parsers::parse_extended_rcode(&bytes[HEADER_LEN..], &header)
            .ok()
            .and_then(|(_, extended)| extended)
            .unwrap_or(0);
        let rcode = (u16::from(extended) << 4) | u16::from(header.flags.rcode);
        Ok(Self {
            response: bytes,
            header,
            rcode,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    /// Header rcode extended by the OPT record, if any.
    pub fn rcode(&self) -> u16 {
        self.rcode
    }

    pub fn bytes(&self) -> &Bytes {
        &self.response
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum MessageType {
    Query,
    Response,
}

const QR_BIT: u16 = 0x8000;
const RD_BIT: u16 = 0x0100;
const RA_BIT: u16 = 0x0080;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Flags {
    pub message_type: MessageType,
    pub opcode: u8,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
}

impl Flags {
    fn from_bits(bits: u16) -> Self {
        let message_type = if bits & QR_BIT == 0 {
            MessageType::Query
        } else {
            MessageType::Response
        };
        Flags {
            message_type,
            opcode: ((bits >> 11) & 0x0f) as u8,
            recursion_desired: bits & RD_BIT != 0,
            recursion_available: bits & RA_BIT != 0,
            rcode: (bits & 0x0f) as u8,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct Header {
    pub id: u16,
    pub flags: Flags,
    pub questions: u16,
    pub answer_resource_records: u16,
    pub authority_resource_records: u16,
    pub additional_resource_records: u16,
}

impl Header {
    fn from_packet(packet: &[u8]) -> Result<Header> {
        match parsers::parse_header(packet) {
            Ok((_, header)) => Ok(header),
            Err(err) => Err(anyhow!(
                "got error while parsing dns header. Err: {:?}, raw_packet: {:02X?}",
                err,
                packet
            )),
        }
    }
}

/// Mnemonic of a header response code, or its decimal form when unassigned.
pub fn rcode_name(rcode: u16) -> Cow<'static, str> {
    let name = match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        6 => "YXDOMAIN",
        7 => "YXRRSET",
        8 => "NXRRSET",
        9 => "NOTAUTH",
        10 => "NOTZONE",
        16 => "BADSIG",
        17 => "BADKEY",
        18 => "BADTIME",
        19 => "BADMODE",
        20 => "BADNAME",
        21 => "BADALG",
        22 => "BADTRUNC",
        23 => "BADCOOKIE",
        other => return Cow::Owned(other.to_string()),
    };
    Cow::Borrowed(name)
}

/// Header-only response; codes above 15 get an OPT record.
#[cfg(test)]
pub(crate) fn response_bytes(id: u16, rcode: u16) -> Bytes {
    let extended = rcode >> 4;
    let mut packet = BytesMut::with_capacity(HEADER_LEN + 11);
    packet.put_u16(id);
    packet.put_u16(QR_BIT | RD_BIT | RA_BIT | (rcode & 0x0f));
    packet.put_u16(0);
    packet.put_u16(0);
    packet.put_u16(0);
    packet.put_u16(u16::from(extended > 0));
    if extended > 0 {
        packet.put_u8(0);
        packet.put_u16(TYPE_OPT);
        packet.put_u16(1232);
        packet.put_u32(u32::from(extended) << 24);
        packet.put_u16(0);
    }
    packet.freeze()
}

#[cfg(test)]
mod tests {
    use super::{rcode_name, response_bytes, MessageType, Query, Response, TYPE_NS};
    use anyhow::Result;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    #[test]
    fn should_build_root_ns_query() -> Result<()> {
        let query = Query::build(0x1234, ".", TYPE_NS, false)?;

        assert_eq!(
            query.bytes().as_ref(),
            &[0x12u8, 0x34, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0, 1][..]
        );
        assert_eq!(query.id(), 0x1234);
        assert!(!query.header().flags.recursion_desired);
        Ok(())
    }

    #[test]
    fn should_encode_labels() -> Result<()> {
        let query = Query::build(7, "www.google.com", 1, true)?;

        assert_eq!(
            &query.bytes()[12..],
            &b"\x03www\x06google\x03com\x00\x00\x01\x00\x01"[..]
        );
        assert!(query.header().flags.recursion_desired);
        assert_eq!(query.header().questions, 1);
        Ok(())
    }

    #[test]
    fn should_parse_response_header() -> Result<()> {
        let response = Response::from_bytes(response_bytes(0xdc06, 3))?;

        assert_eq!(response.id(), 0xdc06);
        assert_eq!(response.rcode(), 3);
        assert_eq!(response.header().flags.message_type, MessageType::Response);
        assert!(response.header().flags.recursion_available);
        Ok(())
    }

    #[test]
    fn should_reject_wrong_direction() -> Result<()> {
        let query = Query::build(1, "example.org", 1, true)?;

        assert!(Response::from_bytes(query.bytes().clone()).is_err());
        assert!(Query::from_bytes(response_bytes(1, 0)).is_err());
        Ok(())
    }

    #[test]
    fn should_reject_truncated_header() {
        assert!(Response::from_bytes(Bytes::from_static(&[0x80, 0x00, 0x81])).is_err());
    }

    #[test]
    fn should_name_rcodes() {
        assert_eq!(rcode_name(0), "NOERROR");
        assert_eq!(rcode_name(2), "SERVFAIL");
        assert_eq!(rcode_name(3), "NXDOMAIN");
        assert_eq!(rcode_name(5), "REFUSED");
        assert_eq!(rcode_name(10), "NOTZONE");
        assert_eq!(rcode_name(13), "13");
        assert_eq!(rcode_name(16), "BADSIG");
        assert_eq!(rcode_name(23), "BADCOOKIE");
        assert_eq!(rcode_name(24), "24");
    }

    #[test]
    fn should_extend_rcode_from_opt_record() -> Result<()> {
        let response = Response::from_bytes(response_bytes(9, 16))?;

        assert_eq!(response.header().flags.rcode, 0);
        assert_eq!(response.rcode(), 16);
        assert_eq!(rcode_name(response.rcode()), "BADSIG");
        Ok(())
    }

    #[test]
    fn should_keep_header_rcode_when_body_is_malformed() -> Result<()> {
        let mut packet = response_bytes(9, 2).to_vec();
        packet[11] = 1;
        packet.extend_from_slice(&[0x00, 0x00]);

        let response = Response::from_bytes(Bytes::from(packet))?;

        assert_eq!(response.rcode(), 2);
        Ok(())
    }
}
