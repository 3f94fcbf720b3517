//! RFC 1035 / RFC 3596 message encoding and decoding.
//!
//! Only what a stub resolver needs: building A/AAAA/PTR queries, parsing
//! replies with compression-pointer following, and the 2-byte length
//! framing used on TCP. Unknown record types are carried opaquely so a
//! mixed answer section never aborts a parse.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::{Result, bail};
use bytes::{BufMut, BytesMut};

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const CLASS_IN: u16 = 1;

/// Longest presentation-form name we will build or accept.
pub const MAX_NAME: usize = 1025;

/// Textual reasons for reply codes, indexed by rcode.
/// See the IANA DNS parameters registry.
const RCODE_TEXT: [&str; 17] = [
    "Success",
    "Packet Format Error",
    "DNS Server Failure",
    "Non-Existent Domain",
    "Not Implemented",
    "Query Refused",
    "Name Exists when it should not",
    "RR Set Exists when it should not",
    "RR Set that should exist does not",
    "Server Not Authoritative for zone",
    "Name not contained in zone",
    "",
    "",
    "",
    "",
    "",
    "Bad OPT Version or TSIG Signature Failure",
];

/// Human-readable reason for an rcode.
pub fn rcode_text(rcode: u8) -> &'static str {
    RCODE_TEXT
        .get(rcode as usize)
        .filter(|s| !s.is_empty())
        .copied()
        .unwrap_or("Unknown Error")
}

/// The question section entry we sent or received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Spoofing defence: does a reply's question match ours?
    pub fn matches(&self, other: &Question) -> bool {
        self.qtype == other.qtype
            && self.qclass == other.qclass
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

/// One answer-section record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub ttl: u32,
    pub data: RrData,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RrData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Cname(String),
    Other { rtype: u16, rdata: Vec<u8> },
}

impl ResourceRecord {
    pub fn ip(&self) -> Option<IpAddr> {
        match self.data {
            RrData::A(a) => Some(IpAddr::V4(a)),
            RrData::Aaaa(a) => Some(IpAddr::V6(a)),
            _ => None,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self.data, RrData::A(_))
    }
}

/// A parsed reply.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: u16,
    pub truncated: bool,
    pub rcode: u8,
    pub question: Option<Question>,
    pub answers: Vec<ResourceRecord>,
}

fn put_name(buf: &mut BytesMut, name: &str) -> Result<()> {
    if name.len() > MAX_NAME {
        bail!("domain name too long: {} octets", name.len());
    }
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            bail!("label too long in '{}'", name);
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// Build a query for `name`/`qtype`. `edns_payload` above zero appends an
/// OPT pseudo-record advertising that UDP payload size.
pub fn build_query(name: &str, qtype: u16, qid: u16, edns_payload: u16) -> Result<(Vec<u8>, Question)> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(qid);
    buf.put_u16(0x0100); // RD set
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0); // ANCOUNT
    buf.put_u16(0); // NSCOUNT
    buf.put_u16(if edns_payload > 0 { 1 } else { 0 }); // ARCOUNT
    put_name(&mut buf, name)?;
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);
    if edns_payload > 0 {
        buf.put_u8(0); // root name
        buf.put_u16(TYPE_OPT);
        buf.put_u16(edns_payload); // class carries the payload size
        buf.put_u32(0); // extended rcode + version + flags
        buf.put_u16(0); // no options
    }
    let question = Question {
        name: name.to_string(),
        qtype,
        qclass: CLASS_IN,
    };
    Ok((buf.to_vec(), question))
}

/// The reverse-lookup name for an address: `in-addr.arpa` for IPv4,
/// nibble-reversed `ip6.arpa` for IPv6.
pub fn ptr_name(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push(char::from_digit((byte & 0xF) as u32, 16).unwrap());
                name.push('.');
                name.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
                name.push('.');
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8> {
        let Some(&b) = self.buf.get(self.pos) else {
            bail!("truncated message at {}", self.pos);
        };
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes([
            self.u8()?,
            self.u8()?,
            self.u8()?,
            self.u8()?,
        ]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!("truncated message: need {} at {}", n, self.pos);
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    /// Decode a possibly-compressed name starting at the cursor.
    fn name(&mut self) -> Result<String> {
        let mut out = String::new();
        let mut jumps = 0usize;
        let mut pos = self.pos;
        let mut followed = false;

        loop {
            let Some(&len) = self.buf.get(pos) else {
                bail!("truncated name at {}", pos);
            };
            if len & 0xC0 == 0xC0 {
                let Some(&lo) = self.buf.get(pos + 1) else {
                    bail!("truncated compression pointer at {}", pos);
                };
                if !followed {
                    self.pos = pos + 2;
                    followed = true;
                }
                pos = (((len & 0x3F) as usize) << 8) | lo as usize;
                jumps += 1;
                if jumps > 64 {
                    bail!("compression pointer loop");
                }
                continue;
            }
            if len == 0 {
                if !followed {
                    self.pos = pos + 1;
                }
                break;
            }
            let start = pos + 1;
            let end = start + len as usize;
            if end > self.buf.len() {
                bail!("label overruns message");
            }
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(&String::from_utf8_lossy(&self.buf[start..end]));
            if out.len() > MAX_NAME {
                bail!("decoded name too long");
            }
            pos = end;
        }
        Ok(out)
    }
}

/// Parse a reply datagram (or a TCP frame payload).
pub fn parse_message(buf: &[u8]) -> Result<Message> {
    let mut c = Cursor { buf, pos: 0 };
    let id = c.u16()?;
    let flags = c.u16()?;
    let qdcount = c.u16()?;
    let ancount = c.u16()?;
    let _nscount = c.u16()?;
    let _arcount = c.u16()?;

    let truncated = flags & 0x0200 != 0;
    let rcode = (flags & 0x000F) as u8;

    let mut question = None;
    for _ in 0..qdcount {
        let name = c.name()?;
        let qtype = c.u16()?;
        let qclass = c.u16()?;
        if question.is_none() {
            question = Some(Question {
                name,
                qtype,
                qclass,
            });
        }
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let name = c.name()?;
        let rtype = c.u16()?;
        let _class = c.u16()?;
        let ttl = c.u32()?;
        let rdlength = c.u16()? as usize;
        let rd_start = c.pos;
        let data = match rtype {
            TYPE_A if rdlength == 4 => {
                let b = c.take(4)?;
                RrData::A(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            }
            TYPE_AAAA if rdlength == 16 => {
                let b = c.take(16)?;
                let mut o = [0u8; 16];
                o.copy_from_slice(b);
                RrData::Aaaa(Ipv6Addr::from(o))
            }
            TYPE_PTR => {
                let target = c.name()?;
                if c.pos != rd_start + rdlength {
                    c.pos = rd_start + rdlength;
                }
                RrData::Ptr(target)
            }
            TYPE_CNAME => {
                let target = c.name()?;
                if c.pos != rd_start + rdlength {
                    c.pos = rd_start + rdlength;
                }
                RrData::Cname(target)
            }
            _ => RrData::Other {
                rtype,
                rdata: c.take(rdlength)?.to_vec(),
            },
        };
        answers.push(ResourceRecord { name, ttl, data });
    }

    Ok(Message {
        id,
        truncated,
        rcode,
        question,
        answers,
    })
}

/// Prefix a message with the 16-bit network-order length used on TCP.
pub fn frame_tcp(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Build a reply carrying the given answers. The resolver never sends
/// these; they exist for the mock wire and for tests.
pub fn build_reply(
    qid: u16,
    question: &Question,
    answers: &[(u32, RrData)],
    rcode: u8,
    truncated: bool,
) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(qid);
    let mut flags = 0x8180u16 | (rcode as u16 & 0x0F);
    if truncated {
        flags |= 0x0200;
    }
    buf.put_u16(flags);
    buf.put_u16(1);
    buf.put_u16(answers.len() as u16);
    buf.put_u16(0);
    buf.put_u16(0);
    put_name(&mut buf, &question.name).unwrap();
    buf.put_u16(question.qtype);
    buf.put_u16(question.qclass);
    for (ttl, data) in answers {
        put_name(&mut buf, &question.name).unwrap();
        match data {
            RrData::A(a) => {
                buf.put_u16(TYPE_A);
                buf.put_u16(CLASS_IN);
                buf.put_u32(*ttl);
                buf.put_u16(4);
                buf.put_slice(&a.octets());
            }
            RrData::Aaaa(a) => {
                buf.put_u16(TYPE_AAAA);
                buf.put_u16(CLASS_IN);
                buf.put_u32(*ttl);
                buf.put_u16(16);
                buf.put_slice(&a.octets());
            }
            RrData::Ptr(p) => {
                buf.put_u16(TYPE_PTR);
                buf.put_u16(CLASS_IN);
                buf.put_u32(*ttl);
                let mut name = BytesMut::new();
                put_name(&mut name, p).unwrap();
                buf.put_u16(name.len() as u16);
                buf.put_slice(&name);
            }
            _ => unimplemented!("reply builder handles A/AAAA/PTR only"),
        }
    }
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_through_parse() {
        let (wire, q) = build_query("www.example.org", TYPE_A, 0xBEEF, 0).unwrap();
        let msg = parse_message(&wire).unwrap();
        assert_eq!(msg.id, 0xBEEF);
        assert_eq!(msg.rcode, 0);
        assert!(!msg.truncated);
        assert!(msg.question.as_ref().unwrap().matches(&q));
    }

    #[test]
    fn reply_parses_answers() {
        let (_, q) = build_query("www.example.org", TYPE_A, 7, 0).unwrap();
        let wire = build_reply(
            7,
            &q,
            &[(60, RrData::A(Ipv4Addr::new(192, 0, 2, 1)))],
            0,
            false,
        );
        let msg = parse_message(&wire).unwrap();
        assert_eq!(msg.answers.len(), 1);
        assert_eq!(
            msg.answers[0].ip(),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
        );
        assert_eq!(msg.answers[0].ttl, 60);
    }

    #[test]
    fn truncation_and_rcode_surface() {
        let (_, q) = build_query("x.example", TYPE_A, 9, 0).unwrap();
        let wire = build_reply(9, &q, &[], 3, true);
        let msg = parse_message(&wire).unwrap();
        assert!(msg.truncated);
        assert_eq!(msg.rcode, 3);
        assert_eq!(rcode_text(msg.rcode), "Non-Existent Domain");
    }

    #[test]
    fn compressed_names_decode() {
        // hand-built reply with the answer name compressed to the question
        let mut wire = BytesMut::new();
        wire.put_u16(1);
        wire.put_u16(0x8180);
        wire.put_u16(1);
        wire.put_u16(1);
        wire.put_u16(0);
        wire.put_u16(0);
        put_name(&mut wire, "a.example.org").unwrap();
        wire.put_u16(TYPE_A);
        wire.put_u16(CLASS_IN);
        wire.put_u16(0xC00C); // pointer to offset 12 (the question name)
        wire.put_u16(TYPE_A);
        wire.put_u16(CLASS_IN);
        wire.put_u32(30);
        wire.put_u16(4);
        wire.put_slice(&[198, 51, 100, 4]);

        let msg = parse_message(&wire).unwrap();
        assert_eq!(msg.answers[0].name, "a.example.org");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_message(&[0, 1, 2]).is_err());
        // pointer loop
        let mut wire = BytesMut::new();
        wire.put_u16(1);
        wire.put_u16(0x8180);
        wire.put_u16(1);
        wire.put_u16(0);
        wire.put_u16(0);
        wire.put_u16(0);
        wire.put_u16(0xC00C); // points at itself
        wire.put_u16(TYPE_A);
        wire.put_u16(CLASS_IN);
        assert!(parse_message(&wire).is_err());
    }

    #[test]
    fn ptr_names() {
        assert_eq!(
            ptr_name("192.0.2.44".parse().unwrap()),
            "44.2.0.192.in-addr.arpa"
        );
        let v6 = ptr_name("2001:db8::1".parse().unwrap());
        assert!(v6.ends_with("ip6.arpa"));
        assert!(v6.starts_with("1.0.0.0."));
    }

    #[test]
    fn labels_are_validated() {
        let long = "a".repeat(64);
        assert!(build_query(&long, TYPE_A, 1, 0).is_err());
    }
}
