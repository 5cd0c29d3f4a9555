use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use anyhow::Context;
use bytes::BufMut;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_AAAA: u16 = 28;

/// 应答记录的 TTL
pub const ANSWER_TTL: u32 = 60;

#[inline]
pub fn is_ip_literal(s: &str) -> bool {
    s.parse::<IpAddr>().is_ok()
}

/// Lower-cased name without the trailing root dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// 构造单问题、RD=1 的标准查询报文
pub fn build_query(id: u16, domain: &str, qtype: RecordType) -> anyhow::Result<Vec<u8>> {
    let mut name = Name::from_ascii(domain).with_context(|| format!("invalid query name: {}", domain))?;
    name.set_fqdn(true);
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name, qtype));
    Ok(msg.to_vec()?)
}

/// Answer section as text: IP literals for A/AAAA, target names for
/// CNAME/NS. Other record types are skipped.
pub fn answers_from_message(msg: &Message) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(msg.answers().len());
    for record in msg.answers() {
        let item = match record.data() {
            Some(RData::A(a)) => a.0.to_string(),
            Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
            Some(RData::CNAME(cname)) => normalize_name(&cname.0.to_ascii()),
            Some(RData::NS(ns)) => normalize_name(&ns.0.to_ascii()),
            _ => continue,
        };
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// 解析响应报文，返回 (事务ID, 应答列表)
pub fn parse_answers(packet: &[u8]) -> anyhow::Result<(u16, Vec<String>)> {
    let msg = Message::from_vec(packet).context("parse dns response")?;
    Ok((msg.id(), answers_from_message(&msg)))
}

/// Keeps only the items whose family fits `qtype`. NS keeps names.
pub fn filter_for_type(items: Vec<String>, qtype: RecordType) -> Vec<String> {
    items
        .into_iter()
        .filter(|item| answer_rdata(item, qtype).is_some())
        .collect()
}

fn answer_rdata(item: &str, qtype: RecordType) -> Option<RData> {
    match (qtype, IpAddr::from_str(item)) {
        (RecordType::A, Ok(IpAddr::V4(v4))) => Some(RData::A(A(v4))),
        (RecordType::AAAA, Ok(IpAddr::V6(v6))) => Some(RData::AAAA(AAAA(v6))),
        (RecordType::NS, Err(_)) => {
            let mut name = Name::from_ascii(item).ok()?;
            name.set_fqdn(true);
            Some(RData::NS(NS(name)))
        }
        _ => None,
    }
}

/// Builds the reply to `request`: same ID and question, AA and RA set, one
/// record per item whose family matches the question type. Mismatching
/// items are skipped.
pub fn build_answer_response(request: &Message, answers: &[String]) -> anyhow::Result<Vec<u8>> {
    let query = request.queries().first().context("empty question")?;
    let qtype = query.query_type();

    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_authoritative(true);
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(ResponseCode::NoError);
    msg.add_query(query.clone());

    for item in answers {
        if let Some(rdata) = answer_rdata(item, qtype) {
            msg.add_answer(Record::from_rdata(query.name().clone(), ANSWER_TTL, rdata));
        }
    }
    Ok(msg.to_vec()?)
}

pub const SOCKS5_ATYP_V4: u8 = 1;
pub const SOCKS5_ATYP_DOMAIN: u8 = 3;
pub const SOCKS5_ATYP_V6: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Addr {
    V4(Ipv4Addr),
    Domain(String),
    V6(Ipv6Addr),
}

/// SOCKS5 UDP request header (RFC 1928 §7):
/// `RSV(2) FRAG(1) ATYP(1) DST.ADDR DST.PORT(2) DATA`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5UdpHeader {
    pub frag: u8,
    pub addr: Socks5Addr,
    pub port: u16,
}

impl Socks5UdpHeader {
    /// Returns the header and the payload slice, or `None` on truncation or
    /// an unknown address type.
    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < 4 || buf[0] != 0 || buf[1] != 0 {
            return None;
        }
        let frag = buf[2];
        let mut pos = 4;
        let addr = match buf[3] {
            SOCKS5_ATYP_V4 => {
                let octets: [u8; 4] = buf.get(pos..pos + 4)?.try_into().ok()?;
                pos += 4;
                Socks5Addr::V4(Ipv4Addr::from(octets))
            }
            SOCKS5_ATYP_V6 => {
                let octets: [u8; 16] = buf.get(pos..pos + 16)?.try_into().ok()?;
                pos += 16;
                Socks5Addr::V6(Ipv6Addr::from(octets))
            }
            SOCKS5_ATYP_DOMAIN => {
                let len = *buf.get(pos)? as usize;
                pos += 1;
                let raw = buf.get(pos..pos + len)?;
                pos += len;
                Socks5Addr::Domain(String::from_utf8(raw.to_vec()).ok()?)
            }
            _ => return None,
        };
        let port_bytes = buf.get(pos..pos + 2)?;
        let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
        pos += 2;
        Some((Self { frag, addr, port }, &buf[pos..]))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u16(0);
        out.put_u8(self.frag);
        match &self.addr {
            Socks5Addr::V4(v4) => {
                out.put_u8(SOCKS5_ATYP_V4);
                out.put_slice(&v4.octets());
            }
            Socks5Addr::V6(v6) => {
                out.put_u8(SOCKS5_ATYP_V6);
                out.put_slice(&v6.octets());
            }
            Socks5Addr::Domain(d) => {
                out.put_u8(SOCKS5_ATYP_DOMAIN);
                let bytes = d.as_bytes();
                let len = bytes.len().min(u8::MAX as usize);
                out.put_u8(len as u8);
                out.put_slice(&bytes[..len]);
            }
        }
        out.put_u16(self.port);
    }
}
