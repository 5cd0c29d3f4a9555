//! DNS transports. Every querier resolves `(domain, type)` to a list of
//! answers and never fails: timeouts, refused connections, TLS and HTTP
//! errors all come back as an empty list.

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use regex::Regex;
use tracing::info;

pub mod https;
pub mod remote;
pub mod tcp;
pub mod udp;

pub use https::HttpsQuerier;
pub use remote::{FrontDispatcher, RemoteQuerier, ReqwestDispatcher};
pub use tcp::TcpQuerier;
pub use udp::UdpQuerier;

#[async_trait]
pub trait DnsQuerier: Send + Sync {
    fn name(&self) -> &str;

    /// Answers in upstream order. IP literals, or names for CNAME/NS
    /// answers. Empty on any failure.
    async fn query(&self, domain: &str, qtype: RecordType) -> Vec<String>;
}

/// The five transports the policy engine picks from.
#[derive(Clone)]
pub struct Queriers {
    pub local: Arc<dyn DnsQuerier>,
    pub tcp: Arc<dyn DnsQuerier>,
    pub tls: Arc<dyn DnsQuerier>,
    pub https: Arc<dyn DnsQuerier>,
    pub remote: Arc<dyn DnsQuerier>,
}

/// A transport that never answers; stands in for disabled transports.
#[derive(Debug, Default)]
pub struct Disabled {
    name: String,
}

impl Disabled {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl DnsQuerier for Disabled {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, _domain: &str, _qtype: RecordType) -> Vec<String> {
        Vec::new()
    }
}

/// Name servers from a resolv.conf style file, skipping loopback.
pub fn system_dns_servers(path: &Path) -> Vec<SocketAddr> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    parse_resolv_conf(&raw)
}

fn parse_resolv_conf(raw: &str) -> Vec<SocketAddr> {
    let re = match Regex::new(r"(?m)^\s*nameserver\s+(\S+)") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let mut out = Vec::new();
    for cap in re.captures_iter(raw) {
        // fe80::1%eth0 形式的作用域后缀直接丢弃
        let text = cap[1].split('%').next().unwrap_or_default();
        let Ok(ip) = text.parse::<IpAddr>() else {
            continue;
        };
        if ip.is_loopback() {
            continue;
        }
        info!(target = "querier", server = %ip, "local dns server");
        out.push(SocketAddr::new(ip, 53));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_skips_loopback_and_garbage() {
        let raw = "# generated\n\
                   nameserver 127.0.0.1\n\
                   nameserver 192.168.1.1\n\
                   search lan\n\
                   nameserver fe80::1%eth0\n\
                   nameserver bogus\n";
        let servers = parse_resolv_conf(raw);
        assert_eq!(
            servers,
            vec![
                "192.168.1.1:53".parse::<SocketAddr>().unwrap(),
                "[fe80::1]:53".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn disabled_querier_is_empty() {
        let q = Disabled::new("off");
        assert_eq!(q.name(), "off");
        assert!(q.query("example.com", RecordType::A).await.is_empty());
    }
}
