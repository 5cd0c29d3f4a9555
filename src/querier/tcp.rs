use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use bytes::BufMut;
use futures::future::BoxFuture;
use hickory_proto::rr::RecordType;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::DnsQuerier;
use crate::proto_utils::{build_query, is_ip_literal, parse_answers};

/// 空闲连接最长保留时间
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_IDLE: usize = 4;
/// CNAME 链最大深度
const MAX_CHAIN: usize = 8;

trait DnsStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DnsStream for T {}

/// Length-prefixed DNS over TCP (RFC 1035 §4.2.2), optionally wrapped in
/// TLS for DNS-over-TLS. Connections are reused while younger than 60s idle.
pub struct TcpQuerier {
    protocol: &'static str,
    servers: Vec<SocketAddr>,
    timeout: Duration,
    tls: Option<TlsConnector>,
    idle: Mutex<Vec<(Box<dyn DnsStream>, Instant)>>,
}

impl TcpQuerier {
    pub fn plain(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            protocol: "tcp",
            servers,
            timeout,
            tls: None,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// DNS-over-TLS; certificates are checked against `ca_file` when given,
    /// otherwise against the bundled web PKI roots.
    pub fn tls(servers: Vec<SocketAddr>, timeout: Duration, ca_file: Option<&Path>) -> anyhow::Result<Self> {
        Ok(Self {
            protocol: "dot",
            servers,
            timeout,
            tls: Some(tls_connector(ca_file)?),
            idle: Mutex::new(Vec::new()),
        })
    }

    fn take_idle(&self) -> Option<Box<dyn DnsStream>> {
        let mut idle = self.idle.lock();
        while let Some((conn, last_used)) = idle.pop() {
            if last_used.elapsed() < IDLE_TIMEOUT {
                return Some(conn);
            }
        }
        None
    }

    fn put_idle(&self, conn: Box<dyn DnsStream>) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push((conn, Instant::now()));
        }
    }

    async fn connect(&self) -> anyhow::Result<Box<dyn DnsStream>> {
        let server = {
            let mut rng = rand::thread_rng();
            *self.servers.choose(&mut rng).context("no dns server configured")?
        };
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("connect {}", server))?;
        let _ = stream.set_nodelay(true);
        match &self.tls {
            None => Ok(Box::new(stream)),
            Some(connector) => {
                let name = ServerName::IpAddress(server.ip().into());
                let tls = connector
                    .connect(name, stream)
                    .await
                    .with_context(|| format!("tls handshake with {}", server))?;
                Ok(Box::new(tls))
            }
        }
    }

    async fn exchange(&self, domain: &str, qtype: RecordType) -> anyhow::Result<Vec<String>> {
        let id: u16 = rand::random();
        let packet = build_query(id, domain, qtype)?;
        let mut frame = Vec::with_capacity(2 + packet.len());
        frame.put_u16(packet.len() as u16);
        frame.extend_from_slice(&packet);

        let (mut conn, resp_len) = match self.take_idle() {
            Some(mut conn) => match send_request(&mut conn, &frame).await {
                Ok(len) => (conn, len),
                Err(err) => {
                    // 空闲期间被服务端关闭的连接，换新连接重试一次
                    debug!(
                        target = "tcp_query",
                        protocol = self.protocol,
                        error = %err,
                        "pooled connection closed, reconnecting"
                    );
                    let mut conn = self.connect().await?;
                    let len = send_request(&mut conn, &frame).await?;
                    (conn, len)
                }
            },
            None => {
                let mut conn = self.connect().await?;
                let len = send_request(&mut conn, &frame).await?;
                (conn, len)
            }
        };

        // read_exact 循环读取直到满足声明长度
        let mut body = vec![0u8; resp_len];
        conn.read_exact(&mut body).await.context("read body")?;

        let (resp_id, ips) = parse_answers(&body)?;
        if resp_id != id {
            anyhow::bail!("transaction id mismatch: sent {} got {}", id, resp_id);
        }
        self.put_idle(conn);
        Ok(ips)
    }

    fn query_chain<'a>(
        &'a self,
        domain: String,
        qtype: RecordType,
        mut visited: Vec<String>,
    ) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let start = Instant::now();
            let answers = match timeout(self.timeout, self.exchange(&domain, qtype)).await {
                Ok(Ok(ips)) => ips,
                Ok(Err(err)) => {
                    warn!(
                        target = "tcp_query",
                        protocol = self.protocol,
                        domain = %domain,
                        qtype = ?qtype,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %err,
                        "query failed"
                    );
                    return Vec::new();
                }
                Err(_) => {
                    warn!(
                        target = "tcp_query",
                        protocol = self.protocol,
                        domain = %domain,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "query timeout"
                    );
                    return Vec::new();
                }
            };
            debug!(
                target = "tcp_query",
                protocol = self.protocol,
                domain = %domain,
                answers = ?answers,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "query returned"
            );

            if qtype == RecordType::NS {
                return answers;
            }
            visited.push(domain.clone());
            let mut ips: Vec<String> = Vec::new();
            for item in answers {
                if is_ip_literal(&item) {
                    if !ips.contains(&item) {
                        ips.push(item);
                    }
                    continue;
                }
                if visited.contains(&item) || visited.len() >= MAX_CHAIN {
                    continue;
                }
                // 应答已带有 CNAME 目标的地址时无需再查
                if !ips.is_empty() {
                    continue;
                }
                for ip in self.query_chain(item, qtype, visited.clone()).await {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            ips
        })
    }
}

/// Writes one framed request and reads the response length prefix.
async fn send_request<S: AsyncRead + AsyncWrite + Unpin>(conn: &mut S, frame: &[u8]) -> anyhow::Result<usize> {
    conn.write_all(frame).await.context("write request")?;
    let mut len_buf = [0u8; 2];
    conn.read_exact(&mut len_buf).await.context("read length")?;
    Ok(u16::from_be_bytes(len_buf) as usize)
}

fn tls_connector(ca_file: Option<&Path>) -> anyhow::Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("open ca file: {}", path.display()))?;
            let mut reader = BufReader::new(file);
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.with_context(|| format!("read ca file: {}", path.display()))?;
                roots.add(cert).context("add ca certificate")?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .context("tls protocol versions")?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[async_trait]
impl DnsQuerier for TcpQuerier {
    fn name(&self) -> &str {
        self.protocol
    }

    async fn query(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        self.query_chain(domain.to_string(), qtype, Vec::new()).await
    }
}
