use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use super::DnsQuerier;
use crate::cache::{PendingTable, new_pending_table, register};
use crate::proto_utils::{build_query, parse_answers};

/// 关联表容量
const PENDING_CAPACITY: u64 = 100;

/// Plain UDP to the system's configured resolvers. One socket and one
/// receiver task per address family; responses are matched to waiters by
/// transaction ID, unmatched ones are dropped.
pub struct UdpQuerier {
    servers: Vec<SocketAddr>,
    timeout: Duration,
    v4: Option<Arc<UdpSocket>>,
    v6: Option<Arc<UdpSocket>>,
    waiters: PendingTable,
    receivers: Vec<JoinHandle<()>>,
}

impl UdpQuerier {
    /// Must be called inside a tokio runtime.
    pub fn bind(servers: Vec<SocketAddr>, timeout: Duration) -> anyhow::Result<Self> {
        let waiters = new_pending_table(PENDING_CAPACITY, timeout.max(Duration::from_secs(1)));
        let mut receivers = Vec::new();

        let v4 = if servers.iter().any(|s| s.is_ipv4()) {
            let sock = Arc::new(bind_client_socket("0.0.0.0:0".parse()?)?);
            receivers.push(spawn_receiver(sock.clone(), waiters.clone()));
            Some(sock)
        } else {
            None
        };
        let v6 = if servers.iter().any(|s| s.is_ipv6()) {
            match bind_client_socket("[::]:0".parse()?) {
                Ok(sock) => {
                    let sock = Arc::new(sock);
                    receivers.push(spawn_receiver(sock.clone(), waiters.clone()));
                    Some(sock)
                }
                Err(err) => {
                    warn!(target = "udp_query", error = %err, "ipv6 udp socket unavailable");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            servers,
            timeout,
            v4,
            v6,
            waiters,
            receivers,
        })
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    fn socket_for(&self, server: &SocketAddr) -> Option<&Arc<UdpSocket>> {
        if server.is_ipv4() {
            self.v4.as_ref()
        } else {
            self.v6.as_ref()
        }
    }

    pub fn stop(&self) {
        for handle in &self.receivers {
            handle.abort();
        }
    }
}

impl Drop for UdpQuerier {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_client_socket(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    if let Err(e) = socket.set_recv_buffer_size(256 * 1024) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind udp client socket")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

fn spawn_receiver(socket: Arc<UdpSocket>, waiters: PendingTable) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, server)) => {
                    let (id, ips) = match parse_answers(&buf[..len]) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            debug!(target = "udp_query", server = %server, error = %err, "bad response dropped");
                            continue;
                        }
                    };
                    // 迟到或伪造的响应：没有等待者，直接丢弃
                    let Some(waiter) = waiters.get(&id) else {
                        continue;
                    };
                    debug!(
                        target = "udp_query",
                        server = %server,
                        domain = %waiter.domain,
                        answers = ips.len(),
                        "udp response received"
                    );
                    if !ips.is_empty() {
                        let _ = waiter.tx.try_send(ips);
                    }
                }
                Err(e) => {
                    error!(target = "udp_query", error = %e, "udp recv error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    })
}

#[async_trait]
impl DnsQuerier for UdpQuerier {
    fn name(&self) -> &str {
        "udp"
    }

    async fn query(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        if self.servers.is_empty() {
            return Vec::new();
        }
        let start = Instant::now();
        let deadline = start + self.timeout;
        let (guard, mut rx) = register(&self.waiters, domain);
        let packet = match build_query(guard.id(), domain, qtype) {
            Ok(p) => p,
            Err(err) => {
                warn!(target = "udp_query", domain = %domain, error = %err, "build query failed");
                return Vec::new();
            }
        };

        let mut ips: Vec<String> = Vec::new();
        for (idx, server) in self.servers.iter().enumerate() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some(socket) = self.socket_for(server) else {
                continue;
            };
            if let Err(err) = socket.send_to(&packet, server).await {
                warn!(target = "udp_query", server = %server, error = %err, "send request failed");
                continue;
            }
            // 剩余时间在未尝试的服务器之间平分
            let left = (self.servers.len() - idx) as u32;
            let wait = (deadline - now) / left;
            if let Ok(Some(answers)) = timeout(wait, rx.recv()).await {
                for ip in answers {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
                if !ips.is_empty() {
                    break;
                }
            }
        }
        drop(guard);

        debug!(
            target = "udp_query",
            domain = %domain,
            qtype = ?qtype,
            elapsed_ms = start.elapsed().as_millis() as u64,
            answers = ?ips,
            "query by udp"
        );
        ips
    }
}
