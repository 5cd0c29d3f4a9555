use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::RecordType;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::dns_query::{CombinedDnsQuery, is_valid_hostname};
use crate::proto_utils::{Socks5UdpHeader, build_answer_response, normalize_name};

/// SOCKS5 中继端口向上探测的个数
const RELAY_PORT_PROBES: u16 = 19;
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listener {
    Dns,
    Socks,
}

/// UDP DNS front end plus the SOCKS5 UDP relay listener.
pub struct DnsServer {
    engine: Arc<CombinedDnsQuery>,
    dns_sockets: Vec<Arc<UdpSocket>>,
    relay_socket: Option<Arc<UdpSocket>>,
    workers: Vec<JoinHandle<()>>,
}

impl DnsServer {
    /// Binds every configured address on `dns_port`, falling back to
    /// `dns_backup_port`. Addresses that bind on neither are skipped; with
    /// none bound the server runs without a DNS listener.
    pub async fn bind(settings: &Settings, engine: Arc<CombinedDnsQuery>) -> anyhow::Result<Self> {
        let bind_ips = settings.bind_ips()?;
        let mut dns_sockets = Vec::with_capacity(bind_ips.len());
        for ip in &bind_ips {
            if let Some(socket) = bind_dns_port(*ip, settings.dns_port, settings.dns_backup_port) {
                dns_sockets.push(Arc::new(UdpSocket::from_std(socket).context("register dns socket")?));
            }
        }
        if dns_sockets.is_empty() {
            error!(
                target = "dns_server",
                port = settings.dns_port,
                backup_port = settings.dns_backup_port,
                "no dns port could be bound, dns service disabled"
            );
        }

        let relay_ip = bind_ips.first().copied().unwrap_or(IpAddr::from([127, 0, 0, 1]));
        let relay_socket = match bind_relay(relay_ip, settings.redirect_port) {
            Some(socket) => Some(Arc::new(UdpSocket::from_std(socket).context("register relay socket")?)),
            None => {
                warn!(
                    target = "dns_server",
                    base_port = settings.redirect_port,
                    "socks5 udp relay not started, no free port"
                );
                None
            }
        };

        Ok(Self {
            engine,
            dns_sockets,
            relay_socket,
            workers: Vec::new(),
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.dns_sockets.iter().filter_map(|s| s.local_addr().ok()).collect()
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn start(&mut self) {
        for socket in &self.dns_sockets {
            self.workers
                .push(tokio::spawn(serve(socket.clone(), self.engine.clone(), Listener::Dns)));
        }
        if let Some(socket) = &self.relay_socket {
            self.workers
                .push(tokio::spawn(serve(socket.clone(), self.engine.clone(), Listener::Socks)));
        }
        info!(
            target = "dns_server",
            dns = ?self.local_addrs(),
            relay = ?self.relay_addr(),
            "dns server started"
        );
    }

    pub fn stop(&mut self) {
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for DnsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_udp(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

fn bind_dns_port(ip: IpAddr, port: u16, backup_port: u16) -> Option<std::net::UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    match bind_udp(addr) {
        Ok(socket) => return Some(socket),
        Err(err) if err.raw_os_error() == Some(libc::EACCES) => {
            warn!(
                target = "dns_server",
                addr = %addr,
                "binding a port below 1024 needs privilege: grant it with \
                 `setcap cap_net_bind_service=+ep <binary>` or run as root"
            );
        }
        Err(err) => {
            warn!(target = "dns_server", addr = %addr, error = %err, "bind dns port failed");
        }
    }
    let backup = SocketAddr::new(ip, backup_port);
    match bind_udp(backup) {
        Ok(socket) => {
            info!(target = "dns_server", addr = %backup, "dns bound on backup port");
            Some(socket)
        }
        Err(err) => {
            warn!(target = "dns_server", addr = %backup, error = %err, "bind dns backup port failed");
            None
        }
    }
}

fn bind_relay(ip: IpAddr, base_port: u16) -> Option<std::net::UdpSocket> {
    let last = base_port.saturating_add(RELAY_PORT_PROBES);
    for port in base_port..=last {
        match bind_udp(SocketAddr::new(ip, port)) {
            Ok(socket) => return Some(socket),
            Err(err) => debug!(target = "dns_server", port, error = %err, "relay port taken"),
        }
    }
    None
}

async fn serve(socket: Arc<UdpSocket>, engine: Arc<CombinedDnsQuery>, listener: Listener) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                // ICMP 不可达等错误会在下一次 recv 上报，忽略即可
                debug!(target = "dns_server", error = %err, "udp recv error");
                continue;
            }
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let socket = socket.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            let reply = match listener {
                Listener::Dns => handle_query(&engine, &packet).await,
                Listener::Socks => handle_socks_frame(&engine, &packet).await,
            };
            if let Some(reply) = reply {
                if let Err(err) = socket.send_to(&reply, peer).await {
                    debug!(target = "dns_server", peer = %peer, error = %err, "send reply failed");
                }
            }
        });
    }
}

/// Answers one DNS request. `None` means drop silently: unparsable
/// packets, responses, and anything without exactly one question.
pub async fn handle_query(engine: &CombinedDnsQuery, packet: &[u8]) -> Option<Vec<u8>> {
    let request = match Message::from_vec(packet) {
        Ok(msg) => msg,
        Err(err) => {
            debug!(target = "dns_server", error = %err, "malformed dns packet dropped");
            return None;
        }
    };
    if request.message_type() != MessageType::Query || request.queries().len() != 1 {
        debug!(
            target = "dns_server",
            questions = request.queries().len(),
            "dns request dropped"
        );
        return None;
    }
    let question = &request.queries()[0];
    let domain = normalize_name(&question.name().to_ascii());
    let qtype = question.query_type();

    if is_valid_hostname(&domain) {
        engine.add_query_count(&domain);
    }
    let answers = match qtype {
        RecordType::A | RecordType::AAAA | RecordType::NS => engine.query(&domain, qtype).await,
        _ => Vec::new(),
    };
    debug!(target = "dns_server", domain = %domain, qtype = ?qtype, answers = ?answers, "dns answered");

    match build_answer_response(&request, &answers) {
        Ok(reply) => Some(reply),
        Err(err) => {
            warn!(target = "dns_server", domain = %domain, error = %err, "encode dns reply failed");
            None
        }
    }
}

/// SOCKS5 UDP relay frame carrying a DNS query to port 53. The reply goes
/// back under the same header.
pub async fn handle_socks_frame(engine: &CombinedDnsQuery, frame: &[u8]) -> Option<Vec<u8>> {
    let Some((header, payload)) = Socks5UdpHeader::parse(frame) else {
        debug!(target = "dns_server", len = frame.len(), "malformed socks5 udp frame dropped");
        return None;
    };
    if header.frag != 0 || header.port != 53 {
        debug!(
            target = "dns_server",
            frag = header.frag,
            port = header.port,
            "socks5 udp frame ignored"
        );
        return None;
    }
    let reply = handle_query(engine, payload).await?;
    let mut out = Vec::with_capacity(reply.len() + 32);
    header.encode(&mut out);
    out.extend_from_slice(&reply);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RouterContext;
    use crate::dns_query::tests::StubQuerier;
    use crate::matcher::DomainLists;
    use crate::proto_utils::{SOCKS5_ATYP_V4, answers_from_message, build_query};
    use crate::querier::{Disabled, Queriers};
    use crate::records::DomainRule;
    use hickory_proto::op::Query;
    use hickory_proto::rr::Name;
    use hickory_proto::serialize::binary::BinEncodable;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_settings(dns_port: u16) -> Settings {
        Settings {
            dns_bind_ips: vec!["127.0.0.1".to_string()],
            dns_port,
            dns_backup_port: 0,
            redirect_port: 0,
            ..Settings::default()
        }
    }

    fn engine(settings: &Settings) -> Arc<CombinedDnsQuery> {
        let ctx = RouterContext::in_memory(settings.clone(), DomainLists::new());
        ctx.domains.update_rule("example.test", DomainRule::Direct);
        let queriers = Queriers {
            local: Arc::new(
                StubQuerier::new("local")
                    .with("example.test", RecordType::A, &["10.0.0.1"])
                    .with("example.test", RecordType::AAAA, &["fd00::1"]),
            ),
            tcp: Arc::new(Disabled::new("tcp")),
            tls: Arc::new(Disabled::new("tls")),
            https: Arc::new(Disabled::new("https")),
            remote: Arc::new(Disabled::new("remote")),
        };
        Arc::new(CombinedDnsQuery::from_context(&ctx, queriers))
    }

    async fn exchange(client: &UdpSocket, to: SocketAddr, packet: &[u8]) -> Option<Vec<u8>> {
        client.send_to(packet, to).await.unwrap();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout(Duration::from_millis(1500), client.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => Some(buf[..len].to_vec()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn answers_direct_domain_end_to_end() {
        let settings = test_settings(15353);
        let mut server = DnsServer::bind(&settings, engine(&settings)).await.unwrap();
        server.start();
        let addr = server.local_addrs()[0];

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = build_query(0x1234, "example.test", RecordType::A).unwrap();
        let reply = exchange(&client, addr, &query).await.expect("reply");
        let msg = Message::from_vec(&reply).unwrap();
        assert_eq!(msg.id(), 0x1234);
        assert_eq!(msg.message_type(), MessageType::Response);
        assert!(msg.authoritative());
        assert_eq!(msg.answers().len(), 1);
        assert_eq!(answers_from_message(&msg), vec!["10.0.0.1".to_string()]);
        server.stop();
    }

    #[tokio::test]
    async fn falls_back_to_backup_port() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let settings = test_settings(taken.local_addr().unwrap().port());
        let server = DnsServer::bind(&settings, engine(&settings)).await.unwrap();
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), settings.dns_port);
    }

    #[tokio::test]
    async fn socks_relay_wraps_reply_in_same_header() {
        let settings = test_settings(0);
        let mut server = DnsServer::bind(&settings, engine(&settings)).await.unwrap();
        server.start();
        let relay = server.relay_addr().expect("relay bound");

        let header = [0u8, 0, 0, SOCKS5_ATYP_V4, 8, 8, 8, 8, 0, 53];
        let mut frame = header.to_vec();
        frame.extend_from_slice(&build_query(0x4321, "example.test", RecordType::AAAA).unwrap());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = exchange(&client, relay, &frame).await.expect("relay reply");
        assert_eq!(&reply[..header.len()], &header);
        let msg = Message::from_vec(&reply[header.len()..]).unwrap();
        assert_eq!(msg.id(), 0x4321);
        assert_eq!(answers_from_message(&msg), vec!["fd00::1".to_string()]);

        // 非 53 端口的负载不予处理
        let mut other = vec![0u8, 0, 0, SOCKS5_ATYP_V4, 8, 8, 8, 8, 0, 80];
        other.extend_from_slice(&build_query(1, "example.test", RecordType::A).unwrap());
        assert!(exchange(&client, relay, &other).await.is_none());
    }

    #[tokio::test]
    async fn malformed_and_multi_question_requests_are_dropped() {
        let settings = test_settings(0);
        let engine = engine(&settings);
        assert!(handle_query(&engine, b"\x00\x01garbage").await.is_none());

        let mut msg = Message::new();
        msg.set_id(7);
        let name = Name::from_ascii("example.test.").unwrap();
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_query(Query::query(name, RecordType::AAAA));
        assert!(handle_query(&engine, &msg.to_vec().unwrap()).await.is_none());

        let fragmented = [0u8, 0, 1, SOCKS5_ATYP_V4, 8, 8, 8, 8, 0, 53];
        assert!(handle_socks_frame(&engine, &fragmented).await.is_none());
    }

    #[tokio::test]
    async fn unsupported_type_gets_empty_answer() {
        let settings = test_settings(0);
        let engine = engine(&settings);
        let query = build_query(9, "example.test", RecordType::MX).unwrap();
        let reply = handle_query(&engine, &query).await.expect("reply");
        let msg = Message::from_vec(&reply).unwrap();
        assert_eq!(msg.id(), 9);
        assert!(msg.answers().is_empty());
    }
}
