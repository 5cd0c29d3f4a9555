use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::DnsQuerier;
use crate::config::DohMode;
use crate::proto_utils::{build_query, is_ip_literal, normalize_name, parse_answers};

const DNS_MESSAGE: &str = "application/dns-message";
const DNS_JSON: &str = "application/dns-json";
const RR_CNAME: u16 = 5;

#[derive(Debug, Deserialize)]
struct DohJson {
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type", default)]
    rtype: u16,
    data: String,
}

/// DNS-over-HTTPS. Endpoints are used round-robin through one pooled
/// client, optionally tunnelled through an upstream proxy.
pub struct HttpsQuerier {
    endpoints: Vec<String>,
    mode: DohMode,
    timeout: Duration,
    client: reqwest::Client,
    next: AtomicUsize,
}

impl HttpsQuerier {
    pub fn new(
        endpoints: Vec<String>,
        mode: DohMode,
        timeout: Duration,
        upstream_proxy: Option<&str>,
    ) -> anyhow::Result<Self> {
        // 不读取环境变量中的系统代理，只使用显式配置
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .no_proxy();
        if let Some(proxy) = upstream_proxy {
            let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("parse upstream proxy: {}", proxy))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("build doh client")?;
        Ok(Self {
            endpoints,
            mode,
            timeout,
            client,
            next: AtomicUsize::new(0),
        })
    }

    fn pick_endpoint(&self) -> Option<&str> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(self.endpoints[idx].as_str())
    }

    async fn exchange(&self, endpoint: &str, domain: &str, qtype: RecordType) -> anyhow::Result<Vec<String>> {
        match self.mode {
            DohMode::Json => {
                let type_name = qtype.to_string();
                let resp = self
                    .client
                    .get(endpoint)
                    .query(&[("name", domain), ("type", type_name.as_str())])
                    .header(ACCEPT, DNS_JSON)
                    .send()
                    .await
                    .context("doh request")?;
                if !resp.status().is_success() {
                    anyhow::bail!("doh status {}", resp.status());
                }
                let body: DohJson = resp.json().await.context("doh json body")?;
                let wanted = u16::from(qtype);
                let mut out: Vec<String> = Vec::new();
                for answer in body.answer {
                    if answer.rtype != 0 && answer.rtype != wanted && answer.rtype != RR_CNAME {
                        continue;
                    }
                    let item = if is_ip_literal(&answer.data) {
                        answer.data
                    } else {
                        normalize_name(&answer.data)
                    };
                    if !out.contains(&item) {
                        out.push(item);
                    }
                }
                Ok(out)
            }
            DohMode::Wire => {
                let id: u16 = rand::random();
                let packet = build_query(id, domain, qtype)?;
                let resp = self
                    .client
                    .post(endpoint)
                    .header(CONTENT_TYPE, DNS_MESSAGE)
                    .header(ACCEPT, DNS_MESSAGE)
                    .body(packet)
                    .send()
                    .await
                    .context("doh request")?;
                if !resp.status().is_success() {
                    anyhow::bail!("doh status {}", resp.status());
                }
                let body = resp.bytes().await.context("doh body")?;
                let (_, ips) = parse_answers(&body)?;
                Ok(ips)
            }
        }
    }
}

#[async_trait]
impl DnsQuerier for HttpsQuerier {
    fn name(&self) -> &str {
        "https"
    }

    async fn query(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        let Some(endpoint) = self.pick_endpoint() else {
            return Vec::new();
        };
        let start = Instant::now();
        match timeout(self.timeout, self.exchange(endpoint, domain, qtype)).await {
            Ok(Ok(ips)) => {
                debug!(
                    target = "https_query",
                    endpoint = %endpoint,
                    domain = %domain,
                    qtype = ?qtype,
                    answers = ?ips,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query returned"
                );
                ips
            }
            Ok(Err(err)) => {
                warn!(
                    target = "https_query",
                    endpoint = %endpoint,
                    domain = %domain,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "query failed"
                );
                Vec::new()
            }
            Err(_) => {
                warn!(
                    target = "https_query",
                    endpoint = %endpoint,
                    domain = %domain,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query timeout"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto_utils::build_answer_response;
    use hickory_proto::op::Message;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Handler = fn(&str, &[u8]) -> (u16, &'static str, Vec<u8>);

    /// Minimal HTTP/1.1 server: one request per connection.
    async fn http_server(handler: Handler) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let header_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
                    let content_length = head
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    while buf.len() < header_end + content_length {
                        let n = stream.read(&mut chunk).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let request_line = head.lines().next().unwrap_or_default().to_string();
                    let (status, content_type, body) = handler(&request_line, &buf[header_end..]);
                    let reply = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                        status,
                        content_type,
                        body.len()
                    );
                    stream.write_all(reply.as_bytes()).await.unwrap();
                    stream.write_all(&body).await.unwrap();
                });
            }
        });
        format!("http://{}/dns-query", addr)
    }

    fn json_handler(request_line: &str, _body: &[u8]) -> (u16, &'static str, Vec<u8>) {
        assert!(request_line.starts_with("GET /dns-query?name=example.test&type=A "));
        let body = r#"{"Status":0,"Answer":[
            {"name":"example.test.","type":5,"data":"edge.example.test."},
            {"name":"edge.example.test.","type":1,"data":"10.1.1.1"},
            {"name":"edge.example.test.","type":1,"data":"10.1.1.1"}]}"#;
        (200, DNS_JSON, body.as_bytes().to_vec())
    }

    fn wire_handler(request_line: &str, body: &[u8]) -> (u16, &'static str, Vec<u8>) {
        assert!(request_line.starts_with("POST /dns-query "));
        let req = Message::from_vec(body).unwrap();
        let resp = build_answer_response(&req, &["10.2.2.2".to_string()]).unwrap();
        (200, DNS_MESSAGE, resp)
    }

    fn error_handler(_request_line: &str, _body: &[u8]) -> (u16, &'static str, Vec<u8>) {
        (503, "text/plain", b"unavailable".to_vec())
    }

    #[tokio::test]
    async fn json_mode_reads_answer_data() {
        let endpoint = http_server(json_handler).await;
        let q = HttpsQuerier::new(vec![endpoint], DohMode::Json, Duration::from_secs(3), None).unwrap();
        assert_eq!(
            q.query("example.test", RecordType::A).await,
            vec!["edge.example.test".to_string(), "10.1.1.1".to_string()]
        );
    }

    #[tokio::test]
    async fn wire_mode_posts_dns_message() {
        let endpoint = http_server(wire_handler).await;
        let q = HttpsQuerier::new(vec![endpoint], DohMode::Wire, Duration::from_secs(3), None).unwrap();
        assert_eq!(q.query("example.test", RecordType::A).await, vec!["10.2.2.2".to_string()]);
    }

    #[tokio::test]
    async fn http_error_is_empty() {
        let endpoint = http_server(error_handler).await;
        let q = HttpsQuerier::new(vec![endpoint], DohMode::Wire, Duration::from_secs(3), None).unwrap();
        assert!(q.query("example.test", RecordType::A).await.is_empty());
    }

    #[test]
    fn endpoints_rotate() {
        let q = HttpsQuerier::new(
            vec!["https://a/dns-query".to_string(), "https://b/dns-query".to_string()],
            DohMode::Wire,
            Duration::from_secs(1),
            None,
        )
        .unwrap();
        assert_eq!(q.pick_endpoint(), Some("https://a/dns-query"));
        assert_eq!(q.pick_endpoint(), Some("https://b/dns-query"));
        assert_eq!(q.pick_endpoint(), Some("https://a/dns-query"));
    }

    #[test]
    fn bad_proxy_url_is_rejected() {
        assert!(HttpsQuerier::new(Vec::new(), DohMode::Wire, Duration::from_secs(1), Some("::not a url")).is_err());
    }
}
