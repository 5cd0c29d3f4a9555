use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::rr::RecordType;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::DnsQuerier;

/// Outbound HTTP path the remote resolver is reached through. The proxy
/// dispatch layer plugs its own tunnel in here.
#[async_trait]
pub trait FrontDispatcher: Send + Sync {
    /// `GET https://{host}{path}`, returning status and body.
    async fn get(&self, host: &str, path: &str) -> anyhow::Result<(u16, Vec<u8>)>;
}

/// 直接通过 reqwest 发出请求的默认分发器
pub struct ReqwestDispatcher {
    client: reqwest::Client,
}

impl ReqwestDispatcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .context("build remote resolver client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FrontDispatcher for ReqwestDispatcher {
    async fn get(&self, host: &str, path: &str) -> anyhow::Result<(u16, Vec<u8>)> {
        let url = format!("https://{}{}", host, path);
        let resp = self.client.get(&url).send().await.with_context(|| format!("GET {}", url))?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.context("read body")?;
        Ok((status, body.to_vec()))
    }
}

#[derive(Debug, Deserialize)]
struct RemoteAnswer {
    #[serde(default)]
    ip: Vec<String>,
}

/// Trusted HTTP resolver: `GET /query?domain=<name>` answering
/// `{"ip": ["<ip>|<country>", ...]}`.
pub struct RemoteQuerier {
    hosts: Vec<String>,
    dispatcher: Arc<dyn FrontDispatcher>,
    timeout: Duration,
}

impl RemoteQuerier {
    pub fn new(hosts: Vec<String>, dispatcher: Arc<dyn FrontDispatcher>, timeout: Duration) -> Self {
        Self {
            hosts,
            dispatcher,
            timeout,
        }
    }

    async fn exchange(&self, host: &str, domain: &str) -> anyhow::Result<Vec<String>> {
        let path = format!("/query?domain={}", domain);
        let (status, body) = self.dispatcher.get(host, &path).await?;
        if status != 200 {
            anyhow::bail!("remote resolver status {}", status);
        }
        let answer: RemoteAnswer = serde_json::from_slice(&body).context("parse remote resolver body")?;
        Ok(answer.ip)
    }
}

/// `ip|cc` 列表中取出与查询类型同族的 IP
fn ips_for_type(items: Vec<String>, qtype: RecordType) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let text = item.split('|').next().unwrap_or_default().trim();
        let Ok(ip) = text.parse::<IpAddr>() else {
            continue;
        };
        let fits = match qtype {
            RecordType::A => ip.is_ipv4(),
            RecordType::AAAA => ip.is_ipv6(),
            _ => false,
        };
        let text = ip.to_string();
        if fits && !out.contains(&text) {
            out.push(text);
        }
    }
    out
}

#[async_trait]
impl DnsQuerier for RemoteQuerier {
    fn name(&self) -> &str {
        "remote"
    }

    async fn query(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        if !matches!(qtype, RecordType::A | RecordType::AAAA) {
            return Vec::new();
        }
        let host = {
            let mut rng = rand::thread_rng();
            match self.hosts.choose(&mut rng) {
                Some(host) => host.clone(),
                None => return Vec::new(),
            }
        };
        let start = Instant::now();
        match timeout(self.timeout, self.exchange(&host, domain)).await {
            Ok(Ok(items)) => {
                let ips = ips_for_type(items, qtype);
                debug!(
                    target = "remote_query",
                    host = %host,
                    domain = %domain,
                    answers = ?ips,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query returned"
                );
                ips
            }
            Ok(Err(err)) => {
                warn!(
                    target = "remote_query",
                    host = %host,
                    domain = %domain,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    error = %err,
                    "query failed"
                );
                Vec::new()
            }
            Err(_) => {
                warn!(
                    target = "remote_query",
                    host = %host,
                    domain = %domain,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "query timeout"
                );
                Vec::new()
            }
        }
    }
}
