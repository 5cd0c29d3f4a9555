//! Resolution policy: which transports a domain goes through, the parallel
//! race between them, recursive CNAME resolution and write-back into the
//! domain store.

use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use hickory_proto::rr::RecordType;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::context::RouterContext;
use crate::matcher::DomainLists;
use crate::proto_utils::{is_ip_literal, normalize_name};
use crate::querier::{DnsQuerier, Queriers};
use crate::records::{DomainRule, DomainRuleStore, SINKHOLE};

static LABEL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9]([A-Z0-9-]{0,61}[A-Z0-9])?$").ok());

/// 主机名合法性：总长不超过255，每个标签符合 LDH 规则
pub fn is_valid_hostname(hostname: &str) -> bool {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > 255 {
        return false;
    }
    let Some(re) = LABEL_RE.as_ref() else {
        return false;
    };
    hostname.to_ascii_uppercase().split('.').all(|label| re.is_match(label))
}

#[derive(Debug, Clone, Copy)]
pub struct QueryPolicy {
    /// 全部域名只走本地解析
    pub all_direct: bool,
    pub local_timeout: Duration,
    pub race_timeout: Duration,
}

impl QueryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            all_direct: settings.all_direct,
            local_timeout: settings.local_timeout(),
            race_timeout: settings.race_timeout(),
        }
    }
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

enum Route {
    Local,
    Blocked,
    Unknown,
}

pub struct CombinedDnsQuery {
    domains: Arc<DomainRuleStore>,
    lists: Arc<ArcSwap<DomainLists>>,
    queriers: Queriers,
    policy: QueryPolicy,
}

impl CombinedDnsQuery {
    pub fn new(
        domains: Arc<DomainRuleStore>,
        lists: Arc<ArcSwap<DomainLists>>,
        queriers: Queriers,
        policy: QueryPolicy,
    ) -> Self {
        Self {
            domains,
            lists,
            queriers,
            policy,
        }
    }

    pub fn from_context(ctx: &RouterContext, queriers: Queriers) -> Self {
        Self::new(
            ctx.domains.clone(),
            ctx.lists.clone(),
            queriers,
            QueryPolicy::from_settings(&ctx.settings),
        )
    }

    pub fn domains(&self) -> &Arc<DomainRuleStore> {
        &self.domains
    }

    /// Rules file entry first, then whatever the store has learned.
    pub fn rule_for(&self, domain: &str) -> DomainRule {
        match self.lists.load().check_host(domain) {
            DomainRule::Unknown => self.domains.get_rule(domain),
            rule => rule,
        }
    }

    pub fn add_query_count(&self, domain: &str) {
        self.domains.add_query_count(domain);
    }

    /// Resolves `domain` to IP literals (names for NS), deduplicated in
    /// first-seen order. Never fails; unresolvable domains give `[]`.
    pub fn query<'a>(&'a self, domain: &str, qtype: RecordType) -> BoxFuture<'a, Vec<String>> {
        self.query_visited(domain.to_string(), qtype, Vec::new())
    }

    fn query_visited(&self, domain: String, qtype: RecordType, visited: Vec<String>) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async move {
            if is_ip_literal(&domain) {
                return vec![domain];
            }
            let domain = normalize_name(&domain);
            if !is_valid_hostname(&domain) {
                warn!(target = "dns_query", domain = %domain, qtype = ?qtype, "invalid hostname");
                return Vec::new();
            }

            let rule = self.rule_for(&domain);
            if rule == DomainRule::Black {
                debug!(target = "dns_query", domain = %domain, "black rule, sinkhole");
                return vec![SINKHOLE.to_string()];
            }

            let type_code = u16::from(qtype);
            let cached = self.domains.get_ips(&domain, Some(type_code));
            if !cached.is_empty() {
                return cached;
            }

            let route = {
                let lists = self.lists.load();
                if rule == DomainRule::Direct
                    || self.policy.all_direct
                    || !domain.contains('.')
                    || lists.in_white_list(&domain)
                {
                    Route::Local
                } else if matches!(rule, DomainRule::Gae | DomainRule::Socks) || lists.in_block_list(&domain) {
                    Route::Blocked
                } else {
                    Route::Unknown
                }
            };

            let start = Instant::now();
            let answers = match route {
                Route::Local => self.query_local(&domain, qtype).await,
                Route::Blocked => self.query_blocked_domain(&domain, qtype).await,
                Route::Unknown => self.query_unknown_domain(&domain, qtype).await,
            };
            let answers = if answers.is_empty() && !matches!(route, Route::Local) {
                self.query_local(&domain, qtype).await
            } else {
                answers
            };

            let ips = self.resolve_names(&domain, qtype, answers, visited).await;
            debug!(
                target = "dns_query",
                domain = %domain,
                qtype = ?qtype,
                answers = ?ips,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "query finished"
            );
            if !ips.is_empty() {
                self.domains.set_ips(&domain, &ips, type_code);
            }
            ips
        })
    }

    /// Both A and AAAA when `qtype` is `None`.
    pub async fn query_recursively(&self, domain: &str, qtype: Option<RecordType>) -> Vec<String> {
        let types = match qtype {
            Some(t) => vec![t],
            None => vec![RecordType::A, RecordType::AAAA],
        };
        let mut out: Vec<String> = Vec::new();
        for t in types {
            for ip in self.query(domain, t).await {
                if is_ip_literal(&ip) && !out.contains(&ip) {
                    out.push(ip);
                }
            }
        }
        out
    }

    /// 非 IP 的应答视为 CNAME，递归解析；visited 防止环路
    async fn resolve_names(
        &self,
        domain: &str,
        qtype: RecordType,
        answers: Vec<String>,
        mut visited: Vec<String>,
    ) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if qtype == RecordType::NS {
            for item in answers {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            return out;
        }

        visited.push(domain.to_string());
        for item in answers {
            if is_ip_literal(&item) {
                if !out.contains(&item) {
                    out.push(item);
                }
                continue;
            }
            let name = normalize_name(&item);
            if name == domain || visited.contains(&name) {
                debug!(target = "dns_query", domain = %domain, cname = %name, "cname loop skipped");
                continue;
            }
            for ip in self.query_visited(name, qtype, visited.clone()).await {
                if !out.contains(&ip) {
                    out.push(ip);
                }
            }
        }
        out
    }

    async fn query_local(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        timeout(self.policy.local_timeout, self.queriers.local.query(domain, qtype))
            .await
            .unwrap_or_default()
    }

    pub async fn query_blocked_domain(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        let candidates = vec![
            self.queriers.https.clone(),
            self.queriers.tls.clone(),
            self.queriers.remote.clone(),
        ];
        self.race(domain, qtype, candidates).await
    }

    pub async fn query_unknown_domain(&self, domain: &str, qtype: RecordType) -> Vec<String> {
        let ips = self.query_local(domain, qtype).await;
        if !ips.is_empty() {
            return ips;
        }
        let candidates = vec![
            self.queriers.https.clone(),
            self.queriers.tls.clone(),
            self.queriers.tcp.clone(),
            self.queriers.remote.clone(),
        ];
        self.race(domain, qtype, candidates).await
    }

    /// First non-empty answer wins. Losers keep running and still write
    /// their addresses into the store when they finish.
    async fn race(&self, domain: &str, qtype: RecordType, candidates: Vec<Arc<dyn DnsQuerier>>) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel::<(String, Vec<String>)>(candidates.len().max(1));
        for querier in candidates {
            let tx = tx.clone();
            let domains = self.domains.clone();
            let domain = domain.to_string();
            tokio::spawn(async move {
                let ips = querier.query(&domain, qtype).await;
                if ips.is_empty() {
                    return;
                }
                let literals: Vec<String> = ips.iter().filter(|ip| is_ip_literal(ip)).cloned().collect();
                if !literals.is_empty() {
                    domains.set_ips(&domain, &literals, u16::from(qtype));
                }
                let _ = tx.try_send((querier.name().to_string(), ips));
            });
        }
        // 所有发送端退出后 recv 立即返回 None
        drop(tx);

        let start = Instant::now();
        match timeout(self.policy.race_timeout, rx.recv()).await {
            Ok(Some((winner, ips))) => {
                debug!(
                    target = "dns_query",
                    domain = %domain,
                    winner = %winner,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "race won"
                );
                ips
            }
            Ok(None) => Vec::new(),
            Err(_) => {
                warn!(
                    target = "dns_query",
                    domain = %domain,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "race timeout"
                );
                Vec::new()
            }
        }
    }
}
