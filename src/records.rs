use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use lru::LruCache;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::proto_utils::{TYPE_A, TYPE_AAAA};

/// 持久化的最小间隔
const SAVE_INTERVAL: Duration = Duration::from_secs(10);
pub const SINKHOLE: &str = "127.0.0.1";

pub const DEFAULT_CONNECT_COST_V4: u64 = 6000;
pub const DEFAULT_CONNECT_COST_V6: u64 = 4000;
pub const FAIL_CONNECT_COST: u64 = 7000;
pub const FAIL_CONNECT_STEP: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DomainRule {
    #[default]
    Unknown,
    Direct,
    Gae,
    Socks,
    Black,
}

impl DomainRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainRule::Unknown => "unknown",
            DomainRule::Direct => "direct",
            DomainRule::Gae => "gae",
            DomainRule::Socks => "socks",
            DomainRule::Black => "black",
        }
    }
}

impl FromStr for DomainRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(DomainRule::Unknown),
            "direct" => Ok(DomainRule::Direct),
            "gae" => Ok(DomainRule::Gae),
            "socks" => Ok(DomainRule::Socks),
            "black" => Ok(DomainRule::Black),
            other => anyhow::bail!("unknown domain rule: {}", other),
        }
    }
}

impl fmt::Display for DomainRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IpRule {
    #[default]
    Direct,
    Gae,
    Socks,
    Black,
    Other,
}

impl IpRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpRule::Direct => "direct",
            IpRule::Gae => "gae",
            IpRule::Socks => "socks",
            IpRule::Black => "black",
            IpRule::Other => "other",
        }
    }
}

impl FromStr for IpRule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(IpRule::Direct),
            "gae" => Ok(IpRule::Gae),
            "socks" => Ok(IpRule::Socks),
            "black" => Ok(IpRule::Black),
            "other" => Ok(IpRule::Other),
            other => anyhow::bail!("unknown ip rule: {}", other),
        }
    }
}

impl fmt::Display for IpRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub rule: DomainRule,
    pub gae_acceptable: bool,
    /// qtype -> ordered, de-duplicated answers (IP literal or CNAME)
    pub dns: FxHashMap<u16, Vec<String>>,
    /// Epoch seconds of the last DNS answer update; 0 means never resolved.
    pub last_update: u64,
    pub query_count: u64,
}

impl Default for DomainRecord {
    fn default() -> Self {
        Self {
            rule: DomainRule::Unknown,
            gae_acceptable: true,
            dns: FxHashMap::default(),
            last_update: 0,
            query_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRecord {
    pub rule: IpRule,
    pub connect_cost_ms: u64,
    pub last_update: u64,
}

/// Reports whether the local network is usable. While it is not, connect
/// failures are not held against individual IPs.
pub trait NetworkHealth: Send + Sync {
    fn is_ok(&self, ip: IpAddr) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeHealthy;

impl NetworkHealth for AssumeHealthy {
    fn is_ok(&self, _ip: IpAddr) -> bool {
        true
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_stale(last_update: u64, ttl: Duration, now: u64) -> bool {
    now.saturating_sub(last_update) > ttl.as_secs()
}

struct StoreInner<K: std::hash::Hash + Eq, V> {
    cache: LruCache<K, V>,
    need_save: bool,
    last_save: Instant,
}

impl<K: std::hash::Hash + Eq, V> StoreInner<K, V> {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            need_save: false,
            last_save: Instant::now(),
        }
    }

    /// Returns the rendered file content when a save is due.
    fn take_snapshot(&mut self, force: bool, render: impl FnOnce(&LruCache<K, V>) -> String) -> Option<String> {
        if !force && (!self.need_save || self.last_save.elapsed() < SAVE_INTERVAL) {
            return None;
        }
        let content = render(&self.cache);
        self.need_save = false;
        self.last_save = Instant::now();
        Some(content)
    }
}

fn write_file(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
        }
    }
    fs::write(path, content).with_context(|| format!("write records file: {}", path.display()))
}

/// Domain -> routing rule + cached DNS answers, LRU bounded.
pub struct DomainRuleStore {
    file_path: Option<PathBuf>,
    ttl: Duration,
    inner: Mutex<StoreInner<String, DomainRecord>>,
}

impl DomainRuleStore {
    pub fn new(file_path: Option<PathBuf>, capacity: usize, ttl: Duration) -> Self {
        let store = Self {
            file_path,
            ttl,
            inner: Mutex::new(StoreInner::new(capacity)),
        };
        if let Err(err) = store.load() {
            warn!(target = "records", error = %err, "load domain records failed");
        }
        store
    }

    pub fn in_memory(capacity: usize, ttl: Duration) -> Self {
        Self::new(None, capacity, ttl)
    }

    fn load(&self) -> anyhow::Result<()> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        if !path.is_file() {
            return Ok(());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read domain records: {}", path.display()))?;
        let mut inner = self.inner.lock();
        let mut loaded = 0usize;
        for line in raw.lines() {
            match parse_domain_line(line) {
                Some((domain, record)) => {
                    inner.cache.put(domain, record);
                    loaded += 1;
                }
                None if line.trim().is_empty() => {}
                None => warn!(target = "records", line = %line, "domain rule line invalid"),
            }
        }
        info!(target = "records", path = %path.display(), loaded, "domain records loaded");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.inner.lock().cache.contains(domain)
    }

    /// Snapshot of a record, touching it in the LRU order.
    pub fn get(&self, domain: &str) -> Option<DomainRecord> {
        self.inner.lock().cache.get(domain).cloned()
    }

    fn update<R>(&self, domain: &str, f: impl FnOnce(&mut DomainRecord) -> R) -> R {
        let out = {
            let mut inner = self.inner.lock();
            let out = match inner.cache.get_mut(domain) {
                Some(record) => f(record),
                None => {
                    let mut record = DomainRecord::default();
                    let out = f(&mut record);
                    // put 在满容量时淘汰最久未使用的条目
                    inner.cache.put(domain.to_string(), record);
                    out
                }
            };
            inner.need_save = true;
            out
        };
        self.save_quietly(false);
        out
    }

    /// Merges `ips` into the answer set for `qtype`, keeping first-seen order.
    /// Stale answers are replaced instead of merged.
    pub fn set_ips(&self, domain: &str, ips: &[String], qtype: u16) {
        if ips.is_empty() {
            return;
        }
        let ttl = self.ttl;
        self.update(domain, |record| {
            let now = now_secs();
            if is_stale(record.last_update, ttl, now) {
                record.dns.clear();
            }
            let entry = record.dns.entry(qtype).or_default();
            for ip in ips {
                if !entry.iter().any(|e| e == ip) {
                    entry.push(ip.clone());
                }
            }
            record.last_update = now;
        });
    }

    /// Cached answers for `qtype` (A and AAAA when `None`). Empty when the
    /// domain is unknown or its answers are stale. Black-listed domains
    /// always resolve to the sinkhole.
    pub fn get_ips(&self, domain: &str, qtype: Option<u16>) -> Vec<String> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.cache.get(domain) else {
            return Vec::new();
        };
        if record.rule == DomainRule::Black {
            return vec![SINKHOLE.to_string()];
        }
        if is_stale(record.last_update, self.ttl, now_secs()) {
            return Vec::new();
        }
        let types: &[u16] = match qtype {
            Some(ref t) => std::slice::from_ref(t),
            None => &[TYPE_A, TYPE_AAAA],
        };
        types
            .iter()
            .filter_map(|t| record.dns.get(t))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn update_rule(&self, domain: &str, rule: DomainRule) {
        self.update(domain, |record| record.rule = rule);
    }

    pub fn get_rule(&self, domain: &str) -> DomainRule {
        self.inner
            .lock()
            .cache
            .peek(domain)
            .map(|r| r.rule)
            .unwrap_or_default()
    }

    pub fn report_gae_deny(&self, domain: &str) {
        self.update(domain, |record| record.gae_acceptable = false);
    }

    pub fn accept_gae(&self, domain: &str) -> bool {
        self.inner
            .lock()
            .cache
            .peek(domain)
            .map(|r| r.gae_acceptable)
            .unwrap_or(true)
    }

    pub fn get_query_count(&self, domain: &str) -> u64 {
        self.inner
            .lock()
            .cache
            .peek(domain)
            .map(|r| r.query_count)
            .unwrap_or(0)
    }

    pub fn add_query_count(&self, domain: &str) {
        self.update(domain, |record| record.query_count += 1);
    }

    /// Drops every record and rewrites the file.
    pub fn clean(&self) -> anyhow::Result<()> {
        self.inner.lock().cache.clear();
        self.save(true)
    }

    /// File content regrouped: socks rules first, then gae, then the rest.
    pub fn get_content(&self) -> String {
        let inner = self.inner.lock();
        let mut socks = Vec::new();
        let mut gae = Vec::new();
        let mut rest = Vec::new();
        for (domain, record) in inner.cache.iter().rev() {
            let line = render_domain_line(domain, record);
            match record.rule {
                DomainRule::Socks => socks.push(line),
                DomainRule::Gae => gae.push(line),
                _ => rest.push(line),
            }
        }
        socks.into_iter().chain(gae).chain(rest).collect()
    }

    /// Writes the records file. Without `force` the write is skipped unless
    /// something changed and the last save is older than 10s.
    pub fn save(&self, force: bool) -> anyhow::Result<()> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let content = self.inner.lock().take_snapshot(force, |cache| {
            cache
                .iter()
                .rev()
                .map(|(domain, record)| render_domain_line(domain, record))
                .collect()
        });
        if let Some(content) = content {
            write_file(path, &content)?;
            debug!(target = "records", path = %path.display(), "domain records saved");
        }
        Ok(())
    }

    fn save_quietly(&self, force: bool) {
        if let Err(err) = self.save(force) {
            self.inner.lock().need_save = true;
            warn!(target = "records", error = %err, "save domain records failed");
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, domain: &str, secs: u64) {
        if let Some(record) = self.inner.lock().cache.get_mut(domain) {
            record.last_update = record.last_update.saturating_sub(secs);
        }
    }
}

fn render_domain_line(domain: &str, record: &DomainRecord) -> String {
    format!(
        "{} {} {}\n",
        domain,
        record.rule,
        if record.gae_acceptable { 1 } else { 0 }
    )
}

fn parse_domain_line(line: &str) -> Option<(String, DomainRecord)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    let rule = parts[1].parse::<DomainRule>().ok()?;
    let gae: u8 = parts[2].parse().ok()?;
    Some((
        parts[0].to_string(),
        DomainRecord {
            rule,
            gae_acceptable: gae != 0,
            ..DomainRecord::default()
        },
    ))
}

/// IP -> last connect latency / failure penalty, LRU bounded.
pub struct IpRuleStore {
    file_path: Option<PathBuf>,
    ttl: Duration,
    health: Arc<dyn NetworkHealth>,
    inner: Mutex<StoreInner<IpAddr, IpRecord>>,
}

impl IpRuleStore {
    pub fn new(
        file_path: Option<PathBuf>,
        capacity: usize,
        ttl: Duration,
        health: Arc<dyn NetworkHealth>,
    ) -> Self {
        let store = Self {
            file_path,
            ttl,
            health,
            inner: Mutex::new(StoreInner::new(capacity)),
        };
        if let Err(err) = store.load() {
            warn!(target = "records", error = %err, "load ip records failed");
        }
        store
    }

    pub fn in_memory(capacity: usize, ttl: Duration) -> Self {
        Self::new(None, capacity, ttl, Arc::new(AssumeHealthy))
    }

    fn load(&self) -> anyhow::Result<()> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        if !path.is_file() {
            return Ok(());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read ip records: {}", path.display()))?;
        let mut inner = self.inner.lock();
        for line in raw.lines() {
            match parse_ip_line(line) {
                Some((ip, record)) => {
                    inner.cache.put(ip, record);
                }
                None if line.trim().is_empty() => {}
                None => warn!(target = "records", line = %line, "ip rule line invalid"),
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ip: IpAddr) -> Option<IpRecord> {
        self.inner.lock().cache.get(&ip).copied()
    }

    fn set(&self, ip: IpAddr, record: IpRecord) {
        {
            let mut inner = self.inner.lock();
            inner.cache.put(ip, record);
            inner.need_save = true;
        }
        if let Err(err) = self.save(false) {
            self.inner.lock().need_save = true;
            warn!(target = "records", error = %err, "save ip records failed");
        }
    }

    /// Last measured connect cost, or the family default when unknown/stale.
    pub fn get_connect_time(&self, ip: IpAddr) -> u64 {
        match self.get(ip) {
            Some(record) if !is_stale(record.last_update, self.ttl, now_secs()) => {
                record.connect_cost_ms
            }
            _ => default_connect_cost(ip),
        }
    }

    pub fn update_rule(&self, ip: IpAddr, rule: IpRule) {
        let mut record = self.get(ip).unwrap_or(IpRecord {
            rule,
            connect_cost_ms: default_connect_cost(ip),
            last_update: 0,
        });
        record.rule = rule;
        record.last_update = now_secs();
        self.set(ip, record);
    }

    /// A successful connect overwrites any penalty with the measured latency.
    pub fn update_connect_time(&self, ip: IpAddr, connect_cost_ms: u64) {
        let mut record = self.get(ip).unwrap_or(IpRecord {
            rule: IpRule::Direct,
            connect_cost_ms,
            last_update: 0,
        });
        record.connect_cost_ms = connect_cost_ms;
        record.last_update = now_secs();
        self.set(ip, record);
    }

    /// First failure sets the 7000ms penalty, each further one adds 1000ms.
    /// Ignored while the local network itself is down.
    pub fn report_connect_fail(&self, ip: IpAddr) {
        if !self.health.is_ok(ip) {
            debug!(target = "records", ip = %ip, "network down, connect fail ignored");
            return;
        }
        let record = match self.get(ip) {
            None => IpRecord {
                rule: IpRule::Direct,
                connect_cost_ms: FAIL_CONNECT_COST,
                last_update: now_secs(),
            },
            Some(mut record) => {
                record.connect_cost_ms = if record.connect_cost_ms < FAIL_CONNECT_COST {
                    FAIL_CONNECT_COST
                } else {
                    record.connect_cost_ms + FAIL_CONNECT_STEP
                };
                record.last_update = now_secs();
                record
            }
        };
        self.set(ip, record);
    }

    pub fn clean(&self) -> anyhow::Result<()> {
        self.inner.lock().cache.clear();
        self.save(true)
    }

    pub fn get_content(&self) -> String {
        render_ip_lines(&self.inner.lock().cache)
    }

    pub fn save(&self, force: bool) -> anyhow::Result<()> {
        let Some(path) = self.file_path.as_ref() else {
            return Ok(());
        };
        let content = self.inner.lock().take_snapshot(force, render_ip_lines);
        if let Some(content) = content {
            write_file(path, &content)?;
            debug!(target = "records", path = %path.display(), "ip records saved");
        }
        Ok(())
    }
}

fn default_connect_cost(ip: IpAddr) -> u64 {
    match ip {
        IpAddr::V4(_) => DEFAULT_CONNECT_COST_V4,
        IpAddr::V6(_) => DEFAULT_CONNECT_COST_V6,
    }
}

fn render_ip_lines(cache: &LruCache<IpAddr, IpRecord>) -> String {
    cache
        .iter()
        .rev()
        .map(|(ip, r)| format!("{} {} {} {}\n", ip, r.rule, r.connect_cost_ms, r.last_update))
        .collect()
}

fn parse_ip_line(line: &str) -> Option<(IpAddr, IpRecord)> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 4 {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        IpRecord {
            rule: parts[1].parse().ok()?,
            connect_cost_ms: parts[2].parse().ok()?,
            last_update: parts[3].parse().ok()?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "smart-router-{}-{}-{}.txt",
            name,
            std::process::id(),
            seq
        ))
    }

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn set_then_get_within_ttl() {
        let store = DomainRuleStore::in_memory(10, Duration::from_secs(3600));
        store.set_ips("example.com", &ips(&["1.2.3.4"]), TYPE_A);
        assert_eq!(store.get_ips("example.com", Some(TYPE_A)), ips(&["1.2.3.4"]));
        assert!(store.get_ips("example.com", Some(TYPE_AAAA)).is_empty());
        assert!(store.get_ips("other.com", Some(TYPE_A)).is_empty());
    }

    #[test]
    fn stale_answers_are_hidden_and_replaced() {
        let store = DomainRuleStore::in_memory(10, Duration::from_secs(60));
        store.set_ips("example.com", &ips(&["1.2.3.4"]), TYPE_A);
        store.update_rule("example.com", DomainRule::Gae);
        store.backdate("example.com", 120);
        assert!(store.get_ips("example.com", Some(TYPE_A)).is_empty());
        // 规则不随 DNS 结果过期
        assert_eq!(store.get_rule("example.com"), DomainRule::Gae);

        store.set_ips("example.com", &ips(&["5.6.7.8"]), TYPE_A);
        assert_eq!(store.get_ips("example.com", Some(TYPE_A)), ips(&["5.6.7.8"]));
    }

    #[test]
    fn set_ips_merges_in_insertion_order() {
        let store = DomainRuleStore::in_memory(10, Duration::from_secs(3600));
        store.set_ips("d.com", &ips(&["1.1.1.1", "2.2.2.2"]), TYPE_A);
        store.set_ips("d.com", &ips(&["2.2.2.2", "3.3.3.3"]), TYPE_A);
        assert_eq!(
            store.get_ips("d.com", Some(TYPE_A)),
            ips(&["1.1.1.1", "2.2.2.2", "3.3.3.3"])
        );
        store.set_ips("d.com", &ips(&["::1"]), TYPE_AAAA);
        assert_eq!(
            store.get_ips("d.com", None),
            ips(&["1.1.1.1", "2.2.2.2", "3.3.3.3", "::1"])
        );
    }

    #[test]
    fn lru_evicts_least_recently_touched() {
        let store = DomainRuleStore::in_memory(3, Duration::from_secs(3600));
        store.set_ips("a.com", &ips(&["1.0.0.1"]), TYPE_A);
        store.set_ips("b.com", &ips(&["1.0.0.2"]), TYPE_A);
        store.set_ips("c.com", &ips(&["1.0.0.3"]), TYPE_A);
        // touch a.com so b.com becomes the oldest
        assert!(!store.get_ips("a.com", Some(TYPE_A)).is_empty());
        store.set_ips("d.com", &ips(&["1.0.0.4"]), TYPE_A);

        assert_eq!(store.len(), 3);
        assert!(!store.contains("b.com"));
        assert!(store.contains("a.com"));
        assert!(store.contains("c.com"));
        assert!(store.contains("d.com"));
    }

    #[test]
    fn ip_store_evicts_least_recently_touched() {
        let store = IpRuleStore::in_memory(3, Duration::from_secs(3600));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        let c: IpAddr = "10.0.0.3".parse().unwrap();
        let d: IpAddr = "10.0.0.4".parse().unwrap();
        store.update_connect_time(a, 100);
        store.update_connect_time(b, 200);
        store.update_connect_time(c, 300);
        assert_eq!(store.get_connect_time(a), 100);
        store.update_connect_time(d, 400);

        assert_eq!(store.len(), 3);
        assert!(store.get(b).is_none());
        assert!(store.get(a).is_some());
        assert!(store.get(c).is_some());
        assert_eq!(store.get_connect_time(d), 400);
    }

    #[test]
    fn black_rule_always_sinkholes() {
        let store = DomainRuleStore::in_memory(10, Duration::from_secs(3600));
        store.set_ips("ads.com", &ips(&["9.9.9.9"]), TYPE_A);
        store.update_rule("ads.com", DomainRule::Black);
        assert_eq!(store.get_ips("ads.com", Some(TYPE_A)), ips(&["127.0.0.1"]));
        store.backdate("ads.com", 7200);
        assert_eq!(store.get_ips("ads.com", Some(TYPE_AAAA)), ips(&["127.0.0.1"]));
    }

    #[test]
    fn gae_and_query_count_bookkeeping() {
        let store = DomainRuleStore::in_memory(10, Duration::from_secs(3600));
        assert!(store.accept_gae("x.com"));
        store.report_gae_deny("x.com");
        assert!(!store.accept_gae("x.com"));
        store.add_query_count("x.com");
        store.add_query_count("x.com");
        assert_eq!(store.get_query_count("x.com"), 2);
    }

    #[test]
    fn domain_records_persist_and_reload() {
        let path = temp_path("domains");
        {
            let store = DomainRuleStore::new(Some(path.clone()), 10, Duration::from_secs(3600));
            store.update_rule("direct.com", DomainRule::Direct);
            store.update_rule("gae.com", DomainRule::Gae);
            store.update_rule("socks.com", DomainRule::Socks);
            store.report_gae_deny("direct.com");
            store.save(true).expect("save");

            let content = store.get_content();
            let lines: Vec<&str> = content.lines().collect();
            assert_eq!(lines[0], "socks.com socks 1");
            assert_eq!(lines[1], "gae.com gae 1");
            assert_eq!(lines[2], "direct.com direct 0");
        }

        let raw = fs::read_to_string(&path).expect("read file");
        assert!(raw.contains("direct.com direct 0\n"));

        let reloaded = DomainRuleStore::new(Some(path.clone()), 10, Duration::from_secs(3600));
        assert_eq!(reloaded.len(), 3);
        assert_eq!(reloaded.get_rule("gae.com"), DomainRule::Gae);
        assert!(!reloaded.accept_gae("direct.com"));
        reloaded.clean().expect("clean");
        assert!(reloaded.is_empty());
        assert_eq!(fs::read_to_string(&path).expect("read file"), "");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn save_is_debounced() {
        let path = temp_path("debounce");
        let store = DomainRuleStore::new(Some(path.clone()), 10, Duration::from_secs(3600));
        store.update_rule("a.com", DomainRule::Gae);
        // 10 秒内不会写盘
        assert!(!path.exists());
        store.save(true).expect("forced save");
        assert!(path.exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn connect_time_defaults_by_family() {
        let store = IpRuleStore::in_memory(10, Duration::from_secs(3600));
        assert_eq!(store.get_connect_time("1.2.3.4".parse().unwrap()), 6000);
        assert_eq!(store.get_connect_time("2001:db8::1".parse().unwrap()), 4000);
        store.update_connect_time("1.2.3.4".parse().unwrap(), 120);
        assert_eq!(store.get_connect_time("1.2.3.4".parse().unwrap()), 120);
    }

    #[test]
    fn connect_fail_penalty_grows_and_success_resets() {
        let store = IpRuleStore::in_memory(10, Duration::from_secs(3600));
        let ip: IpAddr = "5.6.7.8".parse().unwrap();
        store.report_connect_fail(ip);
        assert_eq!(store.get_connect_time(ip), 7000);
        store.report_connect_fail(ip);
        assert_eq!(store.get_connect_time(ip), 8000);
        store.report_connect_fail(ip);
        assert_eq!(store.get_connect_time(ip), 9000);

        store.update_connect_time(ip, 300);
        assert_eq!(store.get_connect_time(ip), 300);
        store.report_connect_fail(ip);
        assert_eq!(store.get_connect_time(ip), 7000);
    }

    struct Toggle(AtomicBool);

    impl NetworkHealth for Toggle {
        fn is_ok(&self, _ip: IpAddr) -> bool {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn connect_fail_ignored_while_network_down() {
        let health = Arc::new(Toggle(AtomicBool::new(false)));
        let store = IpRuleStore::new(None, 10, Duration::from_secs(3600), health.clone());
        let ip: IpAddr = "5.6.7.8".parse().unwrap();
        store.report_connect_fail(ip);
        assert!(store.get(ip).is_none());

        health.0.store(true, Ordering::Relaxed);
        store.report_connect_fail(ip);
        assert_eq!(store.get_connect_time(ip), 7000);
    }

    #[test]
    fn ip_records_persist_and_reload() {
        let path = temp_path("ips");
        let store = IpRuleStore::new(
            Some(path.clone()),
            10,
            Duration::from_secs(3600),
            Arc::new(AssumeHealthy),
        );
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        store.update_rule(ip, IpRule::Gae);
        store.update_connect_time(ip, 250);
        store.save(true).expect("save");

        let reloaded = IpRuleStore::new(
            Some(path.clone()),
            10,
            Duration::from_secs(3600),
            Arc::new(AssumeHealthy),
        );
        let record = reloaded.get(ip).expect("record");
        assert_eq!(record.rule, IpRule::Gae);
        assert_eq!(record.connect_cost_ms, 250);
        assert!(reloaded.get_content().starts_with("10.1.2.3 gae 250 "));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn rule_names_round_trip_through_text() {
        for rule in ["unknown", "direct", "gae", "socks", "black"] {
            assert_eq!(rule.parse::<DomainRule>().unwrap().as_str(), rule);
        }
        assert!("weird".parse::<DomainRule>().is_err());
        assert_eq!("OTHER".parse::<IpRule>().unwrap(), IpRule::Other);
    }
}
