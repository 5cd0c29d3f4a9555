use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub version: Option<String>,
    /// DNS 监听 IP 列表。
    #[serde(default = "default_dns_bind_ips")]
    pub dns_bind_ips: Vec<String>,
    /// DNS 监听端口，缺省53；绑定失败时回退到 dns_backup_port。
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,
    #[serde(default = "default_dns_backup_port")]
    pub dns_backup_port: u16,
    /// SOCKS5 UDP 中继的起始端口，被占用时向上探测最多19个。
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    /// 域名/IP 记录的 LRU 容量。
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// 记录过期时间（秒）。
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// 国家代码，影响默认公共 DNS 列表。
    #[serde(default = "default_country_code")]
    pub country_code: String,
    /// 非 DNS 流量交给哪个下游分发器。
    #[serde(default)]
    pub dispatcher: Dispatcher,
    /// 本地 DNS 服务器；为空时读取 /etc/resolv.conf。
    #[serde(default)]
    pub local_dns_servers: Vec<String>,
    /// 明文 TCP 公共 DNS；为空时按 country_code 选择。
    #[serde(default)]
    pub tcp_dns_servers: Vec<String>,
    #[serde(default = "default_dot_servers")]
    pub dot_servers: Vec<String>,
    /// DoT 证书校验使用的 CA 文件（PEM），缺省使用内置根证书。
    #[serde(default)]
    pub dot_ca_file: Option<PathBuf>,
    #[serde(default = "default_doh_endpoints")]
    pub doh_endpoints: Vec<String>,
    #[serde(default)]
    pub doh_mode: DohMode,
    #[serde(default = "default_remote_resolver_hosts")]
    pub remote_resolver_hosts: Vec<String>,
    /// DoH 客户端使用的上游代理，例如 socks5://127.0.0.1:1080。
    #[serde(default)]
    pub upstream_proxy: Option<String>,
    /// 全部直连：所有域名只走本地解析。
    #[serde(default)]
    pub all_direct: bool,
    /// 对被封锁域名的首个 TLS 记录按 SNI 拆包。
    #[serde(default)]
    pub split_sni: bool,
    #[serde(default = "default_pipe_buf_size")]
    pub pipe_buf_size: usize,
    #[serde(default = "default_local_timeout_ms")]
    pub local_timeout_ms: u64,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_timeout_ms: u64,
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    #[serde(default = "default_https_timeout_ms")]
    pub https_timeout_ms: u64,
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
    /// 并行查询的总超时。
    #[serde(default = "default_race_timeout_ms")]
    pub race_timeout_ms: u64,
    #[serde(default)]
    pub domain_records_file: Option<PathBuf>,
    #[serde(default)]
    pub ip_records_file: Option<PathBuf>,
    /// 黑白名单及用户规则文件，修改后自动重新加载。
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Dispatcher {
    #[default]
    XTunnel,
    GaeProxy,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DohMode {
    /// POST application/dns-message
    #[default]
    Wire,
    /// GET application/dns-json
    Json,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: None,
            dns_bind_ips: default_dns_bind_ips(),
            dns_port: default_dns_port(),
            dns_backup_port: default_dns_backup_port(),
            redirect_port: default_redirect_port(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            country_code: default_country_code(),
            dispatcher: Dispatcher::default(),
            local_dns_servers: Vec::new(),
            tcp_dns_servers: Vec::new(),
            dot_servers: default_dot_servers(),
            dot_ca_file: None,
            doh_endpoints: default_doh_endpoints(),
            doh_mode: DohMode::default(),
            remote_resolver_hosts: default_remote_resolver_hosts(),
            upstream_proxy: None,
            all_direct: false,
            split_sni: false,
            pipe_buf_size: default_pipe_buf_size(),
            local_timeout_ms: default_local_timeout_ms(),
            udp_timeout_ms: default_udp_timeout_ms(),
            tcp_timeout_ms: default_tcp_timeout_ms(),
            https_timeout_ms: default_https_timeout_ms(),
            remote_timeout_ms: default_remote_timeout_ms(),
            race_timeout_ms: default_race_timeout_ms(),
            domain_records_file: None,
            ip_records_file: None,
            rules_file: None,
        }
    }
}

impl Settings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_timeout_ms)
    }

    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn https_timeout(&self) -> Duration {
        Duration::from_millis(self.https_timeout_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }

    pub fn bind_ips(&self) -> Result<Vec<IpAddr>> {
        self.dns_bind_ips
            .iter()
            .map(|s| {
                s.parse::<IpAddr>()
                    .with_context(|| format!("parse dns bind ip: {}", s))
            })
            .collect()
    }

    /// 明文 TCP 公共 DNS 列表，未配置时国内使用 114/阿里，其余使用 Google/Quad9。
    pub fn public_tcp_servers(&self) -> Result<Vec<SocketAddr>> {
        if !self.tcp_dns_servers.is_empty() {
            return parse_server_list(&self.tcp_dns_servers, 53);
        }
        let defaults: &[&str] = if self.country_code.eq_ignore_ascii_case("CN") {
            &["114.114.114.114", "223.5.5.5"]
        } else {
            &["8.8.8.8", "9.9.9.9"]
        };
        parse_server_list(defaults, 53)
    }

    pub fn dot_server_addrs(&self) -> Result<Vec<SocketAddr>> {
        parse_server_list(&self.dot_servers, 853)
    }
}

/// 解析 `ip` 或 `ip:port` 形式的服务器列表。
pub fn parse_server_list<S: AsRef<str>>(list: &[S], default_port: u16) -> Result<Vec<SocketAddr>> {
    list.iter()
        .map(|s| {
            let s = s.as_ref().trim();
            if let Ok(addr) = s.parse::<SocketAddr>() {
                return Ok(addr);
            }
            let ip: IpAddr = s
                .parse()
                .with_context(|| format!("parse dns server address: {}", s))?;
            Ok(SocketAddr::new(ip, default_port))
        })
        .collect()
}

pub fn load_config(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    if let Some(version) = cfg.version.as_ref() {
        info!(target = "config", version = %version, "config loaded");
    }

    // 轻量校验：地址提前解析，启动阶段即可暴露错误。
    cfg.bind_ips()?;
    cfg.public_tcp_servers()?;
    cfg.dot_server_addrs()?;
    parse_server_list(&cfg.local_dns_servers, 53)?;
    if cfg.cache_capacity == 0 {
        anyhow::bail!("cache_capacity must be greater than zero");
    }
    if cfg.pipe_buf_size == 0 {
        anyhow::bail!("pipe_buf_size must be greater than zero");
    }

    Ok(cfg)
}


fn default_dns_bind_ips() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

fn default_dns_port() -> u16 {
    53
}

fn default_dns_backup_port() -> u16 {
    8053
}

fn default_redirect_port() -> u16 {
    8085
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    24 * 3600
}

fn default_country_code() -> String {
    "CN".to_string()
}

fn default_dot_servers() -> Vec<String> {
    vec!["1.1.1.1:853".to_string(), "9.9.9.9:853".to_string()]
}

fn default_doh_endpoints() -> Vec<String> {
    vec!["https://1.1.1.1/dns-query".to_string()]
}

fn default_remote_resolver_hosts() -> Vec<String> {
    vec!["dns.xx-net.net".to_string(), "dns.xx-net.org".to_string()]
}

fn default_pipe_buf_size() -> usize {
    16 * 1024
}

fn default_local_timeout_ms() -> u64 {
    1000
}

fn default_udp_timeout_ms() -> u64 {
    3000
}

fn default_tcp_timeout_ms() -> u64 {
    3000
}

fn default_https_timeout_ms() -> u64 {
    3000
}

fn default_remote_timeout_ms() -> u64 {
    5000
}

fn default_race_timeout_ms() -> u64 {
    5000
}
