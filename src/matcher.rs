use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Context;
use ipnet::IpNet;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

use crate::records::DomainRule;

/// Private, loopback and link-local ranges. A pipe leg whose peer falls in
/// one of these is the client side of the pair.
static PRIVATE_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "100.64.0.0/10",
        "::1/128",
        "fc00::/7",
        "fe80::/10",
    ]
    .iter()
    .filter_map(|s| s.parse().ok())
    .collect()
});

pub fn is_private_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    PRIVATE_NETS.iter().any(|net| net.contains(&ip))
}

/// 域名后缀集合：`a.b.example.com` 命中 `example.com`。
#[derive(Debug, Clone, Default)]
pub struct SuffixSet {
    entries: FxHashSet<String>,
}

impl SuffixSet {
    pub fn insert(&mut self, domain: &str) {
        let d = normalize(domain);
        if !d.is_empty() {
            self.entries.insert(d);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let d = normalize(domain);
        suffixes(&d).any(|s| self.entries.contains(s))
    }
}

/// Block list, allow list and user-assigned rules, reloaded as a whole.
#[derive(Debug, Clone, Default)]
pub struct DomainLists {
    block: SuffixSet,
    allow: SuffixSet,
    user_rules: FxHashMap<String, DomainRule>,
}

impl DomainLists {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules file format, one entry per line:
    ///
    /// ```text
    /// # comment
    /// block  example.com
    /// allow  example.org
    /// direct intranet.example
    /// black  ads.example.net
    /// ```
    pub fn parse(content: &str) -> Self {
        let mut lists = Self::default();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(kind), Some(domain)) = (parts.next(), parts.next()) else {
                warn!(target = "matcher", line = lineno + 1, content = %line, "rule line malformed");
                continue;
            };
            match kind {
                "block" => lists.block.insert(domain),
                "allow" => lists.allow.insert(domain),
                other => match other.parse::<DomainRule>() {
                    Ok(DomainRule::Unknown) | Err(_) => {
                        warn!(target = "matcher", line = lineno + 1, kind = %other, "unknown rule kind");
                    }
                    Ok(rule) => lists.set_user_rule(domain, rule),
                },
            }
        }
        lists
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read rules file: {}", path.display()))?;
        let lists = Self::parse(&raw);
        info!(
            target = "matcher",
            path = %path.display(),
            block = lists.block.len(),
            allow = lists.allow.len(),
            user = lists.user_rules.len(),
            "domain lists loaded"
        );
        Ok(lists)
    }

    pub fn add_block(&mut self, domain: &str) {
        self.block.insert(domain);
    }

    pub fn add_allow(&mut self, domain: &str) {
        self.allow.insert(domain);
    }

    pub fn set_user_rule(&mut self, domain: &str, rule: DomainRule) {
        let d = normalize(domain);
        if !d.is_empty() {
            self.user_rules.insert(d, rule);
        }
    }

    pub fn in_block_list(&self, domain: &str) -> bool {
        self.block.contains(domain)
    }

    pub fn in_white_list(&self, domain: &str) -> bool {
        self.allow.contains(domain)
    }

    /// 用户规则，最长后缀优先；未命中返回 Unknown。
    pub fn check_host(&self, domain: &str) -> DomainRule {
        if self.user_rules.is_empty() {
            return DomainRule::Unknown;
        }
        let d = normalize(domain);
        suffixes(&d)
            .find_map(|s| self.user_rules.get(s).copied())
            .unwrap_or(DomainRule::Unknown)
    }
}

fn normalize(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `a.b.c` -> `a.b.c`, `b.c`, `c`
fn suffixes(domain: &str) -> impl Iterator<Item = &str> {
    std::iter::once(domain).chain(
        domain
            .char_indices()
            .filter(|(_, c)| *c == '.')
            .map(move |(i, _)| &domain[i + 1..])
            .filter(|s| !s.is_empty()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_set_matches_subdomains_only() {
        let mut set = SuffixSet::default();
        set.insert("Example.COM.");
        assert!(set.contains("example.com"));
        assert!(set.contains("www.example.com"));
        assert!(set.contains("a.b.EXAMPLE.com."));
        assert!(!set.contains("notexample.com"));
        assert!(!set.contains("com"));
    }

    #[test]
    fn parse_rules_file() {
        let lists = DomainLists::parse(
            "# comment\n\
             block google.com\n\
             allow baidu.com\n\
             gae appspot.com\n\
             black ads.example.net\n\
             direct intranet.test\n\
             bogus foo.com\n\
             lonely\n",
        );
        assert!(lists.in_block_list("www.google.com"));
        assert!(!lists.in_block_list("baidu.com"));
        assert!(lists.in_white_list("map.baidu.com"));
        assert_eq!(lists.check_host("x.appspot.com"), DomainRule::Gae);
        assert_eq!(lists.check_host("ads.example.net"), DomainRule::Black);
        assert_eq!(lists.check_host("intranet.test"), DomainRule::Direct);
        assert_eq!(lists.check_host("foo.com"), DomainRule::Unknown);
    }

    #[test]
    fn user_rule_longest_suffix_wins() {
        let mut lists = DomainLists::new();
        lists.set_user_rule("example.com", DomainRule::Gae);
        lists.set_user_rule("cdn.example.com", DomainRule::Direct);
        assert_eq!(lists.check_host("img.cdn.example.com"), DomainRule::Direct);
        assert_eq!(lists.check_host("www.example.com"), DomainRule::Gae);
    }

    #[test]
    fn private_ip_detection() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.10".parse().unwrap()));
        assert!(is_private_ip("10.2.3.4".parse().unwrap()));
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fd00::5".parse().unwrap()));
        assert!(is_private_ip("::ffff:192.168.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }
}
