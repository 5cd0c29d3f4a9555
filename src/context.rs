use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::config::Settings;
use crate::matcher::DomainLists;
use crate::records::{AssumeHealthy, DomainRuleStore, IpRuleStore, NetworkHealth};

/// Shared state built once at startup and handed to every component.
pub struct RouterContext {
    pub settings: Settings,
    pub domains: Arc<DomainRuleStore>,
    pub ips: Arc<IpRuleStore>,
    pub lists: Arc<ArcSwap<DomainLists>>,
}

impl RouterContext {
    /// Opens the persisted stores and the rules file named in `settings`.
    /// A missing or unreadable rules file starts with empty lists.
    pub fn new(settings: Settings, health: Arc<dyn NetworkHealth>) -> Self {
        let lists = match settings.rules_file.as_ref() {
            Some(path) => DomainLists::load(path).unwrap_or_else(|err| {
                warn!(target = "context", error = %err, "rules file not loaded, starting with empty lists");
                DomainLists::new()
            }),
            None => DomainLists::new(),
        };
        let domains = DomainRuleStore::new(
            settings.domain_records_file.clone(),
            settings.cache_capacity,
            settings.cache_ttl(),
        );
        let ips = IpRuleStore::new(
            settings.ip_records_file.clone(),
            settings.cache_capacity,
            settings.cache_ttl(),
            health,
        );
        Self {
            settings,
            domains: Arc::new(domains),
            ips: Arc::new(ips),
            lists: Arc::new(ArcSwap::from_pointee(lists)),
        }
    }

    /// Nothing persisted; used by tests and embedders.
    pub fn in_memory(settings: Settings, lists: DomainLists) -> Self {
        let domains = DomainRuleStore::in_memory(settings.cache_capacity, settings.cache_ttl());
        let ips = IpRuleStore::in_memory(settings.cache_capacity, settings.cache_ttl());
        Self {
            settings,
            domains: Arc::new(domains),
            ips: Arc::new(ips),
            lists: Arc::new(ArcSwap::from_pointee(lists)),
        }
    }

    pub fn with_defaults(settings: Settings) -> Self {
        Self::new(settings, Arc::new(AssumeHealthy))
    }

    /// 刷新两个存储；force 时忽略10秒的去抖间隔
    pub fn save(&self, force: bool) {
        if let Err(err) = self.domains.save(force) {
            warn!(target = "context", error = %err, "save domain records failed");
        }
        if let Err(err) = self.ips.save(force) {
            warn!(target = "context", error = %err, "save ip records failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DomainRule;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        let dir = std::env::temp_dir().join(format!("smart-router-ctx-{}-{}", tag, nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn opens_files_named_in_settings() {
        let dir = temp_dir("open");
        let rules = dir.join("rules.txt");
        std::fs::write(&rules, "block blocked.test\nblack ads.test\n").unwrap();
        std::fs::write(dir.join("domains.txt"), "learned.test socks 1\n").unwrap();

        let settings = Settings {
            rules_file: Some(rules),
            domain_records_file: Some(dir.join("domains.txt")),
            ip_records_file: Some(dir.join("ips.txt")),
            ..Settings::default()
        };
        let ctx = RouterContext::with_defaults(settings);
        assert!(ctx.lists.load().in_block_list("www.blocked.test"));
        assert_eq!(ctx.lists.load().check_host("x.ads.test"), DomainRule::Black);
        assert_eq!(ctx.domains.get_rule("learned.test"), DomainRule::Socks);

        ctx.ips.update_connect_time("1.2.3.4".parse().unwrap(), 120);
        ctx.save(true);
        let saved = std::fs::read_to_string(dir.join("ips.txt")).unwrap();
        assert!(saved.starts_with("1.2.3.4 direct 120 "));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_rules_file_gives_empty_lists() {
        let settings = Settings {
            rules_file: Some("/nonexistent/smart-router/rules.txt".into()),
            ..Settings::default()
        };
        let ctx = RouterContext::with_defaults(settings);
        assert!(!ctx.lists.load().in_block_list("anything.test"));
        assert!(ctx.domains.is_empty());
    }
}
