use std::sync::Arc;
use std::time::Duration;

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tokio::sync::mpsc;

/// 等待中的 UDP 查询：按事务 ID 关联响应
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub domain: Arc<str>,
    pub tx: mpsc::Sender<Vec<String>>,
}

/// Transaction ID -> waiter. Bounded, oldest entries evicted first.
pub type PendingTable = Cache<u16, PendingQuery>;

/// 创建带容量上限和 TTL 的关联表。满时淘汰最久未用的条目，新登记的总被接纳
#[inline]
pub fn new_pending_table(max_capacity: u64, ttl: Duration) -> PendingTable {
    Cache::builder()
        .max_capacity(max_capacity)
        .eviction_policy(EvictionPolicy::lru())
        .time_to_live(ttl)
        .build()
}

/// Registers a waiter under a random ID not currently in flight. Dropping
/// the returned guard removes the entry.
pub fn register(table: &PendingTable, domain: &str) -> (PendingGuard, mpsc::Receiver<Vec<String>>) {
    let (tx, rx) = mpsc::channel(1);
    let id = loop {
        let cand: u16 = rand::random();
        if !table.contains_key(&cand) {
            break cand;
        }
    };
    table.insert(
        id,
        PendingQuery {
            domain: Arc::from(domain),
            tx,
        },
    );
    (
        PendingGuard {
            table: table.clone(),
            id,
        },
        rx,
    )
}

pub struct PendingGuard {
    table: PendingTable,
    id: u16,
}

impl PendingGuard {
    pub fn id(&self) -> u16 {
        self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.invalidate(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_hands_off_and_cleans_up() {
        let table = new_pending_table(100, Duration::from_secs(3));
        let (guard, mut rx) = register(&table, "example.com");
        let id = guard.id();

        let waiter = table.get(&id).expect("registered");
        assert_eq!(waiter.domain.as_ref(), "example.com");
        waiter.tx.try_send(vec!["1.2.3.4".to_string()]).expect("send");
        assert_eq!(rx.recv().await, Some(vec!["1.2.3.4".to_string()]));

        drop(guard);
        assert!(table.get(&id).is_none());
    }

    #[test]
    fn full_table_evicts_oldest_waiter() {
        let table = new_pending_table(100, Duration::from_secs(30));
        let regs: Vec<_> = (0..100).map(|_| register(&table, "a.com")).collect();
        table.run_pending_tasks();
        assert_eq!(table.entry_count(), 100);

        let (newest, _rx) = register(&table, "b.com");
        table.run_pending_tasks();
        assert_eq!(table.entry_count(), 100);
        assert_eq!(table.get(&newest.id()).map(|w| w.domain.to_string()), Some("b.com".to_string()));
        assert!(table.get(&regs[0].0.id()).is_none());
    }

    #[test]
    fn concurrent_ids_are_distinct() {
        let table = new_pending_table(100, Duration::from_secs(3));
        let regs: Vec<_> = (0..50).map(|_| register(&table, "a.com")).collect();
        let mut ids: Vec<u16> = regs.iter().map(|(g, _)| g.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 50);
    }
}
