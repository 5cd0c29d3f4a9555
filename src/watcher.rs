use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::matcher::DomainLists;

/// Reloads the rules file into `lists` whenever it changes on disk.
pub fn spawn(path: PathBuf, lists: Arc<ArcSwap<DomainLists>>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, lists) {
            error!(target = "watcher", error = %err, "rules watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, lists: Arc<ArcSwap<DomainLists>>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "rules watcher started");

    for res in rx {
        match res {
            Ok(_event) => {
                reload(&path, &lists);
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

/// 截断后写入时可能读到半个文件，失败重试3次，仍失败则保留旧规则
fn reload(path: &Path, lists: &ArcSwap<DomainLists>) -> bool {
    let mut retries = 3;
    loop {
        match DomainLists::load(path) {
            Ok(new_lists) => {
                lists.store(Arc::new(new_lists));
                info!(target = "watcher", path = %path.display(), "rules reloaded");
                return true;
            }
            Err(err) => {
                retries -= 1;
                if retries == 0 {
                    warn!(target = "watcher", path = %path.display(), error = %err, "rules reload failed, keeping old rules");
                    return false;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    fn temp_file(tag: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("smart-router-watch-{}-{}.txt", tag, nanos))
    }

    #[test]
    fn reload_swaps_lists_and_keeps_old_on_failure() {
        let path = temp_file("reload");
        std::fs::write(&path, "block first.test\n").unwrap();
        let lists = ArcSwap::from_pointee(DomainLists::new());
        assert!(reload(&path, &lists));
        assert!(lists.load().in_block_list("first.test"));

        std::fs::remove_file(&path).unwrap();
        assert!(!reload(&path, &lists));
        assert!(lists.load().in_block_list("first.test"));
    }

    #[test]
    fn file_change_is_picked_up() {
        let path = temp_file("watch");
        std::fs::write(&path, "block first.test\n").unwrap();
        let lists = Arc::new(ArcSwap::from_pointee(DomainLists::load(&path).unwrap()));
        spawn(path.clone(), lists.clone());
        thread::sleep(Duration::from_millis(200));

        std::fs::write(&path, "block second.test\n").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !lists.load().in_block_list("second.test") && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(lists.load().in_block_list("second.test"));
        let _ = std::fs::remove_file(&path);
    }
}
