use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::router::BypassEngine;

/// 写入完成前的合并窗口
const DEBOUNCE: Duration = Duration::from_millis(200);

/// 检查规则文件路径是否被 `set_file` 换掉的间隔
const REARM_INTERVAL: Duration = Duration::from_secs(1);

/// 规则文件监视器：文件被修改或替换后重载分流规则，规则文件路径
/// 换掉后改为监视新路径。Drop 时停止。
pub struct RuleWatcher {
    task: JoinHandle<()>,
}

impl RuleWatcher {
    pub fn spawn(bypass: Arc<BypassEngine>) -> Result<Self> {
        let file = bypass.file();
        let target = Arc::new(RwLock::new(file.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        let filter = target.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_rule_change(&event, &current(&filter)) => {
                let _ = tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "rule watcher error"),
        })
        .context("failed to create rule watcher")?;

        // 编辑器常以重命名方式替换文件，监视所在目录
        let mut watched = watch_dir(&file);
        watcher
            .watch(&watched, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch '{}'", watched.display()))?;
        info!(path = %file.display(), "rule watcher started");

        let task = tokio::spawn(async move {
            let mut rearm_tick = tokio::time::interval(REARM_INTERVAL);
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        if event.is_none() {
                            break;
                        }
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        match bypass.refresh_mapping() {
                            Ok(count) => info!(rules = count, "bypass rules reloaded"),
                            Err(e) => error!(error = %e, "bypass rules reload failed"),
                        }
                    }
                    _ = rearm_tick.tick() => {
                        let file = bypass.file();
                        if file != current(&target) {
                            rearm(&mut watcher, &mut watched, &target, file);
                        }
                    }
                }
            }
            debug!("rule watcher stopped");
        });

        Ok(Self { task })
    }
}

impl Drop for RuleWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn current(target: &RwLock<PathBuf>) -> PathBuf {
    target.read().unwrap_or_else(|p| p.into_inner()).clone()
}

/// 改为监视新的规则文件；新目录挂不上时保持原状，下个周期重试
fn rearm(watcher: &mut RecommendedWatcher, watched: &mut PathBuf, target: &RwLock<PathBuf>, file: PathBuf) {
    let dir = watch_dir(&file);
    if dir != *watched {
        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            warn!(path = %dir.display(), error = %e, "rule watcher re-arm failed");
            return;
        }
        if let Err(e) = watcher.unwatch(watched.as_path()) {
            debug!(path = %watched.display(), error = %e, "rule watcher unwatch failed");
        }
        *watched = dir;
    }
    info!(path = %file.display(), "rule watcher following new rule file");
    *target.write().unwrap_or_else(|p| p.into_inner()) = file;
}

fn watch_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn is_rule_change(event: &Event, file: &Path) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_)
    );
    relevant && event.paths.iter().any(|p| p.file_name() == file.file_name())
}
