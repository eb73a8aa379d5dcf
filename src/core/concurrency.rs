//! 并发限制：任务级总上限 + 按工具类别的上限
//!
//! 每个派发的步骤需同时持有全局许可与（若配置）类别许可；许可随 DispatchPermit 一起释放。
//! 采用 try_acquire：拿不到许可的 Ready 步骤留到下一次调度再试，协调者自身从不阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::SchedulerSection;
use crate::tools::ToolCategory;

/// 一个步骤占用的并发许可，Drop 时归还
#[derive(Debug)]
pub struct DispatchPermit {
    _global: OwnedSemaphorePermit,
    _category: Option<OwnedSemaphorePermit>,
}

/// 并发限制器
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    global: Arc<Semaphore>,
    categories: HashMap<ToolCategory, Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrency: usize, category_limits: HashMap<ToolCategory, usize>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(max_concurrency.max(1))),
            categories: category_limits
                .into_iter()
                .map(|(c, n)| (c, Arc::new(Semaphore::new(n.max(1)))))
                .collect(),
        }
    }

    /// 从 [scheduler] 段构建；无法识别的类别名会被忽略并记录警告
    pub fn from_config(cfg: &SchedulerSection) -> Self {
        let mut limits = HashMap::new();
        for (name, n) in &cfg.category_limits {
            match name.parse::<ToolCategory>() {
                Ok(c) => {
                    limits.insert(c, *n);
                }
                Err(_) => tracing::warn!(category = %name, "Unknown tool category in category_limits"),
            }
        }
        Self::new(cfg.max_concurrency, limits)
    }

    /// 尝试获取一个步骤的执行许可，容量不足时返回 None
    pub fn try_acquire(&self, category: ToolCategory) -> Option<DispatchPermit> {
        let global = Arc::clone(&self.global).try_acquire_owned().ok()?;
        let category = match self.categories.get(&category) {
            Some(sem) => Some(Arc::clone(sem).try_acquire_owned().ok()?),
            None => None,
        };
        Some(DispatchPermit {
            _global: global,
            _category: category,
        })
    }

    pub fn available(&self) -> usize {
        self.global.available_permits()
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::from_config(&SchedulerSection::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_limit() {
        let limiter = ConcurrencyLimiter::new(2, HashMap::new());
        let a = limiter.try_acquire(ToolCategory::Llm);
        let b = limiter.try_acquire(ToolCategory::Llm);
        assert!(a.is_some() && b.is_some());
        assert!(limiter.try_acquire(ToolCategory::Llm).is_none());
        drop(a);
        assert!(limiter.try_acquire(ToolCategory::Llm).is_some());
    }

    #[test]
    fn test_category_limit_releases_global_on_failure() {
        let limiter = ConcurrencyLimiter::new(4, HashMap::from([(ToolCategory::Device, 1)]));
        let first = limiter.try_acquire(ToolCategory::Device);
        assert!(first.is_some());
        assert!(limiter.try_acquire(ToolCategory::Device).is_none());
        // 类别许可失败时已拿到的全局许可被归还
        assert_eq!(limiter.available(), 3);
        assert!(limiter.try_acquire(ToolCategory::Communication).is_some());
    }

    #[test]
    fn test_from_config_parses_categories() {
        let limiter = ConcurrencyLimiter::default();
        let _held = limiter.try_acquire(ToolCategory::Device).unwrap();
        assert!(limiter.try_acquire(ToolCategory::Device).is_none());
    }
}
