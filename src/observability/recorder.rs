//! 事件记录器与事件落地
//!
//! Recorder::record 是“发出即忘”的：从不阻塞调用方、从不返回错误。
//! BufferedRecorder::record 只把事件放入有界缓冲，超出上限后丢弃最旧的；
//! 写入 EventSink 由 spawn_blocking 中的后台排空完成，落地慢或不可用都不会拖住调度器。
//! 运行时之外没有后台排空，事件留在缓冲里直到显式 flush。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::observability::events::{EventKind, ExecutionEvent};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),
    #[error("Sink storage error: {0}")]
    Storage(String),
}

/// 事件落地（追加写入）；实现可以是阻塞的
pub trait EventSink: Send + Sync {
    fn append(&self, event: &ExecutionEvent) -> Result<(), SinkError>;
}

/// 调度器与调用器使用的记录接口
pub trait Recorder: Send + Sync {
    fn record(&self, event: ExecutionEvent);
}

struct Shared {
    sink: Arc<dyn EventSink>,
    buffer: Mutex<VecDeque<ExecutionEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    /// 同一时刻只有一个排空者访问落地
    writer: Mutex<()>,
    /// 已有后台排空在排队或运行
    scheduled: AtomicBool,
}

impl Shared {
    fn pending(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 按顺序写入落地，遇到第一个错误即停止；返回写入条数与落地是否可用
    fn drain(&self) -> (usize, bool) {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut written = 0;
        loop {
            let next = self
                .buffer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .front()
                .cloned();
            let Some(event) = next else {
                return (written, true);
            };
            if let Err(e) = self.sink.append(&event) {
                tracing::debug!(error = %e, pending = self.pending(), "Event sink unavailable, buffering");
                return (written, false);
            }
            // 写入期间该事件可能已因溢出被丢弃
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.front().map(|f| f.id == event.id).unwrap_or(false) {
                buffer.pop_front();
            }
            written += 1;
        }
    }
}

/// 有界缓冲记录器
pub struct BufferedRecorder {
    shared: Arc<Shared>,
    mirror_to_log: bool,
}

impl BufferedRecorder {
    pub fn new(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink,
                buffer: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
                writer: Mutex::new(()),
                scheduled: AtomicBool::new(false),
            }),
            mirror_to_log: false,
        }
    }

    /// 同时把每条事件写入 tracing 日志
    pub fn with_log_mirror(mut self, enabled: bool) -> Self {
        self.mirror_to_log = enabled;
        self
    }

    /// 在当前线程把缓冲写入落地（会阻塞）；遇到第一个错误即停止，剩余事件保留
    pub fn flush(&self) -> usize {
        self.shared.drain().0
    }

    /// 尚未落地的事件数
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// 因缓冲溢出被丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn schedule_drain(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.shared.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        handle.spawn_blocking(move || loop {
            let (_, healthy) = shared.drain();
            shared.scheduled.store(false, Ordering::Release);
            // 落地不可用时等下一条事件再试；否则接手排空期间新进的事件
            if !healthy || shared.pending() == 0 || shared.scheduled.swap(true, Ordering::AcqRel) {
                break;
            }
        });
    }
}

impl Recorder for BufferedRecorder {
    fn record(&self, event: ExecutionEvent) {
        if self.mirror_to_log {
            TracingSink::log(&event);
        }
        {
            let mut buffer = self.shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push_back(event);
            while buffer.len() > self.shared.capacity {
                buffer.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, capacity = self.shared.capacity, "Event buffer full, dropped oldest event");
            }
        }
        self.schedule_drain();
    }
}

/// 内存事件日志：测试与进程内查询用；可模拟不可用
#[derive(Default)]
pub struct InMemoryEventLog {
    events: RwLock<Vec<ExecutionEvent>>,
    unavailable: AtomicBool,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn for_task(&self, task_id: &str) -> Vec<ExecutionEvent> {
        self.events
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn of_kind(&self, task_id: &str, kind: EventKind) -> Vec<ExecutionEvent> {
        self.for_task(task_id).into_iter().filter(|e| e.kind == kind).collect()
    }

    pub fn count(&self, task_id: &str, kind: EventKind) -> usize {
        self.of_kind(task_id, kind).len()
    }
}

impl EventSink for InMemoryEventLog {
    fn append(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable("in-memory log disabled".into()));
        }
        self.events
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// 进程内日志直接记录，不经缓冲；不可用时事件被丢弃
impl Recorder for InMemoryEventLog {
    fn record(&self, event: ExecutionEvent) {
        if let Err(e) = self.append(&event) {
            tracing::debug!(error = %e, "Dropped event");
        }
    }
}

/// 把事件写成结构化日志
pub struct TracingSink;

impl TracingSink {
    fn log(event: &ExecutionEvent) {
        let payload = event.payload.to_string();
        tracing::info!(
            task_id = %event.task_id,
            step_id = event.step_id.as_deref().unwrap_or("-"),
            kind = %event.kind,
            payload = %payload,
            "execution_event"
        );
    }
}

impl EventSink for TracingSink {
    fn append(&self, event: &ExecutionEvent) -> Result<(), SinkError> {
        Self::log(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn event(n: u64) -> ExecutionEvent {
        ExecutionEvent::new("t1", EventKind::ToolInvoked, json!({ "n": n }))
    }

    /// 每次写入都要等待的落地
    struct SlowSink {
        delay: Duration,
        written: AtomicU64,
    }

    impl EventSink for SlowSink {
        fn append(&self, _event: &ExecutionEvent) -> Result<(), SinkError> {
            std::thread::sleep(self.delay);
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_flush_writes_in_order() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = BufferedRecorder::new(log.clone(), 8);
        recorder.record(event(1));
        recorder.record(event(2).with_step("a"));
        // 运行时之外只有 flush 会写入落地
        assert_eq!(recorder.pending(), 2);
        assert_eq!(recorder.flush(), 2);
        assert_eq!(log.count("t1", EventKind::ToolInvoked), 2);
        assert_eq!(log.events()[1].step_id.as_deref(), Some("a"));
        assert_eq!(recorder.pending(), 0);
    }

    #[tokio::test]
    async fn test_background_drain_reaches_sink() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = BufferedRecorder::new(log.clone(), 8);
        recorder.record(event(1));
        for _ in 0..200 {
            if log.count("t1", EventKind::ToolInvoked) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(log.count("t1", EventKind::ToolInvoked), 1);
        assert_eq!(recorder.pending(), 0);
    }

    #[tokio::test]
    async fn test_slow_sink_does_not_block_record() {
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(300),
            written: AtomicU64::new(0),
        });
        let recorder = Arc::new(BufferedRecorder::new(sink.clone(), 16));

        let start = Instant::now();
        recorder.record(event(1));
        recorder.record(event(2));
        assert!(start.elapsed() < Duration::from_millis(50));

        let flusher = Arc::clone(&recorder);
        tokio::task::spawn_blocking(move || flusher.flush()).await.unwrap();
        assert_eq!(sink.written.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.pending(), 0);
    }

    #[test]
    fn test_buffer_drops_oldest_when_sink_down() {
        let log = Arc::new(InMemoryEventLog::new());
        let recorder = BufferedRecorder::new(log.clone(), 3);
        log.set_available(false);
        for n in 0..5 {
            recorder.record(event(n));
        }
        assert_eq!(recorder.pending(), 3);
        assert_eq!(recorder.dropped(), 2);
        assert!(log.events().is_empty());

        log.set_available(true);
        assert_eq!(recorder.flush(), 3);
        let seen: Vec<u64> = log
            .events()
            .iter()
            .filter_map(|e| e.payload["n"].as_u64())
            .collect();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn test_event_kind_roundtrip_names() {
        assert_eq!(EventKind::PermissionDenied.as_str(), "permission_denied");
        assert_eq!(EventKind::parse("emergency_stop"), Some(EventKind::EmergencyStop));
        assert_eq!(EventKind::parse("nope"), None);
    }
}
