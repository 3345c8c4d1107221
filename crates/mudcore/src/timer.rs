//! 計時器服務
//!
//! 單次與重複計時器，觸發時把 `TimerEvent` 送到 Orchestrator 讀取的 channel。
//! 觸發時會在表格的鎖內確認項目仍存在；已取消的計時器絕不會送出事件。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// 計時器識別碼
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimerId(u64);

impl TimerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// 計時器觸發事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub id: TimerId,
}

struct TimerEntry {
    /// 零代表單次
    interval: Duration,
    /// 每次重新排程都會換新，過期的 task 靠它辨識自己
    token: u64,
    task: JoinHandle<()>,
}

struct Inner {
    entries: Mutex<HashMap<TimerId, TimerEntry>>,
    tx: mpsc::UnboundedSender<TimerEvent>,
    next_id: AtomicU64,
    next_token: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<TimerId, TimerEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 計時器服務
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl TimerService {
    /// 建立服務，同時回傳觸發事件的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                tx,
                next_id: AtomicU64::new(0),
                next_token: AtomicU64::new(0),
            }),
        };
        (service, rx)
    }

    /// 經過 `delay` 後觸發一次
    pub fn after(&self, delay: Duration) -> TimerId {
        self.schedule(delay, Duration::ZERO)
    }

    /// 每隔 `interval` 觸發一次
    ///
    /// 每次觸發後從觸發當下重新計時，不補償累積的誤差。
    /// `interval` 為零時等同單次計時器。
    pub fn every(&self, interval: Duration) -> TimerId {
        self.schedule(interval, interval)
    }

    /// 取消計時器，回傳是否仍在排程中
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.inner.lock().remove(&id) {
            Some(entry) => {
                entry.task.abort();
                debug!("取消計時器 {:?}", id);
                true
            }
            None => false,
        }
    }

    /// 取消所有計時器
    pub fn cancel_all(&self) {
        let mut entries = self.inner.lock();
        for (_, entry) in entries.drain() {
            entry.task.abort();
        }
    }

    /// 是否仍在排程中
    pub fn contains(&self, id: TimerId) -> bool {
        self.inner.lock().contains_key(&id)
    }

    /// 排程中的計時器數量
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule(&self, delay: Duration, interval: Duration) -> TimerId {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut entries = self.inner.lock();
        arm(&self.inner, &mut entries, id, delay, interval);
        id
    }
}

/// 建立 sleep task 並登記到表格；呼叫端持有表格的鎖
fn arm(
    inner: &Arc<Inner>,
    entries: &mut HashMap<TimerId, TimerEntry>,
    id: TimerId,
    delay: Duration,
    interval: Duration,
) {
    let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
    let weak = Arc::downgrade(inner);
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire(&weak, id, token);
    });
    entries.insert(id, TimerEntry { interval, token, task });
}

fn fire(weak: &Weak<Inner>, id: TimerId, token: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let mut entries = inner.lock();

    // 表格中找不到（或已被換新）代表已取消
    let interval = match entries.get(&id) {
        Some(entry) if entry.token == token => entry.interval,
        _ => return,
    };
    entries.remove(&id);
    if !interval.is_zero() {
        arm(&inner, &mut entries, id, interval, interval);
    }

    let _ = inner.tx.send(TimerEvent { id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn drain(rx: &mut mpsc::UnboundedReceiver<TimerEvent>) -> Vec<TimerId> {
        let mut ids = Vec::new();
        while let Ok(event) = rx.try_recv() {
            ids.push(event.id);
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let (timers, mut rx) = TimerService::new();
        let id = timers.after(Duration::from_millis(100));
        assert!(timers.contains(id));

        sleep(Duration::from_millis(99)).await;
        assert!(drain(&mut rx).is_empty());

        sleep(Duration::from_millis(2)).await;
        assert_eq!(drain(&mut rx), vec![id]);
        assert!(!timers.contains(id));

        sleep(Duration::from_secs(1)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats_with_same_id() {
        let (timers, mut rx) = TimerService::new();
        let id = timers.every(Duration::from_millis(10));

        sleep(Duration::from_millis(35)).await;
        assert_eq!(drain(&mut rx), vec![id, id, id]);
        assert!(timers.contains(id));

        assert!(timers.cancel(id));
        sleep(Duration::from_millis(50)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_fire_delivers_nothing() {
        let (timers, mut rx) = TimerService::new();
        let id = timers.after(Duration::from_millis(10));
        sleep(Duration::from_millis(9)).await;

        assert!(timers.cancel(id));
        sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_keeps_single_event() {
        let (timers, mut rx) = TimerService::new();
        let id = timers.after(Duration::from_millis(10));
        sleep(Duration::from_millis(20)).await;

        assert!(!timers.cancel(id));
        assert_eq!(drain(&mut rx), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (timers, mut rx) = TimerService::new();
        timers.after(Duration::from_millis(10));
        timers.every(Duration::from_millis(5));
        assert_eq!(timers.len(), 2);

        timers.cancel_all();
        assert!(timers.is_empty());
        sleep(Duration::from_millis(100)).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_unique() {
        let (timers, _rx) = TimerService::new();
        let a = timers.after(Duration::from_secs(1));
        let b = timers.after(Duration::from_secs(1));
        assert_ne!(a, b);
        assert!(a.value() < b.value());
    }
}
