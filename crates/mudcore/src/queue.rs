//! 有上限的背壓佇列
//!
//! 生產端永不阻塞：達到上限時丟棄最舊的項目。給 UI 這類不能拖住上游的消費端使用。
//! 單一消費端。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::warn;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    evicted: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    limit: usize,
}

/// 背壓佇列
pub struct BackpressureQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BackpressureQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> BackpressureQueue<T> {
    /// 建立佇列，`limit` 為同時保留的最大項目數（至少 1）
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    closed: false,
                    evicted: 0,
                }),
                notify: Notify::new(),
                limit,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 放入項目；已關閉時回傳 false
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            if state.items.len() >= self.inner.limit {
                state.items.pop_front();
                state.evicted += 1;
                if state.evicted.is_power_of_two() {
                    warn!("UI 佇列已滿，累計丟棄 {} 筆", state.evicted);
                }
            }
            state.items.push_back(item);
        }
        self.inner.notify.notify_one();
        true
    }

    /// 等待下一個項目；關閉且清空後回傳 None
    pub async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// 關閉佇列，剩餘項目仍可取出
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// 累計因滿載被丟棄的項目數
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }
}
