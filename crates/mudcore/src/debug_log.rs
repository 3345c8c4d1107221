//! 連線追蹤記錄
//!
//! 啟用後把原始 socket 位元組與 Session 事件逐筆寫入檔案，用於排查協定問題

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::event::SessionEvent;

lazy_static::lazy_static! {
    static ref DEBUG_LOGGER: Mutex<Option<DebugLogger>> = Mutex::new(None);
}

/// 全域追蹤記錄器
pub struct DebugLogger {
    writer: BufWriter<File>,
}

fn logger() -> MutexGuard<'static, Option<DebugLogger>> {
    DEBUG_LOGGER.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DebugLogger {
    /// 開始記錄到指定檔案（覆寫既有內容）
    pub fn init(path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        *logger() = Some(DebugLogger {
            writer: BufWriter::new(file),
        });
        Ok(())
    }

    /// 停止記錄並寫出緩衝
    pub fn shutdown() {
        if let Some(mut l) = logger().take() {
            let _ = l.writer.flush();
        }
    }

    /// 是否已啟用
    pub fn is_enabled() -> bool {
        logger().is_some()
    }

    pub fn log(msg: &str) {
        if let Some(l) = logger().as_mut() {
            let _ = writeln!(l.writer, "[{}] {}", timestamp_millis(), msg);
            let _ = l.writer.flush();
        }
    }

    pub fn log_bytes(prefix: &str, bytes: &[u8]) {
        if !Self::is_enabled() {
            return;
        }
        let hex = bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ");
        Self::log(&format!("{}: [{}]", prefix, hex));
    }

    /// 以 JSON 格式記錄 Session 事件
    pub fn log_event(prefix: &str, event: &SessionEvent) {
        if !Self::is_enabled() {
            return;
        }
        match serde_json::to_string(event) {
            Ok(json) => Self::log(&format!("{}: {}", prefix, json)),
            Err(e) => Self::log(&format!("{}: <無法序列化: {}>", prefix, e)),
        }
    }
}

fn timestamp_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
