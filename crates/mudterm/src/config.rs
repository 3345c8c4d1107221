//! 設定檔
//!
//! 存放於 `<config_dir>/mudclient/config.json`，缺少的欄位使用預設值

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mudcore::{TelnetConfig, TextEncoding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("無法讀取設定檔 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("設定檔格式錯誤 {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 用戶端設定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// 連線逾時（秒）
    pub connect_timeout_secs: u64,
    /// 單次寫入逾時（秒）
    pub write_timeout_secs: u64,
    pub read_buffer_size: usize,
    pub send_queue_capacity: usize,
    pub event_capacity: usize,
    /// UI 佇列上限，超過時丟棄最舊的訊息
    pub ui_queue_limit: usize,
    pub encoding: TextEncoding,
    /// 回應 TTYPE 時使用的終端機名稱
    pub terminal_type: String,
    /// 啟動時載入的腳本
    pub scripts: Vec<PathBuf>,
    /// 原始位元組追蹤檔
    pub debug_log: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let telnet = TelnetConfig::default();
        Self {
            connect_timeout_secs: telnet.connect_timeout.as_secs(),
            write_timeout_secs: telnet.write_timeout.as_secs(),
            read_buffer_size: telnet.read_buffer_size,
            send_queue_capacity: telnet.send_queue_capacity,
            event_capacity: telnet.event_capacity,
            ui_queue_limit: 1024,
            encoding: telnet.encoding,
            terminal_type: telnet.terminal_type,
            scripts: Vec::new(),
            debug_log: None,
        }
    }
}

impl ClientConfig {
    /// 預設設定檔路徑
    pub fn config_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// 從檔案載入；檔案不存在時使用預設值
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("找不到設定檔 {:?}，使用預設值", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 轉換為連線設定
    pub fn telnet_config(&self) -> TelnetConfig {
        TelnetConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            read_buffer_size: self.read_buffer_size,
            send_queue_capacity: self.send_queue_capacity,
            event_capacity: self.event_capacity,
            encoding: self.encoding,
            terminal_type: self.terminal_type.clone(),
            ..TelnetConfig::default()
        }
    }
}

/// 獲取設定目錄
pub fn config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("mudclient")
    } else {
        PathBuf::from(".")
    }
}
