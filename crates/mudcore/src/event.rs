//! Session 事件
//!
//! 網路、UI、計時器與非同步操作產生的事件，全部交給 Orchestrator 依序處理

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 送進 Orchestrator 的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// 使用者輸入的一行文字
    UserInput(String),
    /// 伺服器送來的完整一行
    ServerLine(String),
    /// 伺服器送來的提示字元（未換行的剩餘內容）
    ServerPrompt(String),
    /// 目前的連線已中斷
    Disconnected,
    /// 延遲執行的回呼
    Deferred(Deferred),
    /// 系統層級操作請求
    System(SystemRequest),
}

/// 延遲回呼
///
/// 以具體的值代替閉包，讓事件可以比較與序列化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Deferred {
    /// 交給腳本引擎執行的程式碼
    Script(String),
    /// 連線嘗試結束
    ConnectFinished {
        address: String,
        error: Option<String>,
    },
    /// 連線嘗試被之後的連線或斷線請求取代
    ConnectCancelled { address: String },
}

/// 系統層級操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemRequest {
    /// 連線到 `host:port`
    Connect(String),
    /// 中斷目前連線
    Disconnect,
    /// 重新載入所有腳本
    Reload,
    /// 載入腳本檔案
    LoadScript(PathBuf),
    /// 結束程式
    Quit,
}
