//! Telnet 連線管理器
//!
//! 同一時間最多一條連線。連線輸出全部送到一個在程式生命週期內都不會關閉的 channel。

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::connection::{self, Shared};
use super::protocol::{encode_line, TelnetOption};
use crate::encoding::TextEncoding;
use crate::event::SessionEvent;

/// Telnet 客戶端錯誤
#[derive(Debug, Error)]
pub enum TelnetError {
    #[error("連線失敗: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("連線逾時")]
    Timeout,

    #[error("未連線")]
    NotConnected,

    #[error("發送佇列已滿")]
    QueueFull,

    #[error("DNS 解析失敗: {0}")]
    DnsResolutionFailed(String),

    #[error("連線嘗試已被之後的連線或斷線請求取代")]
    Superseded,
}

/// Telnet 客戶端配置
#[derive(Debug, Clone)]
pub struct TelnetConfig {
    /// 連線逾時
    pub connect_timeout: Duration,
    /// 單次寫入期限
    pub write_timeout: Duration,
    /// 讀取緩衝區大小
    pub read_buffer_size: usize,
    /// 發送佇列容量
    pub send_queue_capacity: usize,
    /// 輸出事件 channel 容量（刻意保持很小，讓慢速消費端拖慢讀取）
    pub event_capacity: usize,
    /// 伺服器文字編碼
    pub encoding: TextEncoding,
    /// 回應 TTYPE 時使用的終端名稱
    pub terminal_type: String,
    /// 本地願意啟用的選項（回應 DO）
    pub local_options: Vec<TelnetOption>,
    /// 允許伺服器啟用的選項（回應 WILL）
    pub remote_options: Vec<TelnetOption>,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            read_buffer_size: 8192,
            send_queue_capacity: 64,
            event_capacity: 16,
            encoding: TextEncoding::Utf8,
            terminal_type: "mudclient".to_string(),
            local_options: vec![TelnetOption::TerminalType],
            remote_options: vec![
                TelnetOption::Echo,
                TelnetOption::SuppressGoAhead,
                TelnetOption::EndOfRecord,
            ],
        }
    }
}

/// Telnet 客戶端（連線管理器）
///
/// 可以複製；所有副本共用同一條目前連線
#[derive(Clone)]
pub struct TelnetClient {
    config: Arc<TelnetConfig>,
    shared: Arc<Shared>,
    generations: Arc<AtomicU64>,
}

impl TelnetClient {
    /// 創建客戶端，同時回傳輸出事件的接收端
    pub fn new(config: TelnetConfig) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(config.event_capacity.max(1));
        let client = Self {
            config: Arc::new(config),
            shared: Arc::new(Shared::new(tx)),
            generations: Arc::new(AtomicU64::new(0)),
        };
        (client, rx)
    }

    /// 是否有連線
    pub fn is_connected(&self) -> bool {
        self.shared.lock().is_some()
    }

    /// 目前連線的世代編號
    pub fn generation(&self) -> Option<u64> {
        self.shared.lock().as_ref().map(|c| c.generation)
    }

    /// 連線到 MUD 伺服器
    ///
    /// 呼叫當下就關閉現有連線並登記這次嘗試；回傳的 future 於期限內完成 DNS 解析與連線。
    /// 之後的 `connect` 或 `disconnect` 會取代這次嘗試，此時回傳 `Superseded` 且不會安裝連線。
    ///
    /// # Arguments
    /// * `address` - `host:port`
    /// * `connect_timeout` - 解析加連線的總期限
    pub fn connect(
        &self,
        address: &str,
        connect_timeout: Duration,
    ) -> impl Future<Output = Result<SocketAddr, TelnetError>> + Send + 'static {
        let attempt = self.begin_attempt();
        let client = self.clone();
        let address = address.to_string();
        async move { client.finish_connect(attempt, &address, connect_timeout).await }
    }

    /// 關閉現有連線並取得新的世代編號
    fn begin_attempt(&self) -> u64 {
        let mut current = self.shared.lock();
        if let Some(previous) = current.take() {
            previous.shutdown();
            debug!("重新連線前已關閉連線 #{}", previous.generation);
        }
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn finish_connect(
        &self,
        attempt: u64,
        address: &str,
        connect_timeout: Duration,
    ) -> Result<SocketAddr, TelnetError> {
        info!("正在連線到 {} (嘗試 #{})", address, attempt);

        let dialed = timeout(connect_timeout, dial(address))
            .await
            .map_err(|_| TelnetError::Timeout)
            .and_then(|result| result);
        // 已被取代的嘗試不回報撥號錯誤
        if self.generations.load(Ordering::Relaxed) != attempt {
            return Err(TelnetError::Superseded);
        }
        let (stream, peer) = dialed?;

        // 設定 TCP 選項
        stream.set_nodelay(true)?;

        let mut current = self.shared.lock();
        if self.generations.load(Ordering::Relaxed) != attempt {
            info!("連線嘗試 #{} 已被取代，放棄 {}", attempt, peer);
            return Err(TelnetError::Superseded);
        }
        *current = Some(connection::spawn(
            stream,
            attempt,
            &self.config,
            self.shared.clone(),
        ));

        info!("已連線到 {} ({}), 連線 #{}", address, peer, attempt);
        Ok(peer)
    }

    /// 斷開連線，回傳原本是否有連線
    ///
    /// 同時取消進行中的連線嘗試。主動斷線不會產生 Disconnected 事件
    pub fn disconnect(&self) -> bool {
        let mut current = self.shared.lock();
        self.generations.fetch_add(1, Ordering::Relaxed);
        match current.take() {
            Some(handle) => {
                handle.shutdown();
                info!("已斷開連線 #{}", handle.generation);
                true
            }
            None => false,
        }
    }

    /// 發送一行文字到伺服器（依設定編碼，IAC 加倍並加上 CRLF）
    pub fn send(&self, text: &str) -> Result<(), TelnetError> {
        let data = encode_line(&self.config.encoding.encode(text));
        let current = self.shared.lock();
        let handle = current.as_ref().ok_or(TelnetError::NotConnected)?;
        try_enqueue(&handle.outgoing, data)?;
        handle.input_sent.store(true, Ordering::Release);
        debug!("已發送: {}", text);
        Ok(())
    }

    /// 發送原始位元組到伺服器
    pub fn send_raw(&self, data: Vec<u8>) -> Result<(), TelnetError> {
        let current = self.shared.lock();
        let handle = current.as_ref().ok_or(TelnetError::NotConnected)?;
        try_enqueue(&handle.outgoing, data)
    }
}

/// 放入發送佇列，不等待
fn try_enqueue(outgoing: &mpsc::Sender<Vec<u8>>, data: Vec<u8>) -> Result<(), TelnetError> {
    outgoing.try_send(data).map_err(|e| match e {
        TrySendError::Full(_) => TelnetError::QueueFull,
        TrySendError::Closed(_) => TelnetError::NotConnected,
    })
}

/// 解析主機名稱並依序嘗試每個位址
async fn dial(address: &str) -> Result<(TcpStream, SocketAddr), TelnetError> {
    let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(|e| TelnetError::DnsResolutionFailed(e.to_string()))?
        .collect();

    if socket_addrs.is_empty() {
        return Err(TelnetError::DnsResolutionFailed(format!(
            "無法解析主機: {}",
            address
        )));
    }
    debug!("已解析到位址: {:?}", socket_addrs);

    let mut last_error = None;
    for addr in socket_addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok((stream, addr)),
            Err(e) => {
                warn!("連線 {} 失敗: {}", addr, e);
                last_error = Some(e);
            }
        }
    }
    Err(last_error
        .map(TelnetError::ConnectionFailed)
        .unwrap_or(TelnetError::NotConnected))
}
