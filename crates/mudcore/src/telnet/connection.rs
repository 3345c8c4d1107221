//! 單一 socket 連線
//!
//! 每條連線有一個讀取 task 與一個寫入 task。讀取 task 擁有解析器與分行器，
//! 寫入 task 擁有發送佇列。兩者都綁定建立時的世代編號 (generation)，
//! 發出任何事件前都會在管理器的鎖內確認自己仍是目前的連線。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::client::TelnetConfig;
use super::compat::CompatibilityTable;
use super::output::{OutputSplitter, PromptMode};
use super::parser::{TelnetEvent, TelnetParser};
use super::protocol::{subnegotiation_bytes, TelnetCommand, TelnetOption, TTYPE_IS, TTYPE_SEND};
use crate::debug_log::DebugLogger;
use crate::event::SessionEvent;

/// 管理器與所有 worker 共用的狀態
pub(crate) struct Shared {
    /// 目前的連線；唯一會被多個 task 修改的資料
    current: Mutex<Option<ConnectionHandle>>,
    /// 對 Orchestrator 的輸出 channel，管理器持有一份所以永不關閉
    pub(crate) events: mpsc::Sender<SessionEvent>,
}

impl Shared {
    pub(crate) fn new(events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            current: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<ConnectionHandle>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 管理器持有的連線把手
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    pub(crate) generation: u64,
    pub(crate) outgoing: mpsc::Sender<Vec<u8>>,
    /// 通知讀取 task：使用者剛送出輸入
    pub(crate) input_sent: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionHandle {
    /// 關閉連線；可重複呼叫
    pub(crate) fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// 建立連線並啟動讀寫 task
///
/// 呼叫端必須持有管理器的鎖，並在釋放前把回傳的把手設為目前連線，
/// 否則讀取 task 會把自己視為已被取代。
pub(crate) fn spawn(
    stream: TcpStream,
    generation: u64,
    config: &TelnetConfig,
    shared: Arc<Shared>,
) -> ConnectionHandle {
    let (reader, writer) = stream.into_split();
    let (outgoing_tx, outgoing_rx) = mpsc::channel(config.send_queue_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (failed_tx, failed_rx) = mpsc::channel(1);
    let input_sent = Arc::new(AtomicBool::new(false));

    let mut table = CompatibilityTable::new();
    for option in &config.local_options {
        table.support_local(option.as_byte());
    }
    for option in &config.remote_options {
        table.support_remote(option.as_byte());
    }

    let worker = ReadWorker {
        generation,
        reader,
        parser: TelnetParser::new(table),
        splitter: OutputSplitter::new(config.encoding),
        outgoing: outgoing_tx.clone(),
        shutdown: shutdown_rx.clone(),
        write_failed: failed_rx,
        input_sent: input_sent.clone(),
        shared,
        read_buffer_size: config.read_buffer_size.max(1),
        terminal_type: config.terminal_type.clone(),
    };

    tokio::spawn(worker.run());
    tokio::spawn(write_loop(
        generation,
        writer,
        outgoing_rx,
        shutdown_rx,
        failed_tx,
        config.write_timeout,
    ));

    ConnectionHandle {
        generation,
        outgoing: outgoing_tx,
        input_sent,
        shutdown: shutdown_tx,
    }
}

/// 讀取結果
enum ReadOutcome {
    /// 繼續讀取
    Continue,
    /// 連線已被取代或關閉，安靜結束
    Stop,
    /// 連線失敗，進入統一的拆除流程
    Failed(String),
}

struct ReadWorker {
    generation: u64,
    reader: OwnedReadHalf,
    parser: TelnetParser,
    splitter: OutputSplitter,
    outgoing: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Receiver<bool>,
    write_failed: mpsc::Receiver<io::Error>,
    input_sent: Arc<AtomicBool>,
    shared: Arc<Shared>,
    read_buffer_size: usize,
    terminal_type: String,
}

impl ReadWorker {
    async fn run(mut self) {
        let mut buffer = BytesMut::with_capacity(self.read_buffer_size);

        loop {
            buffer.clear();
            let result = tokio::select! {
                r = self.reader.read_buf(&mut buffer) => r,
                _ = self.shutdown.changed() => {
                    debug!("連線 #{} 收到關閉信號", self.generation);
                    return;
                }
                Some(e) = self.write_failed.recv() => Err(e),
            };

            let outcome = match result {
                Ok(0) => ReadOutcome::Failed("連線已被伺服器關閉".to_string()),
                Ok(_) => self.process(&buffer).await,
                Err(e) => ReadOutcome::Failed(e.to_string()),
            };

            match outcome {
                ReadOutcome::Continue => {}
                ReadOutcome::Stop => return,
                ReadOutcome::Failed(reason) => {
                    self.teardown(&reason).await;
                    return;
                }
            }
        }
    }

    /// 處理一次讀到的位元組
    async fn process(&mut self, bytes: &[u8]) -> ReadOutcome {
        DebugLogger::log_bytes("READ_RAW", bytes);

        if self.input_sent.swap(false, Ordering::AcqRel) {
            self.splitter.input_sent();
        }

        for event in self.parser.receive(bytes) {
            match event {
                TelnetEvent::DataReceive(data) => {
                    for line in self.splitter.receive(&data) {
                        if let stop @ (ReadOutcome::Stop | ReadOutcome::Failed(_)) =
                            self.emit(SessionEvent::ServerLine(line)).await
                        {
                            return stop;
                        }
                    }
                }
                TelnetEvent::DataSend(reply) => {
                    if !self.queue(reply).await {
                        return ReadOutcome::Stop;
                    }
                }
                TelnetEvent::SimpleCommand(command) => {
                    let is_marker = TelnetCommand::from_byte(command)
                        .is_some_and(TelnetCommand::is_prompt_marker);
                    if is_marker {
                        if let stop @ (ReadOutcome::Stop | ReadOutcome::Failed(_)) =
                            self.flush_prompt().await
                        {
                            return stop;
                        }
                    }
                }
                TelnetEvent::Negotiation { command, option } => self.negotiated(command, option),
                TelnetEvent::Subnegotiation { option, payload } => {
                    if !self.subnegotiation(option, &payload).await {
                        return ReadOutcome::Stop;
                    }
                }
                TelnetEvent::DecompressSignal(rest) => {
                    return ReadOutcome::Failed(format!(
                        "伺服器啟用了壓縮串流（{} 位元組），用戶端不支援解壓縮",
                        rest.len()
                    ));
                }
            }
        }

        // 無結束標記時，每次有新的剩餘內容就送出提示字元
        if self.splitter.mode() == PromptMode::Unterminated && self.splitter.has_new_data() {
            let prompt = self.splitter.prompt(false);
            if !prompt.is_empty() {
                return self.emit(SessionEvent::ServerPrompt(prompt)).await;
            }
        }

        ReadOutcome::Continue
    }

    /// 收到 GA / EOR：取出提示字元
    async fn flush_prompt(&mut self) -> ReadOutcome {
        let fresh = self.splitter.has_new_data();
        let prompt = self.splitter.prompt(true);
        if !prompt.is_empty() && (self.splitter.mode() == PromptMode::TerminatedPrompt || fresh) {
            return self.emit(SessionEvent::ServerPrompt(prompt)).await;
        }
        ReadOutcome::Continue
    }

    fn negotiated(&mut self, command: TelnetCommand, option: u8) {
        let option = TelnetOption::from_byte(option);
        info!("連線 #{} 協商完成: {:?} {:?}", self.generation, command, option);
        if option == TelnetOption::EndOfRecord {
            let mode = match command {
                TelnetCommand::Will => PromptMode::TerminatedPrompt,
                _ => PromptMode::Unterminated,
            };
            self.splitter.set_mode(mode);
        }
    }

    async fn subnegotiation(&mut self, option: u8, payload: &[u8]) -> bool {
        match TelnetOption::from_byte(option) {
            TelnetOption::TerminalType if payload == [TTYPE_SEND] => {
                let mut reply = vec![TTYPE_IS];
                reply.extend_from_slice(self.terminal_type.as_bytes());
                self.queue(subnegotiation_bytes(option, &reply)).await
            }
            other => {
                debug!("忽略子協商 {:?} ({} 位元組)", other, payload.len());
                true
            }
        }
    }

    /// 把協商回應放進發送佇列
    ///
    /// 相容表已經記下新狀態，回應不能遺失：佇列滿時等待空位。
    /// 回傳 false 表示等待期間收到關閉信號。
    async fn queue(&mut self, bytes: Vec<u8>) -> bool {
        tokio::select! {
            sent = self.outgoing.send(bytes) => {
                // 寫入 task 已結束，失敗原因會從 write_failed 傳來
                if sent.is_err() {
                    warn!("連線 #{} 的寫入 task 已結束，協商回應未送出", self.generation);
                }
                true
            }
            _ = self.shutdown.changed() => false,
        }
    }

    /// 送出事件給 Orchestrator
    ///
    /// 以阻塞方式等待 channel 空位，讓慢速的消費端拖慢 socket 讀取。
    /// 連線已被取代時回傳 `Stop`；接收端已關閉時回傳 `Failed`，由拆除流程清除目前連線。
    async fn emit(&mut self, event: SessionEvent) -> ReadOutcome {
        let permit = tokio::select! {
            permit = self.shared.events.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return ReadOutcome::Failed("事件 channel 已關閉".to_string()),
            },
            _ = self.shutdown.changed() => return ReadOutcome::Stop,
        };

        let current = self.shared.lock();
        if current.as_ref().map(|c| c.generation) != Some(self.generation) {
            return ReadOutcome::Stop;
        }
        DebugLogger::log_event("EVENT", &event);
        permit.send(event);
        ReadOutcome::Continue
    }

    /// 讀取失敗的統一拆除流程
    ///
    /// 只有仍是目前連線時才清除指標並送出 Disconnected；已被取代的連線安靜結束
    async fn teardown(mut self, reason: &str) {
        let permit = tokio::select! {
            permit = self.shared.events.reserve() => permit.ok(),
            _ = self.shutdown.changed() => None,
        };

        let mut current = self.shared.lock();
        if current.as_ref().map(|c| c.generation) != Some(self.generation) {
            debug!("連線 #{} 已被取代，略過中斷通知: {}", self.generation, reason);
            return;
        }

        if let Some(handle) = current.take() {
            handle.shutdown();
        }
        warn!("連線 #{} 中斷: {}", self.generation, reason);
        if let Some(permit) = permit {
            DebugLogger::log_event("EVENT", &SessionEvent::Disconnected);
            permit.send(SessionEvent::Disconnected);
        }
    }
}

/// 寫入 task：依序寫出佇列內容，每次寫入有期限
///
/// 寫入失敗時通知讀取 task，由讀取 task 執行拆除流程
async fn write_loop(
    generation: u64,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    failed: mpsc::Sender<io::Error>,
    write_timeout: Duration,
) {
    loop {
        let data = tokio::select! {
            data = outgoing.recv() => match data {
                Some(data) => data,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        DebugLogger::log_bytes("WRITE_RAW", &data);
        let result = match timeout(write_timeout, write_all(&mut writer, &data)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "寫入逾時")),
        };

        if let Err(e) = result {
            error!("連線 #{} 寫入失敗: {}", generation, e);
            let _ = failed.try_send(e);
            break;
        }
    }
    debug!("連線 #{} 寫入 task 結束", generation);
}

async fn write_all(writer: &mut OwnedWriteHalf, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const QUIET: Duration = Duration::from_millis(200);

    /// 回傳 (用戶端, 伺服器端) 兩個已連線的 socket
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn current_generation(shared: &Shared) -> Option<u64> {
        shared.lock().as_ref().map(|c| c.generation)
    }

    #[tokio::test]
    async fn test_superseded_worker_teardown_leaves_current_alone() {
        let (tx, mut rx) = mpsc::channel(16);
        let shared = Arc::new(Shared::new(tx));
        let config = TelnetConfig::default();

        let (old_client, old_server) = socket_pair().await;
        let (new_client, _new_server) = socket_pair().await;

        // 第 1 代從未被設為目前連線，等同已被第 2 代取代；保留把手讓關閉信號不觸發
        let stale = spawn(old_client, 1, &config, shared.clone());
        {
            let mut current = shared.lock();
            *current = Some(spawn(new_client, 2, &config, shared.clone()));
        }

        // 舊連線讀到 EOF，走到拆除流程
        drop(old_server);
        assert!(timeout(QUIET, rx.recv()).await.is_err(), "不應有 Disconnected");
        assert_eq!(current_generation(&shared), Some(2));
        drop(stale);
    }

    #[tokio::test]
    async fn test_current_worker_teardown_clears_slot() {
        let (tx, mut rx) = mpsc::channel(16);
        let shared = Arc::new(Shared::new(tx));
        let config = TelnetConfig::default();

        let (client, server) = socket_pair().await;
        {
            let mut current = shared.lock();
            *current = Some(spawn(client, 7, &config, shared.clone()));
        }

        drop(server);
        let event = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(event, Some(SessionEvent::Disconnected));
        assert_eq!(current_generation(&shared), None);
    }
}
