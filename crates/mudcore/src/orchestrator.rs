//! 事件協調器
//!
//! 唯一持有腳本引擎的 task。網路、UI、計時器與延遲回呼四個來源的事件在這裡合流，
//! 一次處理一個；腳本產生的效果（送出命令、顯示、計時器、系統操作）也都在這裡套用。

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::{Deferred, SessionEvent, SystemRequest};
use crate::queue::BackpressureQueue;
use crate::script::{MudContext, ScriptError, ScriptHost};
use crate::telnet::{TelnetClient, TelnetConfig, TelnetError};
use crate::timer::{TimerEvent, TimerId, TimerService};

/// 送給 UI 的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// 伺服器輸出（經腳本處理後）
    Print(String),
    /// 腳本的本地訊息
    Echo(String),
    /// 更新提示字元
    SetPrompt(String),
    /// 狀態訊息（連線狀態等）
    Status(String),
    /// 錯誤訊息
    Error(String),
}

/// 前端持有的把手：送出輸入、接收 UI 事件
#[derive(Clone)]
pub struct SessionHandle {
    input: mpsc::UnboundedSender<SessionEvent>,
    ui: BackpressureQueue<UiEvent>,
}

impl SessionHandle {
    /// 送出使用者輸入；Orchestrator 已結束時回傳 false
    pub fn input(&self, text: impl Into<String>) -> bool {
        self.input.send(SessionEvent::UserInput(text.into())).is_ok()
    }

    /// 送出系統操作請求
    pub fn request(&self, request: SystemRequest) -> bool {
        self.input.send(SessionEvent::System(request)).is_ok()
    }

    /// 等待下一個 UI 事件；Orchestrator 結束且清空後回傳 None
    pub async fn next_ui(&self) -> Option<UiEvent> {
        self.ui.recv().await
    }

    pub fn try_next_ui(&self) -> Option<UiEvent> {
        self.ui.try_recv()
    }

    /// 因 UI 來不及消化而被丟棄的事件數
    pub fn dropped(&self) -> u64 {
        self.ui.evicted()
    }
}

/// 事件協調器
pub struct Orchestrator<H: ScriptHost> {
    host: H,
    client: TelnetClient,
    connect_timeout: Duration,

    net_rx: mpsc::Receiver<SessionEvent>,
    input_rx: mpsc::UnboundedReceiver<SessionEvent>,
    timers: TimerService,
    timer_rx: mpsc::UnboundedReceiver<TimerEvent>,
    /// 計時器觸發時要執行的回呼
    callbacks: HashMap<TimerId, Deferred>,
    /// 腳本計時器代號對應的 TimerId
    timer_keys: HashMap<u64, TimerId>,
    deferred_tx: mpsc::UnboundedSender<SessionEvent>,
    deferred_rx: mpsc::UnboundedReceiver<SessionEvent>,

    ui: BackpressureQueue<UiEvent>,
}

impl<H: ScriptHost> Orchestrator<H> {
    /// 建立協調器與前端把手
    ///
    /// `ui_limit` 是 UI 佇列的上限，超過時丟棄最舊的事件
    pub fn new(host: H, config: TelnetConfig, ui_limit: usize) -> (Self, SessionHandle) {
        let connect_timeout = config.connect_timeout;
        let (client, net_rx) = TelnetClient::new(config);
        let (timers, timer_rx) = TimerService::new();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (deferred_tx, deferred_rx) = mpsc::unbounded_channel();
        let ui = BackpressureQueue::new(ui_limit);

        let orchestrator = Self {
            host,
            client,
            connect_timeout,
            net_rx,
            input_rx,
            timers,
            timer_rx,
            callbacks: HashMap::new(),
            timer_keys: HashMap::new(),
            deferred_tx,
            deferred_rx,
            ui: ui.clone(),
        };
        let handle = SessionHandle {
            input: input_tx,
            ui,
        };
        (orchestrator, handle)
    }

    /// 主迴圈；只有 Quit 會結束
    pub async fn run(mut self) {
        info!("Orchestrator 啟動");

        loop {
            let event = tokio::select! {
                Some(event) = self.net_rx.recv() => event,
                Some(event) = self.input_rx.recv() => event,
                Some(TimerEvent { id }) = self.timer_rx.recv() => {
                    match self.timer_callback(id) {
                        Some(deferred) => SessionEvent::Deferred(deferred),
                        None => continue,
                    }
                }
                Some(event) = self.deferred_rx.recv() => event,
                else => break,
            };

            if !self.handle(event) {
                break;
            }
        }

        self.client.disconnect();
        self.clear_timers();
        self.ui.close();
        info!("Orchestrator 結束");
    }

    /// 處理一個事件，回傳是否繼續執行
    pub fn handle(&mut self, event: SessionEvent) -> bool {
        debug!("處理事件: {:?}", event);
        match event {
            SessionEvent::UserInput(text) => {
                self.with_host(|host, ctx| host.on_input(&text, ctx));
            }
            SessionEvent::ServerLine(line) => {
                match self.with_host(|host, ctx| host.on_output(&line, ctx)) {
                    Some((text, true)) => self.show(UiEvent::Print(text)),
                    Some((_, false)) => {}
                    // 腳本失敗時仍顯示原文
                    None => self.show(UiEvent::Print(line)),
                }
            }
            SessionEvent::ServerPrompt(prompt) => {
                let text = self
                    .with_host(|host, ctx| host.on_prompt(&prompt, ctx))
                    .unwrap_or(prompt);
                self.show(UiEvent::SetPrompt(text));
            }
            SessionEvent::Disconnected => {
                self.show(UiEvent::Status("連線已中斷".to_string()));
                self.hook("disconnected", Vec::new());
            }
            SessionEvent::Deferred(deferred) => self.deferred(deferred),
            SessionEvent::System(request) => return self.system(request),
        }
        true
    }

    fn deferred(&mut self, deferred: Deferred) {
        match deferred {
            Deferred::Script(code) => {
                self.with_host(|host, ctx| host.execute_deferred(&code, ctx));
            }
            Deferred::ConnectFinished { address, error: None } => {
                self.show(UiEvent::Status(format!("已連線到 {}", address)));
                self.hook("connected", vec![address]);
            }
            Deferred::ConnectFinished {
                address,
                error: Some(reason),
            } => {
                self.show(UiEvent::Error(format!("無法連線到 {}: {}", address, reason)));
                self.hook("error", vec![reason]);
            }
            Deferred::ConnectCancelled { address } => {
                self.show(UiEvent::Status(format!("已取消連線到 {}", address)));
            }
        }
    }

    fn system(&mut self, request: SystemRequest) -> bool {
        match request {
            SystemRequest::Connect(address) => {
                self.show(UiEvent::Status(format!("正在連線到 {}...", address)));
                self.hook("connecting", vec![address.clone()]);
                self.spawn_connect(address);
            }
            SystemRequest::Disconnect => {
                if self.client.disconnect() {
                    self.show(UiEvent::Status("已斷開連線".to_string()));
                    self.hook("disconnected", Vec::new());
                } else {
                    self.show(UiEvent::Status("目前沒有連線".to_string()));
                }
            }
            SystemRequest::Reload => {
                self.clear_timers();
                if self.with_host(|host, ctx| host.reload(ctx)).is_some() {
                    self.show(UiEvent::Status("腳本已重新載入".to_string()));
                }
            }
            SystemRequest::LoadScript(path) => {
                if self.with_host(|host, ctx| host.load_script(&path, ctx)).is_some() {
                    self.show(UiEvent::Status(format!("已載入腳本: {}", path.display())));
                }
            }
            SystemRequest::Quit => {
                info!("收到結束請求");
                return false;
            }
        }
        true
    }

    /// 在背景連線，結果以 `Deferred` 回到主迴圈
    ///
    /// 連線嘗試在這裡就登記，之後處理的 Disconnect 或 Connect 都會取代它
    fn spawn_connect(&self, address: String) {
        let connecting = self.client.connect(&address, self.connect_timeout);
        let tx = self.deferred_tx.clone();
        tokio::spawn(async move {
            let deferred = match connecting.await {
                Ok(_) => Deferred::ConnectFinished { address, error: None },
                Err(TelnetError::Superseded) => {
                    debug!("連線到 {} 的嘗試已被取代", address);
                    Deferred::ConnectCancelled { address }
                }
                Err(e) => {
                    warn!("連線到 {} 失敗: {}", address, e);
                    Deferred::ConnectFinished {
                        address,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = tx.send(SessionEvent::Deferred(deferred));
        });
    }

    /// 取出計時器回呼；單次計時器觸發後移除
    fn timer_callback(&mut self, id: TimerId) -> Option<Deferred> {
        if self.timers.contains(id) {
            self.callbacks.get(&id).cloned()
        } else {
            self.timer_keys.retain(|_, timer| *timer != id);
            self.callbacks.remove(&id)
        }
    }

    fn cancel_timer(&mut self, key: u64) {
        match self.timer_keys.remove(&key) {
            Some(id) => {
                self.timers.cancel(id);
                self.callbacks.remove(&id);
                debug!("取消計時器 {:?}", id);
            }
            None => debug!("計時器代號 {} 不存在或已結束", key),
        }
    }

    fn clear_timers(&mut self) {
        self.timers.cancel_all();
        self.callbacks.clear();
        self.timer_keys.clear();
    }

    fn hook(&mut self, name: &str, args: Vec<String>) {
        self.with_host(|host, ctx| host.call_hook(name, &args, ctx));
    }

    /// 呼叫腳本引擎並套用其效果；失敗時交給 error hook
    fn with_host<R>(
        &mut self,
        call: impl FnOnce(&mut H, &mut MudContext) -> Result<R, ScriptError>,
    ) -> Option<R> {
        let mut ctx = MudContext::new();
        let result = call(&mut self.host, &mut ctx);
        self.apply(ctx);
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    fn report(&mut self, err: ScriptError) {
        error!("腳本錯誤: {}", err);
        let message = err.to_string();
        let mut ctx = MudContext::new();
        let result = self
            .host
            .call_hook("error", std::slice::from_ref(&message), &mut ctx);
        self.apply(ctx);
        if let Err(hook_err) = result {
            self.show(UiEvent::Error(format!(
                "{}（error hook 也失敗: {}）",
                message, hook_err
            )));
        } else {
            self.show(UiEvent::Error(message));
        }
    }

    /// 套用腳本效果
    fn apply(&mut self, ctx: MudContext) {
        if ctx.is_empty() {
            return;
        }

        for cmd in ctx.commands {
            if let Err(e) = self.client.send(&cmd) {
                let message = match e {
                    TelnetError::NotConnected => format!("尚未連線，無法送出: {}", cmd),
                    other => format!("無法送出 {}: {}", cmd, other),
                };
                self.show(UiEvent::Error(message));
            }
        }

        for text in ctx.echos {
            self.show(UiEvent::Echo(text));
        }

        for msg in ctx.log_messages {
            info!("[Script] {}", msg);
        }

        if ctx.cancel_timers {
            self.clear_timers();
        }
        for key in ctx.cancelled_timers {
            self.cancel_timer(key);
        }
        for timer in ctx.timers {
            let id = if timer.repeat {
                self.timers.every(timer.delay)
            } else {
                self.timers.after(timer.delay)
            };
            debug!("建立計時器 {:?}: {:?}", id, timer.delay);
            self.callbacks.insert(id, Deferred::Script(timer.code));
            self.timer_keys.insert(timer.key, id);
        }

        // 系統操作排到下一輪處理，不在腳本呼叫中遞迴
        for request in ctx.requests {
            let _ = self.deferred_tx.send(SessionEvent::System(request));
        }
    }

    fn show(&self, event: UiEvent) {
        self.ui.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::TimerRequest;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    /// 記錄所有呼叫的假腳本引擎
    #[derive(Clone, Default)]
    struct FakeHost {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeHost {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ScriptHost for FakeHost {
        fn on_output(
            &mut self,
            line: &str,
            _ctx: &mut MudContext,
        ) -> Result<(String, bool), ScriptError> {
            match line {
                "fail" => Err(ScriptError::Lua("boom".to_string())),
                l if l.starts_with("gag") => Ok((String::new(), false)),
                l => Ok((l.to_uppercase(), true)),
            }
        }

        fn on_prompt(&mut self, line: &str, _ctx: &mut MudContext) -> Result<String, ScriptError> {
            Ok(format!("<{}>", line))
        }

        fn on_input(&mut self, text: &str, ctx: &mut MudContext) -> Result<(), ScriptError> {
            self.record(format!("input:{}", text));
            let timer = |key, millis, repeat, code: &str| TimerRequest {
                key,
                delay: Duration::from_millis(millis),
                repeat,
                code: code.to_string(),
            };
            match text {
                "every" => ctx.timers.push(timer(1, 10, true, "tick")),
                "after" => ctx.timers.push(timer(2, 10, false, "tick")),
                "later" => ctx.timers.push(timer(3, 50, false, "later")),
                "cancel" => ctx.cancelled_timers.push(1),
                "stop" => ctx.cancel_timers = true,
                "bye" => ctx.requests.push(SystemRequest::Quit),
                other => ctx.commands.push(other.to_string()),
            }
            Ok(())
        }

        fn call_hook(
            &mut self,
            name: &str,
            args: &[String],
            _ctx: &mut MudContext,
        ) -> Result<(), ScriptError> {
            self.record(format!("hook:{}:{}", name, args.join(",")));
            Ok(())
        }

        fn execute_deferred(&mut self, code: &str, ctx: &mut MudContext) -> Result<(), ScriptError> {
            ctx.echos.push(format!("ran {}", code));
            Ok(())
        }

        fn reload(&mut self, _ctx: &mut MudContext) -> Result<(), ScriptError> {
            self.record("reload".to_string());
            Ok(())
        }

        fn load_script(&mut self, path: &Path, _ctx: &mut MudContext) -> Result<(), ScriptError> {
            self.record(format!("load:{}", path.display()));
            Ok(())
        }
    }

    fn start(host: FakeHost) -> (SessionHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Orchestrator::new(host, TelnetConfig::default(), 64);
        (handle, tokio::spawn(orchestrator.run()))
    }

    async fn next_ui(handle: &SessionHandle) -> UiEvent {
        timeout(Duration::from_secs(5), handle.next_ui())
            .await
            .expect("等待 UI 事件逾時")
            .expect("UI 佇列已關閉")
    }

    async fn wait_for_status(handle: &SessionHandle, needle: &str) {
        loop {
            if let UiEvent::Status(s) = next_ui(handle).await {
                if s.contains(needle) {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connect_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let host = FakeHost::default();
        let (handle, task) = start(host.clone());

        handle.request(SystemRequest::Connect(address.clone()));
        let (server, _) = listener.accept().await.unwrap();
        wait_for_status(&handle, "已連線").await;

        let (read, mut write) = server.into_split();
        write.write_all(b"hello\r\ngag me\r\nHP:10> ").await.unwrap();
        assert_eq!(next_ui(&handle).await, UiEvent::Print("HELLO".to_string()));
        assert_eq!(
            next_ui(&handle).await,
            UiEvent::SetPrompt("<HP:10> >".to_string())
        );

        handle.input("look");
        let mut lines = BufReader::new(read).lines();
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line.as_deref(), Some("look"));

        handle.request(SystemRequest::Quit);
        task.await.unwrap();
        assert_eq!(
            host.calls()[..3],
            [
                format!("hook:connecting:{}", address),
                format!("hook:connected:{}", address),
                "input:look".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_server_close_calls_disconnected_hook() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let host = FakeHost::default();
        let (handle, task) = start(host.clone());

        handle.request(SystemRequest::Connect(address));
        let (server, _) = listener.accept().await.unwrap();
        wait_for_status(&handle, "已連線").await;
        drop(server);

        wait_for_status(&handle, "連線已中斷").await;
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
        assert!(host.calls().contains(&"hook:disconnected:".to_string()));
    }

    #[tokio::test]
    async fn test_connect_failure_calls_error_hook() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let host = FakeHost::default();
        let (handle, task) = start(host.clone());
        handle.request(SystemRequest::Connect(address.clone()));

        loop {
            if let UiEvent::Error(message) = next_ui(&handle).await {
                assert!(message.contains(&address));
                break;
            }
        }
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
        assert!(host.calls().iter().any(|c| c.starts_with("hook:error:")));
    }

    #[tokio::test]
    async fn test_send_without_connection_shows_error() {
        let (handle, task) = start(FakeHost::default());
        handle.input("look");
        match next_ui(&handle).await {
            UiEvent::Error(message) => assert!(message.contains("look")),
            other => panic!("unexpected {:?}", other),
        }
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_timer_runs_deferred_once() {
        let (handle, task) = start(FakeHost::default());
        handle.input("after");
        assert_eq!(next_ui(&handle).await, UiEvent::Echo("ran tick".to_string()));

        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.try_next_ui(), None);
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_timer_until_cancelled() {
        let (handle, task) = start(FakeHost::default());
        handle.input("every");
        for _ in 0..3 {
            assert_eq!(next_ui(&handle).await, UiEvent::Echo("ran tick".to_string()));
        }

        handle.input("stop");
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.try_next_ui(), None);
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_single_timer() {
        let (handle, task) = start(FakeHost::default());
        handle.input("every");
        handle.input("later");
        assert_eq!(next_ui(&handle).await, UiEvent::Echo("ran tick".to_string()));

        // 只取消重複的計時器，另一個照常觸發
        handle.input("cancel");
        assert_eq!(next_ui(&handle).await, UiEvent::Echo("ran later".to_string()));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.try_next_ui(), None);

        // 已結束的代號再取消不影響任何事
        handle.input("cancel");
        sleep(Duration::from_millis(100)).await;
        assert_eq!(handle.try_next_ui(), None);
        handle.request(SystemRequest::Quit);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let host = FakeHost::default();
        let (handle, task) = start(host.clone());

        handle.request(SystemRequest::Connect(address.clone()));
        handle.request(SystemRequest::Disconnect);
        wait_for_status(&handle, "已取消連線到").await;

        // 撥號已完成的 socket 被丟棄，伺服器端讀到 EOF
        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), server.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        handle.request(SystemRequest::Quit);
        task.await.unwrap();
        let calls = host.calls();
        assert_eq!(calls, vec![format!("hook:connecting:{}", address)]);
    }

    #[tokio::test]
    async fn test_script_error_goes_to_error_hook() {
        let host = FakeHost::default();
        let (mut orchestrator, handle) = Orchestrator::new(host.clone(), TelnetConfig::default(), 8);

        assert!(orchestrator.handle(SessionEvent::ServerLine("fail".to_string())));
        assert!(orchestrator.handle(SessionEvent::ServerLine("gag this".to_string())));

        assert_eq!(handle.try_next_ui(), Some(UiEvent::Error("Lua 錯誤: boom".to_string())));
        assert_eq!(handle.try_next_ui(), Some(UiEvent::Print("fail".to_string())));
        assert_eq!(handle.try_next_ui(), None);
        assert_eq!(host.calls(), vec!["hook:error:Lua 錯誤: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_system_requests_from_script_are_queued() {
        let host = FakeHost::default();
        let (orchestrator, handle) = Orchestrator::new(host.clone(), TelnetConfig::default(), 8);
        let task = tokio::spawn(orchestrator.run());

        handle.request(SystemRequest::LoadScript("init.lua".into()));
        handle.request(SystemRequest::Reload);
        handle.input("bye");
        task.await.unwrap();

        assert_eq!(
            host.calls(),
            vec![
                "load:init.lua".to_string(),
                "reload".to_string(),
                "input:bye".to_string()
            ]
        );
        // 結束後 UI 佇列關閉
        while handle.next_ui().await.is_some() {}
        assert!(!handle.input("late"));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let host = FakeHost::default();
        let (mut orchestrator, handle) = Orchestrator::new(host.clone(), TelnetConfig::default(), 8);
        assert!(orchestrator.handle(SessionEvent::System(SystemRequest::Disconnect)));
        assert_eq!(
            handle.try_next_ui(),
            Some(UiEvent::Status("目前沒有連線".to_string()))
        );
        assert!(!orchestrator.handle(SessionEvent::System(SystemRequest::Quit)));
        assert!(host.calls().is_empty());
    }
}
