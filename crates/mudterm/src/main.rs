//! MUD Client 終端機前端
//!
//! 標準輸入逐行讀取指令，MUD 輸出寫到標準輸出，日誌寫到標準錯誤

mod command;
mod config;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mudcore::{DebugLogger, LuaHost, Orchestrator, ScriptError, SessionHandle, SystemRequest, UiEvent};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use command::Command;
use config::{ClientConfig, ConfigError};

#[derive(Debug, Parser)]
#[command(name = "mudterm", version, about = "Line-mode MUD client")]
struct Args {
    /// 啟動後連線的位址 (host:port)
    address: Option<String>,

    /// 設定檔路徑
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 額外載入的腳本，可重複指定
    #[arg(short, long = "script")]
    scripts: Vec<PathBuf>,
}

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("無法初始化腳本引擎: {0}")]
    Script(#[from] ScriptError),

    #[error("無法開啟追蹤檔: {0}")]
    DebugLog(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    // 初始化日誌（寫到 stderr，stdout 留給 MUD 畫面）
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("mudterm: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let config_path = args.config.unwrap_or_else(ClientConfig::config_path);
    let config = ClientConfig::load_from(&config_path)?;

    if let Some(path) = &config.debug_log {
        DebugLogger::init(path)?;
        tracing::info!("追蹤記錄寫入 {:?}", path);
    }

    let host = LuaHost::new()?;
    let (orchestrator, handle) =
        Orchestrator::new(host, config.telnet_config(), config.ui_queue_limit);

    for script in config.scripts.iter().chain(args.scripts.iter()) {
        handle.request(SystemRequest::LoadScript(script.clone()));
    }
    if let Some(address) = args.address {
        handle.request(SystemRequest::Connect(address));
    }

    spawn_stdin_reader(handle.clone());
    let printer = tokio::spawn(print_loop(handle));

    // 腳本引擎不能跨執行緒，協調器在主 task 上執行
    orchestrator.run().await;

    let _ = printer.await;
    DebugLogger::shutdown();
    Ok(())
}

/// 標準輸入使用獨立執行緒，結束時不必等待阻塞中的讀取
fn spawn_stdin_reader(handle: SessionHandle) {
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let delivered = match command::parse(&line) {
                Ok(Command::Input(text)) => handle.input(text),
                Ok(Command::System(request)) => handle.request(request),
                Err(e) => {
                    eprintln!("{}", e);
                    true
                }
            };
            if !delivered {
                return;
            }
        }
        // EOF
        handle.request(SystemRequest::Quit);
    });
}

async fn print_loop(handle: SessionHandle) {
    let mut reported = 0;
    while let Some(event) = handle.next_ui().await {
        let dropped = handle.dropped();
        if dropped > reported {
            tracing::warn!("畫面來不及更新，已略過 {} 則訊息", dropped - reported);
            reported = dropped;
        }

        let _ = print_event(&event);
    }
}

fn print_event(event: &UiEvent) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    match event {
        // 提示字元不換行
        UiEvent::SetPrompt(prompt) => write!(stdout, "{}", prompt)?,
        other => writeln!(stdout, "{}", render(other))?,
    }
    stdout.flush()
}

fn render(event: &UiEvent) -> String {
    match event {
        UiEvent::Print(text) | UiEvent::Echo(text) | UiEvent::SetPrompt(text) => text.clone(),
        UiEvent::Status(text) => format!("# {}", text),
        UiEvent::Error(text) => format!("! {}", text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "mudterm",
            "mud.example.org:4000",
            "--script",
            "a.lua",
            "-s",
            "b.lua",
        ]);
        assert_eq!(args.address.as_deref(), Some("mud.example.org:4000"));
        assert_eq!(args.scripts, vec![PathBuf::from("a.lua"), PathBuf::from("b.lua")]);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&UiEvent::Status("已連線".to_string())), "# 已連線");
        assert_eq!(render(&UiEvent::Error("逾時".to_string())), "! 逾時");
        assert_eq!(render(&UiEvent::Print("hello".to_string())), "hello");
    }
}
