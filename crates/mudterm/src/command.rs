//! 前端指令
//!
//! `/` 開頭的指令轉為系統操作，其他輸入原樣交給腳本引擎。`//` 可送出以 `/` 開頭的文字。

use std::path::PathBuf;

use mudcore::SystemRequest;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Input(String),
    System(SystemRequest),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("用法: /{0} {1}")]
    MissingArgument(&'static str, &'static str),
}

/// 解析一行輸入
pub fn parse(line: &str) -> Result<Command, CommandError> {
    if let Some(rest) = line.strip_prefix("//") {
        return Ok(Command::Input(format!("/{}", rest)));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Input(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    let request = match name {
        "connect" if arg.is_empty() => {
            return Err(CommandError::MissingArgument("connect", "<host:port>"))
        }
        "connect" => SystemRequest::Connect(arg.to_string()),
        "disconnect" => SystemRequest::Disconnect,
        "reload" => SystemRequest::Reload,
        "load" if arg.is_empty() => return Err(CommandError::MissingArgument("load", "<path>")),
        "load" => SystemRequest::LoadScript(PathBuf::from(arg)),
        "quit" => SystemRequest::Quit,
        _ => return Ok(Command::Input(line.to_string())),
    };
    Ok(Command::System(request))
}
