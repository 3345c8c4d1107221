//! MUD Core Library
//!
//! 提供 MUD 客戶端的核心功能：
//! - `telnet`: Telnet 協定解析、連線管理
//! - `encoding`: Big5/UTF-8 編解碼
//! - `timer`: 計時器服務
//! - `queue`: 有上限的背壓佇列
//! - `orchestrator`: 事件協調器，唯一持有腳本引擎的 task
//! - `script`: Lua 腳本支援
//! - `event`: 送進協調器的 Session 事件
//! - `debug_log`: 原始位元組追蹤記錄

pub mod debug_log;
pub mod encoding;
pub mod event;
pub mod orchestrator;
pub mod queue;
pub mod script;
pub mod telnet;
pub mod timer;

pub use debug_log::DebugLogger;
pub use encoding::{decode_big5, encode_big5, TextEncoding};
pub use event::{Deferred, SessionEvent, SystemRequest};
pub use orchestrator::{Orchestrator, SessionHandle, UiEvent};
pub use queue::BackpressureQueue;
pub use script::{LuaHost, MudContext, ScriptError, ScriptHost, TimerRequest};
pub use telnet::{TelnetClient, TelnetConfig, TelnetError};
pub use timer::{TimerEvent, TimerId, TimerService};
