//! Lua 腳本支援模組
//!
//! `ScriptHost` 是 Orchestrator 與腳本引擎之間的介面，所有呼叫都是同步的，
//! 而且只會在 Orchestrator 的 task 中發生。腳本不直接操作連線或計時器，
//! 而是把要做的事寫進 `MudContext`，由 Orchestrator 在呼叫結束後套用。

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mlua::{Function, Lua, Variadic};
use thiserror::Error;
use tracing::{debug, info};

use crate::event::SystemRequest;

/// 腳本執行錯誤
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Lua 錯誤: {0}")]
    Lua(String),

    #[error("無法讀取腳本 {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<mlua::Error> for ScriptError {
    fn from(err: mlua::Error) -> Self {
        ScriptError::Lua(err.to_string())
    }
}

/// 腳本要求建立的計時器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    /// 腳本端的代號，`mud.cancel` 用它指定要取消的計時器
    pub key: u64,
    pub delay: Duration,
    pub repeat: bool,
    /// 觸發時交給 `execute_deferred` 的程式碼
    pub code: String,
}

/// MUD 腳本上下文（腳本執行後的結果）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MudContext {
    /// 待發送的命令隊列
    pub commands: Vec<String>,

    /// 本地顯示的訊息（mud.echo）
    pub echos: Vec<String>,

    /// 寫入日誌的訊息
    pub log_messages: Vec<String>,

    /// 新的計時器
    pub timers: Vec<TimerRequest>,

    /// 先取消所有既有的計時器
    pub cancel_timers: bool,

    /// 要取消的計時器代號
    pub cancelled_timers: Vec<u64>,

    /// 系統層級操作（連線、重新載入等）
    pub requests: Vec<SystemRequest>,
}

impl MudContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否沒有任何待套用的效果
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// 腳本引擎介面
pub trait ScriptHost {
    /// 處理伺服器的一行輸出，回傳 (修改後的文字, 是否顯示)
    fn on_output(&mut self, line: &str, ctx: &mut MudContext)
        -> Result<(String, bool), ScriptError>;

    /// 處理提示字元，回傳要顯示的內容
    fn on_prompt(&mut self, line: &str, ctx: &mut MudContext) -> Result<String, ScriptError>;

    /// 處理使用者輸入；要送到伺服器的命令放進 `ctx.commands`
    fn on_input(&mut self, text: &str, ctx: &mut MudContext) -> Result<(), ScriptError>;

    /// 呼叫具名 hook；不存在的 hook 直接略過
    fn call_hook(
        &mut self,
        name: &str,
        args: &[String],
        ctx: &mut MudContext,
    ) -> Result<(), ScriptError>;

    /// 執行延遲回呼（計時器觸發等）
    fn execute_deferred(&mut self, code: &str, ctx: &mut MudContext) -> Result<(), ScriptError>;

    /// 重新載入所有已載入的腳本
    fn reload(&mut self, ctx: &mut MudContext) -> Result<(), ScriptError>;

    /// 載入腳本檔案
    fn load_script(&mut self, path: &Path, ctx: &mut MudContext) -> Result<(), ScriptError>;
}

/// Lua 腳本引擎
///
/// 腳本可定義下列全域函數：
/// - `on_output(line)` 回傳 `line, keep`；回傳 nil 代表不修改
/// - `on_prompt(line)` 回傳要顯示的提示字元
/// - `on_input(text)` 自行決定要送出的命令；未定義時直接送出輸入
///
/// 以及 `hooks` 表中的具名函數（`connecting`、`connected`、`disconnected`、`error`...）。
/// 腳本透過 `mud` 表操作用戶端，`mud` 只在呼叫期間有效。
/// `mud.after` / `mud.every` 回傳計時器代號，可交給 `mud.cancel` 取消。
pub struct LuaHost {
    /// Lua 解釋器實例
    lua: Lua,
    /// 已載入的腳本路徑，依載入順序
    scripts: Vec<PathBuf>,
    /// 下一個計時器代號；重新載入後仍持續遞增
    next_timer_key: Cell<u64>,
}

impl LuaHost {
    /// 創建新的腳本引擎
    pub fn new() -> Result<Self, ScriptError> {
        Ok(Self {
            lua: fresh_state()?,
            scripts: Vec::new(),
            next_timer_key: Cell::new(1),
        })
    }

    /// 已載入的腳本
    pub fn scripts(&self) -> &[PathBuf] {
        &self.scripts
    }

    /// 執行一段程式碼
    pub fn exec(&mut self, code: &str, ctx: &mut MudContext) -> Result<(), ScriptError> {
        self.exec_named(code, "=chunk", ctx)
    }

    fn exec_named(
        &mut self,
        code: &str,
        name: &str,
        ctx: &mut MudContext,
    ) -> Result<(), ScriptError> {
        with_api(&self.lua, &self.next_timer_key, ctx, |lua| {
            lua.load(code).set_name(name).exec()
        })
    }

    fn global_function(&self, name: &str) -> Result<Option<Function>, ScriptError> {
        Ok(self.lua.globals().get::<Option<Function>>(name)?)
    }

    fn run_file(&mut self, path: &Path, ctx: &mut MudContext) -> Result<(), ScriptError> {
        let code = std::fs::read_to_string(path).map_err(|source| ScriptError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = format!("@{}", path.display());
        self.exec_named(&code, &name, ctx)
    }
}

impl ScriptHost for LuaHost {
    fn on_output(
        &mut self,
        line: &str,
        ctx: &mut MudContext,
    ) -> Result<(String, bool), ScriptError> {
        let Some(func) = self.global_function("on_output")? else {
            return Ok((line.to_string(), true));
        };
        let (text, keep) = with_api(&self.lua, &self.next_timer_key, ctx, |_| {
            func.call::<(Option<String>, Option<bool>)>(line)
        })?;
        Ok((text.unwrap_or_else(|| line.to_string()), keep.unwrap_or(true)))
    }

    fn on_prompt(&mut self, line: &str, ctx: &mut MudContext) -> Result<String, ScriptError> {
        let Some(func) = self.global_function("on_prompt")? else {
            return Ok(line.to_string());
        };
        let text = with_api(&self.lua, &self.next_timer_key, ctx, |_| {
            func.call::<Option<String>>(line)
        })?;
        Ok(text.unwrap_or_else(|| line.to_string()))
    }

    fn on_input(&mut self, text: &str, ctx: &mut MudContext) -> Result<(), ScriptError> {
        match self.global_function("on_input")? {
            Some(func) => {
                with_api(&self.lua, &self.next_timer_key, ctx, |_| func.call::<()>(text))
            }
            None => {
                ctx.commands.push(text.to_string());
                Ok(())
            }
        }
    }

    fn call_hook(
        &mut self,
        name: &str,
        args: &[String],
        ctx: &mut MudContext,
    ) -> Result<(), ScriptError> {
        let hooks: Option<mlua::Table> = self.lua.globals().get("hooks")?;
        let Some(func) = hooks.map(|h| h.get::<Option<Function>>(name)).transpose()?.flatten()
        else {
            return Ok(());
        };
        debug!("呼叫 hook: {}", name);
        let args: Variadic<String> = args.iter().cloned().collect();
        with_api(&self.lua, &self.next_timer_key, ctx, |_| func.call::<()>(args))
    }

    fn execute_deferred(&mut self, code: &str, ctx: &mut MudContext) -> Result<(), ScriptError> {
        self.exec_named(code, "=deferred", ctx)
    }

    fn reload(&mut self, ctx: &mut MudContext) -> Result<(), ScriptError> {
        self.lua = fresh_state()?;
        let scripts = self.scripts.clone();
        info!("重新載入 {} 個腳本", scripts.len());

        // 個別腳本失敗不影響其他腳本，回報第一個錯誤
        let mut first_error = None;
        for path in &scripts {
            if let Err(e) = self.run_file(path, ctx) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn load_script(&mut self, path: &Path, ctx: &mut MudContext) -> Result<(), ScriptError> {
        self.run_file(path, ctx)?;
        if !self.scripts.iter().any(|p| p == path) {
            self.scripts.push(path.to_path_buf());
        }
        info!("已載入腳本: {}", path.display());
        Ok(())
    }
}

fn fresh_state() -> Result<Lua, ScriptError> {
    let lua = Lua::new();
    lua.globals().set("hooks", lua.create_table()?)?;
    Ok(lua)
}

fn seconds(value: f64) -> mlua::Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(mlua::Error::external)
}

/// 在呼叫期間提供 `mud` API，所有效果寫入 `ctx`
fn with_api<R>(
    lua: &Lua,
    timer_keys: &Cell<u64>,
    ctx: &mut MudContext,
    body: impl FnOnce(&Lua) -> mlua::Result<R>,
) -> Result<R, ScriptError> {
    let ctx = RefCell::new(ctx);
    let schedule = |delay: f64, code: String, repeat: bool| -> mlua::Result<u64> {
        let delay = seconds(delay)?;
        let key = timer_keys.get();
        timer_keys.set(key + 1);
        ctx.borrow_mut().timers.push(TimerRequest {
            key,
            delay,
            repeat,
            code,
        });
        Ok(key)
    };

    let result = lua.scope(|scope| {
        let mud = lua.create_table()?;

        // mud.send(command)
        mud.set(
            "send",
            scope.create_function(|_, cmd: String| {
                ctx.borrow_mut().commands.push(cmd);
                Ok(())
            })?,
        )?;

        // mud.echo(text) 本地顯示
        mud.set(
            "echo",
            scope.create_function(|_, text: String| {
                ctx.borrow_mut().echos.push(text);
                Ok(())
            })?,
        )?;

        mud.set(
            "log",
            scope.create_function(|_, msg: String| {
                ctx.borrow_mut().log_messages.push(msg);
                Ok(())
            })?,
        )?;

        // mud.after(seconds, code) 延遲執行，回傳代號
        mud.set(
            "after",
            scope.create_function(|_, (delay, code): (f64, String)| schedule(delay, code, false))?,
        )?;

        // mud.every(seconds, code) 重複執行，回傳代號
        mud.set(
            "every",
            scope.create_function(|_, (delay, code): (f64, String)| schedule(delay, code, true))?,
        )?;

        // mud.cancel(key) 取消單一計時器
        mud.set(
            "cancel",
            scope.create_function(|_, key: u64| {
                let mut ctx = ctx.borrow_mut();
                let before = ctx.timers.len();
                ctx.timers.retain(|t| t.key != key);
                // 本次呼叫才建立的計時器直接移除，其餘交給 Orchestrator
                if ctx.timers.len() == before {
                    ctx.cancelled_timers.push(key);
                }
                Ok(())
            })?,
        )?;

        mud.set(
            "cancel_timers",
            scope.create_function(|_, ()| {
                let mut ctx = ctx.borrow_mut();
                ctx.cancel_timers = true;
                ctx.timers.clear();
                ctx.cancelled_timers.clear();
                Ok(())
            })?,
        )?;

        mud.set(
            "connect",
            scope.create_function(|_, address: String| {
                ctx.borrow_mut().requests.push(SystemRequest::Connect(address));
                Ok(())
            })?,
        )?;
        mud.set(
            "disconnect",
            scope.create_function(|_, ()| {
                ctx.borrow_mut().requests.push(SystemRequest::Disconnect);
                Ok(())
            })?,
        )?;
        mud.set(
            "reload",
            scope.create_function(|_, ()| {
                ctx.borrow_mut().requests.push(SystemRequest::Reload);
                Ok(())
            })?,
        )?;
        mud.set(
            "load",
            scope.create_function(|_, path: String| {
                ctx.borrow_mut()
                    .requests
                    .push(SystemRequest::LoadScript(PathBuf::from(path)));
                Ok(())
            })?,
        )?;
        mud.set(
            "quit",
            scope.create_function(|_, ()| {
                ctx.borrow_mut().requests.push(SystemRequest::Quit);
                Ok(())
            })?,
        )?;

        lua.globals().set("mud", mud)?;
        let result = body(lua);
        lua.globals().set("mud", mlua::Value::Nil)?;
        result
    });

    Ok(result?)
}
