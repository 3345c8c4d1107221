//! Telnet 協定模組
//!
//! 位元組層級的協商狀態機、輸出分行，以及連線管理

mod client;
mod compat;
mod connection;
mod output;
mod parser;
mod protocol;

pub use client::{TelnetClient, TelnetConfig, TelnetError};
pub use compat::{CompatibilityTable, OptionSupport};
pub use output::{OutputSplitter, PromptMode};
pub use parser::{TelnetEvent, TelnetParser};
pub use protocol::{
    encode_line, escape_iac, negotiation_bytes, subnegotiation_bytes, unescape_iac,
    TelnetCommand, TelnetOption, IAC,
};
