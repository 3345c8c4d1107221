//! Telnet 位元組串流解析器
//!
//! 逐位元組的狀態機，將任意切割的串流轉換為協定事件。
//! 未完成的序列會保留到下一次 `receive` 呼叫。

use tracing::{debug, warn};

use super::compat::CompatibilityTable;
use super::protocol::{negotiation_bytes, TelnetCommand, TelnetOption, IAC};

/// 子協商內容上限，超過即丟棄該段子協商
const MAX_SUBNEGOTIATION_LEN: usize = 1 << 20;

/// 解析器產生的協定事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelnetEvent {
    /// 一般文字資料（已還原 IAC IAC）
    DataReceive(Vec<u8>),
    /// 需要回傳給伺服器的位元組
    DataSend(Vec<u8>),
    /// 兩位元組命令，如 GA、EOR、NOP
    SimpleCommand(u8),
    /// 選項狀態已改變
    Negotiation { command: TelnetCommand, option: u8 },
    /// 完整的子協商內容（已還原轉義）
    Subnegotiation { option: u8, payload: Vec<u8> },
    /// 壓縮選項的子協商結束，後續位元組需先解壓縮
    DecompressSignal(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum State {
    #[default]
    Normal,
    Command,
    Negotiate(TelnetCommand),
    SubnegotiationBegin,
    SubnegotiationData(u8),
    SubnegotiationEscape(u8),
}

/// Telnet 協定解析器
#[derive(Debug, Clone, Default)]
pub struct TelnetParser {
    table: CompatibilityTable,
    state: State,
    data: Vec<u8>,
    subnegotiation: Vec<u8>,
    /// 目前的子協商已超過長度上限，內容將被丟棄
    oversized: bool,
}

impl TelnetParser {
    /// 以指定的相容表建立解析器
    pub fn new(table: CompatibilityTable) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }

    /// 目前的相容表
    pub fn table(&self) -> &CompatibilityTable {
        &self.table
    }

    /// 解析器是否停在序列中間
    pub fn is_mid_sequence(&self) -> bool {
        self.state != State::Normal
    }

    /// 清除緩衝與協商狀態，保留支援宣告
    pub fn reset(&mut self) {
        self.state = State::Normal;
        self.data.clear();
        self.subnegotiation.clear();
        self.oversized = false;
        self.table.reset_states();
    }

    /// 解析一段位元組
    pub fn receive(&mut self, input: &[u8]) -> Vec<TelnetEvent> {
        let mut events = Vec::new();
        let mut i = 0;

        while i < input.len() {
            let b = input[i];
            i += 1;

            match self.state {
                State::Normal => {
                    if b == IAC {
                        self.state = State::Command;
                    } else {
                        self.data.push(b);
                    }
                }
                State::Command => {
                    self.state = State::Normal;
                    if b == IAC {
                        // IAC IAC = 轉義的 0xFF
                        self.data.push(IAC);
                        continue;
                    }
                    match TelnetCommand::from_byte(b) {
                        Some(cmd) if cmd.is_negotiation() => {
                            self.state = State::Negotiate(cmd);
                        }
                        Some(TelnetCommand::Sb) => {
                            self.state = State::SubnegotiationBegin;
                        }
                        _ => {
                            self.flush_data(&mut events);
                            events.push(TelnetEvent::SimpleCommand(b));
                        }
                    }
                }
                State::Negotiate(cmd) => {
                    self.state = State::Normal;
                    self.flush_data(&mut events);
                    self.negotiate(cmd, b, &mut events);
                }
                State::SubnegotiationBegin => {
                    self.subnegotiation.clear();
                    self.oversized = false;
                    self.state = State::SubnegotiationData(b);
                }
                State::SubnegotiationData(option) => {
                    if b == IAC {
                        self.state = State::SubnegotiationEscape(option);
                    } else {
                        self.push_subnegotiation(option, &[b]);
                    }
                }
                State::SubnegotiationEscape(option) => {
                    if b == TelnetCommand::Se as u8 {
                        self.state = State::Normal;
                        self.flush_data(&mut events);
                        if self.oversized {
                            self.oversized = false;
                        } else {
                            events.push(TelnetEvent::Subnegotiation {
                                option,
                                payload: std::mem::take(&mut self.subnegotiation),
                            });
                        }

                        if TelnetOption::from_byte(option).is_compression() {
                            debug!("壓縮串流開始於選項 {}", option);
                            events.push(TelnetEvent::DecompressSignal(input[i..].to_vec()));
                            return events;
                        }
                    } else {
                        self.state = State::SubnegotiationData(option);
                        if b == IAC {
                            self.push_subnegotiation(option, &[IAC]);
                        } else {
                            // 不合法的 IAC <x>：兩個位元組都保留
                            self.push_subnegotiation(option, &[IAC, b]);
                        }
                    }
                }
            }
        }

        self.flush_data(&mut events);
        events
    }

    fn flush_data(&mut self, events: &mut Vec<TelnetEvent>) {
        if !self.data.is_empty() {
            events.push(TelnetEvent::DataReceive(std::mem::take(&mut self.data)));
        }
    }

    fn push_subnegotiation(&mut self, option: u8, bytes: &[u8]) {
        if self.oversized {
            return;
        }
        if self.subnegotiation.len() + bytes.len() > MAX_SUBNEGOTIATION_LEN {
            warn!("選項 {} 的子協商過長，已丟棄", option);
            self.subnegotiation = Vec::new();
            self.oversized = true;
            return;
        }
        self.subnegotiation.extend_from_slice(bytes);
    }

    /// 處理對方送來的 WILL / WONT / DO / DONT
    ///
    /// 已處於要求的狀態時不回應，避免協商迴圈
    fn negotiate(&mut self, command: TelnetCommand, option: u8, events: &mut Vec<TelnetEvent>) {
        let mut entry = self.table.get(option);

        let reply = match command {
            TelnetCommand::Will => {
                if entry.remote_enabled {
                    None
                } else if entry.remotely_supported {
                    entry.remote_enabled = true;
                    Some(TelnetCommand::Do)
                } else {
                    events.push(TelnetEvent::DataSend(negotiation_bytes(TelnetCommand::Dont, option)));
                    return;
                }
            }
            TelnetCommand::Do => {
                if entry.local_enabled {
                    None
                } else if entry.locally_supported {
                    entry.local_enabled = true;
                    Some(TelnetCommand::Will)
                } else {
                    events.push(TelnetEvent::DataSend(negotiation_bytes(TelnetCommand::Wont, option)));
                    return;
                }
            }
            TelnetCommand::Wont if entry.remote_enabled => {
                entry.remote_enabled = false;
                Some(TelnetCommand::Dont)
            }
            TelnetCommand::Dont if entry.local_enabled => {
                entry.local_enabled = false;
                Some(TelnetCommand::Wont)
            }
            _ => None,
        };

        if let Some(reply) = reply {
            debug!("協商 {:?} {:?} -> {:?}", command, TelnetOption::from_byte(option), reply);
            self.table.set(option, entry);
            events.push(TelnetEvent::DataSend(negotiation_bytes(reply, option)));
            events.push(TelnetEvent::Negotiation { command, option });
        }
    }
}
