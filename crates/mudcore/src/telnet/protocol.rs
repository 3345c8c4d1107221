//! Telnet 協定常數與位元組編碼
//!
//! 實作 RFC 854 / RFC 855 的命令、選項以及 IAC 轉義規則

/// Telnet IAC (Interpret As Command) - 0xFF
pub const IAC: u8 = 255;

/// Telnet 命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TelnetCommand {
    /// End of Record (RFC 885)
    EndOfRecord = 239,
    /// Sub-negotiation End
    Se = 240,
    /// No Operation
    Nop = 241,
    /// Data Mark
    DataMark = 242,
    /// Break
    Break = 243,
    /// Interrupt Process
    InterruptProcess = 244,
    /// Abort Output
    AbortOutput = 245,
    /// Are You There
    AreYouThere = 246,
    /// Erase Character
    EraseCharacter = 247,
    /// Erase Line
    EraseLine = 248,
    /// Go Ahead
    GoAhead = 249,
    /// Sub-negotiation Begin
    Sb = 250,
    /// Will
    Will = 251,
    /// Won't
    Wont = 252,
    /// Do
    Do = 253,
    /// Don't
    Dont = 254,
}

impl TelnetCommand {
    /// 從位元組解析 Telnet 命令
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            239 => Some(Self::EndOfRecord),
            240 => Some(Self::Se),
            241 => Some(Self::Nop),
            242 => Some(Self::DataMark),
            243 => Some(Self::Break),
            244 => Some(Self::InterruptProcess),
            245 => Some(Self::AbortOutput),
            246 => Some(Self::AreYouThere),
            247 => Some(Self::EraseCharacter),
            248 => Some(Self::EraseLine),
            249 => Some(Self::GoAhead),
            250 => Some(Self::Sb),
            251 => Some(Self::Will),
            252 => Some(Self::Wont),
            253 => Some(Self::Do),
            254 => Some(Self::Dont),
            _ => None,
        }
    }

    /// 是否為選項協商動詞 (WILL / WONT / DO / DONT)
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Will | Self::Wont | Self::Do | Self::Dont)
    }

    /// 是否為提示字元結束標記 (GA / EOR)
    pub fn is_prompt_marker(self) -> bool {
        matches!(self, Self::GoAhead | Self::EndOfRecord)
    }
}

/// Telnet 選項
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelnetOption {
    /// Binary Transmission
    BinaryTransmission,
    /// Echo
    Echo,
    /// Suppress Go Ahead
    SuppressGoAhead,
    /// Terminal Type
    TerminalType,
    /// End of Record
    EndOfRecord,
    /// Window Size (NAWS)
    Naws,
    /// Linemode
    Linemode,
    /// Environment Variables (New)
    NewEnviron,
    /// Charset
    Charset,
    /// MUD Server Data Protocol
    Msdp,
    /// MUD Server Status Protocol
    Mssp,
    /// MCCP2 (MUD Client Compression Protocol)
    Mccp2,
    /// MCCP3
    Mccp3,
    /// GMCP (Generic MUD Communication Protocol)
    Gmcp,
    /// Unknown option
    Unknown(u8),
}

impl TelnetOption {
    /// 從位元組解析 Telnet 選項
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::BinaryTransmission,
            1 => Self::Echo,
            3 => Self::SuppressGoAhead,
            24 => Self::TerminalType,
            25 => Self::EndOfRecord,
            31 => Self::Naws,
            34 => Self::Linemode,
            39 => Self::NewEnviron,
            42 => Self::Charset,
            69 => Self::Msdp,
            70 => Self::Mssp,
            86 => Self::Mccp2,
            87 => Self::Mccp3,
            201 => Self::Gmcp,
            other => Self::Unknown(other),
        }
    }

    /// 獲取選項的位元組值
    pub fn as_byte(&self) -> u8 {
        match self {
            Self::BinaryTransmission => 0,
            Self::Echo => 1,
            Self::SuppressGoAhead => 3,
            Self::TerminalType => 24,
            Self::EndOfRecord => 25,
            Self::Naws => 31,
            Self::Linemode => 34,
            Self::NewEnviron => 39,
            Self::Charset => 42,
            Self::Msdp => 69,
            Self::Mssp => 70,
            Self::Mccp2 => 86,
            Self::Mccp3 => 87,
            Self::Gmcp => 201,
            Self::Unknown(b) => *b,
        }
    }

    /// 子協商結束後，伺服器是否會立即切換為壓縮串流
    pub fn is_compression(&self) -> bool {
        matches!(self, Self::Mccp2)
    }
}

impl From<u8> for TelnetOption {
    fn from(byte: u8) -> Self {
        Self::from_byte(byte)
    }
}

/// TTYPE 子協商：IS
pub const TTYPE_IS: u8 = 0;
/// TTYPE 子協商：SEND
pub const TTYPE_SEND: u8 = 1;

/// 將資料中的 IAC 加倍
///
/// ```
/// use mudcore::telnet::{escape_iac, IAC};
///
/// assert_eq!(escape_iac(&[b'a', IAC]), vec![b'a', IAC, IAC]);
/// ```
pub fn escape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    for &b in data {
        if b == IAC {
            out.push(IAC);
        }
        out.push(b);
    }
    out
}

/// `escape_iac` 的反向操作：IAC IAC 還原為單一 IAC
///
/// 孤立的 IAC 原樣保留
pub fn unescape_iac(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        out.push(data[i]);
        if data[i] == IAC && data.get(i + 1) == Some(&IAC) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

/// 產生選項協商序列 `IAC <verb> <option>`
pub fn negotiation_bytes(command: TelnetCommand, option: u8) -> Vec<u8> {
    vec![IAC, command as u8, option]
}

/// 產生子協商序列 `IAC SB <option> <escaped payload> IAC SE`
pub fn subnegotiation_bytes(option: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![IAC, TelnetCommand::Sb as u8, option];
    out.extend_from_slice(&escape_iac(payload));
    out.extend_from_slice(&[IAC, TelnetCommand::Se as u8]);
    out
}

/// 將一行輸出文字編碼為線上格式：IAC 加倍並以 CRLF 結尾
pub fn encode_line(encoded_text: &[u8]) -> Vec<u8> {
    let mut out = escape_iac(encoded_text);
    out.extend_from_slice(b"\r\n");
    out
}
