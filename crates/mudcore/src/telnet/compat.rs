//! 選項相容表
//!
//! 每個 Telnet 選項 (0-255) 記錄本地/遠端是否支援，以及目前是否啟用

/// 單一選項的協商狀態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OptionSupport {
    /// 本地端願意啟用此選項 (回應 DO)
    pub locally_supported: bool,
    /// 允許遠端啟用此選項 (回應 WILL)
    pub remotely_supported: bool,
    /// 本地端目前已啟用
    pub local_enabled: bool,
    /// 遠端目前已啟用
    pub remote_enabled: bool,
}

impl OptionSupport {
    /// 修正為合法狀態：未支援的一側不可啟用
    fn normalized(mut self) -> Self {
        self.local_enabled &= self.locally_supported;
        self.remote_enabled &= self.remotely_supported;
        self
    }
}

/// 選項相容表
///
/// 每個 Parser 擁有一份，不與其他連線共用
#[derive(Debug, Clone)]
pub struct CompatibilityTable {
    entries: [OptionSupport; 256],
}

impl CompatibilityTable {
    /// 建立空白表（不支援任何選項）
    pub fn new() -> Self {
        Self {
            entries: [OptionSupport::default(); 256],
        }
    }

    /// 取得選項狀態
    pub fn get(&self, option: u8) -> OptionSupport {
        self.entries[usize::from(option)]
    }

    /// 設定選項狀態
    ///
    /// 違反不變式的啟用旗標會被清除
    pub fn set(&mut self, option: u8, entry: OptionSupport) {
        self.entries[usize::from(option)] = entry.normalized();
    }

    /// 宣告本地支援
    pub fn support_local(&mut self, option: u8) {
        self.entries[usize::from(option)].locally_supported = true;
    }

    /// 宣告接受遠端啟用
    pub fn support_remote(&mut self, option: u8) {
        self.entries[usize::from(option)].remotely_supported = true;
    }

    /// 同時宣告本地與遠端支援
    pub fn support(&mut self, option: u8) {
        self.support_local(option);
        self.support_remote(option);
    }

    /// 清除所有啟用狀態，保留支援宣告
    pub fn reset_states(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.local_enabled = false;
            entry.remote_enabled = false;
        }
    }
}

impl Default for CompatibilityTable {
    fn default() -> Self {
        Self::new()
    }
}
