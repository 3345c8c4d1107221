//! 輸出分行器
//!
//! 將伺服器文字切成完整的行，剩下未換行的部分視為提示字元 (prompt)

use crate::encoding::TextEncoding;

/// 提示字元結束模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptMode {
    /// 伺服器不標示提示字元結束，送出輸入後伺服器會重送提示字元
    #[default]
    Unterminated,
    /// 伺服器以 GA / EOR 明確標示訊息邊界
    TerminatedPrompt,
}

/// 輸出分行器
#[derive(Debug, Clone, Default)]
pub struct OutputSplitter {
    /// 尚未換行的剩餘位元組
    pending: Vec<u8>,
    mode: PromptMode,
    encoding: TextEncoding,
    /// 剩餘內容自上次讀取後是否有變化
    has_new_data: bool,
    /// 上一行以單獨 LF 結尾，緊接的 CR 屬於同一個行尾
    skip_cr: bool,
}

impl OutputSplitter {
    /// 建立分行器
    pub fn new(encoding: TextEncoding) -> Self {
        Self {
            encoding,
            ..Default::default()
        }
    }

    /// 目前模式
    pub fn mode(&self) -> PromptMode {
        self.mode
    }

    /// 切換模式
    pub fn set_mode(&mut self, mode: PromptMode) {
        self.mode = mode;
    }

    /// 剩餘內容是否有尚未讀取的變化
    pub fn has_new_data(&self) -> bool {
        self.has_new_data
    }

    /// 剩餘內容是否為空
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// 加入資料，回傳完整的行（不含行尾）
    ///
    /// 行尾可以是 CRLF、LFCR 或單獨的 LF
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            if self.skip_cr {
                self.skip_cr = false;
                if b == b'\r' {
                    continue;
                }
            }

            if b == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                } else {
                    self.skip_cr = true;
                }
                lines.push(self.encoding.decode(&line));
                self.has_new_data = false;
            } else {
                self.pending.push(b);
                self.has_new_data = true;
            }
        }

        lines
    }

    /// 取得剩餘的提示字元
    ///
    /// `consume` 為 true 時同時清空
    pub fn prompt(&mut self, consume: bool) -> String {
        let text = self.encoding.decode(&self.pending);
        if consume {
            self.pending.clear();
        }
        self.has_new_data = false;
        text
    }

    /// 使用者已送出輸入
    ///
    /// 只有 `Unterminated` 模式會清除剩餘內容；`TerminatedPrompt` 模式保留到伺服器標示結束
    pub fn input_sent(&mut self) {
        if self.mode == PromptMode::Unterminated {
            self.pending.clear();
            self.has_new_data = false;
        }
    }
}
