//! アドレスの妥当性判定
//!
//! チェーンの終端を示す構造的な印は存在しないため、
//! 「アドレスらしいか」「対象モジュールのコードか」で歩行を打ち切る。

use std::fmt;

/// アドレス判定器
pub trait AddressFilter {
    /// アドレスを受け入れるか
    fn accepts(&self, address: u64) -> bool;
}

impl<F: Fn(u64) -> bool> AddressFilter for F {
    fn accepts(&self, address: u64) -> bool {
        self(address)
    }
}

/// 閾値より大きいアドレスだけを有効な仮想アドレスとみなす
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimumAddress(pub u64);

impl MinimumAddress {
    /// 下位 1MB を除外する
    ///
    /// 非 PIE の実行ファイルでは `[heap]` が 0x60_0000 付近に置かれるので、これより高くはできない。
    pub const DEFAULT: Self = Self(0x10_0000);
    /// 下位 2GB を除外する（ヒープが高位に置かれる Windows 向け）
    pub const WINDOWS: Self = Self(0x7F00_0000);
}

impl Default for MinimumAddress {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl AddressFilter for MinimumAddress {
    fn accepts(&self, address: u64) -> bool {
        address > self.0
    }
}

/// モジュールのアドレス範囲（両端を含む）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleRange {
    pub start: u64,
    pub end: u64,
}

impl ModuleRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// アドレスが範囲内にあるか
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address <= self.end
    }
}

impl AddressFilter for ModuleRange {
    fn accepts(&self, address: u64) -> bool {
        self.contains(address)
    }
}

impl fmt::Display for ModuleRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}-0x{:x}", self.start, self.end)
    }
}
