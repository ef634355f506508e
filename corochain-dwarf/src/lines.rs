//! ソース行情報

use crate::loader::DwarfReader;
use crate::{DwarfLoader, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

/// ソース行情報の取得
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfReader>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let dwarf = loader.owned_dwarf()?;
        let context = addr2line::Context::from_dwarf(dwarf)
            .map_err(|e| anyhow::anyhow!("Failed to build line table context: {}", e))?;
        Ok(Self { context })
    }

    /// リンク時アドレスからソース行情報を取得する
    ///
    /// ファイル名または行番号が得られない場合は None を返す。
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Failed to look up 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            Some(LineInfo {
                file: loc.file?.to_string(),
                line: loc.line?,
                column: loc.column,
            })
        }))
    }
}
