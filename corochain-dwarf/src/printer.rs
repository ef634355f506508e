//! アドレスの表示形式への変換
//!
//! `module!qualified_name [source_path @ line]` の形で1アドレスを表示する。

use crate::{DwarfLoader, LineInfo, LineInfoProvider, Result, SymbolResolver};

/// スタック表示器
pub struct StackPrinter {
    resolver: SymbolResolver,
    lines: Option<LineInfoProvider>,
}

impl StackPrinter {
    /// ローダーから表示器を作成する
    ///
    /// 行情報が読めない場合（DWARFなし）はシンボル名だけを表示する。
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let resolver = SymbolResolver::new(loader)?;
        let lines = match LineInfoProvider::new(loader) {
            Ok(lines) => Some(lines),
            Err(e) => {
                tracing::warn!("Line information unavailable for {:?}: {}", loader.path(), e);
                None
            }
        };
        Ok(Self::from_parts(resolver, lines))
    }

    /// シンボル解決器と行情報プロバイダから表示器を作成する
    pub fn from_parts(resolver: SymbolResolver, lines: Option<LineInfoProvider>) -> Self {
        Self { resolver, lines }
    }

    /// シンボル解決器への参照を取得する
    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    /// シンボル解決器を可変参照で取得する
    pub fn resolver_mut(&mut self) -> &mut SymbolResolver {
        &mut self.resolver
    }

    /// 実行時アドレスを表示用文字列に変換する
    pub fn print(&self, address: u64) -> String {
        let Some(symbol) = self.resolver.reverse_resolve(address) else {
            return format!("<0x{:x}>", address);
        };

        let link_address = self.resolver.to_link(address);
        let offset = link_address - symbol.address;
        let line = self.lines.as_ref().and_then(|lines| match lines.lookup(link_address) {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        });

        format_frame(self.resolver.module(), symbol.display_name(), offset, line.as_ref())
    }
}

/// 1フレーム分の表示文字列を組み立てる
pub fn format_frame(module: &str, name: &str, offset: u64, line: Option<&LineInfo>) -> String {
    let mut out = format!("{}!{}", module, name);
    if offset != 0 {
        out.push_str(&format!("+0x{:x}", offset));
    }
    if let Some(line) = line {
        out.push_str(&format!(" [{} @ {}]", line.file, line.line));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_frame() {
        let line = LineInfo {
            file: "/src/store.rs".to_string(),
            line: 1040,
            column: Some(9),
        };
        assert_eq!(
            format_frame("server", "store::get::{{closure}}", 0, Some(&line)),
            "server!store::get::{{closure}} [/src/store.rs @ 1040]"
        );
        assert_eq!(format_frame("server", "main", 0x1f, None), "server!main+0x1f");
    }
}
