//! パターンに一致する全関数の一括解析

use crate::search::parse_symbol_line;
use crate::{AddressFilter, ChainAggregate, CoroutineAnalyzer, DiagnosticSink, Result, SymbolSearch};
use tracing::{debug, warn};

/// 1関数分の解析結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub function_address: u64,
    /// シンボル検索が返した表示名
    pub name: String,
    pub aggregate: ChainAggregate,
    /// 解析に失敗した場合のメッセージ
    pub error: Option<String>,
}

impl BatchEntry {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// シンボルパターンに一致する関数をすべて解析する
pub struct BatchDriver<'a> {
    symbols: &'a dyn SymbolSearch,
    analyzer: CoroutineAnalyzer<'a>,
}

impl<'a> BatchDriver<'a> {
    pub fn new(symbols: &'a dyn SymbolSearch, analyzer: CoroutineAnalyzer<'a>) -> Self {
        Self { symbols, analyzer }
    }

    /// パターンに一致する関数ごとに単一関数の解析を実行する
    ///
    /// 解釈できない検索結果の行は飛ばす。
    /// ある関数の解析が失敗しても残りの関数の解析は続ける。
    ///
    /// # Arguments
    /// * `pattern` - シンボルパターン（`module!glob`）
    /// * `limit` - 関数ごとに調べる検索レコード数の上限
    /// * `depth` - 親をたどる世代数
    /// * `scope` - 親の関数アドレスの判定
    /// * `sink` - レポートの出力先
    ///
    /// # Returns
    /// 一致した関数ごとの結果。シンボル検索自体の失敗のみエラー
    pub fn run_batch(
        &self,
        pattern: &str,
        limit: usize,
        depth: usize,
        scope: &dyn AddressFilter,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Vec<BatchEntry>> {
        let lines = self.symbols.search(pattern)?;
        debug!("Symbol search {:?} returned {} lines", pattern, lines.len());

        let mut entries = Vec::new();
        for line in &lines {
            let Some((function_address, name)) = parse_symbol_line(line) else {
                debug!("Skipping symbol line {:?}", line);
                continue;
            };

            sink.log(&format!(
                "Finding unique coroutine frames for {:016x} {}",
                function_address, name
            ));

            let entry = match self
                .analyzer
                .unique_coroutine_frames(function_address, limit, depth, scope, sink)
            {
                Ok(aggregate) => BatchEntry {
                    function_address,
                    name: name.to_string(),
                    aggregate,
                    error: None,
                },
                Err(e) => {
                    warn!("Failed to analyze 0x{:x} {}: {:#}", function_address, name, e);
                    sink.log(&format!("Error: {:#}", e));
                    BatchEntry {
                        function_address,
                        name: name.to_string(),
                        aggregate: ChainAggregate::new(),
                        error: Some(format!("{:#}", e)),
                    }
                }
            };
            entries.push(entry);
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameLayout, FrameQuery, FrameSearch, ModuleRange};
    use corochain_target::Snapshot;

    struct Symbols(Vec<&'static str>);

    impl SymbolSearch for Symbols {
        fn search(&self, _pattern: &str) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    /// 0xbad だけ失敗し、それ以外は何も見つからない
    struct Flaky;

    impl FrameSearch for Flaky {
        fn search(&self, query: &FrameQuery) -> Result<Box<dyn Iterator<Item = String> + '_>> {
            if query.function_address == 0xbad {
                anyhow::bail!("search for 0x{:x} failed", query.function_address);
            }
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn test_batch_skips_bad_lines_and_continues() {
        let snapshot = Snapshot::new();
        let symbols = Symbols(vec![
            "00000000`00000bad server!broken",
            "",
            "not an address",
            "0x7ff600001000 server!ok",
        ]);
        let analyzer = CoroutineAnalyzer::new(&snapshot, &Flaky, FrameLayout::default());
        let driver = BatchDriver::new(&symbols, analyzer);

        let mut lines: Vec<String> = Vec::new();
        let entries = driver
            .run_batch("server!*", 10, 3, &ModuleRange::new(0, u64::MAX), &mut lines)
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].function_address, 0xbad);
        assert!(!entries[0].is_ok());
        assert_eq!(entries[1].name, "server!ok");
        assert!(entries[1].is_ok());
        assert!(entries[1].aggregate.is_empty());

        assert_eq!(lines[0], "Finding unique coroutine frames for 0000000000000bad server!broken");
        assert!(lines.contains(&"Finding unique coroutine frames for 00007ff600001000 server!ok".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("Map size: 0"));
    }

    #[test]
    fn test_no_symbols() {
        let snapshot = Snapshot::new();
        let symbols = Symbols(Vec::new());
        let analyzer = CoroutineAnalyzer::new(&snapshot, &Flaky, FrameLayout::default());
        let driver = BatchDriver::new(&symbols, analyzer);

        let mut lines: Vec<String> = Vec::new();
        let entries = driver
            .run_batch("nothing!*", 10, 3, &ModuleRange::new(0, u64::MAX), &mut lines)
            .unwrap();
        assert!(entries.is_empty());
        assert!(lines.is_empty());
    }
}
