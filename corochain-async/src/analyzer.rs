//! 単一関数の解析パイプライン
//!
//! 候補フレームの検索 → 親チェーンの歩行 → シグネチャ集計 → レポート出力

use crate::{
    AddressFilter, CallChain, ChainAggregate, ChainWalker, DiagnosticSink, FrameLayout, FrameLocator, FrameSearch,
    MinimumAddress, Result,
};
use corochain_target::MemoryReader;
use tracing::debug;

/// 解析の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// 調べる検索レコード数の上限
    pub candidate_limit: usize,
    /// 親をたどる世代数
    pub depth: usize,
    /// フレームレイアウト
    pub layout: FrameLayout,
    /// アドレスらしさの閾値
    pub min_address: MinimumAddress,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            candidate_limit: 100,
            depth: 3,
            layout: FrameLayout::default(),
            min_address: MinimumAddress::DEFAULT,
        }
    }
}

/// コルーチンチェーン解析器
pub struct CoroutineAnalyzer<'a> {
    memory: &'a dyn MemoryReader,
    search: &'a dyn FrameSearch,
    layout: FrameLayout,
    min_address: MinimumAddress,
}

impl<'a> CoroutineAnalyzer<'a> {
    pub fn new(memory: &'a dyn MemoryReader, search: &'a dyn FrameSearch, layout: FrameLayout) -> Self {
        Self {
            memory,
            search,
            layout,
            min_address: MinimumAddress::DEFAULT,
        }
    }

    /// 設定から解析器を作成する
    pub fn with_config(memory: &'a dyn MemoryReader, search: &'a dyn FrameSearch, config: &AnalysisConfig) -> Self {
        Self::new(memory, search, config.layout).with_min_address(config.min_address)
    }

    /// アドレスらしさの閾値を変更する
    pub fn with_min_address(mut self, min_address: MinimumAddress) -> Self {
        self.min_address = min_address;
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn locator(&self) -> FrameLocator<'a> {
        FrameLocator::new(self.search, self.layout)
    }

    pub fn walker(&self) -> ChainWalker<'a> {
        ChainWalker::new(self.memory, self.layout).with_address_check(self.min_address)
    }

    /// 候補フレームを探し、それぞれの親チェーンを返す
    pub fn collect_chains(
        &self,
        function_address: u64,
        limit: usize,
        depth: usize,
        scope: &dyn AddressFilter,
    ) -> Result<Vec<CallChain>> {
        let candidates = self.locator().locate(function_address, limit)?;
        let walker = self.walker();

        let chains: Vec<CallChain> = candidates
            .into_iter()
            .map(|frame| walker.walk(frame, depth, scope))
            .collect();

        debug!("Walked {} chains for 0x{:x}", chains.len(), function_address);
        Ok(chains)
    }

    /// 関数のコルーチンフレームをシグネチャごとに集計し、レポートを出力する
    ///
    /// # Arguments
    /// * `function_address` - 対象関数のアドレス
    /// * `limit` - 調べる検索レコード数の上限
    /// * `depth` - 親をたどる世代数
    /// * `scope` - 親の関数アドレスの判定（通常はモジュール範囲）
    /// * `sink` - レポートの出力先
    ///
    /// # Returns
    /// 集計結果。候補が見つからなければ空の集計
    pub fn unique_coroutine_frames(
        &self,
        function_address: u64,
        limit: usize,
        depth: usize,
        scope: &dyn AddressFilter,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<ChainAggregate> {
        let chains = self.collect_chains(function_address, limit, depth, scope)?;

        let mut aggregate = ChainAggregate::new();
        aggregate.extend(chains);
        aggregate.report(sink);

        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameQuery, ModuleRange};
    use corochain_target::Snapshot;

    /// 何も返さない検索
    struct Empty;

    impl FrameSearch for Empty {
        fn search(&self, _query: &FrameQuery) -> Result<Box<dyn Iterator<Item = String> + '_>> {
            Ok(Box::new(std::iter::empty()))
        }
    }

    /// 常に失敗する検索
    struct Broken;

    impl FrameSearch for Broken {
        fn search(&self, _query: &FrameQuery) -> Result<Box<dyn Iterator<Item = String> + '_>> {
            Err(anyhow::anyhow!("heap search failed"))
        }
    }

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.candidate_limit, 100);
        assert_eq!(config.depth, 3);
        assert_eq!(config.layout, FrameLayout::msvc_x64());
        assert_eq!(config.min_address, MinimumAddress::DEFAULT);
    }

    #[test]
    fn test_zero_candidates_is_empty_aggregate() {
        let snapshot = Snapshot::new();
        let analyzer = CoroutineAnalyzer::new(&snapshot, &Empty, FrameLayout::default());
        let mut lines: Vec<String> = Vec::new();

        let result = analyzer
            .unique_coroutine_frames(0x7ff6_0000_1000, 10, 3, &ModuleRange::new(0, u64::MAX), &mut lines)
            .unwrap();

        assert!(result.is_empty());
        assert_eq!(lines, vec!["Map size: 0".to_string()]);
    }

    #[test]
    fn test_search_failure_propagates() {
        let snapshot = Snapshot::new();
        let analyzer = CoroutineAnalyzer::new(&snapshot, &Broken, FrameLayout::default());
        let mut lines: Vec<String> = Vec::new();

        let result =
            analyzer.unique_coroutine_frames(0x7ff6_0000_1000, 10, 3, &ModuleRange::new(0, u64::MAX), &mut lines);

        assert!(result.is_err());
        assert!(lines.is_empty());
    }
}
