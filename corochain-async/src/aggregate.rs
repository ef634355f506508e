//! チェーンのシグネチャ集計

use crate::{CallChain, DiagnosticSink, Signature};
use std::collections::HashMap;

/// シグネチャごとの出現回数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainAggregate {
    counts: HashMap<Signature, usize>,
}

impl ChainAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// チェーンを1件数える
    pub fn record(&mut self, chain: &CallChain) {
        self.record_signature(chain.signature());
    }

    /// シグネチャを1件数える
    pub fn record_signature(&mut self, signature: Signature) {
        *self.counts.entry(signature).or_insert(0) += 1;
    }

    /// 異なるシグネチャの数
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// シグネチャの出現回数
    pub fn get(&self, signature: &str) -> Option<usize> {
        self.counts.get(signature).copied()
    }

    /// 数えたチェーンの総数
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Signature, usize)> {
        self.counts.iter().map(|(sig, &count)| (sig, count))
    }

    /// 出現回数の多い順（同数ならシグネチャ順）
    pub fn sorted(&self) -> Vec<(&Signature, usize)> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        entries
    }

    /// 集計結果を出力する
    ///
    /// ```text
    /// Map size: 2
    /// 0x7ff6...,0x7ff6... => 5
    /// 0x7ff6... => 1
    /// ```
    pub fn report(&self, sink: &mut dyn DiagnosticSink) {
        sink.log(&format!("Map size: {}", self.len()));
        for (signature, count) in self.sorted() {
            sink.log(&format!("{} => {}", signature, count));
        }
    }
}

impl Extend<CallChain> for ChainAggregate {
    fn extend<I: IntoIterator<Item = CallChain>>(&mut self, chains: I) {
        for chain in chains {
            self.record(&chain);
        }
    }
}

/// チェーン列を集計する
pub fn aggregate<'c>(chains: impl IntoIterator<Item = &'c CallChain>) -> ChainAggregate {
    let mut result = ChainAggregate::new();
    for chain in chains {
        result.record(chain);
    }
    result
}
