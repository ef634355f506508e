//! corochain のコア機能
//!
//! このクレートは、解析対象へのアクセス、バイナリのシンボル情報、コルーチンチェーン解析エンジンを統合します。
//! 利用者向けの操作（単一関数の集計、パターンによる一括集計、チェーンの歩行、スタック表示）を提供します。

pub mod errors;
pub mod parse;
pub mod session;

pub use parse::{parse_address, parse_address_list};
pub use session::Session;

// 他のクレートから使用するために再エクスポート
pub use corochain_async::{
    AnalysisConfig, BatchEntry, CallChain, ChainAggregate, DiagnosticSink, FrameLayout, MinimumAddress, ModuleRange,
    StdoutSink,
};
pub use corochain_target::{MemoryMapping, Snapshot};

/// コア機能の結果型
pub type Result<T> = anyhow::Result<T>;
