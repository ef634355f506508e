//! corochain コルーチンチェーン解析エンジン
//!
//! このクレートは、ヒープ上に残ったコルーチンフレームから論理的な呼び出しチェーン
//! （await/resume の連鎖）を推定する機能を提供します。
//! 候補フレームの検索、フレームヘッダの親参照の歩行、チェーンの形ごとの集計を行います。
//!
//! 結果はヒューリスティックであり、チェーンの真の先頭に到達したことは保証しません。

pub mod aggregate;
pub mod analyzer;
pub mod batch;
pub mod filter;
pub mod frame;
pub mod layout;
pub mod locator;
pub mod search;
pub mod sink;
pub mod walker;

pub use aggregate::{aggregate, ChainAggregate};
pub use analyzer::{AnalysisConfig, CoroutineAnalyzer};
pub use batch::{BatchDriver, BatchEntry};
pub use filter::{AddressFilter, MinimumAddress, ModuleRange};
pub use frame::{CallChain, CoroutineFrame, Signature, SIGNATURE_SEPARATOR};
pub use layout::FrameLayout;
pub use locator::FrameLocator;
pub use search::{
    format_frame_record, parse_frame_record, parse_hex_token, parse_symbol_line, FrameQuery, FrameSearch,
    SymbolSearch,
};
pub use sink::{DiagnosticSink, StdoutSink};
pub use walker::{ChainWalker, WalkOutcome, WalkStop};

/// 解析エンジンの結果型
pub type Result<T> = anyhow::Result<T>;
