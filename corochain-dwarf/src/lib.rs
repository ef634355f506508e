//! corochain シンボル・ソース行解析
//!
//! このクレートは、ELFファイルのシンボルテーブルとDWARFの行情報を扱います。
//! シンボルパターン検索、アドレスからシンボル名・ソース行への変換などを行います。

pub mod lines;
pub mod loader;
pub mod printer;
pub mod symbols;

pub use lines::{LineInfo, LineInfoProvider};
pub use loader::DwarfLoader;
pub use printer::{format_frame, StackPrinter};
pub use symbols::{glob_to_regex, Symbol, SymbolPattern, SymbolResolver};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;
