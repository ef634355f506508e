//! ヒープ検索・シンボル検索の境界
//!
//! 検索結果はテキスト行として受け取り、位置で列を解釈する。
//! フレーム検索の行: `<フレームアドレス> <関数アドレス> [...]`
//! シンボル検索の行: `<関数アドレス> <表示名>`
//!
//! アドレスは16進数で、`0x` 接頭辞とデバッガ形式の区切り（`00007ff6`2318bf80`）を許す。

use crate::{CoroutineFrame, FrameLayout, Result};
use corochain_dwarf::SymbolResolver;
use corochain_target::HeapScanner;
use std::fmt;

/// フレーム検索のクエリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameQuery {
    /// 検索する関数アドレス
    pub function_address: u64,
    /// 調べるレコード数の上限（バックエンドへのヒント）
    pub limit: usize,
    /// フレームレイアウト
    pub layout: FrameLayout,
}

impl fmt::Display for FrameQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "heap search 0x{:x} (first {} records, function pointer at +0x{:x})",
            self.function_address, self.limit, self.layout.function_offset
        )
    }
}

/// ヒープ検索
pub trait FrameSearch {
    /// クエリに一致するヒープオブジェクトを1行1レコードで遅延列挙する
    fn search(&self, query: &FrameQuery) -> Result<Box<dyn Iterator<Item = String> + '_>>;
}

/// シンボルパターン検索
pub trait SymbolSearch {
    /// パターンに一致する関数を1行1関数で返す
    fn search(&self, pattern: &str) -> Result<Vec<String>>;
}

impl FrameSearch for HeapScanner<'_> {
    fn search(&self, query: &FrameQuery) -> Result<Box<dyn Iterator<Item = String> + '_>> {
        let layout = query.layout;
        let records = self
            .scan(query.function_address)
            .take(query.limit)
            .filter_map(move |hit| {
                let frame_address = layout.frame_from_function_slot(hit.address)?;
                Some(format_frame_record(frame_address, hit.value))
            });
        Ok(Box::new(records))
    }
}

impl SymbolSearch for SymbolResolver {
    fn search(&self, pattern: &str) -> Result<Vec<String>> {
        self.search_lines(pattern)
    }
}

/// フレーム検索の1レコードを組み立てる
pub fn format_frame_record(frame_address: u64, function_address: u64) -> String {
    format!("{:016x}  {:016x}", frame_address, function_address)
}

/// 16進数のアドレストークンをパースする
///
/// バッククォートを取り除き、`0x` 接頭辞は任意。
pub fn parse_hex_token(token: &str) -> Option<u64> {
    let cleaned: String = token.trim().chars().filter(|&c| c != '`').collect();
    let digits = cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
        .unwrap_or(&cleaned);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// フレーム検索の1行をパースする
pub fn parse_frame_record(line: &str) -> Option<CoroutineFrame> {
    let mut columns = line.split_whitespace();
    let frame_address = parse_hex_token(columns.next()?)?;
    let function_address = parse_hex_token(columns.next()?)?;
    Some(CoroutineFrame::new(frame_address, function_address))
}

/// シンボル検索の1行をパースする
pub fn parse_symbol_line(line: &str) -> Option<(u64, &str)> {
    let line = line.trim();
    let (token, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let address = parse_hex_token(token)?;
    Some((address, rest.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use corochain_target::Snapshot;

    #[test]
    fn test_parse_hex_token() {
        assert_eq!(parse_hex_token("00007ff6`2318bf80"), Some(0x7ff6_2318_bf80));
        assert_eq!(parse_hex_token("0x7ff62318bf80"), Some(0x7ff6_2318_bf80));
        assert_eq!(parse_hex_token("7FF62318BF80"), Some(0x7ff6_2318_bf80));
        assert_eq!(parse_hex_token("0x"), None);
        assert_eq!(parse_hex_token("busy"), None);
        assert_eq!(parse_hex_token(""), None);
    }

    #[test]
    fn test_parse_frame_record() {
        let frame = parse_frame_record("00000055`2f8a1040  00007ff6`2318bf80").unwrap();
        assert_eq!(frame, CoroutineFrame::new(0x55_2f8a_1040, 0x7ff6_2318_bf80));

        // 余分な列は無視する
        let frame = parse_frame_record("0x1040 0x2000 extra columns").unwrap();
        assert_eq!(frame, CoroutineFrame::new(0x1040, 0x2000));

        assert_eq!(parse_frame_record(""), None);
        assert_eq!(parse_frame_record("0x1040"), None);
        assert_eq!(parse_frame_record("Couldn't resolve error at"), None);
    }

    #[test]
    fn test_parse_symbol_line() {
        assert_eq!(
            parse_symbol_line("00007ff6`2318bf80 server!store::get$_ResumeCoro$2"),
            Some((0x7ff6_2318_bf80, "server!store::get$_ResumeCoro$2"))
        );
        assert_eq!(parse_symbol_line("0x1000"), Some((0x1000, "")));
        assert_eq!(parse_symbol_line("   "), None);
        assert_eq!(parse_symbol_line("*** ERROR: Module load completed"), None);
    }

    #[test]
    fn test_heap_scanner_records() {
        let layout = FrameLayout {
            function_offset: 0x8,
            ..FrameLayout::msvc_x64()
        };
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(0x5000_0000, vec![0u8; 0x100]);
        snapshot.write_u64(0x5000_0048, 0x7ff6_0000_1000).unwrap();
        snapshot.write_u64(0x5000_0088, 0x7ff6_0000_1000).unwrap();

        let scanner = HeapScanner::new(&snapshot, snapshot.mappings());
        let query = FrameQuery {
            function_address: 0x7ff6_0000_1000,
            limit: 1,
            layout,
        };
        let records: Vec<String> = FrameSearch::search(&scanner, &query).unwrap().collect();

        assert_eq!(records, vec!["0000000050000040  00007ff600001000".to_string()]);
        assert_eq!(
            parse_frame_record(&records[0]),
            Some(CoroutineFrame::new(0x5000_0040, 0x7ff6_0000_1000))
        );
    }
}
