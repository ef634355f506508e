//! パース関連のユーティリティ関数

use anyhow::Result;

/// アドレス文字列をu64にパース
///
/// デバッガと同じく既定の基数は16。`0x` 接頭辞は16進数、`0n` 接頭辞は10進数。
/// デバッガ出力をそのまま貼り付けられるよう、バッククォート区切りを取り除く。
///
/// # Examples
/// ```
/// use corochain_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("0n1234").unwrap(), 1234);
/// assert_eq!(parse_address("00007ff6`2318bf80").unwrap(), 0x7ff6_2318_bf80);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s: String = s.trim().chars().filter(|&c| c != '`').collect();

    if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(digits, 16).map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else if let Some(digits) = s.strip_prefix("0n").or_else(|| s.strip_prefix("0N")) {
        digits
            .parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid decimal address '{}': {}", s, e))
    } else {
        u64::from_str_radix(&s, 16).map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// カンマ区切りのアドレス列をパースする
///
/// 空の要素は飛ばすので、集計レポートのシグネチャをそのまま渡せる。
pub fn parse_address_list(list: &str) -> Result<Vec<u64>> {
    list.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_address)
        .collect()
}
