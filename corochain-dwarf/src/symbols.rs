//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use regex::Regex;
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// マングルされたシンボル名
    pub name: String,
    /// デマングルされたシンボル名（可読な形式）
    pub demangled_name: String,
    /// リンク時アドレス
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// 表示用の名前を取得
    pub fn display_name(&self) -> &str {
        &self.demangled_name
    }
}

/// シンボル名をデマングルする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// ワイルドカード（`*`, `?`）を含むパターンを正規表現に変換する
pub fn glob_to_regex(glob: &str, case_insensitive: bool) -> Result<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    if case_insensitive {
        pattern.push_str("(?i)");
    }
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern.push('$');

    Regex::new(&pattern).map_err(|e| anyhow::anyhow!("Invalid symbol pattern '{}': {}", glob, e))
}

/// `module!name` 形式のシンボルパターン
///
/// モジュール部分は大文字小文字を区別せずにファイル名と照合し、
/// 名前部分はデマングル名（またはマングル名）と照合する。
#[derive(Debug)]
pub struct SymbolPattern {
    module: Option<Regex>,
    name: Regex,
}

impl SymbolPattern {
    /// パターン文字列をパースする
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(anyhow::anyhow!("Empty symbol pattern"));
        }

        match pattern.split_once('!') {
            Some((module, name)) => Ok(Self {
                module: Some(glob_to_regex(module, true)?),
                name: glob_to_regex(name, false)?,
            }),
            None => Ok(Self {
                module: None,
                name: glob_to_regex(pattern, false)?,
            }),
        }
    }

    /// モジュール名が一致するか
    pub fn matches_module(&self, module: &str) -> bool {
        self.module.as_ref().map_or(true, |re| re.is_match(module))
    }

    /// シンボルが一致するか
    pub fn matches_symbol(&self, symbol: &Symbol) -> bool {
        self.name.is_match(&symbol.demangled_name) || self.name.is_match(&symbol.name)
    }
}

/// シンボル解決
pub struct SymbolResolver {
    /// モジュール名
    module: String,
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートした関数シンボル
    symbols_by_address: Vec<Symbol>,
    /// PIE（Position Independent Executable）かどうか
    is_pie: bool,
    /// 実行時アドレス - リンク時アドレス
    load_bias: u64,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    ///
    /// アドレスを持つ関数シンボルだけを取り込む。
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        for symbol in loader.object_file().symbols() {
            if symbol.kind() != SymbolKind::Text || symbol.address() == 0 {
                continue;
            }
            let Ok(name) = symbol.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }

            let sym = Symbol::new(name.to_string(), symbol.address(), symbol.size());
            symbols_by_name.insert(name.to_string(), sym.clone());
            symbols_by_address.push(sym);
        }

        symbols_by_address.sort_by_key(|s| s.address);
        tracing::debug!(
            "Loaded {} function symbols from {:?}",
            symbols_by_address.len(),
            loader.path()
        );

        Ok(Self {
            module: loader.module_name(),
            symbols_by_name,
            symbols_by_address,
            is_pie: loader.is_pie(),
            load_bias: 0,
        })
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// モジュール名を取得する
    pub fn module(&self) -> &str {
        &self.module
    }

    /// ロードバイアスを設定する
    pub fn set_load_bias(&mut self, bias: u64) {
        self.load_bias = bias;
    }

    /// ロードバイアスを取得する
    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// リンク時アドレスを実行時アドレスに変換する
    pub fn to_runtime(&self, link_address: u64) -> u64 {
        link_address.wrapping_add(self.load_bias)
    }

    /// 実行時アドレスをリンク時アドレスに変換する
    pub fn to_link(&self, runtime_address: u64) -> u64 {
        runtime_address.wrapping_sub(self.load_bias)
    }

    /// シンボル名から実行時アドレスを解決する
    ///
    /// マングル名で見つからなければデマングル名で探す。
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name
            .get(symbol)
            .or_else(|| self.symbols_by_address.iter().find(|s| s.demangled_name == symbol))
            .map(|s| self.to_runtime(s.address))
    }

    /// 実行時アドレスを含むシンボルを解決する
    ///
    /// サイズ情報がないシンボルは、直前のシンボルを最も近いものとして返す。
    pub fn reverse_resolve(&self, addr: u64) -> Option<&Symbol> {
        let addr = self.to_link(addr);
        let idx = match self.symbols_by_address.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => return self.symbols_by_address.get(idx),
            Err(0) => return None,
            Err(idx) => idx - 1,
        };

        let sym = &self.symbols_by_address[idx];
        if sym.size > 0 && addr >= sym.address + sym.size {
            None
        } else {
            Some(sym)
        }
    }

    /// `module!glob` パターンにマッチするシンボルをアドレス順に返す
    ///
    /// 同じアドレスの別名は最初の1つだけを返す。
    pub fn search(&self, pattern: &str) -> Result<Vec<&Symbol>> {
        let pattern = SymbolPattern::parse(pattern)?;
        if !pattern.matches_module(&self.module) {
            return Ok(Vec::new());
        }

        let mut found: Vec<&Symbol> = Vec::new();
        for sym in self.symbols_by_address.iter().filter(|s| pattern.matches_symbol(s)) {
            if found.last().is_some_and(|prev| prev.address == sym.address) {
                continue;
            }
            found.push(sym);
        }
        Ok(found)
    }

    /// パターン検索の結果を `<実行時アドレス> <module>!<name>` 形式の行で返す
    pub fn search_lines(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .search(pattern)?
            .into_iter()
            .map(|sym| format!("{:016x} {}!{}", self.to_runtime(sym.address), self.module, sym.display_name()))
            .collect())
    }
}
