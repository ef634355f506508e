//! 解析セッション
//!
//! 解析対象（ライブプロセスまたはスナップショット）、バイナリのシンボル、
//! 解析エンジンをまとめ、利用者向けの操作を提供する。

use crate::errors::{ERR_BINARY_NOT_LOADED, ERR_NO_MODULE_RANGE, ERR_NO_TARGET};
use crate::parse::parse_address_list;
use crate::Result;
use corochain_async::{
    AddressFilter, AnalysisConfig, BatchDriver, BatchEntry, CallChain, ChainAggregate, ChainWalker,
    CoroutineAnalyzer, CoroutineFrame, DiagnosticSink, ModuleRange,
};
use corochain_dwarf::{DwarfLoader, StackPrinter};
use corochain_target::{
    module_bounds, module_load_bias, HeapScanner, Memory, MemoryMapping, MemoryReader, Process, Snapshot,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 解析セッション
pub struct Session {
    /// アタッチしたプロセス（ドロップ時にデタッチする）
    process: Option<Process>,
    /// メモリアクセス
    memory: Option<Box<dyn MemoryReader>>,
    /// 解析対象のメモリマッピング
    mappings: Vec<MemoryMapping>,
    /// 読み込んだバイナリのパス
    binary: Option<PathBuf>,
    /// スタック表示器（シンボル検索も兼ねる）
    printer: Option<StackPrinter>,
    /// 解析の設定
    config: AnalysisConfig,
}

impl Session {
    /// 新しいセッションを作成する
    pub fn new() -> Self {
        Self::with_config(AnalysisConfig::default())
    }

    /// 設定を指定してセッションを作成する
    pub fn with_config(config: AnalysisConfig) -> Self {
        Self {
            process: None,
            memory: None,
            mappings: Vec::new(),
            binary: None,
            printer: None,
            config,
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// アタッチしている間は全スレッドが停止しているので、読み取り結果は一貫する。
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let process = Process::attach(pid)?;
        let memory = Memory::new(pid);
        let mappings = memory.get_mappings()?;
        info!("Attached to process {} ({} mappings)", pid, mappings.len());

        self.mappings = mappings;
        self.memory = Some(Box::new(memory));
        self.process = Some(process);
        Ok(())
    }

    /// コアファイルを開く
    pub fn open_core<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let snapshot = Snapshot::from_core_file(path.as_ref())?;
        self.load_snapshot(snapshot);
        Ok(())
    }

    /// スナップショットを解析対象にする
    pub fn load_snapshot(&mut self, snapshot: Snapshot) {
        self.process = None;
        self.mappings = snapshot.mappings();
        self.memory = Some(Box::new(snapshot));
    }

    /// ELFバイナリからシンボルと行情報を読み込む
    ///
    /// PIE で、解析対象のマッピング（ライブプロセスの maps またはコアの `NT_FILE`）に
    /// バイナリが見つかればロードバイアスを設定する。
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let loader = DwarfLoader::load(path)?;
        let mut printer = StackPrinter::new(&loader)?;

        if loader.is_pie() {
            match module_load_bias(&self.mappings, &path.to_string_lossy()) {
                Some(bias) => {
                    debug!("Load bias of {:?}: 0x{:x}", path, bias);
                    printer.resolver_mut().set_load_bias(bias);
                }
                None if self.memory.is_some() => warn!(
                    "{:?} is PIE but not found in the target mappings; symbols use link addresses unless a load bias is given",
                    path
                ),
                None => debug!("{:?} is PIE; no target loaded to compute its load bias", path),
            }
        }

        self.binary = Some(path.to_path_buf());
        self.printer = Some(printer);
        Ok(())
    }

    /// ロードバイアスを明示的に設定する（マッピングから求められない場合用）
    pub fn set_load_bias(&mut self, bias: u64) -> Result<()> {
        let printer = self
            .printer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))?;
        printer.resolver_mut().set_load_bias(bias);
        debug!("Load bias set to 0x{:x}", bias);
        Ok(())
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AnalysisConfig {
        &mut self.config
    }

    /// アタッチしているプロセスのID
    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(Process::pid)
    }

    /// 解析対象のメモリマッピング
    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    /// スタック表示器を取得する
    pub fn printer(&self) -> Option<&StackPrinter> {
        self.printer.as_ref()
    }

    /// シンボル名から実行時アドレスを解決する
    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.printer.as_ref()?.resolver().resolve(name)
    }

    /// メモリアクセスを取得する
    fn require_memory(&self) -> Result<&dyn MemoryReader> {
        self.memory
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NO_TARGET))
    }

    /// スタック表示器を取得する
    fn require_printer(&self) -> Result<&StackPrinter> {
        self.printer
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))
    }

    /// 読み込んだバイナリのアドレス範囲をメモリマッピングから求める
    pub fn module_range(&self) -> Result<ModuleRange> {
        let binary = self.binary.as_ref().ok_or_else(|| anyhow::anyhow!(ERR_NO_MODULE_RANGE))?;
        let (start, end) = module_bounds(&self.mappings, &binary.to_string_lossy())
            .ok_or_else(|| anyhow::anyhow!("{}: {:?} is not mapped", ERR_NO_MODULE_RANGE, binary))?;
        Ok(ModuleRange::new(start, end))
    }

    /// ヒープ走査器を作成する
    fn scanner<'s>(&'s self, memory: &'s dyn MemoryReader) -> HeapScanner<'s> {
        HeapScanner::new(memory, self.mappings.clone()).with_pointer_size(self.config.layout.pointer_size)
    }

    /// 関数のコルーチンフレームを探し、チェーンの形ごとに集計する
    ///
    /// # Arguments
    /// * `function_address` - 対象関数の実行時アドレス
    /// * `limit` - 調べるヒープ検索レコード数の上限
    /// * `depth` - 親をたどる世代数
    /// * `scope` - 親の関数アドレスの判定（通常はモジュール範囲）
    /// * `sink` - レポートの出力先
    pub fn unique_coroutine_frames(
        &self,
        function_address: u64,
        limit: usize,
        depth: usize,
        scope: &dyn AddressFilter,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<ChainAggregate> {
        let memory = self.require_memory()?;
        let scanner = self.scanner(memory);
        let analyzer = CoroutineAnalyzer::with_config(memory, &scanner, &self.config);

        debug!("Finding unique coroutine frames for 0x{:x}", function_address);
        analyzer.unique_coroutine_frames(function_address, limit, depth, scope, sink)
    }

    /// シンボルパターンに一致する全関数について `unique_coroutine_frames` を実行する
    pub fn all_unique_coroutine_frames(
        &self,
        pattern: &str,
        limit: usize,
        depth: usize,
        scope: &dyn AddressFilter,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<Vec<BatchEntry>> {
        let memory = self.require_memory()?;
        let printer = self.require_printer()?;
        let scanner = self.scanner(memory);
        let analyzer = CoroutineAnalyzer::with_config(memory, &scanner, &self.config);

        BatchDriver::new(printer.resolver(), analyzer).run_batch(pattern, limit, depth, scope, sink)
    }

    /// 指定したフレームから親チェーンをたどって表示する
    ///
    /// 開始フレームの関数ポインタが読めない場合はエラー。それ以降の読み取り失敗は歩行の終端になる。
    ///
    /// # Returns
    /// 古い順のチェーン
    pub fn walk_coroutine_chain(
        &self,
        frame_address: u64,
        depth: usize,
        scope: &dyn AddressFilter,
        sink: &mut dyn DiagnosticSink,
    ) -> Result<CallChain> {
        let memory = self.require_memory()?;
        let layout = self.config.layout;

        let slot = layout
            .function_slot(frame_address)
            .ok_or_else(|| anyhow::anyhow!("Invalid coroutine frame address 0x{:x}", frame_address))?;
        let function_address = memory.read_pointer(slot, layout.pointer_size).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read function pointer of coroutine frame 0x{:x}: {}",
                frame_address,
                e
            )
        })?;

        let walker = ChainWalker::new(memory, layout).with_address_check(self.config.min_address);
        let chain = walker.walk(CoroutineFrame::new(frame_address, function_address), depth, scope);

        sink.log("coro_frame, function_address");
        for link in chain.links() {
            sink.log(&format!("0x{:x}, 0x{:x}", link.frame_address, link.function_address));
        }

        let functions: Vec<u64> = chain.links().iter().map(|link| link.function_address).collect();
        self.print_stack(&functions, sink);

        Ok(chain)
    }

    /// カンマ区切りのアドレス列をシンボル名とソース行で表示する
    pub fn print_stack_from_addresses(&self, list: &str, sink: &mut dyn DiagnosticSink) -> Result<()> {
        self.require_printer()?;
        let addresses = parse_address_list(list)?;
        self.print_stack(&addresses, sink);
        Ok(())
    }

    /// 1アドレス1行で表示する（バイナリがなければ生アドレス）
    fn print_stack(&self, addresses: &[u64], sink: &mut dyn DiagnosticSink) {
        for &address in addresses {
            let line = match &self.printer {
                Some(printer) => printer.print(address),
                None => format!("<0x{:x}>", address),
            };
            sink.log(&line);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corochain_async::{FrameLayout, MinimumAddress};

    #[test]
    fn test_operations_require_target() {
        let session = Session::new();
        let mut lines: Vec<String> = Vec::new();
        let scope = ModuleRange::new(0, u64::MAX);

        let err = session
            .unique_coroutine_frames(0x7ff6_0000_1000, 10, 3, &scope, &mut lines)
            .unwrap_err();
        assert_eq!(err.to_string(), ERR_NO_TARGET);
        assert!(session.walk_coroutine_chain(0x5500_0040, 3, &scope, &mut lines).is_err());
    }

    #[test]
    fn test_print_requires_binary() {
        let session = Session::new();
        let mut lines: Vec<String> = Vec::new();
        let err = session.print_stack_from_addresses("0x10", &mut lines).unwrap_err();
        assert_eq!(err.to_string(), ERR_BINARY_NOT_LOADED);
    }

    #[test]
    fn test_module_range_requires_binary() {
        let mut session = Session::new();
        session.load_snapshot(Snapshot::new());
        assert!(session.module_range().is_err());
    }

    #[test]
    fn test_load_bias_requires_binary() {
        let mut session = Session::new();
        let err = session.set_load_bias(0x5555_0000_0000).unwrap_err();
        assert_eq!(err.to_string(), ERR_BINARY_NOT_LOADED);
    }

    #[test]
    fn test_config_overrides() {
        let mut session = Session::new();
        session.config_mut().min_address = MinimumAddress::WINDOWS;
        session.config_mut().layout = FrameLayout {
            function_offset: 8,
            ..FrameLayout::msvc_x64()
        };
        assert_eq!(session.config().min_address, MinimumAddress::WINDOWS);
        assert_eq!(session.config().layout.function_offset, 8);
    }
}
