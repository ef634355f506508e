//! 親チェーンの歩行
//!
//! フレームヘッダに格納された親コルーチンハンドルへの参照をたどり、
//! 論理的な呼び出し元を推定する。
//!
//! チェーンの先頭を示す構造的な印はないので、歩行はヒューリスティックに打ち切る。
//! 行き過ぎ（偶然それらしく見えるメモリへ進む）も手前での停止も起こりうる。
//! どちらもシグネチャ集計で目立たなくなる程度のノイズとして扱う。

use crate::{AddressFilter, CallChain, CoroutineFrame, FrameLayout, MinimumAddress};
use corochain_target::MemoryReader;
use tracing::trace;

/// 歩行が止まった理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStop {
    /// 深さの上限に達した
    DepthExhausted,
    /// 親への参照アドレスがアドレスらしくない（メモリは読んでいない）
    ImplausibleReference { frame_address: u64 },
    /// 参照または親の関数ポインタが読めなかった
    ReadFailed { address: u64 },
    /// 親フレームのアドレスがアドレスらしくない
    ImplausibleParent { parent_address: u64 },
    /// 親の関数が対象モジュールの外にある
    OutOfScope { function_address: u64 },
}

/// 歩行の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkOutcome {
    /// 古い順のチェーン（末尾は開始フレーム）
    pub chain: CallChain,
    /// 停止理由
    pub stop: WalkStop,
}

/// 親チェーンを歩くウォーカー
pub struct ChainWalker<'a> {
    memory: &'a dyn MemoryReader,
    layout: FrameLayout,
    address_check: Box<dyn AddressFilter + 'a>,
}

impl<'a> ChainWalker<'a> {
    /// ウォーカーを作成する（アドレス判定は `MinimumAddress::DEFAULT`）
    pub fn new(memory: &'a dyn MemoryReader, layout: FrameLayout) -> Self {
        Self {
            memory,
            layout,
            address_check: Box::new(MinimumAddress::DEFAULT),
        }
    }

    /// アドレスらしさの判定を差し替える
    pub fn with_address_check(mut self, check: impl AddressFilter + 'a) -> Self {
        self.address_check = Box::new(check);
        self
    }

    /// フレームレイアウト
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// `frame` から最大 `depth` 世代まで親をたどる
    ///
    /// # Arguments
    /// * `frame` - 開始フレーム
    /// * `depth` - たどる世代数の上限
    /// * `scope` - 親の関数アドレスが対象コードに属するかの判定（通常は `ModuleRange`）
    ///
    /// # Returns
    /// 古い順のチェーン。長さは 1 以上 `depth + 1` 以下
    pub fn walk(&self, frame: CoroutineFrame, depth: usize, scope: &dyn AddressFilter) -> CallChain {
        self.walk_with_reason(frame, depth, scope).chain
    }

    /// `walk` と同じだが停止理由も返す
    pub fn walk_with_reason(
        &self,
        frame: CoroutineFrame,
        depth: usize,
        scope: &dyn AddressFilter,
    ) -> WalkOutcome {
        // 子→親の順に積み、最後に反転する
        let mut links = vec![frame];
        let mut current = frame;
        let mut remaining = depth;

        let stop = loop {
            if remaining == 0 {
                break WalkStop::DepthExhausted;
            }
            match self.parent_of(current, scope) {
                Ok(parent) => {
                    links.push(parent);
                    current = parent;
                    remaining -= 1;
                }
                Err(stop) => break stop,
            }
        };

        trace!(
            "Walk from 0x{:x} stopped after {} frames: {:?}",
            frame.frame_address,
            links.len(),
            stop
        );

        links.reverse();
        let chain = CallChain::from_oldest_first(links).unwrap_or_else(|| CallChain::single(frame));
        WalkOutcome { chain, stop }
    }

    /// 1世代分の親を求める
    fn parent_of(&self, frame: CoroutineFrame, scope: &dyn AddressFilter) -> Result<CoroutineFrame, WalkStop> {
        let reference = self
            .layout
            .parent_ref_address(frame.frame_address)
            .filter(|&addr| self.address_check.accepts(addr))
            .ok_or(WalkStop::ImplausibleReference {
                frame_address: frame.frame_address,
            })?;

        let parent_address = self.read_pointer(reference)?;
        if !self.address_check.accepts(parent_address) {
            return Err(WalkStop::ImplausibleParent { parent_address });
        }

        let slot = self
            .layout
            .function_slot(parent_address)
            .ok_or(WalkStop::ImplausibleParent { parent_address })?;
        let function_address = self.read_pointer(slot)?;
        if !scope.accepts(function_address) {
            return Err(WalkStop::OutOfScope { function_address });
        }

        Ok(CoroutineFrame::new(parent_address, function_address))
    }

    /// 読み取り失敗は歩行の終端として扱う
    fn read_pointer(&self, address: u64) -> Result<u64, WalkStop> {
        self.memory
            .read_pointer(address, self.layout.pointer_size)
            .map_err(|e| {
                trace!("Read failed: {}", e);
                WalkStop::ReadFailed { address }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModuleRange;
    use corochain_target::{MemoryError, Snapshot};
    use std::cell::Cell;

    const MODULE: ModuleRange = ModuleRange {
        start: 0x7ff6_0000_0000,
        end: 0x7ff6_ffff_ffff,
    };
    const HEAP: u64 = 0x5500_0000_0000;

    /// MSVC レイアウトのフレームをスナップショットに書き込む
    ///
    /// `frame` にヒープブロック先頭 + 0x40 のアドレスを渡す。
    fn write_frame(snapshot: &mut Snapshot, frame: u64, function: u64, parent: u64) {
        snapshot.write_u64(frame, function).unwrap();
        snapshot.write_u64(frame - 0x40 + 0x10, parent).unwrap();
    }

    fn heap() -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(HEAP, vec![0u8; 0x1000]);
        snapshot
    }

    /// 読み取り回数を数える
    struct Counting<'a> {
        inner: &'a Snapshot,
        reads: Cell<usize>,
    }

    impl MemoryReader for Counting<'_> {
        fn read_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
            self.reads.set(self.reads.get() + 1);
            self.inner.read_bytes(addr, size)
        }
    }

    #[test]
    fn test_depth_zero_returns_start_frame() {
        let snapshot = heap();
        let walker = ChainWalker::new(&snapshot, FrameLayout::default());
        let start = CoroutineFrame::new(HEAP + 0x140, 0x7ff6_0000_1000);

        let outcome = walker.walk_with_reason(start, 0, &MODULE);
        assert_eq!(outcome.chain.links(), &[start]);
        assert_eq!(outcome.stop, WalkStop::DepthExhausted);
    }

    #[test]
    fn test_walk_three_generations_oldest_first() {
        let mut snapshot = heap();
        let (c, a, r) = (HEAP + 0x140, HEAP + 0x240, HEAP + 0x340);
        write_frame(&mut snapshot, c, 0x7ff6_0000_3000, a);
        write_frame(&mut snapshot, a, 0x7ff6_0000_2000, r);
        // ルートの親はモジュール外の関数を指すフレーム
        write_frame(&mut snapshot, r, 0x7ff6_0000_1000, HEAP + 0x440);
        write_frame(&mut snapshot, HEAP + 0x440, 0x1234_5678_9abc, 0);

        let walker = ChainWalker::new(&snapshot, FrameLayout::default());
        let start = CoroutineFrame::new(c, 0x7ff6_0000_3000);
        let outcome = walker.walk_with_reason(start, 5, &MODULE);

        assert_eq!(
            outcome.chain.links(),
            &[
                CoroutineFrame::new(r, 0x7ff6_0000_1000),
                CoroutineFrame::new(a, 0x7ff6_0000_2000),
                start,
            ]
        );
        assert_eq!(
            outcome.stop,
            WalkStop::OutOfScope {
                function_address: 0x1234_5678_9abc
            }
        );
    }

    #[test]
    fn test_length_never_exceeds_depth_plus_one() {
        // 自分自身を親とするフレームは深さの上限まで続く
        let mut snapshot = heap();
        let frame = HEAP + 0x140;
        write_frame(&mut snapshot, frame, 0x7ff6_0000_1000, frame);

        let walker = ChainWalker::new(&snapshot, FrameLayout::default());
        let start = CoroutineFrame::new(frame, 0x7ff6_0000_1000);
        for depth in 0..6 {
            let chain = walker.walk(start, depth, &MODULE);
            assert_eq!(chain.len(), depth + 1);
        }
    }

    #[test]
    fn test_implausible_reference_reads_nothing() {
        let snapshot = heap();
        let counting = Counting {
            inner: &snapshot,
            reads: Cell::new(0),
        };
        let walker = ChainWalker::new(&counting, FrameLayout::default());

        // 参照アドレス 0x1000 - 0x40 + 0x10 は閾値以下
        let start = CoroutineFrame::new(0x1000, 0x7ff6_0000_1000);
        let outcome = walker.walk_with_reason(start, 3, &MODULE);

        assert_eq!(outcome.chain.links(), &[start]);
        assert_eq!(outcome.stop, WalkStop::ImplausibleReference { frame_address: 0x1000 });
        assert_eq!(counting.reads.get(), 0);
    }

    #[test]
    fn test_reference_underflow_stops() {
        let snapshot = heap();
        let walker = ChainWalker::new(&snapshot, FrameLayout::default()).with_address_check(|_: u64| true);
        let start = CoroutineFrame::new(0x8, 0x7ff6_0000_1000);

        assert_eq!(walker.walk(start, 3, &MODULE).links(), &[start]);
    }

    #[test]
    fn test_read_fault_is_soft_terminus() {
        let snapshot = heap();
        let walker = ChainWalker::new(&snapshot, FrameLayout::default());

        // 参照アドレスはそれらしいが、マップされていない
        let start = CoroutineFrame::new(0x6600_0000_0040, 0x7ff6_0000_1000);
        let outcome = walker.walk_with_reason(start, 3, &MODULE);

        assert_eq!(outcome.chain.links(), &[start]);
        assert_eq!(
            outcome.stop,
            WalkStop::ReadFailed {
                address: 0x6600_0000_0010
            }
        );
    }

    #[test]
    fn test_parent_function_read_fault() {
        let mut snapshot = heap();
        let frame = HEAP + 0x140;
        // 親は存在しない領域を指す
        write_frame(&mut snapshot, frame, 0x7ff6_0000_1000, 0x6600_0000_0040);

        let walker = ChainWalker::new(&snapshot, FrameLayout::default());
        let start = CoroutineFrame::new(frame, 0x7ff6_0000_1000);
        let outcome = walker.walk_with_reason(start, 3, &MODULE);

        assert_eq!(outcome.chain.links(), &[start]);
        assert_eq!(
            outcome.stop,
            WalkStop::ReadFailed {
                address: 0x6600_0000_0040
            }
        );
    }

    #[test]
    fn test_null_parent_is_implausible() {
        let mut snapshot = heap();
        let frame = HEAP + 0x140;
        write_frame(&mut snapshot, frame, 0x7ff6_0000_1000, 0);

        let walker = ChainWalker::new(&snapshot, FrameLayout::default());
        let start = CoroutineFrame::new(frame, 0x7ff6_0000_1000);
        let outcome = walker.walk_with_reason(start, 3, &MODULE);

        assert_eq!(outcome.chain.len(), 1);
        assert_eq!(outcome.stop, WalkStop::ImplausibleParent { parent_address: 0 });
    }

    #[test]
    fn test_default_check_follows_low_heap() {
        // 非 PIE バイナリ: コードは 0x40_0000 から、ヒープは 0x60_0000 付近
        let module = ModuleRange::new(0x40_0000, 0x4f_ffff);
        let heap_base = 0x0060_0000;
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(heap_base, vec![0u8; 0x1000]);
        let (child, parent) = (heap_base + 0x140, heap_base + 0x240);
        write_frame(&mut snapshot, child, 0x40_2000, parent);
        write_frame(&mut snapshot, parent, 0x40_1000, 0);

        let start = CoroutineFrame::new(child, 0x40_2000);
        let outcome = ChainWalker::new(&snapshot, FrameLayout::default()).walk_with_reason(start, 3, &module);
        assert_eq!(outcome.chain.len(), 2);
        assert_eq!(outcome.chain.root().function_address, 0x40_1000);

        let outcome = ChainWalker::new(&snapshot, FrameLayout::default())
            .with_address_check(MinimumAddress::WINDOWS)
            .walk_with_reason(start, 3, &module);
        assert_eq!(outcome.chain.len(), 1);
    }

    #[test]
    fn test_custom_layout() {
        // ヘッダがフレームの直前 0x10 バイト、親参照はその先頭、関数ポインタは +8
        let layout = FrameLayout {
            header_offset: 0x10,
            parent_ref_offset: 0,
            function_offset: 8,
            pointer_size: 8,
        };
        let mut snapshot = heap();
        let (child, parent) = (HEAP + 0x100, HEAP + 0x200);
        snapshot.write_u64(child + 8, 0x7ff6_0000_2000).unwrap();
        snapshot.write_u64(child - 0x10, parent).unwrap();
        snapshot.write_u64(parent + 8, 0x7ff6_0000_1000).unwrap();
        snapshot.write_u64(parent - 0x10, 0).unwrap();

        let walker = ChainWalker::new(&snapshot, layout);
        let start = CoroutineFrame::new(child, 0x7ff6_0000_2000);
        let chain = walker.walk(start, 3, &MODULE);

        assert_eq!(
            chain.links(),
            &[CoroutineFrame::new(parent, 0x7ff6_0000_1000), start]
        );
    }
}
