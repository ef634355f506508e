//! ヒープ走査
//!
//! ヒープらしい領域をワード単位で読み、指定した値（関数アドレス）を
//! 保持している場所を列挙する。走査はチャンク単位で遅延実行される。

use crate::{MemoryMapping, MemoryReader};
use std::collections::VecDeque;

/// 1回の読み取りサイズ
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// 走査で見つかった1ワード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapHit {
    /// 値が格納されているアドレス
    pub address: u64,
    /// 格納されている値
    pub value: u64,
}

/// ヒープ走査器
pub struct HeapScanner<'a> {
    memory: &'a dyn MemoryReader,
    mappings: Vec<MemoryMapping>,
    pointer_size: usize,
    chunk_size: usize,
}

impl<'a> HeapScanner<'a> {
    /// 走査器を作成する
    ///
    /// `mappings` のうちヒープらしい領域（`MemoryMapping::is_heap_like`）だけを走査する。
    pub fn new(memory: &'a dyn MemoryReader, mappings: Vec<MemoryMapping>) -> Self {
        let mappings = mappings.into_iter().filter(MemoryMapping::is_heap_like).collect();
        Self {
            memory,
            mappings,
            pointer_size: 8,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// ワードサイズを設定する（4 または 8）
    pub fn with_pointer_size(mut self, pointer_size: usize) -> Self {
        self.pointer_size = pointer_size;
        self
    }

    /// チャンクサイズを設定する（ワードサイズの倍数に切り上げる）
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// 走査対象の領域
    pub fn mappings(&self) -> &[MemoryMapping] {
        &self.mappings
    }

    /// `needle` に一致するワードを遅延列挙する
    pub fn scan(&self, needle: u64) -> HeapHits<'_> {
        let word = self.pointer_size.max(1);
        let chunk_size = self.chunk_size.max(word).div_ceil(word) * word;
        HeapHits {
            memory: self.memory,
            mappings: &self.mappings,
            needle,
            pointer_size: self.pointer_size,
            chunk_size,
            mapping_index: 0,
            cursor: self.mappings.first().map(|m| m.start).unwrap_or(0),
            pending: VecDeque::new(),
        }
    }
}

/// `HeapScanner::scan` のイテレータ
pub struct HeapHits<'s> {
    memory: &'s dyn MemoryReader,
    mappings: &'s [MemoryMapping],
    needle: u64,
    pointer_size: usize,
    chunk_size: usize,
    mapping_index: usize,
    cursor: u64,
    pending: VecDeque<HeapHit>,
}

impl HeapHits<'_> {
    /// 次の領域へ進む
    fn advance_mapping(&mut self) {
        self.mapping_index += 1;
        if let Some(next) = self.mappings.get(self.mapping_index) {
            self.cursor = next.start;
        }
    }

    /// 現在位置から1チャンク読み、一致したワードを pending に積む
    fn scan_chunk(&mut self, mapping: &MemoryMapping) {
        let remaining = mapping.end.saturating_sub(self.cursor);
        let size = remaining.min(self.chunk_size as u64) as usize;
        let chunk_start = self.cursor;
        self.cursor += size as u64;

        let bytes = match self.memory.read_bytes(chunk_start, size) {
            Ok(bytes) => bytes,
            Err(e) => {
                // 走査中に読めなくなった領域は残りを読み飛ばす
                tracing::debug!("Skipping region 0x{:x}-0x{:x}: {}", mapping.start, mapping.end, e);
                self.cursor = mapping.end;
                return;
            }
        };

        for (i, word) in bytes.chunks_exact(self.pointer_size).enumerate() {
            let mut buf = [0u8; 8];
            buf[..self.pointer_size].copy_from_slice(word);
            let value = u64::from_le_bytes(buf);
            if value == self.needle {
                self.pending.push_back(HeapHit {
                    address: chunk_start + (i * self.pointer_size) as u64,
                    value,
                });
            }
        }
    }
}

impl Iterator for HeapHits<'_> {
    type Item = HeapHit;

    fn next(&mut self) -> Option<HeapHit> {
        if !matches!(self.pointer_size, 4 | 8) {
            return None;
        }

        loop {
            if let Some(hit) = self.pending.pop_front() {
                return Some(hit);
            }

            let mappings = self.mappings;
            let mapping = mappings.get(self.mapping_index)?;
            if self.cursor >= mapping.end {
                self.advance_mapping();
                continue;
            }

            self.scan_chunk(mapping);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Snapshot;

    const NEEDLE: u64 = 0x7ff6_2318_bf80;

    #[test]
    fn test_scan_finds_aligned_hits_across_regions() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(0x1000_0000, vec![0u8; 0x300]);
        snapshot.insert_region(0x2000_0000, vec![0u8; 0x100]);
        snapshot.write_u64(0x1000_0008, NEEDLE).unwrap();
        snapshot.write_u64(0x1000_0200, NEEDLE).unwrap();
        snapshot.write_u64(0x2000_0040, NEEDLE).unwrap();
        snapshot.write_u64(0x2000_0048, NEEDLE + 1).unwrap();

        let scanner = HeapScanner::new(&snapshot, snapshot.mappings()).with_chunk_size(0x80);
        let hits: Vec<u64> = scanner.scan(NEEDLE).map(|h| h.address).collect();

        assert_eq!(hits, vec![0x1000_0008, 0x1000_0200, 0x2000_0040]);
    }

    #[test]
    fn test_scan_skips_non_heap_regions() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region_with_permissions(0x1000, vec![0u8; 0x40], false, true);
        snapshot.insert_region(0x2000, vec![0u8; 0x40]);
        snapshot.write_u64(0x1010, NEEDLE).unwrap();
        snapshot.write_u64(0x2010, NEEDLE).unwrap();

        let scanner = HeapScanner::new(&snapshot, snapshot.mappings());
        assert_eq!(scanner.mappings().len(), 1);

        let hits: Vec<HeapHit> = scanner.scan(NEEDLE).collect();
        assert_eq!(
            hits,
            vec![HeapHit {
                address: 0x2010,
                value: NEEDLE
            }]
        );
    }

    #[test]
    fn test_scan_is_lazy() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(0x1000, vec![0u8; 0x1000]);
        for i in 0..16 {
            snapshot.write_u64(0x1000 + i * 0x100, NEEDLE).unwrap();
        }

        let scanner = HeapScanner::new(&snapshot, snapshot.mappings()).with_chunk_size(0x100);
        let first_two: Vec<u64> = scanner.scan(NEEDLE).take(2).map(|h| h.address).collect();
        assert_eq!(first_two, vec![0x1000, 0x1100]);
    }

    #[test]
    fn test_scan_unreadable_mapping_is_skipped() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(0x3000, vec![0u8; 0x20]);
        snapshot.write_u64(0x3008, NEEDLE).unwrap();

        // スナップショットに存在しない領域を先頭に置く
        let mut mappings = snapshot.mappings();
        mappings.insert(
            0,
            MemoryMapping {
                start: 0x1000,
                end: 0x2000,
                readable: true,
                writable: true,
                executable: false,
                offset: 0,
                path: None,
            },
        );

        let scanner = HeapScanner::new(&snapshot, mappings);
        let hits: Vec<u64> = scanner.scan(NEEDLE).map(|h| h.address).collect();
        assert_eq!(hits, vec![0x3008]);
    }

    #[test]
    fn test_scan_with_four_byte_words() {
        let mut snapshot = Snapshot::new();
        snapshot.insert_region(0x1000, vec![0u8; 0x20]);
        snapshot.write_u64(0x1004, 0x1234_5678).unwrap();

        let scanner = HeapScanner::new(&snapshot, snapshot.mappings()).with_pointer_size(4);
        let hits: Vec<u64> = scanner.scan(0x1234_5678).map(|h| h.address).collect();
        assert_eq!(hits, vec![0x1004]);
    }
}
