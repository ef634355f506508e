//! メモリアクセスのエラー型

use thiserror::Error;

/// メモリ読み取りの失敗
///
/// ウォーカーはこのエラーを「チェーンの終端」として扱う。
/// ログで追えるよう、失敗したアドレスをメッセージに含める。
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("address 0x{addr:x} is not mapped")]
    Unmapped { addr: u64 },

    #[error("short read at 0x{addr:x}: expected {expected} bytes, got {actual}")]
    Short {
        addr: u64,
        expected: usize,
        actual: usize,
    },

    #[error("unsupported element size {0} (expected 1, 2, 4 or 8)")]
    UnsupportedElementSize(usize),

    #[error("read of {size} bytes at 0x{addr:x} overflows the address space")]
    Overflow { addr: u64, size: usize },

    #[error("failed to read 0x{addr:x}: {source}")]
    Io {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("ptrace read at 0x{addr:x} failed: {source}")]
    Ptrace {
        addr: u64,
        #[source]
        source: nix::Error,
    },
}
