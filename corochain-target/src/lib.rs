//! corochain 解析対象へのアクセス
//!
//! このクレートは、解析対象（ptraceで停止させたライブプロセス、またはメモリスナップショット）の
//! 生メモリを読むための低レベル機能を提供します。
//! メモリ読み取り、メモリマッピングの解析、ヒープ走査などを行います。

pub mod error;
pub mod memory;
pub mod process;
pub mod scan;
pub mod snapshot;

pub use error::MemoryError;
pub use memory::{module_bounds, module_load_bias, parse_maps, Memory, MemoryMapping, MemoryReader};
pub use process::Process;
pub use scan::{HeapHit, HeapHits, HeapScanner};
pub use snapshot::Snapshot;

/// ターゲットアクセスの結果型
pub type Result<T> = anyhow::Result<T>;
