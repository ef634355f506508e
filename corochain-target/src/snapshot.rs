//! メモリスナップショット
//!
//! コアダンプ、またはプログラムから組み立てた領域の集合をメモリとして扱う。
//! スナップショットは静的なので、ライブプロセスのような読み取り競合は起きない。

use crate::{MemoryError, MemoryMapping, MemoryReader, Result};
use object::elf::{NT_FILE, PF_R, PF_W, PF_X, PT_LOAD};
use object::read::elf::{ElfFile64, ProgramHeader};
use object::{Endian, Endianness, Object, ObjectKind};
use std::collections::BTreeMap;
use std::path::Path;

/// スナップショット内の1領域
#[derive(Debug, Clone)]
struct Region {
    bytes: Vec<u8>,
    writable: bool,
    executable: bool,
}

/// `NT_FILE` ノートの1エントリ（ファイルにマップされた範囲）
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileMapping {
    start: u64,
    end: u64,
    /// ファイル内のバイトオフセット
    offset: u64,
    path: String,
}

/// メモリスナップショット
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// 開始アドレス -> 領域
    regions: BTreeMap<u64, Region>,
    /// コアファイルの `PT_LOAD` ヘッダから得たマッピング（データのないセグメントも含む）
    segments: Vec<MemoryMapping>,
}

impl Snapshot {
    /// 空のスナップショットを作成する
    pub fn new() -> Self {
        Self::default()
    }

    /// ELFコアファイルからスナップショットを読み込む
    ///
    /// 全ての `PT_LOAD` ヘッダをマッピングとして記録し、ファイル内にデータを持つものを領域として取り込む。
    /// テキストセグメントはダンプされないことが多いので、マッピングのパスとオフセットは
    /// `NT_FILE` ノートから補う。
    pub fn from_core_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read core file {:?}: {}", path, e))?;
        let snapshot = Self::from_core_bytes(&data)
            .map_err(|e| anyhow::anyhow!("Failed to load core file {:?}: {}", path, e))?;

        tracing::debug!(
            "Loaded {} regions ({} segments) from core file {:?}",
            snapshot.regions.len(),
            snapshot.segments.len(),
            path
        );
        Ok(snapshot)
    }

    /// メモリ上の ELF64 コアイメージを解析する
    pub fn from_core_bytes(data: &[u8]) -> Result<Self> {
        let elf = ElfFile64::<Endianness>::parse(data)
            .map_err(|e| anyhow::anyhow!("not an ELF64 file: {}", e))?;
        if elf.kind() != ObjectKind::Core {
            return Err(anyhow::anyhow!("not a core file"));
        }

        let endian = elf.endian();
        let files = file_mappings(&elf)?;
        tracing::debug!("NT_FILE lists {} mapped files", files.len());

        let mut snapshot = Self::new();
        for phdr in elf.elf_program_headers() {
            if phdr.p_type(endian) != PT_LOAD {
                continue;
            }

            let start = phdr.p_vaddr(endian);
            let end = start.saturating_add(phdr.p_memsz(endian));
            let flags = phdr.p_flags(endian);
            let writable = flags & PF_W != 0;
            let executable = flags & PF_X != 0;

            let file = files.iter().find(|f| f.start <= start && start < f.end);
            snapshot.segments.push(MemoryMapping {
                start,
                end,
                readable: flags & PF_R != 0,
                writable,
                executable,
                offset: file.map_or(0, |f| f.offset + (start - f.start)),
                path: file.map(|f| f.path.clone()),
            });

            let bytes = phdr
                .data(endian, data)
                .map_err(|_| anyhow::anyhow!("segment data at 0x{:x} is out of bounds", start))?;
            if !bytes.is_empty() {
                snapshot.insert_region_with_permissions(start, bytes.to_vec(), writable, executable);
            }
        }

        Ok(snapshot)
    }

    /// 読み書き可能な領域を追加する
    pub fn insert_region(&mut self, start: u64, bytes: Vec<u8>) {
        self.insert_region_with_permissions(start, bytes, true, false);
    }

    /// パーミッションを指定して領域を追加する（同じ開始アドレスの領域は置き換える）
    pub fn insert_region_with_permissions(
        &mut self,
        start: u64,
        bytes: Vec<u8>,
        writable: bool,
        executable: bool,
    ) {
        self.regions.insert(
            start,
            Region {
                bytes,
                writable,
                executable,
            },
        );
    }

    /// データを持たないマッピングを追加する（ファイル由来のテキストセグメントなど）
    pub fn insert_mapping(&mut self, mapping: MemoryMapping) {
        self.segments.push(mapping);
    }

    /// 既存の領域に u64 値を書き込む（リトルエンディアン）
    pub fn write_u64(&mut self, addr: u64, value: u64) -> std::result::Result<(), MemoryError> {
        let (start, region) = self
            .regions
            .range_mut(..=addr)
            .next_back()
            .ok_or(MemoryError::Unmapped { addr })?;

        let offset = (addr - *start) as usize;
        let slot = region
            .bytes
            .get_mut(offset..offset + 8)
            .ok_or(MemoryError::Unmapped { addr })?;
        slot.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// メモリマッピングの一覧を取得する
    ///
    /// コアファイルのセグメントに、セグメントに含まれない領域を加えて開始アドレス順に並べる。
    pub fn mappings(&self) -> Vec<MemoryMapping> {
        let mut mappings = self.segments.clone();
        for (&start, region) in &self.regions {
            if self.segments.iter().any(|m| m.contains(start)) {
                continue;
            }
            mappings.push(MemoryMapping {
                start,
                end: start + region.bytes.len() as u64,
                readable: true,
                writable: region.writable,
                executable: region.executable,
                offset: 0,
                path: None,
            });
        }
        mappings.sort_by_key(|m| m.start);
        mappings
    }
}

/// `PT_NOTE` セグメントから `NT_FILE` ノートを探して解析する
fn file_mappings(elf: &ElfFile64<'_, Endianness>) -> Result<Vec<FileMapping>> {
    let endian = elf.endian();
    let mut files = Vec::new();

    for phdr in elf.elf_program_headers() {
        let Some(mut notes) = phdr
            .notes(endian, elf.data())
            .map_err(|e| anyhow::anyhow!("malformed note segment: {}", e))?
        else {
            continue;
        };

        while let Some(note) = notes
            .next()
            .map_err(|e| anyhow::anyhow!("malformed note: {}", e))?
        {
            if note.name() != b"CORE" || note.n_type(endian) != NT_FILE {
                continue;
            }
            match parse_nt_file(note.desc(), endian) {
                Some(parsed) => files.extend(parsed),
                None => tracing::warn!("Ignoring truncated NT_FILE note"),
            }
        }
    }

    Ok(files)
}

/// `NT_FILE` の本体を解析する
///
/// 件数とページサイズの後に (開始, 終了, ページ単位のオフセット) の組が並び、
/// 最後に NUL 終端のパスが同じ順で続く。
fn parse_nt_file(desc: &[u8], endian: Endianness) -> Option<Vec<FileMapping>> {
    let word = |index: usize| -> Option<u64> {
        let bytes = desc.get(index * 8..index * 8 + 8)?;
        Some(endian.read_u64_bytes(bytes.try_into().ok()?))
    };

    let count = usize::try_from(word(0)?).ok()?;
    let page_size = word(1)?;
    let names_at = count.checked_mul(3)?.checked_add(2)?.checked_mul(8)?;
    let mut names = desc.get(names_at..)?.split(|&b| b == 0);

    let mut files = Vec::with_capacity(count.min(1024));
    for i in 0..count {
        let base = 2 + i * 3;
        let name = names.next()?;
        files.push(FileMapping {
            start: word(base)?,
            end: word(base + 1)?,
            offset: word(base + 2)?.checked_mul(page_size)?,
            path: String::from_utf8_lossy(name).into_owned(),
        });
    }
    Some(files)
}

impl MemoryReader for Snapshot {
    /// 1つの領域に収まる読み取りだけを許可する
    fn read_bytes(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError> {
        let (start, region) = self
            .regions
            .range(..=addr)
            .next_back()
            .ok_or(MemoryError::Unmapped { addr })?;

        let offset = (addr - start) as usize;
        let end = offset
            .checked_add(size)
            .ok_or(MemoryError::Overflow { addr, size })?;

        match region.bytes.get(offset..end) {
            Some(bytes) => Ok(bytes.to_vec()),
            None if offset >= region.bytes.len() => Err(MemoryError::Unmapped { addr }),
            None => Err(MemoryError::Unmapped {
                addr: start + region.bytes.len() as u64,
            }),
        }
    }
}
