//! メモリアクセス機能
//!
//! 対象プロセス（またはスナップショット）の生メモリを読むための
//! `MemoryReader` トレイトと、ライブプロセス向けの実装 `Memory` を提供する。
//!
//! ライブプロセスを読む場合、`Process::attach` で全スレッドを停止させてから読む。
//! 停止していないプロセスを読むと値が途中で書き換わる可能性があり、
//! 結果はベストエフォートになる。

use crate::{MemoryError, Result};
use nix::unistd::Pid;
use std::fs::{self, File};
use std::io::{Read as _, Seek, SeekFrom};

/// 生メモリの読み取り
pub trait MemoryReader {
    /// `addr` から `size` バイトを読み取る
    fn read_bytes(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError>;

    /// `addr` から `element_size` バイトの値を `count` 個読み取る（リトルエンディアン）
    fn read_values(
        &self,
        addr: u64,
        count: usize,
        element_size: usize,
    ) -> std::result::Result<Vec<u64>, MemoryError> {
        if !matches!(element_size, 1 | 2 | 4 | 8) {
            return Err(MemoryError::UnsupportedElementSize(element_size));
        }
        let total = count
            .checked_mul(element_size)
            .ok_or(MemoryError::Overflow { addr, size: usize::MAX })?;

        let bytes = self.read_bytes(addr, total)?;
        if bytes.len() != total {
            return Err(MemoryError::Short {
                addr,
                expected: total,
                actual: bytes.len(),
            });
        }

        Ok(bytes
            .chunks_exact(element_size)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word[..element_size].copy_from_slice(chunk);
                u64::from_le_bytes(word)
            })
            .collect())
    }

    /// ポインタ1個を読み取る
    fn read_pointer(&self, addr: u64, pointer_size: usize) -> std::result::Result<u64, MemoryError> {
        self.read_values(addr, 1, pointer_size)?
            .first()
            .copied()
            .ok_or(MemoryError::Short {
                addr,
                expected: pointer_size,
                actual: 0,
            })
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for &T {
    fn read_bytes(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError> {
        (**self).read_bytes(addr, size)
    }
}

impl<T: MemoryReader + ?Sized> MemoryReader for Box<T> {
    fn read_bytes(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError> {
        (**self).read_bytes(addr, size)
    }
}

/// メモリマッピング情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMapping {
    pub start: u64,
    /// 終端（排他的）
    pub end: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// マッピング元ファイルのオフセット
    pub offset: u64,
    /// `/proc/pid/maps` のパス列（無名マッピングは None）
    pub path: Option<String>,
}

impl MemoryMapping {
    /// アドレスがこのマッピング内にあるか
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// ヒープとして走査対象にすべき領域か
    ///
    /// 読み書き可能・非実行で、ファイルに裏付けられていない領域を対象にする。
    /// スタックや vdso などの特殊領域は除外する。
    pub fn is_heap_like(&self) -> bool {
        if !(self.readable && self.writable) || self.executable {
            return false;
        }
        match self.path.as_deref() {
            None => true,
            Some("[heap]") => true,
            Some(p) => p.starts_with("[anon"),
        }
    }
}

/// `/proc/pid/maps` 形式のテキストを解析する
///
/// 解析できない行は読み飛ばす。
pub fn parse_maps(text: &str) -> Vec<MemoryMapping> {
    let mut mappings = Vec::new();

    for line in text.lines() {
        // フォーマット: "address perms offset dev inode pathname"
        // 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            continue;
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16))
        else {
            continue;
        };
        let Ok(offset) = u64::from_str_radix(parts[2], 16) else {
            continue;
        };

        let perms = parts[1].as_bytes();
        let path = if parts.len() >= 6 {
            Some(parts[5..].join(" "))
        } else {
            None
        };

        mappings.push(MemoryMapping {
            start,
            end,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            offset,
            path,
        });
    }

    mappings
}

/// マッピングのパスが `path` を指しているか（完全一致またはファイル名の一致）
fn path_matches(mapping: &MemoryMapping, path: &str) -> bool {
    let file_name = std::path::Path::new(path).file_name().and_then(|n| n.to_str());
    mapping.path.as_deref().is_some_and(|p| {
        p == path || (file_name.is_some() && std::path::Path::new(p).file_name().and_then(|n| n.to_str()) == file_name)
    })
}

/// `path` に一致するマッピング全体を覆う範囲（両端を含む）を求める
pub fn module_bounds(mappings: &[MemoryMapping], path: &str) -> Option<(u64, u64)> {
    mappings
        .iter()
        .filter(|m| path_matches(m, path))
        .fold(None, |acc, m| match acc {
            None => Some((m.start, m.end.saturating_sub(1))),
            Some((start, end)) => Some((start.min(m.start), end.max(m.end.saturating_sub(1)))),
        })
}

/// モジュールのロードバイアスを求める
///
/// PIE の場合、シンボルアドレスはリンク時のアドレスなので、
/// 最初の実行可能セグメントの開始アドレスからファイルオフセットを引いた値を返す。
pub fn module_load_bias(mappings: &[MemoryMapping], path: &str) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.executable)
        .find(|m| path_matches(m, path))
        .map(|m| m.start.wrapping_sub(m.offset))
}

/// ライブプロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(self.mem_path())?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    fn read_via_ptrace(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<nix::libc::c_long>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = addr
                .checked_add(offset as u64)
                .ok_or(MemoryError::Overflow { addr, size })?;
            let word = ptrace::read(self.pid, word_addr as *mut std::ffi::c_void)
                .map_err(|source| MemoryError::Ptrace { addr: word_addr, source })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let text = fs::read_to_string(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", maps_path, e))?;
        Ok(parse_maps(&text))
    }
}

impl MemoryReader for Memory {
    /// /proc/pid/mem で読み取り、EIO の場合は PTRACE_PEEKDATA にフォールバックする
    fn read_bytes(&self, addr: u64, size: usize) -> std::result::Result<Vec<u8>, MemoryError> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => self
                .read_via_ptrace(addr, size)
                .map_err(|_| MemoryError::Unmapped { addr }),
            Err(source) => Err(MemoryError::Io { addr, source }),
        }
    }
}
