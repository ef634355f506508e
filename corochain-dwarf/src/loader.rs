//! ELFとDWARFの読み込み機能

use crate::Result;
use object::{Object, ObjectSection};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// DWARFセクションのリーダー型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;

/// DWARFローダー
pub struct DwarfLoader {
    /// 読み込んだファイルのパス
    path: PathBuf,
    /// オブジェクトファイル
    object_file: Rc<object::File<'static>>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // セクションのスライスを'staticで保持するため、データはプロセス終了まで解放しない
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            object_file: Rc::new(object_file),
        })
    }

    /// オブジェクトファイルからDWARFセクションを読み込む
    ///
    /// セクションが存在しない場合は空のスライスになる（ストリップ済みバイナリ）。
    fn load_sections(object_file: &object::File<'static>) -> Result<gimli::Dwarf<DwarfReader>> {
        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
    }

    /// DWARFコンテキストを構築する（addr2line用）
    pub fn owned_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        Self::load_sections(&self.object_file)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// 読み込んだファイルのパス
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// モジュール名（拡張子を除いたファイル名）
    pub fn module_name(&self) -> String {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("<unknown>")
            .to_string()
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIEの場合、シンボルアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;

        // ET_DYN = PIE実行ファイルまたは共有ライブラリ
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
