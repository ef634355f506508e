//! コルーチンフレームと呼び出しチェーン

use std::borrow::Borrow;
use std::fmt;

/// シグネチャ内の関数アドレスの区切り文字
pub const SIGNATURE_SEPARATOR: &str = ",";

/// コルーチンフレーム（チェーンの1要素）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoroutineFrame {
    /// フレーム（コルーチンハンドル）のアドレス
    pub frame_address: u64,
    /// フレームに格納された関数ポインタ
    pub function_address: u64,
}

impl CoroutineFrame {
    pub fn new(frame_address: u64, function_address: u64) -> Self {
        Self {
            frame_address,
            function_address,
        }
    }
}

/// 再構築した論理呼び出しチェーン
///
/// 最も古い祖先が先頭、解析を始めたフレームが末尾。空にはならない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChain {
    links: Vec<CoroutineFrame>,
}

impl CallChain {
    /// 1フレームだけのチェーンを作成する
    pub fn single(frame: CoroutineFrame) -> Self {
        Self { links: vec![frame] }
    }

    /// 古い順に並んだフレーム列からチェーンを作成する（空なら None）
    pub fn from_oldest_first(links: Vec<CoroutineFrame>) -> Option<Self> {
        if links.is_empty() {
            None
        } else {
            Some(Self { links })
        }
    }

    /// 全てのフレームを取得する（古い順）
    pub fn links(&self) -> &[CoroutineFrame] {
        &self.links
    }

    /// チェーンの長さ
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// 常に false（チェーンは空にならない）
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// 最も古い祖先
    pub fn root(&self) -> &CoroutineFrame {
        &self.links[0]
    }

    /// 解析を始めたフレーム
    pub fn target(&self) -> &CoroutineFrame {
        &self.links[self.links.len() - 1]
    }

    /// チェーンのシグネチャを計算する
    pub fn signature(&self) -> Signature {
        Signature::from_functions(self.links.iter().map(|link| link.function_address))
    }
}

/// チェーンの形を表すグループ化キー
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Signature(String);

impl Signature {
    /// 関数アドレス列からシグネチャを作成する（空列は空文字列）
    pub fn from_functions<I: IntoIterator<Item = u64>>(functions: I) -> Self {
        let parts: Vec<String> = functions.into_iter().map(|f| format!("0x{:x}", f)).collect();
        Self(parts.join(SIGNATURE_SEPARATOR))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Signature {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
