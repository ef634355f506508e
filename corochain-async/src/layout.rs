//! コルーチンフレームのレイアウト
//!
//! フレームヘッダ内のオフセットはコンパイラ・ランタイムのバージョンに依存するため、
//! 定数ではなく値として受け渡す。

/// フレームレイアウト記述子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    /// フレームアドレスからヘッダ領域先頭までの距離（フレームの手前）
    pub header_offset: u64,
    /// ヘッダ領域先頭から親コルーチンハンドルへの参照までのオフセット
    pub parent_ref_offset: u64,
    /// フレームアドレスから関数ポインタまでのオフセット
    pub function_offset: u64,
    /// ポインタサイズ（バイト）
    pub pointer_size: usize,
}

impl FrameLayout {
    /// MSVC x64 のコルーチンフレーム
    ///
    /// ヒープブロック先頭から 0x40 の位置がコルーチンハンドルで、
    /// 親ハンドルへの参照はヒープブロック先頭から 0x10 にある。
    pub const fn msvc_x64() -> Self {
        Self {
            header_offset: 0x40,
            parent_ref_offset: 0x10,
            function_offset: 0,
            pointer_size: 8,
        }
    }

    /// 親への参照が格納されているアドレスを計算する
    ///
    /// アドレス空間をはみ出す場合は None。
    pub fn parent_ref_address(&self, frame_address: u64) -> Option<u64> {
        frame_address
            .checked_sub(self.header_offset)?
            .checked_add(self.parent_ref_offset)
    }

    /// 関数ポインタが格納されているアドレスを計算する
    pub fn function_slot(&self, frame_address: u64) -> Option<u64> {
        frame_address.checked_add(self.function_offset)
    }

    /// 関数ポインタの格納アドレスからフレームアドレスを逆算する
    pub fn frame_from_function_slot(&self, slot: u64) -> Option<u64> {
        slot.checked_sub(self.function_offset)
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::msvc_x64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msvc_parent_ref() {
        let layout = FrameLayout::msvc_x64();
        assert_eq!(layout.parent_ref_address(0x5500_0040), Some(0x5500_0010));
        assert_eq!(layout.function_slot(0x5500_0040), Some(0x5500_0040));
    }

    #[test]
    fn test_underflow_is_none() {
        let layout = FrameLayout::msvc_x64();
        assert_eq!(layout.parent_ref_address(0x20), None);

        let shifted = FrameLayout {
            function_offset: 0x8,
            ..layout
        };
        assert_eq!(shifted.frame_from_function_slot(0x4), None);
        assert_eq!(shifted.frame_from_function_slot(0x1008), Some(0x1000));
    }
}
