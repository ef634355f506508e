//! 候補フレームの検索

use crate::search::parse_frame_record;
use crate::{CoroutineFrame, FrameLayout, FrameQuery, FrameSearch, Result};
use std::collections::HashSet;
use tracing::{debug, trace};

/// 関数アドレスから候補フレームを探す
pub struct FrameLocator<'a> {
    search: &'a dyn FrameSearch,
    layout: FrameLayout,
}

impl<'a> FrameLocator<'a> {
    pub fn new(search: &'a dyn FrameSearch, layout: FrameLayout) -> Self {
        Self { search, layout }
    }

    /// `function_address` を保持するフレームを探す
    ///
    /// 検索結果の先頭 `limit` レコードだけを調べる（一致数ではなくレコード数の上限）。
    /// 空行・不正な行・関数アドレスが一致しない行は黙って捨てる。
    /// 同じフレームが複数回現れた場合は最初の1つだけを返す。
    ///
    /// # Returns
    /// 見つかった順の候補フレーム。見つからなければ空
    pub fn locate(&self, function_address: u64, limit: usize) -> Result<Vec<CoroutineFrame>> {
        let query = FrameQuery {
            function_address,
            limit,
            layout: self.layout,
        };
        debug!("Executing: {}", query);

        let mut seen = HashSet::new();
        let mut frames = Vec::new();

        for line in self.search.search(&query)?.take(limit) {
            let Some(frame) = parse_frame_record(&line) else {
                trace!("Skipping malformed record {:?}", line);
                continue;
            };

            // 上流の検索は不正確なことがあるので関数アドレスを再確認する
            if frame.function_address != function_address {
                trace!(
                    "Skipping frame 0x{:x}: function 0x{:x} != 0x{:x}",
                    frame.frame_address,
                    frame.function_address,
                    function_address
                );
                continue;
            }

            if seen.insert(frame.frame_address) {
                frames.push(frame);
            }
        }

        debug!("Found {} candidate frames for 0x{:x}", frames.len(), function_address);
        Ok(frames)
    }
}
