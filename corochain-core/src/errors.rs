//! エラーメッセージ定数

/// 解析対象が開かれていない場合のエラーメッセージ
pub const ERR_NO_TARGET: &str = "No target (attach to a process or open a core file)";

/// バイナリが読み込まれていない場合のエラーメッセージ
pub const ERR_BINARY_NOT_LOADED: &str = "Binary not loaded";

/// モジュール範囲が決められない場合のエラーメッセージ
pub const ERR_NO_MODULE_RANGE: &str =
    "Module range unknown (pass --module-start/--module-end, or attach to a live process with --binary)";
