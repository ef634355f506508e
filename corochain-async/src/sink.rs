//! 解析結果の出力先
//!
//! レポートの出力先はパイプラインに明示的に渡す。

/// 1行ずつ出力を受け取る
pub trait DiagnosticSink {
    fn log(&mut self, line: &str);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &mut S {
    fn log(&mut self, line: &str) {
        (**self).log(line);
    }
}

/// 行をメモリに貯める
impl DiagnosticSink for Vec<String> {
    fn log(&mut self, line: &str) {
        self.push(line.to_string());
    }
}

/// 標準出力
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn log(&mut self, line: &str) {
        println!("{}", line);
    }
}
