//! corochain CLI - コマンドラインインターフェース
//!
//! コルーチンの論理呼び出しチェーン解析を1回ずつ実行するコマンド群

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use corochain_core::{parse_address, MinimumAddress, ModuleRange, Session, StdoutSink};

/// corochain - Coroutine Call Chain Reconstructor
#[derive(Parser)]
#[command(name = "corochain")]
#[command(version)]
#[command(about = "Reconstructs logical call chains of suspended coroutines from heap memory", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: AnalyzeCommand,
}

/// 解析対象の指定
#[derive(Args)]
struct TargetArgs {
    /// Process ID to attach to
    #[arg(short, long, global = true, conflicts_with = "core")]
    pid: Option<i32>,

    /// Core file to analyze
    #[arg(long, global = true)]
    core: Option<String>,

    /// Binary providing symbols and line information
    #[arg(short, long, global = true)]
    binary: Option<String>,

    /// Load bias of a PIE binary, when the target's mappings do not name it
    #[arg(long, global = true, value_parser = parse_address, requires = "binary")]
    load_bias: Option<u64>,

    /// Addresses at or below this value are treated as invalid pointers
    /// [default: 0x100000; use 0x7f000000 for Windows-style high heaps]
    #[arg(long, global = true, value_parser = parse_address)]
    min_address: Option<u64>,
}

/// 歩行範囲の指定
#[derive(Args)]
struct WalkArgs {
    /// Number of ancestors to follow [default: 3]
    #[arg(short, long)]
    depth: Option<usize>,

    /// First address of the module's code (inclusive)
    #[arg(long, value_parser = parse_address, requires = "module_end")]
    module_start: Option<u64>,

    /// Last address of the module's code (inclusive)
    #[arg(long, value_parser = parse_address, requires = "module_start")]
    module_end: Option<u64>,
}

impl WalkArgs {
    /// 指定がなければセッションの設定値を使う
    fn depth(&self, session: &Session) -> usize {
        self.depth.unwrap_or(session.config().depth)
    }
}

#[derive(Subcommand)]
enum AnalyzeCommand {
    /// Group the coroutine frames of one function by chain shape
    Frames {
        /// Function address or symbol name
        function: String,

        /// Number of heap search records to examine [default: 100]
        #[arg(short, long)]
        limit: Option<usize>,

        #[command(flatten)]
        walk: WalkArgs,
    },

    /// Run `frames` for every function matching a symbol pattern
    Batch {
        /// Symbol pattern (`module!glob`)
        pattern: String,

        /// Number of heap search records to examine per function [default: 100]
        #[arg(short, long)]
        limit: Option<usize>,

        #[command(flatten)]
        walk: WalkArgs,
    },

    /// Walk the ancestors of one coroutine frame
    Walk {
        /// Coroutine frame address
        #[arg(value_parser = parse_address)]
        frame: u64,

        #[command(flatten)]
        walk: WalkArgs,
    },

    /// Print symbols and source lines for a comma-separated address list
    Print {
        /// Addresses, e.g. a signature from the `frames` report
        addresses: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// コマンドを実行する
fn run(cli: Cli) -> Result<()> {
    let session = init_session(&cli.target)?;
    let mut sink = StdoutSink;

    match cli.command {
        AnalyzeCommand::Frames { function, limit, walk } => {
            let function_address = resolve_function(&session, &function)?;
            let scope = module_range(&session, &walk)?;
            let limit = limit.unwrap_or(session.config().candidate_limit);
            session.unique_coroutine_frames(function_address, limit, walk.depth(&session), &scope, &mut sink)?;
        }
        AnalyzeCommand::Batch { pattern, limit, walk } => {
            let scope = module_range(&session, &walk)?;
            let limit = limit.unwrap_or(session.config().candidate_limit);
            let entries =
                session.all_unique_coroutine_frames(&pattern, limit, walk.depth(&session), &scope, &mut sink)?;
            let failed = entries.iter().filter(|entry| !entry.is_ok()).count();
            if failed > 0 {
                tracing::warn!("{} of {} functions could not be analyzed", failed, entries.len());
            }
        }
        AnalyzeCommand::Walk { frame, walk } => {
            let scope = module_range(&session, &walk)?;
            session.walk_coroutine_chain(frame, walk.depth(&session), &scope, &mut sink)?;
        }
        AnalyzeCommand::Print { addresses } => {
            session.print_stack_from_addresses(&addresses, &mut sink)?;
        }
    }

    Ok(())
}

/// セッションを初期化してプロセスにアタッチ、またはコアファイルを開く
fn init_session(target: &TargetArgs) -> Result<Session> {
    let mut session = Session::new();
    if let Some(min_address) = target.min_address {
        session.config_mut().min_address = MinimumAddress(min_address);
    }

    // ロードバイアスの計算にマッピングが必要なので、バイナリより先に対象を開く
    if let Some(pid) = target.pid {
        session.attach(pid)?;
    } else if let Some(core) = &target.core {
        session.open_core(core)?;
    }

    if let Some(binary) = &target.binary {
        session.load_binary(binary)?;
    }
    if let Some(bias) = target.load_bias {
        session.set_load_bias(bias)?;
    }

    Ok(session)
}

/// シンボル名または関数アドレスを実行時アドレスに変換する
///
/// `add` や `deadbeef` のように16進数として読める名前もあるので、シンボルを先に引く。
fn resolve_function(session: &Session, function: &str) -> Result<u64> {
    if let Some(address) = session.resolve_symbol(function) {
        return Ok(address);
    }
    parse_address(function)
        .map_err(|e| anyhow::anyhow!("'{}' is neither a known symbol nor an address ({})", function, e))
}

/// 引数またはメモリマッピングからモジュール範囲を決める
fn module_range(session: &Session, walk: &WalkArgs) -> Result<ModuleRange> {
    match (walk.module_start, walk.module_end) {
        (Some(start), Some(end)) if start <= end => Ok(ModuleRange::new(start, end)),
        (Some(start), Some(end)) => Err(anyhow::anyhow!(
            "Module start 0x{:x} is after module end 0x{:x}",
            start,
            end
        )),
        _ => session.module_range(),
    }
}
