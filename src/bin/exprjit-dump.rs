//! Compile an expression tree written as S-expressions and show what the
//! JIT makes of it: the tree, the tile list, the disassembled code and the
//! resolved label table.

use std::path::PathBuf;
use std::process::ExitCode;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};
use iced_x86::{Decoder, DecoderOptions, Formatter, NasmFormatter};

use exprjit::compiler::JitCompiler;
use exprjit::core::{CompilationSession, InterpLayout, JitConfig};
use exprjit::expr::parse_expr;
use exprjit::graph::JitGraph;
use exprjit::x64::CallConv;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Conv {
    Sysv,
    Win64,
}

impl From<Conv> for CallConv {
    fn from(conv: Conv) -> Self {
        match conv {
            Conv::Sysv => CallConv::SysV,
            Conv::Win64 => CallConv::Win64,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "exprjit-dump", version, about)]
struct Cli {
    /// File holding the tree in S-expression form.
    input: PathBuf,

    /// Function name used for symbols and dumps.
    #[arg(long, default_value = "exprjit")]
    name: String,

    /// Number of producer labels the tree may mark.
    #[arg(long, default_value_t = 0)]
    labels: u32,

    /// Calling convention to generate code for.
    #[arg(long, value_enum)]
    conv: Option<Conv>,

    /// Write jit-code-NNNN.bin/.o into this directory.
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Append a line to /tmp/perf-<pid>.map.
    #[arg(long)]
    perf_map: bool,

    /// Register unwind info for the generated code.
    #[arg(long)]
    unwind: bool,

    /// Skip the tree rewrites.
    #[arg(long)]
    no_optimize: bool,

    /// Log the tree and tile list (needs RUST_LOG=debug).
    #[arg(long)]
    trees: bool,

    /// Size of the local variable area; spill slots follow it.
    #[arg(long, default_value_t = 0)]
    locals_size: i32,

    /// Offset of the current frame pointer in the thread context.
    #[arg(long, default_value_t = 0)]
    tc_cur_frame: i32,

    /// Offset of the work area pointer in a frame.
    #[arg(long, default_value_t = 0)]
    frame_work: i32,
}

fn disassemble(code: &[u8], address: u64) -> Vec<String> {
    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    let mut formatter = NasmFormatter::new();
    let mut lines = Vec::new();
    for instr in &mut decoder {
        let mut text = String::new();
        formatter.format(&instr, &mut text);
        lines.push(format!("{:6x}  {}", instr.ip(), text));
    }
    lines
}

fn run(cli: Cli) -> Result<(), String> {
    let text = std::fs::read_to_string(&cli.input).map_err(|e| format!("{}: {}", cli.input.display(), e))?;
    let (tree, roots) = parse_expr(&text).map_err(|e| e.to_string())?;
    let mut graph = JitGraph::new(cli.name.clone(), tree, roots, cli.labels);
    graph.collect_guards().map_err(|e| e.to_string())?;
    println!("{}", graph.tree.dump(&graph.roots));

    let config = JitConfig {
        disabled: false,
        dump_dir: cli.dump_dir,
        perf_map: cli.perf_map,
        dump_trees: cli.trees,
        register_unwind: cli.unwind,
        optimize: !cli.no_optimize,
        layout: InterpLayout {
            tc_cur_frame: cli.tc_cur_frame,
            frame_work: cli.frame_work,
            locals_size: cli.locals_size,
        },
    };
    let mut compiler = JitCompiler::new(config);
    if let Some(conv) = cli.conv {
        compiler = compiler.with_call_conv(conv.into());
    }

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let code = compiler
        .try_compile(&mut graph, &session)
        .map_err(|e| format!("compilation failed: {}", e))?;

    for line in disassemble(code.bytes(), 0) {
        println!("{}", line);
    }
    println!();
    for (label, offset) in code.tables().labels.iter().enumerate() {
        match offset {
            Some(offset) => println!("label {:4} -> {:#x}", label, offset),
            None => println!("label {:4} unplaced", label),
        }
    }
    for deopt in &code.tables().deopts {
        println!("deopt {:4} at {:#x}", deopt.index, deopt.offset);
    }
    println!("spill area: {} bytes", code.spill_size());
    println!("{}", code.perf_map_line());
    println!("{}", session.stats());
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("exprjit-dump: {}", err);
            ExitCode::FAILURE
        }
    }
}
