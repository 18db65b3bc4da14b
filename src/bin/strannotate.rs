/// StrAnnotate CLI - 文字列テーブルをバイナリのコメントDBへ取り込む
///
/// Usage:
///   strannotate --binary sample.exe annotate strings.json
///   strannotate -b sample.exe comments
///   strannotate -b sample.exe resolve 0x400

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use strannotate::{AnalysisHost, Annotator, ImageSession, StdoutConsole};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strannotate")]
#[command(about = "Annotate a binary's comment database with an imported strings table", long_about = None)]
struct Cli {
    /// Target binary (ELF, PE or Mach-O)
    #[arg(short, long, value_name = "BINARY")]
    binary: PathBuf,

    /// Comment database (default: <binary>.strannotate.json)
    #[arg(long, value_name = "DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a strings file and write comments
    Annotate {
        /// Strings file: {"strings":[{"offset":N,"value":"..."}]}
        strings: PathBuf,

        /// Do not write the comment database
        #[arg(long)]
        dry_run: bool,
    },

    /// List stored comments
    Comments,

    /// Show binary layout summary
    Info,

    /// Translate a file offset to its item head address
    Resolve {
        /// File offset (decimal or 0x hex)
        offset: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut session = ImageSession::open(&cli.binary, cli.db)
        .with_context(|| format!("Failed to open {}", cli.binary.display()))?;

    match cli.command {
        Commands::Annotate { strings, dry_run } => cmd_annotate(&mut session, strings, dry_run),
        Commands::Comments => cmd_comments(&session),
        Commands::Info => cmd_info(&session),
        Commands::Resolve { offset } => cmd_resolve(&session, &offset),
    }
}

fn cmd_annotate(session: &mut ImageSession, strings: PathBuf, dry_run: bool) -> Result<()> {
    let mut annotator = Annotator::new(StdoutConsole);
    let report = annotator.annotate(session, &strings);

    // 取り込みエラーはコンソールに表示済み。途中までの結果も保存する
    if dry_run {
        eprintln!("dry run: {} comments not saved", report.applied.len());
    } else if !report.applied.is_empty() {
        session.save()?;
    }

    Ok(())
}

fn cmd_comments(session: &ImageSession) -> Result<()> {
    let comments = session.comments();

    for (address, text) in comments.disassembly() {
        match comments.pseudocode_comment(address) {
            Some(pseudo) => println!("0x{:x} : {}  [pseudocode in 0x{:x}]", address, text, pseudo.function),
            None => println!("0x{:x} : {}", address, text),
        }
    }

    Ok(())
}

fn cmd_info(session: &ImageSession) -> Result<()> {
    let summary = session.summary();
    println!("{}", serde_json::to_string_pretty(&summary)?);

    println!("\nMappings:");
    for (i, m) in session.image().mappings().iter().enumerate() {
        println!(
            "   [{:3}] {:<10} file 0x{:08x}-0x{:08x} -> 0x{:016x} {}",
            i,
            m.name,
            m.file_offset,
            m.file_offset.saturating_add(m.file_size),
            m.address,
            if m.executable { "X" } else { "" }
        );
    }

    Ok(())
}

fn cmd_resolve(session: &ImageSession, offset: &str) -> Result<()> {
    let offset = parse_offset(offset)?;
    let address = session.resolve_file_offset(offset);

    if session.address_width().is_unmapped(address) {
        println!("0x{:x} : not in range of binary", offset);
    } else {
        let head = session.item_head(address);
        println!("0x{:x} -> 0x{:x} (item head 0x{:x})", offset, address, head);
    }

    Ok(())
}

fn parse_offset(text: &str) -> Result<u64> {
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => text.parse()?,
    };
    Ok(value)
}
