use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use minicc::{compile, SourceFile};

/// Compile a preprocessed C source file to x86-64 assembly (Intel syntax)
#[derive(Clone, Debug, Parser)]
struct Args {
    /// input source file
    input: PathBuf,
    /// output assembly file, defaults to stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn run(args: &Args) -> Result<()> {
    let src = fs::read_to_string(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    let file = SourceFile::new(args.input.display().to_string(), src);

    let asm = compile(&file)?;

    match &args.output {
        Some(path) => fs::write(path, asm).with_context(|| format!("writing {}", path.display()))?,
        None => print!("{asm}"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
