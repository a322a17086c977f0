#![forbid(unsafe_code)]
//! A compiler for a substantial subset of C, producing x86-64 assembly in
//! Intel syntax. The pipeline is a lexer, a recursive-descent parser that
//! resolves names and elaborates types, and a stack-machine code generator.
//! Input is a single, already preprocessed translation unit; compilation is
//! single-shot and the first diagnostic is fatal.

pub mod ast;
pub mod codegen;
pub mod parse;
pub mod token;
pub mod ty;

#[cfg(test)]
mod test;

use anyhow::Result;

pub use token::SourceFile;

/// Compiles one translation unit to assembly text.
pub fn compile(file: &SourceFile) -> Result<String> {
    let toks = token::tokenize(file)?;
    let mut parser = parse::Parser::new(file, toks);
    let prog = parser.program()?;
    codegen::codegen(file, &prog)
}
