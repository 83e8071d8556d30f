use std::fs;
use std::process;

use thiserror::Error;

use nedparse::lexer::{self, LexError};
use nedparse::parser::{self, ParseError};
use nedparse::{codegen, optimizer};

#[derive(Debug, Error)]
enum CompileError {
    #[error("cannot open file '{filename}'")]
    FileNotFound { filename: String },
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Codegen(#[from] anyhow::Error),
}

fn compile(filename: &str) -> Result<(), CompileError> {
    let source = fs::read(filename).map_err(|_| CompileError::FileNotFound {
        filename: filename.to_string(),
    })?;

    let tokens = lexer::tokenize(&source)?;
    let mut program = parser::parse_tokens(tokens)?;

    optimizer::prune_empty_statements(&mut program.statements);
    optimizer::fold_constant_expressions(&mut program.statements);

    let ir = codegen::generate(&program.statements)?;
    print!("{ir}");

    Ok(())
}

fn main() {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| "nedparse".to_string());

    let Some(filename) = args.next() else {
        println!("{program} <filename>");
        process::exit(-1);
    };

    if let Err(error) = compile(&filename) {
        eprintln!("error: {error}");
        process::exit(-1);
    }
}
