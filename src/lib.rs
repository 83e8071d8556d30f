//! `nedparse` library crate.
//!
//! Compiler front end for the NEdit macro language:
//! - `input` + `lexer` turn the raw byte stream into tokens
//! - `parser` builds the `ast` by recursive descent
//! - `optimizer` prunes blank-line placeholders and folds constants
//! - `codegen` lowers the tree into a printable stack-machine IR
pub mod ast;
pub mod codegen;
pub mod input;
pub mod lexer;
pub mod optimizer;
pub mod parser;
pub mod token;
