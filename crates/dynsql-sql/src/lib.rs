//! T-SQL front-end
//!
//! This crate handles:
//! - Tokenizing T-SQL with byte offsets and exact source slices
//! - Parsing scripts into a syntax tree of statements and expressions
//! - Visiting the tree by node kind
//! - Reporting structural errors as diagnostics

pub mod tokens;
pub mod ast;
pub mod visitor;
pub mod parser;

pub use tokens::{TokenStream, TokenRange, SourceToken, LineIndex};
pub use ast::*;
pub use visitor::{Visitor, walk_script, walk_statement, walk_expr, walk_fragment};
pub use parser::{SqlParser, ParsedScript, ParseError, ReadError};
