//! The SuDB command dialect: a compact SQL-like language over the two-level
//! `collection.database` namespace.

mod parser;
mod statement;

pub use parser::parse;
pub use statement::Statement;
