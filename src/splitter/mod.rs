//! Statement Splitter
//!
//! Turns a stream of SQL text (a single query or a multi-gigabyte dump)
//! into delimited statements, honouring quotes, backslash escapes and
//! `DELIMITER` directives.

mod parser;
mod statement;

pub use parser::{QuoteState, StatementSplitter, DEFAULT_DELIMITER};
pub use statement::Statement;

use crate::error::Result;

/// Split a complete script in one call
pub fn split_all(text: &str) -> Result<Vec<Statement>> {
    let mut splitter = StatementSplitter::new();
    let mut statements = splitter.feed(text)?;
    if let Some(last) = splitter.finish()? {
        statements.push(last);
    }
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_all() {
        let statements = split_all("CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1)").unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].to_string(), "CREATE TABLE t (id INT)");
        assert_eq!(statements[1].as_str(), "INSERT INTO t VALUES (1)");
    }
}
