//! Statement value emitted by the splitter

use std::fmt;

/// One complete, trimmed SQL statement without its delimiter.
///
/// Only the splitter constructs statements, so a `Statement` never ends
/// inside an open quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Statement(String);

impl Statement {
    pub(crate) fn new(text: &str) -> Self {
        Self(text.to_string())
    }

    /// Statement text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned text
    pub fn into_string(self) -> String {
        self.0
    }

    /// Length of the statement text in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the statement text is empty. Never true for splitter output.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Statement {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Statement> for String {
    fn from(statement: Statement) -> Self {
        statement.0
    }
}
