//! Streaming statement parser
//!
//! Character-at-a-time state machine. Every piece of state lives in the
//! struct, so chunk boundaries can fall anywhere, including inside a
//! quote, an escape sequence or a multi-character delimiter.

use super::statement::Statement;
use crate::error::{Error, Result};

/// Default statement delimiter
pub const DEFAULT_DELIMITER: &str = ";";

const DELIMITER_DIRECTIVE: &str = "delimiter";

/// Open quote, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteState {
    None,
    Single,
    Double,
}

impl QuoteState {
    fn for_char(c: char) -> Option<QuoteState> {
        match c {
            '\'' => Some(QuoteState::Single),
            '"' => Some(QuoteState::Double),
            _ => None,
        }
    }
}

/// Leading `--` comment handling at the start of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentState {
    None,
    /// Saw one '-' on an otherwise blank buffer
    Dash,
    /// Inside a leading `--` line, discarding until newline
    Line,
}

/// Incremental SQL statement splitter.
///
/// Feed text in chunks of any size; each call returns the statements
/// completed by that chunk. Call [`StatementSplitter::finish`] at end of
/// stream to flush a trailing statement and detect unterminated quotes.
#[derive(Debug)]
pub struct StatementSplitter {
    buffer: String,
    delimiter: String,
    quote: QuoteState,
    escaped: bool,
    seeking_delimiter: bool,
    comment: CommentState,
    /// Byte offset of the first non-whitespace character in `buffer`
    content_start: Option<usize>,
    last_char: Option<char>,
    emitted: usize,
}

impl Default for StatementSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementSplitter {
    /// Create a new splitter using the default `;` delimiter
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            quote: QuoteState::None,
            escaped: false,
            seeking_delimiter: false,
            comment: CommentState::None,
            content_start: None,
            last_char: None,
            emitted: 0,
        }
    }

    /// Currently active delimiter
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Current quote state
    pub fn quote_state(&self) -> QuoteState {
        self.quote
    }

    /// Number of statements emitted so far
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Feed a chunk of text and collect the statements it completes
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Statement>> {
        let mut out = Vec::new();
        for c in chunk.chars() {
            self.step(c, &mut out)?;
        }
        Ok(out)
    }

    /// Flush the end of the stream.
    ///
    /// Trailing text without a delimiter becomes the final statement. An
    /// open quote or an empty delimiter directive is an error.
    pub fn finish(&mut self) -> Result<Option<Statement>> {
        if self.comment == CommentState::Dash {
            self.comment = CommentState::None;
            let mut out = Vec::new();
            self.consume('-', &mut out)?;
            if let Some(statement) = out.pop() {
                return Ok(Some(statement));
            }
        }
        self.comment = CommentState::None;

        if self.seeking_delimiter {
            self.apply_delimiter()?;
            return Ok(None);
        }

        if self.quote != QuoteState::None {
            let reason = format!("unterminated {:?} quote at end of stream", self.quote);
            self.reset_buffer();
            self.quote = QuoteState::None;
            return Err(self.parse_error(reason));
        }

        let trailing = self.buffer.trim();
        let statement = if trailing.is_empty() {
            None
        } else {
            self.emitted += 1;
            Some(Statement::new(trailing))
        };
        self.reset_buffer();
        Ok(statement)
    }

    fn step(&mut self, c: char, out: &mut Vec<Statement>) -> Result<()> {
        match self.comment {
            CommentState::Line => {
                if c == '\n' || c == '\r' {
                    self.comment = CommentState::None;
                }
                return Ok(());
            }
            CommentState::Dash => {
                self.comment = CommentState::None;
                if c == '-' {
                    self.comment = CommentState::Line;
                    return Ok(());
                }
                self.consume('-', out)?;
            }
            CommentState::None => {
                if c == '-' && self.at_statement_start() {
                    self.comment = CommentState::Dash;
                    return Ok(());
                }
            }
        }
        self.consume(c, out)
    }

    fn at_statement_start(&self) -> bool {
        self.content_start.is_none()
            && !self.seeking_delimiter
            && self.quote == QuoteState::None
            && !self.delimiter.starts_with('-')
    }

    fn consume(&mut self, c: char, out: &mut Vec<Statement>) -> Result<()> {
        // A backslash escapes the next character only; "\\" cancels itself.
        self.escaped = match self.last_char {
            Some('\\') => !self.escaped,
            _ => false,
        };

        if self.content_start.is_none() && !c.is_whitespace() {
            self.content_start = Some(self.buffer.len());
        }
        self.buffer.push(c);
        self.last_char = Some(c);

        if self.seeking_delimiter {
            if c == '\n' || c == '\r' {
                self.apply_delimiter()?;
            }
            return Ok(());
        }

        if self.quote == QuoteState::None && self.is_delimiter_directive() {
            self.seeking_delimiter = true;
            self.reset_buffer();
            return Ok(());
        }

        if !self.escaped {
            if let Some(kind) = QuoteState::for_char(c) {
                if self.quote == kind {
                    self.quote = QuoteState::None;
                } else if self.quote == QuoteState::None {
                    self.quote = kind;
                }
            }
        }

        if self.quote == QuoteState::None
            && self.delimiter.ends_with(c)
            && self.buffer.ends_with(self.delimiter.as_str())
        {
            let body_len = self.buffer.len() - self.delimiter.len();
            let body = self.buffer[..body_len].trim();
            if !body.is_empty() {
                self.emitted += 1;
                out.push(Statement::new(body));
            }
            self.reset_buffer();
        }

        Ok(())
    }

    fn is_delimiter_directive(&self) -> bool {
        match self.content_start {
            Some(start) => {
                let word = &self.buffer[start..];
                word.len() == DELIMITER_DIRECTIVE.len()
                    && word.eq_ignore_ascii_case(DELIMITER_DIRECTIVE)
            }
            None => false,
        }
    }

    fn apply_delimiter(&mut self) -> Result<()> {
        let delimiter = self.buffer.trim().to_string();
        self.seeking_delimiter = false;
        self.reset_buffer();
        if delimiter.is_empty() {
            return Err(self.parse_error("empty DELIMITER directive".to_string()));
        }
        tracing::debug!("Statement delimiter changed to {:?}", delimiter);
        self.delimiter = delimiter;
        Ok(())
    }

    fn reset_buffer(&mut self) {
        self.buffer.clear();
        self.content_start = None;
        self.last_char = None;
        self.escaped = false;
    }

    fn parse_error(&self, reason: String) -> Error {
        Error::Parse {
            statement: self.emitted + 1,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn split(text: &str) -> Vec<String> {
        let mut splitter = StatementSplitter::new();
        let mut out: Vec<String> = splitter
            .feed(text)
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        if let Some(last) = splitter.finish().unwrap() {
            out.push(last.into_string());
        }
        out
    }

    fn split_in_chunks(text: &str, sizes: &mut impl FnMut() -> usize) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let mut splitter = StatementSplitter::new();
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < chars.len() {
            let end = (pos + sizes()).min(chars.len());
            let chunk: String = chars[pos..end].iter().collect();
            out.extend(splitter.feed(&chunk).unwrap().into_iter().map(String::from));
            pos = end;
        }
        if let Some(last) = splitter.finish().unwrap() {
            out.push(last.into_string());
        }
        out
    }

    #[test]
    fn test_delimiter_inside_quotes() {
        let statements = split("INSERT INTO t VALUES ('a;b', \"c;d\"); SELECT 1;");
        assert_eq!(
            statements,
            vec!["INSERT INTO t VALUES ('a;b', \"c;d\")", "SELECT 1"]
        );
    }

    #[test]
    fn test_mixed_quote_types() {
        let statements = split("SELECT \"it's; fine\"; SELECT 'say \"hi;\"';");
        assert_eq!(
            statements,
            vec!["SELECT \"it's; fine\"", "SELECT 'say \"hi;\"'"]
        );
    }

    #[test]
    fn test_escaped_quote() {
        // \' stays inside the literal
        let statements = split(r"INSERT INTO t VALUES ('it\'s; ok'); SELECT 2;");
        assert_eq!(statements, vec![r"INSERT INTO t VALUES ('it\'s; ok')", "SELECT 2"]);

        // \\' is an escaped backslash followed by a closing quote
        let statements = split(r"SELECT 'a\\'; SELECT 2;");
        assert_eq!(statements, vec![r"SELECT 'a\\'", "SELECT 2"]);
    }

    #[test]
    fn test_delimiter_directive() {
        let script = "DELIMITER //\n\
                      CREATE PROCEDURE p() BEGIN SELECT 1; SELECT 2; END//\n\
                      DELIMITER ;\n\
                      SELECT 3;";
        let mut splitter = StatementSplitter::new();
        let statements = splitter.feed(script).unwrap();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[0].as_str(),
            "CREATE PROCEDURE p() BEGIN SELECT 1; SELECT 2; END"
        );
        assert_eq!(statements[1].as_str(), "SELECT 3");
        assert_eq!(splitter.delimiter(), ";");
        assert!(splitter.finish().unwrap().is_none());
    }

    #[test]
    fn test_delimiter_directive_case_and_position() {
        let script = "SELECT 1;\n  delimiter $$\nSELECT 2$$\nDeLiMiTeR ;\r\nSELECT 3;";
        assert_eq!(split(script), vec!["SELECT 1", "SELECT 2", "SELECT 3"]);
    }

    #[test]
    fn test_multichar_delimiter_split_across_chunks() {
        let mut splitter = StatementSplitter::new();
        assert!(splitter.feed("DELIMITER $$\nSELECT 1$").unwrap().is_empty());
        let statements = splitter.feed("$ SELECT '$$'$").unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].as_str(), "SELECT 1");
        let statements = splitter.feed("$").unwrap();
        assert_eq!(statements[0].as_str(), "SELECT '$$'");
    }

    #[test]
    fn test_leading_comments_stripped() {
        let script = "-- dump header\n-- generated\n\nSELECT 1;\n-- between\nSELECT -2;\n-- trailing";
        assert_eq!(split(script), vec!["SELECT 1", "SELECT -2"]);
        // A lone dash is not a comment
        assert_eq!(split("-1;"), vec!["-1"]);
    }

    #[test]
    fn test_blank_input() {
        assert!(split("").is_empty());
        assert!(split("  \n\r\n\t").is_empty());
        assert!(split("-- only a comment\n-- and another").is_empty());
        assert!(split(";;  ;").is_empty());

        let statements = StatementSplitter::new().feed("A;;B;").unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_trailing_statement_without_delimiter() {
        assert_eq!(split("SELECT 1; SELECT 2"), vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_unterminated_quote_is_error() {
        let mut splitter = StatementSplitter::new();
        let statements = splitter.feed("SELECT 1; INSERT INTO t VALUES ('oops;").unwrap();
        assert_eq!(statements.len(), 1);
        assert_eq!(splitter.quote_state(), QuoteState::Single);
        match splitter.finish() {
            Err(Error::Parse { statement, .. }) => assert_eq!(statement, 2),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_delimiter_is_error() {
        let mut splitter = StatementSplitter::new();
        assert!(matches!(
            splitter.feed("DELIMITER   \nSELECT 1;"),
            Err(Error::Parse { .. })
        ));

        // Directive cut off by end of stream still applies
        let mut splitter = StatementSplitter::new();
        splitter.feed("DELIMITER //").unwrap();
        assert!(splitter.finish().unwrap().is_none());
        assert_eq!(splitter.delimiter(), "//");
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let script = "-- header\nINSERT INTO t VALUES ('a;b\\'c', \"d;e\");\n\
                      DELIMITER ;;\n\
                      CREATE TRIGGER tr BEFORE INSERT ON t FOR EACH ROW BEGIN SET @x = ';'; END;;\n\
                      DELIMITER ;\n\
                      UPDATE t SET v = 'x\\\\' WHERE id = 1;\n\
                      SELECT 'tail'";
        let whole = split(script);
        assert_eq!(whole.len(), 4);

        let mut one = || 1;
        assert_eq!(split_in_chunks(script, &mut one), whole);

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut sizes = || rng.gen_range(1..=16);
            assert_eq!(split_in_chunks(script, &mut sizes), whole);
        }
    }

    #[test]
    fn test_balanced_literals_survive_splitting() {
        let mut rng = StdRng::seed_from_u64(42);
        let alphabet: Vec<char> = "ab;; \n'\"\\$".chars().collect();

        for _ in 0..100 {
            let mut expected = Vec::new();
            for i in 0..rng.gen_range(1..8) {
                let mut literal = String::new();
                for _ in 0..rng.gen_range(0..12) {
                    let c = alphabet[rng.gen_range(0..alphabet.len())];
                    match c {
                        '\'' => literal.push_str("''"),
                        '\\' => literal.push_str("\\\\"),
                        other => literal.push(other),
                    }
                }
                expected.push(format!("INSERT INTO t VALUES ({}, '{}')", i, literal));
            }
            let script = expected.join(";\n") + ";";
            let mut sizes = || rng.gen_range(1..=32);
            assert_eq!(split_in_chunks(&script, &mut sizes), expected);
        }
    }
}
