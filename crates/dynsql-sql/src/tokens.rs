//! Token stream with byte offsets
//!
//! Wraps the sqlparser tokenizer (MsSqlDialect) and keeps every token,
//! whitespace and comments included, so that the text of a node can be
//! recovered exactly from its token range.

use sqlparser::dialect::MsSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer, TokenizerError};

/// Inclusive range of token indices covered by a syntax node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenRange {
    /// Index of the first token
    pub first: usize,

    /// Index of the last token (inclusive)
    pub last: usize,
}

impl TokenRange {
    pub fn new(first: usize, last: usize) -> Self {
        Self { first, last }
    }

    /// Range covering a single token
    pub fn single(index: usize) -> Self {
        Self { first: index, last: index }
    }

    /// Range from the start of `self` to the end of `other`
    pub fn to(self, other: TokenRange) -> Self {
        Self { first: self.first, last: other.last }
    }
}

/// A token together with its position in the source text
#[derive(Debug, Clone, PartialEq)]
pub struct SourceToken {
    pub token: Token,

    /// Byte offset of the first character
    pub offset: usize,

    /// Byte length
    pub len: usize,

    /// 1-indexed line
    pub line: u64,

    /// 1-indexed column (in characters)
    pub column: u64,
}

impl SourceToken {
    /// Byte offset one past the last character
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Whitespace and comments
    pub fn is_trivia(&self) -> bool {
        matches!(self.token, Token::Whitespace(_))
    }

    /// Value of an unquoted word token
    pub fn word(&self) -> Option<&str> {
        match &self.token {
            Token::Word(w) if w.quote_style.is_none() => Some(w.value.as_str()),
            _ => None,
        }
    }

    /// Check for an unquoted keyword, case-insensitively
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.word().is_some_and(|w| w.eq_ignore_ascii_case(keyword))
    }

    /// `@name` local variable (MsSqlDialect tokenizes it as a single word)
    pub fn is_variable(&self) -> bool {
        self.word()
            .is_some_and(|w| w.len() > 1 && w.starts_with('@') && !w.starts_with("@@"))
    }

    /// `@@NAME` system function
    pub fn is_global_variable(&self) -> bool {
        self.word().is_some_and(|w| w.len() > 2 && w.starts_with("@@"))
    }
}

/// Maps 1-indexed (line, column) positions to byte offsets
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, ch) in text.char_indices() {
            if ch == '\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    /// Byte offset of a tokenizer location. Columns count characters, not bytes.
    pub fn offset(&self, text: &str, line: u64, column: u64) -> usize {
        if line == 0 || line as usize > self.line_starts.len() {
            return text.len();
        }
        let line_start = self.line_starts[(line - 1) as usize];
        let chars_in = column.saturating_sub(1) as usize;
        text[line_start..]
            .char_indices()
            .nth(chars_in)
            .map(|(i, _)| line_start + i)
            .unwrap_or(text.len())
    }

    /// 1-indexed (line, column) of a byte offset
    pub fn position(&self, text: &str, offset: usize) -> (usize, usize) {
        let offset = offset.min(text.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = self.line_starts[line];
        let column = text[line_start..offset].chars().count() + 1;
        (line + 1, column)
    }
}

/// Forward-only walk from tokenizer locations to byte offsets
///
/// Locations arrive in source order, so the whole text is walked once.
struct OffsetCursor<'a> {
    chars: std::str::CharIndices<'a>,
    len: usize,
    line: u64,
    column: u64,
    offset: usize,
}

impl<'a> OffsetCursor<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.char_indices(),
            len: text.len(),
            line: 1,
            column: 1,
            offset: 0,
        }
    }

    /// Byte offset of `(line, column)`; `None` if it lies behind the cursor
    fn seek(&mut self, line: u64, column: u64) -> Option<usize> {
        if (line, column) < (self.line, self.column) {
            return None;
        }

        while (self.line, self.column) < (line, column) {
            let Some((i, ch)) = self.chars.next() else {
                self.offset = self.len;
                break;
            };
            self.offset = i + ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }

        Some(self.offset)
    }
}

/// Every token of a parsed text, in source order
#[derive(Debug, Clone)]
pub struct TokenStream {
    text: String,
    tokens: Vec<SourceToken>,
    lines: LineIndex,
}

impl TokenStream {
    /// Tokenize T-SQL text
    pub fn tokenize(text: &str) -> Result<Self, TokenizerError> {
        let dialect = MsSqlDialect {};
        let raw = Tokenizer::new(&dialect, text)
            .with_unescape(false)
            .tokenize_with_location()?;

        let lines = LineIndex::new(text);
        let raw: Vec<_> = raw
            .into_iter()
            .filter(|t| !matches!(t.token, Token::EOF))
            .collect();

        let mut cursor = OffsetCursor::new(text);
        let mut seek = |line: u64, column: u64| {
            cursor
                .seek(line, column)
                .unwrap_or_else(|| lines.offset(text, line, column))
        };

        let starts: Vec<usize> = raw
            .iter()
            .map(|t| seek(t.span.start.line, t.span.start.column))
            .collect();
        let last_end = raw.last().map(|t| seek(t.span.end.line, t.span.end.column));

        let mut tokens = Vec::with_capacity(raw.len());
        for (i, t) in raw.into_iter().enumerate() {
            let offset = starts[i];
            // Tokens are contiguous; the last one ends where the tokenizer stopped.
            let end = match starts.get(i + 1) {
                Some(next) => *next,
                None => last_end.unwrap_or(text.len()),
            }
            .max(offset);

            tokens.push(SourceToken {
                token: t.token,
                offset,
                len: end - offset,
                line: t.span.start.line,
                column: t.span.start.column,
            });
        }

        Ok(Self {
            text: text.to_string(),
            tokens,
            lines,
        })
    }

    /// Stream with no tokens, used when tokenizing failed
    pub fn empty(text: &str) -> Self {
        Self {
            text: text.to_string(),
            tokens: Vec::new(),
            lines: LineIndex::new(text),
        }
    }

    /// The full text that was tokenized
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[SourceToken] {
        &self.tokens
    }

    pub fn get(&self, index: usize) -> Option<&SourceToken> {
        self.tokens.get(index)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn lines(&self) -> &LineIndex {
        &self.lines
    }

    /// Byte span `(offset, len)` of a token range
    pub fn span(&self, range: TokenRange) -> (usize, usize) {
        match (self.tokens.get(range.first), self.tokens.get(range.last)) {
            (Some(first), Some(last)) if range.first <= range.last => {
                (first.offset, last.end() - first.offset)
            }
            _ => (self.text.len(), 0),
        }
    }

    /// Exact source text of a token range
    pub fn script(&self, range: TokenRange) -> &str {
        let (offset, len) = self.span(range);
        &self.text[offset..offset + len]
    }

    /// 1-indexed (line, column) of a byte offset
    pub fn position(&self, offset: usize) -> (usize, usize) {
        self.lines.position(&self.text, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tokens_are_contiguous() {
        let sql = "SET @p1 = N'SELECT 1';\n-- note\nEXEC sp_executesql @p1";
        let stream = TokenStream::tokenize(sql).unwrap();

        let joined: String = stream
            .tokens()
            .iter()
            .map(|t| &sql[t.offset..t.end()])
            .collect();
        assert_eq!(joined, sql);
        assert_eq!(stream.tokens().last().unwrap().end(), sql.len());
    }

    #[test]
    fn offsets_on_a_long_single_line() {
        let columns: Vec<String> = (0..2000).map(|i| format!("N'é{}' AS c{}, @v{}", i, i, i)).collect();
        let sql = format!("SELECT {} FROM t", columns.join(", "));
        let stream = TokenStream::tokenize(&sql).unwrap();

        let variables: Vec<&SourceToken> = stream.tokens().iter().filter(|t| t.is_variable()).collect();
        assert_eq!(variables.len(), 2000);
        for (i, token) in variables.iter().enumerate() {
            assert_eq!(&sql[token.offset..token.end()], format!("@v{}", i));
        }
        assert_eq!(stream.tokens().last().unwrap().end(), sql.len());
    }

    #[test]
    fn variables_are_single_words() {
        let stream = TokenStream::tokenize("@id=@userId + @@ROWCOUNT").unwrap();
        let variables: Vec<&str> = stream
            .tokens()
            .iter()
            .filter(|t| t.is_variable())
            .filter_map(|t| t.word())
            .collect();

        assert_eq!(variables, vec!["@id", "@userId"]);
    }

    #[test]
    fn script_recovers_national_literal() {
        let sql = "SET @q = N'it''s'";
        let stream = TokenStream::tokenize(sql).unwrap();
        let literal = stream
            .tokens()
            .iter()
            .position(|t| matches!(t.token, Token::NationalStringLiteral(_)))
            .unwrap();

        assert_eq!(stream.script(TokenRange::single(literal)), "N'it''s'");
    }

    #[test]
    fn offsets_survive_multibyte_text() {
        let sql = "SET @a = N'é';\nSET @b = 1";
        let stream = TokenStream::tokenize(sql).unwrap();
        let b = stream
            .tokens()
            .iter()
            .find(|t| t.word() == Some("@b"))
            .unwrap();

        assert_eq!(&sql[b.offset..b.end()], "@b");
        assert_eq!(stream.position(b.offset), (2, 5));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(TokenStream::tokenize("SET @a = 'oops").is_err());
    }
}
