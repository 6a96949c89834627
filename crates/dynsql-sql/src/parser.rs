//! T-SQL script parsing
//!
//! Statement-level parser over the sqlparser token stream. It models the
//! statements that carry variables (`SET`, `DECLARE`, `EXEC`) and the
//! control flow around them; every other statement is kept as a fragment
//! that still exposes its variable references.

use sqlparser::tokenizer::Token;
use dynsql_core::{Diagnostic, DiagnosticCode, Location};
use std::path::{Path, PathBuf};

use crate::ast::*;
use crate::tokens::{SourceToken, TokenRange, TokenStream};

/// Keywords that always begin a new statement
const BOUNDARY_KEYWORDS: &[&str] = &[
    "BEGIN", "BREAK", "COMMIT", "CONTINUE", "DECLARE", "ELSE", "END", "EXEC", "EXECUTE",
    "GO", "IF", "PRINT", "RAISERROR", "RETURN", "ROLLBACK", "THROW", "USE", "WHILE",
];

/// Keywords that begin a statement but may also continue one (`INSERT ... SELECT`)
const STATEMENT_KEYWORDS: &[&str] = &[
    "ALTER", "BACKUP", "BULK", "CHECKPOINT", "CLOSE", "CREATE", "DBCC", "DEALLOCATE", "DELETE",
    "DENY", "DROP", "FETCH", "GOTO", "GRANT", "INSERT", "KILL", "MERGE", "OPEN", "RESTORE",
    "REVOKE", "SAVE", "SELECT", "SET", "TRUNCATE", "UPDATE", "WAITFOR", "WITH",
];

/// Clause keywords that can never be an operand
const CLAUSE_KEYWORDS: &[&str] = &[
    "AND", "AS", "FROM", "GROUP", "HAVING", "ON", "OR", "ORDER", "THEN", "UNION", "WHEN", "WHERE",
];

fn is_boundary(token: &SourceToken) -> bool {
    BOUNDARY_KEYWORDS.iter().any(|kw| token.is_keyword(kw))
}

fn starts_statement(token: &SourceToken) -> bool {
    is_boundary(token) || STATEMENT_KEYWORDS.iter().any(|kw| token.is_keyword(kw))
}

fn is_reserved(token: &SourceToken) -> bool {
    starts_statement(token) || CLAUSE_KEYWORDS.iter().any(|kw| token.is_keyword(kw))
}

fn variable_ref(index: usize, token: &SourceToken) -> VariableRef {
    VariableRef {
        name: token.word().unwrap_or_default().to_string(),
        offset: token.offset,
        length: token.len,
        range: TokenRange::single(index),
    }
}

/// SQL parser for T-SQL scripts
pub struct SqlParser;

impl SqlParser {
    /// Create a new SQL parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a script
    ///
    /// Always returns a tree; structural problems are collected in
    /// `ParsedScript::errors` and parsing resumes at the next statement.
    pub fn parse(&self, sql: &str, file_path: Option<&Path>) -> ParsedScript {
        let (tokens, tree, errors) = match TokenStream::tokenize(sql) {
            Ok(tokens) => {
                let (tree, errors) = ScriptParser::new(&tokens).parse();
                (tokens, tree, errors)
            }
            Err(e) => {
                let tokens = TokenStream::empty(sql);
                let error = ParseError {
                    message: e.message.clone(),
                    offset: tokens.lines().offset(sql, e.location.line, e.location.column),
                    line: e.location.line as usize,
                    column: e.location.column as usize,
                };
                (tokens, Script::default(), vec![error])
            }
        };

        ParsedScript {
            tree,
            tokens,
            errors,
            file_path: file_path.map(|p| p.to_path_buf()),
        }
    }

    /// Parse a script from a file
    pub fn parse_file(&self, path: &Path) -> Result<ParsedScript, ReadError> {
        let sql = std::fs::read_to_string(path).map_err(|source| ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(self.parse(&sql, Some(path)))
    }
}

impl Default for SqlParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of parsing a script: tree, token stream and structural errors
#[derive(Debug, Clone)]
pub struct ParsedScript {
    pub tree: Script,

    pub tokens: TokenStream,

    pub errors: Vec<ParseError>,

    /// Source file path (if parsed from file)
    pub file_path: Option<PathBuf>,
}

impl ParsedScript {
    /// The parsed text
    pub fn text(&self) -> &str {
        self.tokens.text()
    }

    /// True when the front-end reported no errors
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Exact source text of a node
    pub fn script<N: Spanned + ?Sized>(&self, node: &N) -> &str {
        self.tokens.script(node.range())
    }

    pub fn statement_count(&self) -> usize {
        self.tree.statements.len()
    }

    /// Parse errors as diagnostics
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.errors
            .iter()
            .map(|e| e.to_diagnostic(self.file_path.as_deref()))
            .collect()
    }
}

/// Structural error reported by the front-end
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
    pub message: String,

    /// Byte offset in the parsed text
    pub offset: usize,

    /// 1-indexed line
    pub line: usize,

    /// 1-indexed column
    pub column: usize,
}

impl ParseError {
    /// Convert to a diagnostic
    pub fn to_diagnostic(&self, file_path: Option<&Path>) -> Diagnostic {
        let file = file_path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<input>".to_string());

        Diagnostic::error(DiagnosticCode::SqlParseError, self.message.clone())
            .with_location(Location::with_position(file, self.line, self.column).at_offset(self.offset))
    }
}

/// Failure to read a script from disk
#[derive(Debug, thiserror::Error)]
#[error("Failed to read {}: {}", .path.display(), .source)]
pub struct ReadError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

type PResult<T> = Result<T, ParseError>;

struct ScriptParser<'a> {
    stream: &'a TokenStream,
    /// Indices of non-trivia tokens
    significant: Vec<usize>,
    pos: usize,
    errors: Vec<ParseError>,
}

impl<'a> ScriptParser<'a> {
    fn new(stream: &'a TokenStream) -> Self {
        let significant = stream
            .tokens()
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.is_trivia())
            .map(|(i, _)| i)
            .collect();

        Self {
            stream,
            significant,
            pos: 0,
            errors: Vec::new(),
        }
    }

    fn parse(mut self) -> (Script, Vec<ParseError>) {
        let statements = self.parse_statements(false);
        (Script { statements }, self.errors)
    }

    // ----- cursor ------------------------------------------------------------

    fn current(&self) -> Option<(usize, &'a SourceToken)> {
        self.nth(0)
    }

    fn nth(&self, n: usize) -> Option<(usize, &'a SourceToken)> {
        let index = *self.significant.get(self.pos + n)?;
        self.stream.get(index).map(|t| (index, t))
    }

    fn peek(&self) -> Option<&'a SourceToken> {
        self.current().map(|(_, t)| t)
    }

    fn peek_nth(&self, n: usize) -> Option<&'a SourceToken> {
        self.nth(n).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<usize> {
        let index = *self.significant.get(self.pos)?;
        self.pos += 1;
        Some(index)
    }

    fn last_consumed(&self) -> usize {
        self.pos
            .checked_sub(1)
            .and_then(|p| self.significant.get(p))
            .copied()
            .unwrap_or(0)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.at_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn at_token(&self, token: &Token) -> bool {
        self.peek().is_some_and(|t| &t.token == token)
    }

    fn eat_token(&mut self, token: &Token) -> bool {
        if self.at_token(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_token(&mut self, token: &Token, what: &str) -> PResult<usize> {
        if self.at_token(token) {
            return self.advance().ok_or_else(|| self.error_here(format!("Expected {}", what)));
        }
        Err(self.error_here(format!("Expected {}, found {}", what, self.found())))
    }

    fn expect_variable(&mut self) -> PResult<VariableRef> {
        match self.current() {
            Some((index, token)) if token.is_variable() => {
                self.pos += 1;
                Ok(variable_ref(index, token))
            }
            _ => Err(self.error_here(format!("Expected variable, found {}", self.found()))),
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.current() {
            Some((_, SourceToken { token: Token::Word(w), .. })) => {
                self.pos += 1;
                Ok(w.value.clone())
            }
            _ => Err(self.error_here(format!("Expected identifier, found {}", self.found()))),
        }
    }

    fn skip_semicolons(&mut self) {
        while self.eat_token(&Token::SemiColon) {}
    }

    fn at_statement_end(&self) -> bool {
        match self.peek() {
            None => true,
            Some(t) => t.token == Token::SemiColon || starts_statement(t),
        }
    }

    fn expect_statement_end(&self) -> PResult<()> {
        if self.at_statement_end() {
            Ok(())
        } else {
            Err(self.error_here(format!("Incorrect syntax near {}", self.found())))
        }
    }

    // ----- errors ------------------------------------------------------------

    fn found(&self) -> String {
        match self.current() {
            Some((index, _)) => format!("'{}'", self.stream.script(TokenRange::single(index))),
            None => "end of input".to_string(),
        }
    }

    fn error_here(&self, message: impl Into<String>) -> ParseError {
        match self.current() {
            Some((index, _)) => self.error_at(index, message),
            None => self.error_at_offset(self.stream.text().len(), message),
        }
    }

    fn error_at(&self, index: usize, message: impl Into<String>) -> ParseError {
        let offset = self.stream.get(index).map(|t| t.offset).unwrap_or(self.stream.text().len());
        self.error_at_offset(offset, message)
    }

    fn error_at_offset(&self, offset: usize, message: impl Into<String>) -> ParseError {
        let (line, column) = self.stream.position(offset);
        ParseError {
            message: message.into(),
            offset,
            line,
            column,
        }
    }

    /// Skip to the next statement boundary, always making progress
    fn recover(&mut self, start: usize) {
        if self.pos == start && self.pos < self.significant.len() {
            self.pos += 1;
        }
        while let Some(token) = self.peek() {
            if token.token == Token::SemiColon || starts_statement(token) {
                break;
            }
            self.pos += 1;
        }
    }

    // ----- statements --------------------------------------------------------

    fn parse_statements(&mut self, in_block: bool) -> Vec<Statement> {
        let mut statements = Vec::new();

        loop {
            self.skip_semicolons();
            let Some((index, token)) = self.current() else {
                break;
            };

            if token.is_keyword("END") {
                if in_block {
                    break;
                }
                self.pos += 1;
                self.errors.push(self.error_at(index, "END without matching BEGIN"));
                continue;
            }

            let start = self.pos;
            match self.parse_statement() {
                Ok(statement) => statements.push(statement),
                Err(error) => {
                    self.errors.push(error);
                    self.recover(start);
                }
            }
        }

        statements
    }

    fn parse_statement(&mut self) -> PResult<Statement> {
        let Some((index, token)) = self.current() else {
            return Err(self.error_here("Expected statement, found end of input"));
        };
        let next_is_variable = self.peek_nth(1).is_some_and(SourceToken::is_variable);

        if token.is_keyword("SET") && next_is_variable {
            if self.at_compound_assignment() {
                return self.parse_other().map(Statement::Other);
            }
            return self.parse_set().map(Statement::SetVariable);
        }
        if token.is_keyword("DECLARE") && next_is_variable {
            return self.parse_declare().map(Statement::Declare);
        }
        if token.is_keyword("EXEC") || token.is_keyword("EXECUTE") {
            return self.parse_execute().map(Statement::Execute);
        }
        if token.is_keyword("BEGIN") && !self.at_begin_statement() {
            return self.parse_block().map(Statement::Block);
        }
        if token.is_keyword("IF") {
            return self.parse_if().map(Statement::If);
        }
        if token.is_keyword("WHILE") {
            return self.parse_while().map(Statement::While);
        }
        if token.is_keyword("ELSE") {
            return Err(self.error_at(index, "ELSE without matching IF"));
        }

        self.parse_other().map(Statement::Other)
    }

    /// `BEGIN TRAN`, `BEGIN DISTRIBUTED TRANSACTION`, `BEGIN DIALOG` ...
    fn at_begin_statement(&self) -> bool {
        self.peek_nth(1).is_some_and(|t| {
            ["TRAN", "TRANSACTION", "DISTRIBUTED", "DIALOG", "CONVERSATION"]
                .iter()
                .any(|kw| t.is_keyword(kw))
        })
    }

    /// `SET @x += 1`
    fn at_compound_assignment(&self) -> bool {
        let operator = self.peek_nth(2).is_some_and(|t| {
            matches!(
                t.token,
                Token::Plus
                    | Token::Minus
                    | Token::Mul
                    | Token::Div
                    | Token::Mod
                    | Token::Ampersand
                    | Token::Pipe
                    | Token::Caret
            )
        });
        operator && self.peek_nth(3).is_some_and(|t| t.token == Token::Eq)
    }

    fn parse_set(&mut self) -> PResult<SetVariable> {
        let start = self.expect_keyword_index("SET")?;
        let variable = self.expect_variable()?;

        if !self.eat_token(&Token::Eq) {
            return Err(self.error_here(format!(
                "Expected '=' after {}, found {}",
                variable.name,
                self.found()
            )));
        }

        let expression = self.parse_value(false)?;
        self.expect_statement_end()?;

        Ok(SetVariable {
            variable,
            expression,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    fn parse_declare(&mut self) -> PResult<Declare> {
        let start = self.expect_keyword_index("DECLARE")?;
        let mut declarations = Vec::new();

        loop {
            let variable = self.expect_variable()?;
            let first = variable.range.first;
            self.eat_keyword("AS");
            let data_type = self.parse_data_type()?;
            let initializer = if self.eat_token(&Token::Eq) {
                Some(self.parse_value(true)?)
            } else {
                None
            };

            declarations.push(VariableDeclaration {
                variable,
                data_type,
                initializer,
                range: TokenRange::new(first, self.last_consumed()),
            });

            if !self.eat_token(&Token::Comma) {
                break;
            }
        }

        self.expect_statement_end()?;

        Ok(Declare {
            declarations,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    fn parse_data_type(&mut self) -> PResult<TokenRange> {
        let first = match self.current() {
            Some((index, t)) if matches!(t.token, Token::Word(_)) && !t.is_variable() && !is_reserved(t) => index,
            _ => return Err(self.error_here(format!("Expected data type, found {}", self.found()))),
        };

        while let Some(token) = self.peek() {
            match &token.token {
                Token::Word(_) if !token.is_variable() && !is_reserved(token) => self.pos += 1,
                Token::Period => self.pos += 1,
                Token::LParen => {
                    self.parse_paren_fragment()?;
                }
                _ => break,
            }
        }

        Ok(TokenRange::new(first, self.last_consumed()))
    }

    fn parse_execute(&mut self) -> PResult<Execute> {
        let start = match self.advance() {
            Some(index) => index,
            None => return Err(self.error_here("Expected EXEC")),
        };

        if self.at_token(&Token::LParen) {
            self.advance();
            let mut parts = vec![self.parse_expr()?];
            while self.eat_token(&Token::Comma) {
                parts.push(self.parse_expr()?);
            }
            self.expect_token(&Token::RParen, "')'")?;
            self.skip_execute_options()?;
            self.expect_statement_end()?;

            return Ok(Execute {
                return_status: None,
                entity: ExecutableEntity::AdHoc { parts },
                range: TokenRange::new(start, self.last_consumed()),
            });
        }

        let return_status = if self.at_named_argument() {
            let status = self.expect_variable()?;
            self.advance();
            Some(status)
        } else {
            None
        };

        let entity = match self.peek() {
            Some(t) if t.is_variable() => {
                let variable = self.expect_variable()?;
                let parameters = self.parse_execute_parameters()?;
                ExecutableEntity::ProcedureVariable { variable, parameters }
            }
            Some(t) if matches!(t.token, Token::Word(_)) && !is_reserved(t) => {
                let name = self.parse_object_name()?;
                let parameters = self.parse_execute_parameters()?;
                ExecutableEntity::Procedure { name, parameters }
            }
            _ => {
                return Err(self.error_here(format!(
                    "Expected procedure name after EXEC, found {}",
                    self.found()
                )))
            }
        };

        self.skip_execute_options()?;
        self.expect_statement_end()?;

        Ok(Execute {
            return_status,
            entity,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    /// `@name = ...`
    fn at_named_argument(&self) -> bool {
        self.peek().is_some_and(SourceToken::is_variable)
            && self.peek_nth(1).is_some_and(|t| t.token == Token::Eq)
    }

    fn parse_execute_parameters(&mut self) -> PResult<Vec<ExecuteParameter>> {
        let mut parameters = Vec::new();
        if self.at_statement_end() {
            return Ok(parameters);
        }

        loop {
            let first = match self.current() {
                Some((index, _)) => index,
                None => return Err(self.error_here("Expected parameter, found end of input")),
            };

            let variable = if self.at_named_argument() {
                let variable = self.expect_variable()?;
                self.advance();
                Some(variable)
            } else {
                None
            };

            let value = self.parse_expr()?;
            let output = self.eat_keyword("OUTPUT") || self.eat_keyword("OUT");

            parameters.push(ExecuteParameter {
                variable,
                value,
                output,
                range: TokenRange::new(first, self.last_consumed()),
            });

            if !self.eat_token(&Token::Comma) {
                break;
            }
        }

        Ok(parameters)
    }

    /// `WITH RECOMPILE`, `WITH RESULT SETS (...)`, `AS USER = '...'`, `AT server`
    fn skip_execute_options(&mut self) -> PResult<()> {
        if !(self.at_keyword("WITH") || self.at_keyword("AS") || self.at_keyword("AT")) {
            return Ok(());
        }
        self.advance();

        while let Some(token) = self.peek() {
            if token.token == Token::SemiColon {
                break;
            }
            if token.token == Token::LParen {
                self.parse_paren_fragment()?;
            } else if starts_statement(token) {
                break;
            } else {
                self.pos += 1;
            }
        }
        Ok(())
    }

    fn parse_object_name(&mut self) -> PResult<ObjectName> {
        let first = match self.current() {
            Some((index, _)) => index,
            None => return Err(self.error_here("Expected name, found end of input")),
        };

        let mut parts = vec![self.expect_identifier()?];
        while self.eat_token(&Token::Period) {
            if self.at_token(&Token::Period) {
                parts.push(String::new());
                continue;
            }
            parts.push(self.expect_identifier()?);
        }

        Ok(ObjectName {
            parts,
            range: TokenRange::new(first, self.last_consumed()),
        })
    }

    fn parse_block(&mut self) -> PResult<Block> {
        let start = self.expect_keyword_index("BEGIN")?;
        let kind = if self.eat_keyword("TRY") {
            BlockKind::Try
        } else if self.eat_keyword("CATCH") {
            BlockKind::Catch
        } else {
            BlockKind::Plain
        };

        let statements = self.parse_statements(true);

        if !self.eat_keyword("END") {
            return Err(self.error_at(start, "BEGIN without matching END"));
        }
        match kind {
            BlockKind::Try if !self.eat_keyword("TRY") => {
                return Err(self.error_here(format!("Expected END TRY, found {}", self.found())));
            }
            BlockKind::Catch if !self.eat_keyword("CATCH") => {
                return Err(self.error_here(format!("Expected END CATCH, found {}", self.found())));
            }
            _ => {}
        }

        Ok(Block {
            kind,
            statements,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    fn parse_if(&mut self) -> PResult<IfStatement> {
        let start = self.expect_keyword_index("IF")?;
        let predicate = self.parse_expr()?;
        let then = Box::new(self.parse_body("IF")?);

        let before_else = self.pos;
        self.skip_semicolons();
        let otherwise = if self.eat_keyword("ELSE") {
            Some(Box::new(self.parse_body("ELSE")?))
        } else {
            self.pos = before_else;
            None
        };

        Ok(IfStatement {
            predicate,
            then,
            otherwise,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    fn parse_while(&mut self) -> PResult<WhileStatement> {
        let start = self.expect_keyword_index("WHILE")?;
        let predicate = self.parse_expr()?;
        let body = Box::new(self.parse_body("WHILE")?);

        Ok(WhileStatement {
            predicate,
            body,
            range: TokenRange::new(start, self.last_consumed()),
        })
    }

    /// Statement controlled by IF / ELSE / WHILE
    fn parse_body(&mut self, owner: &str) -> PResult<Statement> {
        self.skip_semicolons();
        match self.peek() {
            None => Err(self.error_here(format!("Expected statement after {}, found end of input", owner))),
            Some(t) if t.is_keyword("END") => {
                Err(self.error_here(format!("Expected statement after {}, found 'END'", owner)))
            }
            Some(_) => self.parse_statement(),
        }
    }

    fn parse_other(&mut self) -> PResult<Fragment> {
        let start = match self.current() {
            Some((index, _)) => index,
            None => return Err(self.error_here("Expected statement, found end of input")),
        };

        let mut references = Vec::new();
        let mut open_parens: Vec<usize> = Vec::new();
        let mut case_depth = 0usize;
        // An UPDATE (standalone or in a MERGE WHEN clause) owns the next SET only
        let mut owns_set = false;
        let mut last = start;

        while let Some((index, token)) = self.current() {
            let top_level = open_parens.is_empty() && case_depth == 0;
            if index != start && top_level {
                if token.token == Token::SemiColon || is_boundary(token) {
                    break;
                }
                if token.is_keyword("SET") && !owns_set {
                    break;
                }
            }

            match &token.token {
                Token::LParen => open_parens.push(index),
                Token::RParen => {
                    if open_parens.pop().is_none() {
                        return Err(self.error_at(index, "Unexpected ')'"));
                    }
                }
                _ if token.is_keyword("CASE") => case_depth += 1,
                _ if token.is_keyword("END") && case_depth > 0 => case_depth -= 1,
                _ if token.is_keyword("UPDATE") && top_level => {
                    owns_set = !self.peek_nth(1).is_some_and(|t| t.is_keyword("STATISTICS"));
                }
                _ if token.is_keyword("SET") && top_level => owns_set = false,
                _ if token.is_variable() => references.push(variable_ref(index, token)),
                _ => {}
            }

            last = index;
            self.pos += 1;
        }

        if let Some(open) = open_parens.first() {
            return Err(self.error_at(*open, "Unclosed '('"));
        }
        if case_depth > 0 {
            return Err(self.error_here(format!("Expected END for CASE, found {}", self.found())));
        }

        Ok(Fragment {
            references,
            range: TokenRange::new(start, last),
        })
    }

    /// Right-hand side of an assignment
    ///
    /// Falls back to the raw tokens up to the end of the statement (or the
    /// next declaration in a list) when the expression grammar does not
    /// cover them, e.g. `NEXT VALUE FOR dbo.seq` or `$5.00`.
    fn parse_value(&mut self, in_list: bool) -> PResult<Expr> {
        let start = self.pos;
        let parsed = self.parse_expr();
        if parsed.is_ok() && (self.at_statement_end() || (in_list && self.at_token(&Token::Comma))) {
            return parsed;
        }

        self.pos = start;
        match self.parse_value_fragment(in_list)? {
            Some(fragment) => Ok(Expr::Fragment(fragment)),
            None => Err(parsed
                .err()
                .unwrap_or_else(|| self.error_here(format!("Expected expression, found {}", self.found())))),
        }
    }

    fn parse_value_fragment(&mut self, in_list: bool) -> PResult<Option<Fragment>> {
        let Some((first, _)) = self.current() else {
            return Ok(None);
        };

        let mut references = Vec::new();
        let mut open_parens: Vec<usize> = Vec::new();
        let mut case_depth = 0usize;
        let mut last = None;

        while let Some((index, token)) = self.current() {
            if open_parens.is_empty() && case_depth == 0 {
                let at_end = token.token == Token::SemiColon
                    || starts_statement(token)
                    || (in_list && token.token == Token::Comma);
                if at_end {
                    break;
                }
            }

            match &token.token {
                Token::LParen => open_parens.push(index),
                Token::RParen => {
                    if open_parens.pop().is_none() {
                        return Err(self.error_at(index, "Unexpected ')'"));
                    }
                }
                _ if token.is_keyword("CASE") => case_depth += 1,
                _ if token.is_keyword("END") && case_depth > 0 => case_depth -= 1,
                _ if token.is_variable() => references.push(variable_ref(index, token)),
                _ => {}
            }

            last = Some(index);
            self.pos += 1;
        }

        if let Some(open) = open_parens.first() {
            return Err(self.error_at(*open, "Unclosed '('"));
        }
        if case_depth > 0 {
            return Err(self.error_here(format!("Expected END for CASE, found {}", self.found())));
        }

        Ok(last.map(|last| Fragment {
            references,
            range: TokenRange::new(first, last),
        }))
    }

    fn expect_keyword_index(&mut self, keyword: &str) -> PResult<usize> {
        match self.current() {
            Some((index, t)) if t.is_keyword(keyword) => {
                self.pos += 1;
                Ok(index)
            }
            _ => Err(self.error_here(format!("Expected {}, found {}", keyword, self.found()))),
        }
    }

    // ----- expressions -------------------------------------------------------

    fn parse_expr(&mut self) -> PResult<Expr> {
        let mut left = self.parse_unary()?;

        loop {
            if self.eat_keyword("COLLATE") {
                self.expect_identifier()?;
                continue;
            }

            if self.at_keyword("IS") {
                self.advance();
                let negated = self.eat_keyword("NOT");
                let null = self.expect_keyword_index("NULL")?;
                let range = TokenRange::new(left.range().first, null);
                let op = if negated { "IS NOT NULL" } else { "IS NULL" };
                left = Expr::Unary {
                    op: op.to_string(),
                    operand: Box::new(left),
                    range,
                };
                continue;
            }

            let Some((op, width)) = self.peek_binary_operator() else {
                break;
            };
            self.pos += width;

            let right = self.parse_unary()?;
            let range = left.range().to(right.range());
            left = Expr::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
                range,
            };
        }

        Ok(left)
    }

    /// Operator at the cursor and the number of tokens it spans
    fn peek_binary_operator(&self) -> Option<(String, usize)> {
        let token = self.peek()?;
        let op = match &token.token {
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Mul => "*",
            Token::Div => "/",
            Token::Mod => "%",
            Token::Eq => "=",
            Token::Neq => "<>",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::LtEq => "<=",
            Token::GtEq => ">=",
            Token::Ampersand => "&",
            Token::Pipe => "|",
            Token::Caret => "^",
            Token::StringConcat => "||",
            Token::Word(_) => {
                if let Some(kw) = ["AND", "OR", "LIKE", "IN", "BETWEEN"]
                    .into_iter()
                    .find(|kw| token.is_keyword(kw))
                {
                    return Some((kw.to_string(), 1));
                }
                if token.is_keyword("NOT") {
                    let next = self.peek_nth(1)?;
                    return ["LIKE", "IN", "BETWEEN"]
                        .into_iter()
                        .find(|kw| next.is_keyword(kw))
                        .map(|kw| (format!("NOT {}", kw), 2));
                }
                return None;
            }
            _ => return None,
        };
        Some((op.to_string(), 1))
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        let Some((start, token)) = self.current() else {
            return Err(self.error_here("Expected expression, found end of input"));
        };

        let op = match &token.token {
            Token::Minus => Some("-"),
            Token::Plus => Some("+"),
            Token::Tilde => Some("~"),
            _ if token.is_keyword("NOT") => Some("NOT"),
            _ if token.is_keyword("EXISTS") => Some("EXISTS"),
            _ => None,
        };

        let Some(op) = op else {
            return self.parse_primary();
        };

        self.pos += 1;
        let operand = self.parse_unary()?;
        let range = TokenRange::new(start, operand.range().last);
        Ok(Expr::Unary {
            op: op.to_string(),
            operand: Box::new(operand),
            range,
        })
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        let Some((index, token)) = self.current() else {
            return Err(self.error_here("Expected expression, found end of input"));
        };

        let literal = |kind| Expr::Literal {
            kind,
            range: TokenRange::single(index),
        };

        match &token.token {
            Token::SingleQuotedString(_) => {
                self.pos += 1;
                Ok(literal(LiteralKind::String))
            }
            Token::NationalStringLiteral(_) => {
                self.pos += 1;
                Ok(literal(LiteralKind::NationalString))
            }
            Token::Number(..) => {
                self.pos += 1;
                Ok(literal(LiteralKind::Number))
            }
            Token::HexStringLiteral(_) => {
                self.pos += 1;
                Ok(literal(LiteralKind::Binary))
            }
            // Some tokenizer versions split `@@NAME` into `@@` and a word
            Token::AtAt => {
                self.pos += 1;
                let name = self.expect_identifier()?;
                Ok(Expr::GlobalVariable {
                    name: format!("@@{}", name),
                    range: TokenRange::new(index, self.last_consumed()),
                })
            }
            Token::LParen => self.parse_parenthesized(),
            Token::Word(w) => {
                if token.is_variable() {
                    self.pos += 1;
                    return Ok(Expr::Variable(variable_ref(index, token)));
                }
                if token.is_global_variable() {
                    self.pos += 1;
                    return Ok(Expr::GlobalVariable {
                        name: w.value.clone(),
                        range: TokenRange::single(index),
                    });
                }
                if token.is_keyword("NULL") {
                    self.pos += 1;
                    return Ok(literal(LiteralKind::Null));
                }
                if token.is_keyword("DEFAULT") {
                    self.pos += 1;
                    return Ok(literal(LiteralKind::Default));
                }
                if token.is_keyword("CASE") {
                    return self.parse_case().map(Expr::Case);
                }
                if is_reserved(token) {
                    return Err(self.error_at(index, format!("Expected expression, found '{}'", w.value)));
                }

                let name = self.parse_object_name()?;
                if self.at_token(&Token::LParen) {
                    let arguments = self.parse_paren_fragment()?;
                    return Ok(Expr::Function { name, arguments });
                }
                Ok(Expr::Identifier(name))
            }
            _ => Err(self.error_at(index, format!("Expected expression, found {}", self.found()))),
        }
    }

    fn parse_parenthesized(&mut self) -> PResult<Expr> {
        let is_query = self
            .peek_nth(1)
            .is_some_and(|t| t.is_keyword("SELECT") || t.is_keyword("WITH"));
        if is_query {
            return self.parse_paren_fragment().map(Expr::Subquery);
        }

        let open = self.expect_token(&Token::LParen, "'('")?;
        let mut exprs = vec![self.parse_expr()?];
        while self.eat_token(&Token::Comma) {
            exprs.push(self.parse_expr()?);
        }
        let close = self.expect_token(&Token::RParen, "')'")?;

        Ok(Expr::Nested {
            exprs,
            range: TokenRange::new(open, close),
        })
    }

    /// Balanced `( ... )`, keeping only the variable references inside
    fn parse_paren_fragment(&mut self) -> PResult<Fragment> {
        let open = self.expect_token(&Token::LParen, "'('")?;
        let mut depth = 1usize;
        let mut references = Vec::new();

        while let Some((index, token)) = self.current() {
            self.pos += 1;
            match &token.token {
                Token::LParen => depth += 1,
                Token::RParen => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Fragment {
                            references,
                            range: TokenRange::new(open, index),
                        });
                    }
                }
                _ if token.is_variable() => references.push(variable_ref(index, token)),
                _ => {}
            }
        }

        Err(self.error_at(open, "Unclosed '('"))
    }

    /// `CASE ... END`, nested CASEs included
    fn parse_case(&mut self) -> PResult<Fragment> {
        let start = self.expect_keyword_index("CASE")?;
        let mut depth = 1usize;
        let mut references = Vec::new();

        while let Some((index, token)) = self.current() {
            self.pos += 1;
            if token.is_keyword("CASE") {
                depth += 1;
            } else if token.is_keyword("END") {
                depth -= 1;
                if depth == 0 {
                    return Ok(Fragment {
                        references,
                        range: TokenRange::new(start, index),
                    });
                }
            } else if token.is_variable() {
                references.push(variable_ref(index, token));
            }
        }

        Err(self.error_at(start, "CASE without matching END"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(sql: &str) -> ParsedScript {
        SqlParser::new().parse(sql, None)
    }

    fn parse_ok(sql: &str) -> ParsedScript {
        let parsed = parse(sql);
        assert!(parsed.is_valid(), "unexpected errors: {:?}", parsed.errors);
        parsed
    }

    #[test]
    fn parse_set_variable() {
        let parsed = parse_ok("SET @p1 = N'SELECT * FROM t WHERE id = @id';");
        assert_eq!(parsed.statement_count(), 1);

        let Statement::SetVariable(set) = &parsed.tree.statements[0] else {
            panic!("expected SET, got {:?}", parsed.tree.statements[0]);
        };
        assert_eq!(set.variable.name, "@p1");
        assert_eq!(parsed.script(&set.expression), "N'SELECT * FROM t WHERE id = @id'");
    }

    #[test]
    fn statements_without_semicolons() {
        let parsed = parse_ok("SET @a = 1 SET @b = @a + 2\nSET @c = 'x'");
        assert_eq!(parsed.statement_count(), 3);

        let Statement::SetVariable(set) = &parsed.tree.statements[1] else {
            panic!("expected SET");
        };
        assert_eq!(parsed.script(&set.expression), "@a + 2");
    }

    #[test]
    fn parse_declare_with_initializers() {
        let parsed = parse_ok("DECLARE @a int = 5, @b nvarchar(50), @c AS decimal(10, 2) = 1.5;");

        let Statement::Declare(declare) = &parsed.tree.statements[0] else {
            panic!("expected DECLARE");
        };
        assert_eq!(declare.declarations.len(), 3);
        assert_eq!(parsed.tokens.script(declare.declarations[1].data_type), "nvarchar(50)");
        assert!(declare.declarations[1].initializer.is_none());
        assert_eq!(parsed.script(declare.declarations[2].initializer.as_ref().unwrap()), "1.5");
    }

    #[test]
    fn parse_execute_with_named_and_positional_parameters() {
        let parsed = parse_ok("EXEC sys.sp_executesql @p1, N'@id int, @n int OUTPUT', @id = @userId, @n = @count OUTPUT");

        let Statement::Execute(exec) = &parsed.tree.statements[0] else {
            panic!("expected EXEC");
        };
        let ExecutableEntity::Procedure { name, parameters } = &exec.entity else {
            panic!("expected procedure call");
        };

        assert_eq!(name.parts, vec!["sys", "sp_executesql"]);
        assert_eq!(name.base_identifier(), "sp_executesql");
        assert_eq!(parameters.len(), 4);
        assert!(parameters[0].variable.is_none());
        assert_eq!(parsed.script(&parameters[1].value), "N'@id int, @n int OUTPUT'");
        assert_eq!(parameters[2].variable.as_ref().unwrap().name, "@id");
        assert_eq!(parsed.script(&parameters[2].value), "@userId");
        assert!(parameters[3].output);
    }

    #[test]
    fn parse_execute_forms() {
        let parsed = parse_ok(
            "EXECUTE @rc = [dbo].[proc] 1, DEFAULT WITH RECOMPILE;\nEXEC @procName;\nEXEC ('SELECT ' + @cols)",
        );
        assert_eq!(parsed.statement_count(), 3);

        let Statement::Execute(first) = &parsed.tree.statements[0] else {
            panic!("expected EXEC");
        };
        assert_eq!(first.return_status.as_ref().unwrap().name, "@rc");
        assert!(matches!(&first.entity, ExecutableEntity::Procedure { name, .. } if name.base_identifier() == "proc"));

        let Statement::Execute(second) = &parsed.tree.statements[1] else {
            panic!("expected EXEC");
        };
        assert!(matches!(second.entity, ExecutableEntity::ProcedureVariable { .. }));

        let Statement::Execute(third) = &parsed.tree.statements[2] else {
            panic!("expected EXEC");
        };
        assert!(matches!(&third.entity, ExecutableEntity::AdHoc { parts } if parts.len() == 1));
    }

    #[test]
    fn update_keeps_its_set_clause() {
        let parsed = parse_ok("UPDATE session SET ss_last_used = @LastUsed WHERE ss_sequence = @sequence");
        assert_eq!(parsed.statement_count(), 1);

        let Statement::Other(fragment) = &parsed.tree.statements[0] else {
            panic!("expected a plain statement");
        };
        let names: Vec<&str> = fragment.references.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["@LastUsed", "@sequence"]);
        assert_eq!(fragment.references[0].offset, 34);
        assert_eq!(fragment.references[0].length, 9);
    }

    #[test]
    fn update_owns_only_its_first_set() {
        let parsed = parse_ok("UPDATE t SET x = @a WHERE id = 1\nSET @q = N'SELECT 1'");
        assert_eq!(parsed.statement_count(), 2);
        assert!(matches!(&parsed.tree.statements[1], Statement::SetVariable(s) if s.variable.name == "@q"));
    }

    #[test]
    fn merge_update_clauses_keep_their_set() {
        let parsed = parse_ok(
            "MERGE dst USING src ON dst.id = src.id\n\
             WHEN MATCHED AND src.gone = 1 THEN UPDATE SET dst.gone = 1\n\
             WHEN MATCHED THEN UPDATE SET dst.v = @v\n\
             WHEN NOT MATCHED THEN INSERT (id) VALUES (src.id)\n\
             SET @done = 1",
        );

        assert_eq!(parsed.statement_count(), 2);
        let Statement::Other(merge) = &parsed.tree.statements[0] else {
            panic!("expected a plain statement");
        };
        assert_eq!(merge.references[0].name, "@v");
        assert!(matches!(&parsed.tree.statements[1], Statement::SetVariable(_)));
    }

    #[test]
    fn unmodelled_values_fall_back_to_fragments() {
        let parsed = parse_ok("SET @n = NEXT VALUE FOR dbo.seq\nSET @m = $5.00\nDECLARE @a int = NEXT VALUE FOR s, @b int = @n");
        assert_eq!(parsed.statement_count(), 3);

        let Statement::SetVariable(first) = &parsed.tree.statements[0] else {
            panic!("expected SET");
        };
        assert!(matches!(first.expression, Expr::Fragment(_)));
        assert_eq!(parsed.script(&first.expression), "NEXT VALUE FOR dbo.seq");

        let Statement::SetVariable(second) = &parsed.tree.statements[1] else {
            panic!("expected SET");
        };
        assert_eq!(parsed.script(&second.expression), "$5.00");

        let Statement::Declare(declare) = &parsed.tree.statements[2] else {
            panic!("expected DECLARE");
        };
        assert_eq!(declare.declarations.len(), 2);
        assert_eq!(parsed.script(declare.declarations[0].initializer.as_ref().unwrap()), "NEXT VALUE FOR s");
        assert_eq!(parsed.script(declare.declarations[1].initializer.as_ref().unwrap()), "@n");
    }

    #[test]
    fn string_contents_are_not_references() {
        let parsed = parse_ok("SELECT '@notAVariable', @real FROM t");
        let Statement::Other(fragment) = &parsed.tree.statements[0] else {
            panic!("expected a plain statement");
        };
        assert_eq!(fragment.references.len(), 1);
        assert_eq!(fragment.references[0].name, "@real");
    }

    #[test]
    fn control_flow_and_blocks() {
        let parsed = parse_ok(
            r#"
            BEGIN TRAN
            BEGIN TRY
                IF NOT EXISTS (SELECT 1 FROM t WHERE id = @id) AND @x IS NOT NULL
                    SET @y = CASE WHEN @z > 0 THEN 1 ELSE 0 END
                ELSE
                    SET @y = 2;
            END TRY
            BEGIN CATCH
                ROLLBACK
            END CATCH
            COMMIT
            "#,
        );

        assert_eq!(parsed.statement_count(), 4);
        assert!(matches!(&parsed.tree.statements[1], Statement::Block(b) if b.kind == BlockKind::Try));
        assert!(matches!(&parsed.tree.statements[2], Statement::Block(b) if b.kind == BlockKind::Catch));
    }

    #[test]
    fn set_without_equals_is_an_error() {
        let parsed = parse("SET @a 5");
        assert_eq!(parsed.errors.len(), 1);
        assert!(parsed.errors[0].message.contains("Expected '='"));
        assert_eq!((parsed.errors[0].line, parsed.errors[0].column), (1, 8));
    }

    #[test]
    fn errors_recover_at_next_statement() {
        let parsed = parse("SET @a = ;\nSET @b = 2;\nEXEC ;\nSET @c = 3");

        assert_eq!(parsed.errors.len(), 2);
        assert_eq!(parsed.errors[0].line, 1);
        assert_eq!(parsed.errors[1].line, 3);
        assert_eq!(parsed.statement_count(), 2);
    }

    #[test]
    fn unbalanced_blocks_are_errors() {
        assert!(parse("BEGIN SET @a = 1").errors[0].message.contains("BEGIN without matching END"));
        assert!(parse("SET @a = 1 END").errors[0].message.contains("END without matching BEGIN"));
        assert!(parse("SELECT (1").errors[0].message.contains("Unclosed"));
        assert!(parse("SELECT 1)").errors[0].message.contains("Unexpected ')'"));
    }

    #[test]
    fn tokenizer_errors_are_reported() {
        let parsed = parse("SET @a = N'unterminated");
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.statement_count(), 0);

        let diag = parsed.errors[0].to_diagnostic(None);
        assert_eq!(diag.code, DiagnosticCode::SqlParseError);
        assert_eq!(diag.location.unwrap().file, "<input>");
    }

    #[test]
    fn parse_file_reports_missing_file() {
        let result = SqlParser::new().parse_file(Path::new("/nonexistent/script.sql"));
        let error = result.unwrap_err();
        assert!(error.to_string().contains("/nonexistent/script.sql"));
    }
}
