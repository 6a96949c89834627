//! T-SQL syntax tree
//!
//! A closed set of node kinds; every node records the token range it was
//! parsed from so its exact source text can be recovered from the
//! [`TokenStream`](crate::tokens::TokenStream).

use crate::tokens::TokenRange;

/// Any node that covers a range of tokens
pub trait Spanned {
    fn range(&self) -> TokenRange;
}

/// A parsed script: statements in document order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub statements: Vec<Statement>,
}

/// `@name` reference to a local variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableRef {
    /// Name including the `@` prefix, as written
    pub name: String,

    /// Byte offset in the parsed text
    pub offset: usize,

    /// Byte length in the parsed text
    pub length: usize,

    pub range: TokenRange,
}

/// Possibly qualified name such as `sys.sp_executesql` or `[dbo].[proc]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectName {
    /// Identifier parts without brackets or quotes; skipped parts (`db..proc`) are empty
    pub parts: Vec<String>,
    pub range: TokenRange,
}

impl ObjectName {
    /// The last part of the name
    pub fn base_identifier(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }
}

/// A run of tokens the parser does not model in detail
///
/// Only the variable references inside it are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub references: Vec<VariableRef>,
    pub range: TokenRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    /// `'text'`
    String,
    /// `N'text'`
    NationalString,
    Number,
    /// `0x...`
    Binary,
    Null,
    /// `DEFAULT` in a parameter list
    Default,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Variable(VariableRef),

    /// `@@ROWCOUNT` and friends
    GlobalVariable { name: String, range: TokenRange },

    Literal { kind: LiteralKind, range: TokenRange },

    Identifier(ObjectName),

    /// Function call; arguments are kept as a fragment (`CAST(@x AS int)`)
    Function { name: ObjectName, arguments: Fragment },

    /// Parenthesized expression or expression list
    Nested { exprs: Vec<Expr>, range: TokenRange },

    /// Parenthesized query
    Subquery(Fragment),

    /// `CASE ... END`
    Case(Fragment),

    Unary { op: String, operand: Box<Expr>, range: TokenRange },

    /// Operator precedence is not modelled; chains are left-associative.
    Binary { left: Box<Expr>, op: String, right: Box<Expr>, range: TokenRange },

    /// Value outside the modelled grammar (`NEXT VALUE FOR seq`), kept as written
    Fragment(Fragment),
}

impl Spanned for Expr {
    fn range(&self) -> TokenRange {
        match self {
            Expr::Variable(v) => v.range,
            Expr::GlobalVariable { range, .. } => *range,
            Expr::Literal { range, .. } => *range,
            Expr::Identifier(name) => name.range,
            Expr::Function { name, arguments } => name.range.to(arguments.range),
            Expr::Nested { range, .. } => *range,
            Expr::Subquery(fragment) | Expr::Case(fragment) | Expr::Fragment(fragment) => fragment.range,
            Expr::Unary { range, .. } => *range,
            Expr::Binary { range, .. } => *range,
        }
    }
}

impl Expr {
    /// The variable, when this expression is nothing but a variable reference
    pub fn as_variable(&self) -> Option<&VariableRef> {
        match self {
            Expr::Variable(v) => Some(v),
            _ => None,
        }
    }
}

/// `SET @x = expr`
#[derive(Debug, Clone, PartialEq)]
pub struct SetVariable {
    pub variable: VariableRef,
    pub expression: Expr,
    pub range: TokenRange,
}

/// One `@x type [= expr]` element of a `DECLARE`
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDeclaration {
    pub variable: VariableRef,
    pub data_type: TokenRange,
    pub initializer: Option<Expr>,
    pub range: TokenRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Declare {
    pub declarations: Vec<VariableDeclaration>,
    pub range: TokenRange,
}

/// One argument of an `EXEC`: `[@name =] value [OUTPUT]`
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteParameter {
    /// Parameter name when passed by name
    pub variable: Option<VariableRef>,
    pub value: Expr,
    pub output: bool,
    pub range: TokenRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutableEntity {
    /// `EXEC schema.proc args`
    Procedure { name: ObjectName, parameters: Vec<ExecuteParameter> },

    /// `EXEC @proc args`
    ProcedureVariable { variable: VariableRef, parameters: Vec<ExecuteParameter> },

    /// `EXEC ('SELECT ...')`
    AdHoc { parts: Vec<Expr> },
}

/// `EXEC [@status =] entity`
#[derive(Debug, Clone, PartialEq)]
pub struct Execute {
    pub return_status: Option<VariableRef>,
    pub entity: ExecutableEntity,
    pub range: TokenRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `BEGIN ... END`
    Plain,
    /// `BEGIN TRY ... END TRY`
    Try,
    /// `BEGIN CATCH ... END CATCH`
    Catch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub statements: Vec<Statement>,
    pub range: TokenRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStatement {
    pub predicate: Expr,
    pub then: Box<Statement>,
    pub otherwise: Option<Box<Statement>>,
    pub range: TokenRange,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WhileStatement {
    pub predicate: Expr,
    pub body: Box<Statement>,
    pub range: TokenRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    SetVariable(SetVariable),
    Declare(Declare),
    Execute(Execute),
    Block(Block),
    If(IfStatement),
    While(WhileStatement),
    /// Queries, DML, transaction control and everything else
    Other(Fragment),
}

impl Spanned for Statement {
    fn range(&self) -> TokenRange {
        match self {
            Statement::SetVariable(s) => s.range,
            Statement::Declare(d) => d.range,
            Statement::Execute(e) => e.range,
            Statement::Block(b) => b.range,
            Statement::If(i) => i.range,
            Statement::While(w) => w.range,
            Statement::Other(f) => f.range,
        }
    }
}

impl Spanned for VariableRef {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for ObjectName {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for Fragment {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for ExecuteParameter {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for Execute {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for SetVariable {
    fn range(&self) -> TokenRange {
        self.range
    }
}

impl Spanned for VariableDeclaration {
    fn range(&self) -> TokenRange {
        self.range
    }
}
