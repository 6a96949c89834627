//! Locating calls to the dynamic-execution procedure

use dynsql_sql::{ExecutableEntity, Execute, Expr, ParsedScript, Spanned, Visitor};

/// One argument of a located call
#[derive(Debug, Clone, PartialEq)]
pub struct CallParameter {
    /// `@name` when passed as `@name = value`
    pub name: Option<String>,

    pub value: Expr,

    /// Exact source text of the value
    pub text: String,

    pub output: bool,
}

impl CallParameter {
    /// Name of the variable passed as the value, if the value is a bare variable
    pub fn variable(&self) -> Option<&str> {
        self.value.as_variable().map(|v| v.name.as_str())
    }
}

/// A call such as `EXEC sp_executesql @sql, N'@id int', @id = @userId`
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicCall {
    /// Exact source text of the whole call
    pub text: String,

    /// Byte span `(offset, length)` in the script
    pub span: (usize, usize),

    /// Procedure name as written
    pub procedure: String,

    /// Arguments in call order
    pub parameters: Vec<CallParameter>,
}

/// Finds procedure calls whose base name matches, ignoring case
pub struct DynamicCallLocator {
    procedure: String,
}

impl DynamicCallLocator {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
        }
    }

    /// Matching calls in document order
    ///
    /// Only `EXEC name ...` calls are considered; `EXEC @proc` and
    /// `EXEC ('...')` are never dynamic calls.
    pub fn locate(&self, parsed: &ParsedScript) -> Vec<DynamicCall> {
        let mut finder = CallFinder {
            parsed,
            procedure: &self.procedure,
            calls: Vec::new(),
        };
        parsed.tree.accept(&mut finder);
        finder.calls
    }
}

struct CallFinder<'a> {
    parsed: &'a ParsedScript,
    procedure: &'a str,
    calls: Vec<DynamicCall>,
}

impl Visitor for CallFinder<'_> {
    fn visit_execute(&mut self, node: &Execute) {
        let ExecutableEntity::Procedure { name, parameters } = &node.entity else {
            return;
        };
        if !name.base_identifier().eq_ignore_ascii_case(self.procedure) {
            return;
        }

        let parameters: Vec<CallParameter> = parameters
            .iter()
            .map(|p| CallParameter {
                name: p.variable.as_ref().map(|v| v.name.clone()),
                value: p.value.clone(),
                text: self.parsed.script(&p.value).to_string(),
                output: p.output,
            })
            .collect();

        let text = self.parsed.script(node).to_string();
        tracing::debug!(call = %text, parameters = parameters.len(), "dynamic call");

        self.calls.push(DynamicCall {
            text,
            span: self.parsed.tokens.span(node.range()),
            procedure: self.parsed.script(name).to_string(),
            parameters,
        });
    }
}
