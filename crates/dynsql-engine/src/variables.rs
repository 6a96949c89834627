//! Variable table: every assignment of a script, in document order

use dynsql_core::BindingPolicy;
use dynsql_sql::{Expr, ParsedScript, SetVariable, Spanned, TokenRange, VariableDeclaration, VariableRef, Visitor};

/// One assignment: `SET @x = expr` or `DECLARE @x type = expr`
#[derive(Debug, Clone, PartialEq)]
pub struct VariableBinding {
    pub name: String,

    /// Assigned expression
    pub value: Expr,

    /// Exact source text of the assigned expression
    pub text: String,

    /// Byte span `(offset, length)` of the assignment in the script
    pub span: (usize, usize),
}

/// Assignments in script order, queryable by name
///
/// Repeated names are all kept; which one a lookup returns is decided by
/// the [`BindingPolicy`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariableTable {
    bindings: Vec<VariableBinding>,
}

impl VariableTable {
    /// Collect the assignments of a parsed script
    pub fn build(parsed: &ParsedScript, include_declarations: bool) -> Self {
        let mut builder = TableBuilder {
            parsed,
            include_declarations,
            bindings: Vec::new(),
        };
        parsed.tree.accept(&mut builder);

        tracing::debug!(bindings = builder.bindings.len(), "variable table built");
        Self {
            bindings: builder.bindings,
        }
    }

    /// Find the binding for `name` (exact, case-sensitive match)
    pub fn lookup(&self, name: &str, policy: BindingPolicy) -> Option<&VariableBinding> {
        let mut matches = self.bindings.iter().filter(|b| b.name == name);
        match policy {
            BindingPolicy::First => matches.next(),
            BindingPolicy::Last => matches.last(),
        }
    }

    pub fn bindings(&self) -> &[VariableBinding] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

struct TableBuilder<'a> {
    parsed: &'a ParsedScript,
    include_declarations: bool,
    bindings: Vec<VariableBinding>,
}

impl TableBuilder<'_> {
    fn push(&mut self, variable: &VariableRef, value: &Expr, range: TokenRange) {
        let text = self.parsed.script(value).to_string();
        tracing::debug!(name = %variable.name, value = %text, "variable binding");

        self.bindings.push(VariableBinding {
            name: variable.name.clone(),
            value: value.clone(),
            text,
            span: self.parsed.tokens.span(range),
        });
    }
}

impl Visitor for TableBuilder<'_> {
    fn visit_set_variable(&mut self, node: &SetVariable) {
        self.push(&node.variable, &node.expression, node.range());
    }

    fn visit_variable_declaration(&mut self, node: &VariableDeclaration) {
        if !self.include_declarations {
            return;
        }
        if let Some(initializer) = &node.initializer {
            self.push(&node.variable, initializer, node.range());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynsql_sql::SqlParser;
    use pretty_assertions::assert_eq;

    fn table(sql: &str, include_declarations: bool) -> VariableTable {
        let parsed = SqlParser::new().parse(sql, None);
        assert!(parsed.is_valid(), "{:?}", parsed.errors);
        VariableTable::build(&parsed, include_declarations)
    }

    #[test]
    fn bindings_follow_document_order() {
        let table = table("SET @b = 2;\nIF 1 = 1 SET @a = 'x' + @b;\nSET @b = 3", true);

        let names: Vec<&str> = table.bindings().iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["@b", "@a", "@b"]);
        assert_eq!(table.bindings()[1].text, "'x' + @b");
        assert_eq!(table.bindings()[0].span, (0, 10));
    }

    #[test]
    fn lookup_honors_policy() {
        let table = table("SET @x = 1; SET @x = 2;", true);

        assert_eq!(table.lookup("@x", BindingPolicy::First).unwrap().text, "1");
        assert_eq!(table.lookup("@x", BindingPolicy::Last).unwrap().text, "2");
        assert!(table.lookup("@X", BindingPolicy::First).is_none());
    }

    #[test]
    fn declarations_are_optional_bindings() {
        let sql = "DECLARE @a int = 5, @b int; SET @b = 6";

        assert_eq!(table(sql, true).len(), 2);
        assert_eq!(table(sql, false).len(), 1);
        assert!(table(sql, false).lookup("@a", BindingPolicy::First).is_none());
    }

    #[test]
    fn empty_script_gives_empty_table() {
        assert!(table("SELECT 1", true).is_empty());
    }
}
