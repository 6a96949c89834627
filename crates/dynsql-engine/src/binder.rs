//! Parameter binding for a located call
//!
//! A dynamic call has the shape
//! `EXEC sp_executesql <query>, <signature>, <value>, ...`. The binder
//! extracts the query text, reads the declared parameter names from the
//! signature and pairs every value with the name it is bound to.

use dynsql_core::{BindingPolicy, Diagnostic, DiagnosticCode};
use dynsql_sql::TokenStream;
use sqlparser::tokenizer::Token;

use crate::calls::{CallParameter, DynamicCall};
use crate::error::EngineError;
use crate::variables::VariableTable;

/// Remove string-literal quoting: a leading `N'` (or `'`) and a trailing `'`, once each.
///
/// Doubled quotes inside the literal are left as written.
pub fn strip_string_literal(text: &str) -> &str {
    let text = text
        .strip_prefix("N'")
        .or_else(|| text.strip_prefix("n'"))
        .or_else(|| text.strip_prefix('\''))
        .unwrap_or(text);
    text.strip_suffix('\'').unwrap_or(text)
}

/// Parameter declared in a signature string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredParameter {
    pub name: String,
    pub output: bool,
}

/// Parsed signature string such as `@id int, @total decimal(10, 2) OUTPUT`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub parameters: Vec<DeclaredParameter>,
}

impl Signature {
    /// Read the declared names; text that does not tokenize yields an empty signature
    pub fn parse(text: &str) -> Self {
        let Ok(stream) = TokenStream::tokenize(text) else {
            return Self::default();
        };

        let mut parameters: Vec<DeclaredParameter> = Vec::new();
        let mut depth = 0usize;
        let mut at_start = true;

        for token in stream.tokens().iter().filter(|t| !t.is_trivia()) {
            match &token.token {
                Token::LParen => depth += 1,
                Token::RParen => depth = depth.saturating_sub(1),
                Token::Comma if depth == 0 => {
                    at_start = true;
                    continue;
                }
                _ if depth == 0 && at_start && token.is_variable() => {
                    parameters.push(DeclaredParameter {
                        name: token.word().unwrap_or_default().to_string(),
                        output: false,
                    });
                }
                _ if depth == 0 && (token.is_keyword("OUTPUT") || token.is_keyword("OUT")) => {
                    if let Some(last) = parameters.last_mut() {
                        last.output = true;
                    }
                }
                _ => {}
            }
            at_start = false;
        }

        Self { parameters }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}

/// What a declared parameter is bound to at the call site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValue {
    /// `@id = @userId`: resolved through the variable table
    Variable(String),

    /// `@id = 42`: substituted as written
    Literal(String),
}

/// Declared parameter name -> call-site value, unique keys in call order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterPairs {
    pairs: Vec<(String, BoundValue)>,
}

impl ParameterPairs {
    pub fn get(&self, name: &str) -> Option<&BoundValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Insert unless the name is already bound; returns false on a duplicate
    pub fn insert(&mut self, name: impl Into<String>, value: BoundValue) -> bool {
        let name = name.into();
        if self.get(&name).is_some() {
            return false;
        }
        self.pairs.push((name, value));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BoundValue)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Pairs plus the warnings raised while building them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallBinding {
    pub signature: Signature,
    pub pairs: ParameterPairs,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct ParameterBinder<'a> {
    table: &'a VariableTable,
    policy: BindingPolicy,
    query_text_policy: BindingPolicy,
}

impl<'a> ParameterBinder<'a> {
    /// `policy` applies to the signature and the call-site values; the
    /// query-text variable takes its last assignment unless overridden
    pub fn new(table: &'a VariableTable, policy: BindingPolicy) -> Self {
        Self {
            table,
            policy,
            query_text_policy: BindingPolicy::Last,
        }
    }

    pub fn with_query_text_policy(mut self, policy: BindingPolicy) -> Self {
        self.query_text_policy = policy;
        self
    }

    /// Inner query text of a call, with its literal quoting removed
    ///
    /// A variable argument is looked up in the variable table; anything
    /// else is taken as written.
    pub fn query_text(&self, call: &DynamicCall) -> Result<String, EngineError> {
        let Some(first) = call.parameters.first() else {
            return Err(EngineError::MalformedCall {
                reason: format!("{} is called without a query argument", call.procedure),
            });
        };

        let text = self.argument_text(first, self.query_text_policy)?;
        Ok(strip_string_literal(text).to_string())
    }

    /// Pair every value in `parameters[2..]` with its declared name
    pub fn bind(&self, call: &DynamicCall) -> CallBinding {
        let mut binding = CallBinding::default();

        if let Some(signature) = call.parameters.get(1) {
            match self.argument_text(signature, self.policy) {
                Ok(text) => binding.signature = Signature::parse(strip_string_literal(text)),
                Err(_) => {
                    let name = signature.variable().unwrap_or_default();
                    binding.diagnostics.push(
                        Diagnostic::warning(
                            DiagnosticCode::SignatureMismatch,
                            format!("Signature variable {} is never assigned; values are bound by name only", name),
                        )
                        .with_subject(name),
                    );
                }
            }
        }

        for (position, parameter) in call.parameters.iter().skip(2).enumerate() {
            let declared = binding.signature.parameters.get(position).map(|p| p.name.clone());

            let name = match (&parameter.name, declared) {
                (Some(name), _) => {
                    if !binding.signature.is_empty() && !binding.signature.contains(name) {
                        tracing::warn!(name = %name, "value bound to a name the signature does not declare");
                        binding.diagnostics.push(
                            Diagnostic::warning(
                                DiagnosticCode::SignatureMismatch,
                                format!("{} is not declared in the parameter signature", name),
                            )
                            .with_subject(name.clone()),
                        );
                    }
                    name.clone()
                }
                (None, Some(declared)) => declared,
                (None, None) => {
                    binding.diagnostics.push(
                        Diagnostic::warning(
                            DiagnosticCode::UnmappedPositionalValue,
                            format!("Value {} at position {} has no declared parameter", parameter.text, position + 1),
                        )
                        .with_subject(parameter.text.clone()),
                    );
                    continue;
                }
            };

            let value = match parameter.variable() {
                Some(variable) => BoundValue::Variable(variable.to_string()),
                None => BoundValue::Literal(parameter.text.clone()),
            };
            tracing::debug!(name = %name, value = ?value, "parameter pair");

            if !binding.pairs.insert(name.clone(), value) {
                binding.diagnostics.push(
                    Diagnostic::warning(
                        DiagnosticCode::SignatureMismatch,
                        format!("{} is bound more than once; the first value is used", name),
                    )
                    .with_subject(name),
                );
            }
        }

        binding
    }

    fn argument_text<'p>(
        &'p self,
        parameter: &'p CallParameter,
        policy: BindingPolicy,
    ) -> Result<&'p str, EngineError> {
        match parameter.variable() {
            Some(name) => self
                .table
                .lookup(name, policy)
                .map(|b| b.text.as_str())
                .ok_or_else(|| EngineError::MissingBinding {
                    name: name.to_string(),
                }),
            None => Ok(parameter.text.as_str()),
        }
    }
}
