//! Inner-query resolution
//!
//! The extracted query text is parsed on its own, every variable reference
//! in it is located, and each one is replaced by the text it is bound to.
//! Offsets are local to the inner query.

use dynsql_core::BindingPolicy;
use dynsql_sql::{ParseError, SqlParser, VariableRef, Visitor};

use crate::binder::{BoundValue, ParameterPairs};
use crate::error::EngineError;
use crate::variables::VariableTable;

/// One occurrence of a variable inside the inner query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableReferenceSite {
    pub name: String,
    pub offset: usize,
    pub length: usize,
}

impl VariableReferenceSite {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Inner query text with its reference sites in offset order
#[derive(Debug, Clone, PartialEq)]
pub struct InnerQuery {
    pub text: String,
    pub sites: Vec<VariableReferenceSite>,

    /// Errors from parsing the query on its own
    pub errors: Vec<ParseError>,
}

impl InnerQuery {
    /// Parse the query text and collect its reference sites
    pub fn parse(parser: &SqlParser, text: impl Into<String>) -> Self {
        let text = text.into();
        let parsed = parser.parse(&text, None);

        let mut collector = SiteCollector::default();
        parsed.tree.accept(&mut collector);

        // Traversal order is not textual order for every construct.
        let mut sites = collector.sites;
        sites.sort_by_key(|s| s.offset);

        Self {
            text,
            sites,
            errors: parsed.errors,
        }
    }

    /// Reject sites that overlap each other or leave the query text
    pub fn check_sites(&self) -> Result<(), EngineError> {
        for pair in self.sites.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err(EngineError::OverlappingReferences {
                    previous: pair[0].name.clone(),
                    next: pair[1].name.clone(),
                    offset: pair[1].offset,
                });
            }
        }

        for site in &self.sites {
            let inside = site.end() <= self.text.len()
                && self.text.is_char_boundary(site.offset)
                && self.text.is_char_boundary(site.end());
            if !inside {
                return Err(EngineError::OverlappingReferences {
                    previous: "the end of the query text".to_string(),
                    next: site.name.clone(),
                    offset: site.offset,
                });
            }
        }

        Ok(())
    }
}

#[derive(Default)]
struct SiteCollector {
    sites: Vec<VariableReferenceSite>,
}

impl Visitor for SiteCollector {
    fn visit_variable_reference(&mut self, node: &VariableRef) {
        self.sites.push(VariableReferenceSite {
            name: node.name.clone(),
            offset: node.offset,
            length: node.length,
        });
    }
}

/// A site and the text spliced in its place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub site: VariableReferenceSite,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedQuery {
    pub text: String,

    /// Substitutions in offset order
    pub substitutions: Vec<Substitution>,
}

pub struct InnerQueryResolver<'a> {
    table: &'a VariableTable,
    pairs: &'a ParameterPairs,
    policy: BindingPolicy,
}

impl<'a> InnerQueryResolver<'a> {
    pub fn new(table: &'a VariableTable, pairs: &'a ParameterPairs, policy: BindingPolicy) -> Self {
        Self { table, pairs, policy }
    }

    /// Replace every reference site; the first lookup failure aborts
    pub fn resolve(&self, query: &InnerQuery) -> Result<ResolvedQuery, EngineError> {
        query.check_sites()?;

        let text = query.text.as_str();
        let mut output = String::with_capacity(text.len());
        let mut substitutions = Vec::with_capacity(query.sites.len());
        let mut cursor = 0;

        for site in &query.sites {
            let replacement = self.value_for(site)?;
            tracing::debug!(name = %site.name, offset = site.offset, replacement = %replacement, "substitution");

            output.push_str(&text[cursor..site.offset]);
            output.push_str(&replacement);
            cursor = site.end();

            substitutions.push(Substitution {
                site: site.clone(),
                replacement,
            });
        }
        output.push_str(&text[cursor..]);

        Ok(ResolvedQuery {
            text: output,
            substitutions,
        })
    }

    fn value_for(&self, site: &VariableReferenceSite) -> Result<String, EngineError> {
        let bound = self
            .pairs
            .get(&site.name)
            .ok_or_else(|| EngineError::UnresolvedParameter {
                name: site.name.clone(),
                offset: site.offset,
            })?;

        match bound {
            BoundValue::Literal(text) => Ok(text.clone()),
            BoundValue::Variable(name) => self
                .table
                .lookup(name, self.policy)
                .map(|b| b.text.clone())
                .ok_or_else(|| EngineError::MissingBinding { name: name.clone() }),
        }
    }
}
