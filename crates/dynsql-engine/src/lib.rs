//! dynsql engine - dynamic SQL resolution
//!
//! This crate implements the resolution pipeline:
//! - Variable table construction from assignments
//! - Locating dynamic-execution calls
//! - Binding call-site values to declared parameters
//! - Offset-exact substitution inside the inner query

pub mod error;
pub mod variables;
pub mod calls;
pub mod binder;
pub mod resolver;
pub mod pipeline;

pub use error::EngineError;
pub use variables::{VariableBinding, VariableTable};
pub use calls::{CallParameter, DynamicCall, DynamicCallLocator};
pub use binder::{strip_string_literal, BoundValue, CallBinding, DeclaredParameter, ParameterBinder, ParameterPairs, Signature};
pub use resolver::{InnerQuery, InnerQueryResolver, ResolvedQuery, Substitution, VariableReferenceSite};
pub use pipeline::{DynamicSqlEngine, OutputMode, Resolution};
