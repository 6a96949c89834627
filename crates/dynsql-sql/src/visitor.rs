//! Tree traversal with per-node-kind hooks
//!
//! Implement only the hooks you need; [`walk_script`] calls them in
//! document order, parents before children.

use crate::ast::*;

pub trait Visitor {
    fn visit_set_variable(&mut self, _node: &SetVariable) {}

    fn visit_variable_declaration(&mut self, _node: &VariableDeclaration) {}

    fn visit_execute(&mut self, _node: &Execute) {}

    fn visit_variable_reference(&mut self, _node: &VariableRef) {}
}

impl Script {
    /// Drive a visitor over every node
    pub fn accept<V: Visitor + ?Sized>(&self, visitor: &mut V) {
        walk_script(visitor, self);
    }
}

pub fn walk_script<V: Visitor + ?Sized>(visitor: &mut V, script: &Script) {
    for statement in &script.statements {
        walk_statement(visitor, statement);
    }
}

pub fn walk_statement<V: Visitor + ?Sized>(visitor: &mut V, statement: &Statement) {
    match statement {
        Statement::SetVariable(node) => {
            visitor.visit_set_variable(node);
            visitor.visit_variable_reference(&node.variable);
            walk_expr(visitor, &node.expression);
        }
        Statement::Declare(node) => {
            for declaration in &node.declarations {
                visitor.visit_variable_declaration(declaration);
                if let Some(initializer) = &declaration.initializer {
                    walk_expr(visitor, initializer);
                }
            }
        }
        Statement::Execute(node) => {
            visitor.visit_execute(node);
            if let Some(status) = &node.return_status {
                visitor.visit_variable_reference(status);
            }
            match &node.entity {
                ExecutableEntity::Procedure { parameters, .. } => {
                    walk_parameters(visitor, parameters);
                }
                ExecutableEntity::ProcedureVariable { variable, parameters } => {
                    visitor.visit_variable_reference(variable);
                    walk_parameters(visitor, parameters);
                }
                ExecutableEntity::AdHoc { parts } => {
                    for part in parts {
                        walk_expr(visitor, part);
                    }
                }
            }
        }
        Statement::Block(block) => {
            for statement in &block.statements {
                walk_statement(visitor, statement);
            }
        }
        Statement::If(node) => {
            walk_expr(visitor, &node.predicate);
            walk_statement(visitor, &node.then);
            if let Some(otherwise) = &node.otherwise {
                walk_statement(visitor, otherwise);
            }
        }
        Statement::While(node) => {
            walk_expr(visitor, &node.predicate);
            walk_statement(visitor, &node.body);
        }
        Statement::Other(fragment) => walk_fragment(visitor, fragment),
    }
}

fn walk_parameters<V: Visitor + ?Sized>(visitor: &mut V, parameters: &[ExecuteParameter]) {
    for parameter in parameters {
        if let Some(variable) = &parameter.variable {
            visitor.visit_variable_reference(variable);
        }
        walk_expr(visitor, &parameter.value);
    }
}

pub fn walk_expr<V: Visitor + ?Sized>(visitor: &mut V, expr: &Expr) {
    match expr {
        Expr::Variable(variable) => visitor.visit_variable_reference(variable),
        Expr::GlobalVariable { .. } | Expr::Literal { .. } | Expr::Identifier(_) => {}
        Expr::Function { arguments, .. } => walk_fragment(visitor, arguments),
        Expr::Nested { exprs, .. } => {
            for expr in exprs {
                walk_expr(visitor, expr);
            }
        }
        Expr::Subquery(fragment) | Expr::Case(fragment) | Expr::Fragment(fragment) => {
            walk_fragment(visitor, fragment)
        }
        Expr::Unary { operand, .. } => walk_expr(visitor, operand),
        Expr::Binary { left, right, .. } => {
            walk_expr(visitor, left);
            walk_expr(visitor, right);
        }
    }
}

pub fn walk_fragment<V: Visitor + ?Sized>(visitor: &mut V, fragment: &Fragment) {
    for reference in &fragment.references {
        visitor.visit_variable_reference(reference);
    }
}
