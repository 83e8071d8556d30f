//! AST rewrites between parsing and emission: blank-line pruning and
//! constant folding. Both passes are idempotent.

use crate::ast::{AtomKind, BinaryOp, Expression, Statement};

/// Drops the placeholder statements blank lines produce, so the emitter
/// never sees an expression statement without an expression.
pub fn prune_empty_statements(statements: &mut Vec<Statement>) {
    statements.retain(|statement| !matches!(statement, Statement::Expression(None)));
}

/// Folds constant sub-expressions in place. Integer arithmetic uses 32-bit
/// wrapping semantics; division and modulus by zero are left alone to fail
/// at runtime instead of at compile time.
pub fn fold_constant_expressions(statements: &mut [Statement]) {
    for statement in statements {
        fold_statement(statement);
    }
}

fn fold_statement(statement: &mut Statement) {
    match statement {
        Statement::Block(statements) | Statement::Function { body: statements, .. } => {
            fold_constant_expressions(statements);
        }
        Statement::Expression(Some(expression)) => fold_expression(expression),
        Statement::Expression(None) => {}
        Statement::Return { value: Some(expression) } => fold_expression(expression),
        Statement::Return { value: None } => {}
        Statement::If { cond, then_body, else_body } => {
            fold_expression(cond);
            fold_statement(then_body);
            if let Some(else_body) = else_body {
                fold_statement(else_body);
            }
        }
        Statement::Loop { init, cond, incr, body } => {
            for expression in init.iter_mut().chain(incr.iter_mut()) {
                fold_expression(expression);
            }
            if let Some(cond) = cond {
                fold_expression(cond);
            }
            fold_statement(body);
        }
        Statement::ForEach { container, body, .. } => {
            fold_expression(container);
            fold_statement(body);
        }
        Statement::Delete { indices, .. } => {
            for index in indices {
                fold_expression(index);
            }
        }
        Statement::Break | Statement::Continue => {}
    }
}

fn fold_expression(expression: &mut Expression) {
    match expression {
        Expression::Binary { .. } => fold_binary_expression(expression),
        Expression::Call { args, .. } => {
            for arg in args {
                fold_expression(arg);
            }
        }
        Expression::ArrayIndex { indices, .. } => {
            for index in indices {
                fold_expression(index);
            }
        }
        Expression::Atom { .. } | Expression::Unary { .. } => {}
    }
}

fn fold_binary_expression(expression: &mut Expression) {
    let Expression::Binary { op, lhs, rhs } = expression else {
        return;
    };

    fold_expression(lhs);
    fold_expression(rhs);

    let (Expression::Atom { value: left, kind: left_kind },
         Expression::Atom { value: right, kind: right_kind }) = (&**lhs, &**rhs)
    else {
        return;
    };

    let folded = match (left_kind, right_kind) {
        (AtomKind::Integer, AtomKind::Integer) => fold_numeric(*op, left, right),
        (AtomKind::String, AtomKind::String)
        | (AtomKind::String, AtomKind::Integer)
        | (AtomKind::Integer, AtomKind::String) => fold_string(*op, left, right),
        _ => None,
    };

    if let Some(folded) = folded {
        *expression = folded;
    }
}

/// Integer atoms are string-encoded, so concatenating with a string operand
/// is plain lexeme concatenation.
fn fold_string(op: BinaryOp, left: &str, right: &str) -> Option<Expression> {
    match op {
        BinaryOp::Concatenate => Some(Expression::Atom {
            value: format!("{left}{right}"),
            kind: AtomKind::String,
        }),
        _ => None,
    }
}

fn fold_numeric(op: BinaryOp, left: &str, right: &str) -> Option<Expression> {
    let left = left.parse::<i32>().ok()?;
    let right = right.parse::<i32>().ok()?;

    let value = match op {
        BinaryOp::Add => left.wrapping_add(right),
        BinaryOp::Sub => left.wrapping_sub(right),
        BinaryOp::Mul => left.wrapping_mul(right),
        BinaryOp::Div => {
            if right == 0 {
                return None;
            }
            left.wrapping_div(right)
        }
        BinaryOp::Mod => {
            if right == 0 {
                return None;
            }
            left.wrapping_rem(right)
        }
        BinaryOp::Exponent => (f64::from(left).powf(f64::from(right))) as i32,
        _ => return None,
    };

    Some(Expression::Atom {
        value: value.to_string(),
        kind: AtomKind::Integer,
    })
}
