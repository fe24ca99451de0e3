use serde_json::{Map, Value};

use super::ast::{BinaryOp, Expr, PathSegment, UnaryOp};
use super::context::EvalContext;
use super::error::ExpressionError;

/// Evaluates a parsed expression against a context.
///
/// Deterministic and side-effect free: the same `(expr, ctx)` pair always
/// produces the same result, and evaluation never writes into `ctx`.
pub fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(eval_path(segments, ctx)?),
        Expr::Unary(op, inner) => eval_unary(*op, inner, ctx),
        Expr::Binary(op, lhs, rhs) => eval_binary(*op, lhs, rhs, ctx),
        Expr::List(items) => {
            let values = items
                .iter()
                .map(|e| eval(e, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Object(fields) => {
            let mut map = Map::new();
            for (k, v) in fields {
                map.insert(k.clone(), eval(v, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Call(name, args) => eval_call(name, args, ctx),
    }
}

fn eval_path(segments: &[PathSegment], ctx: &EvalContext) -> Result<Value, ExpressionError> {
    let mut current = ctx.root();
    for segment in segments {
        current = match segment {
            PathSegment::Field(name) => current
                .as_object()
                .and_then(|o| o.get(name))
                .cloned()
                .unwrap_or(Value::Null),
            PathSegment::Index(index_expr) => {
                let index_val = eval(index_expr, ctx)?;
                let idx = index_val.as_u64().ok_or_else(|| ExpressionError::Type {
                    expr: format!("{index_val:?}"),
                    reason: "index must be a non-negative integer".into(),
                })? as usize;
                current
                    .as_array()
                    .and_then(|a| a.get(idx))
                    .cloned()
                    .unwrap_or(Value::Null)
            }
        };
    }
    Ok(current)
}

/// Truthiness over the typed tree: `null`, `false`, `0`, `""`, `[]`, `{}`
/// are falsy; everything else is truthy.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval_unary(op: UnaryOp, inner: &Expr, ctx: &EvalContext) -> Result<Value, ExpressionError> {
    let v = eval(inner, ctx)?;
    match op {
        UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
        UnaryOp::Neg => {
            let n = as_number(&v, "-")?;
            Ok(Value::from(-n))
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &EvalContext,
) -> Result<Value, ExpressionError> {
    // Short-circuit boolean combinators.
    if op == BinaryOp::And {
        let l = eval(lhs, ctx)?;
        if !truthy(&l) {
            return Ok(Value::Bool(false));
        }
        return Ok(Value::Bool(truthy(&eval(rhs, ctx)?)));
    }
    if op == BinaryOp::Or {
        let l = eval(lhs, ctx)?;
        if truthy(&l) {
            return Ok(Value::Bool(true));
        }
        return Ok(Value::Bool(truthy(&eval(rhs, ctx)?)));
    }

    let l = eval(lhs, ctx)?;
    let r = eval(rhs, ctx)?;

    match op {
        BinaryOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            _ => Ok(Value::from(as_number(&l, "+")? + as_number(&r, "+")?)),
        },
        BinaryOp::Sub => Ok(Value::from(as_number(&l, "-")? - as_number(&r, "-")?)),
        BinaryOp::Mul => Ok(Value::from(as_number(&l, "*")? * as_number(&r, "*")?)),
        BinaryOp::Div => {
            let divisor = as_number(&r, "/")?;
            if divisor == 0.0 {
                return Err(ExpressionError::Type {
                    expr: "/".into(),
                    reason: "division by zero".into(),
                });
            }
            Ok(Value::from(as_number(&l, "/")? / divisor))
        }
        BinaryOp::Eq => Ok(Value::Bool(l == r)),
        BinaryOp::Ne => Ok(Value::Bool(l != r)),
        BinaryOp::Lt => Ok(Value::Bool(as_number(&l, "<")? < as_number(&r, "<")?)),
        BinaryOp::Le => Ok(Value::Bool(as_number(&l, "<=")? <= as_number(&r, "<=")?)),
        BinaryOp::Gt => Ok(Value::Bool(as_number(&l, ">")? > as_number(&r, ">")?)),
        BinaryOp::Ge => Ok(Value::Bool(as_number(&l, ">=")? >= as_number(&r, ">=")?)),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above with short-circuiting"),
    }
}

fn as_number(v: &Value, op: &str) -> Result<f64, ExpressionError> {
    v.as_f64().ok_or_else(|| ExpressionError::Type {
        expr: op.to_string(),
        reason: format!("expected a number, found {v}"),
    })
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Value, ExpressionError> {
    match name {
        "len" => {
            let [arg] = require_arity(name, args, 1)?;
            let v = eval(arg, ctx)?;
            let len = match &v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                _ => {
                    return Err(ExpressionError::Type {
                        expr: name.to_string(),
                        reason: "len() expects a string, list, or object".into(),
                    })
                }
            };
            Ok(Value::from(len as u64))
        }
        "bool" => {
            let [arg] = require_arity(name, args, 1)?;
            Ok(Value::Bool(truthy(&eval(arg, ctx)?)))
        }
        "in" => {
            let [item, collection] = require_arity(name, args, 2)?;
            let item_v = eval(item, ctx)?;
            let collection_v = eval(collection, ctx)?;
            let found = match &collection_v {
                Value::Array(a) => a.contains(&item_v),
                Value::Object(o) => item_v
                    .as_str()
                    .map(|k| o.contains_key(k))
                    .unwrap_or(false),
                Value::String(s) => item_v
                    .as_str()
                    .map(|needle| s.contains(needle))
                    .unwrap_or(false),
                _ => false,
            };
            Ok(Value::Bool(found))
        }
        "default" => {
            let [value, fallback] = require_arity(name, args, 2)?;
            let v = eval(value, ctx)?;
            if v.is_null() {
                eval(fallback, ctx)
            } else {
                Ok(v)
            }
        }
        other => Err(ExpressionError::UnknownFunction(other.to_string())),
    }
}

fn require_arity<'a, const N: usize>(
    name: &str,
    args: &'a [Expr],
    expected: usize,
) -> Result<[&'a Expr; N], ExpressionError> {
    if args.len() != expected {
        return Err(ExpressionError::Arity(name.to_string()));
    }
    Ok(std::array::from_fn(|i| &args[i]))
}
