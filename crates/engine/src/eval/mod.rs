//! The data-flow expression evaluator (§4.3).
//!
//! A small, closed expression language: variable lookup, dotted path
//! traversal, arithmetic, comparison, boolean combinators, list/object
//! literals, and a fixed set of built-in functions. Expressions are parsed
//! once into an [`ast::Expr`] and evaluated any number of times against an
//! [`EvalContext`] snapshot; evaluation never mutates what it reads.

mod ast;
mod context;
mod error;
mod eval;
mod lexer;
mod parser;

pub use ast::Expr;
pub use context::EvalContext;
pub use error::ExpressionError;
pub use eval::truthy;
pub use parser::parse_expr;

use ast::PathSegment;
use std::collections::BTreeSet;

/// Parses and evaluates `expr` against `ctx` in one call.
///
/// Most callers want this; the two-step `parse_expr` + `eval::eval` split
/// exists for callers (the task state machine) that evaluate the same
/// `TaskSpec` expression on every attempt and want to parse it once.
pub fn evaluate(expr: &str, ctx: &EvalContext) -> Result<serde_json::Value, ExpressionError> {
    let ast = parse_expr(expr)?;
    eval::eval(&ast, ctx)
}

/// The set of root path identifiers an expression reads from the eval
/// context (e.g. `$.greeting` and bare `greeting` both yield `"greeting"`).
/// Used by reverse-workflow scheduling (§4.5) to trace a published output
/// back to the task that publishes it.
pub fn referenced_roots(expr: &str) -> Result<BTreeSet<String>, ExpressionError> {
    let ast = parse_expr(expr)?;
    let mut roots = BTreeSet::new();
    collect_roots(&ast, &mut roots);
    Ok(roots)
}

fn collect_roots(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Path(segments) => {
            if let Some(PathSegment::Field(name)) = segments.first() {
                out.insert(name.clone());
            }
            for segment in segments {
                if let PathSegment::Index(index_expr) = segment {
                    collect_roots(index_expr, out);
                }
            }
        }
        Expr::Unary(_, inner) => collect_roots(inner, out),
        Expr::Binary(_, lhs, rhs) => {
            collect_roots(lhs, out);
            collect_roots(rhs, out);
        }
        Expr::List(items) => items.iter().for_each(|item| collect_roots(item, out)),
        Expr::Object(fields) => fields.iter().for_each(|(_, v)| collect_roots(v, out)),
        Expr::Call(_, args) => args.iter().for_each(|arg| collect_roots(arg, out)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EvalContext {
        let mut c = EvalContext::new(json!({"name": "world"}));
        c.publish("greeting", json!("Hi"));
        c
    }

    #[test]
    fn literal_values() {
        assert_eq!(evaluate("42", &ctx()).unwrap(), json!(42.0));
        assert_eq!(evaluate("'hello'", &ctx()).unwrap(), json!("hello"));
        assert_eq!(evaluate("true", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("null", &ctx()).unwrap(), json!(null));
    }

    #[test]
    fn published_lookup_via_dollar_sigil() {
        assert_eq!(evaluate("$.greeting", &ctx()).unwrap(), json!("Hi"));
    }

    #[test]
    fn bare_identifier_lookup() {
        assert_eq!(evaluate("greeting", &ctx()).unwrap(), json!("Hi"));
    }

    #[test]
    fn input_namespace() {
        assert_eq!(evaluate("$.input.name", &ctx()).unwrap(), json!("world"));
    }

    #[test]
    fn unknown_variable_is_null_not_an_error() {
        assert_eq!(evaluate("$.nonexistent", &ctx()).unwrap(), json!(null));
    }

    #[test]
    fn arithmetic() {
        assert_eq!(evaluate("1 + 2 * 3", &ctx()).unwrap(), json!(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &ctx()).unwrap(), json!(9.0));
        assert_eq!(evaluate("10 / 4", &ctx()).unwrap(), json!(2.5));
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(evaluate("'a' + 'b'", &ctx()).unwrap(), json!("ab"));
    }

    #[test]
    fn comparisons_and_booleans() {
        assert_eq!(evaluate("1 < 2 && 2 < 3", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("1 > 2 || 3 == 3", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("!false", &ctx()).unwrap(), json!(true));
    }

    #[test]
    fn list_and_object_literals() {
        assert_eq!(evaluate("[1, 2, 3]", &ctx()).unwrap(), json!([1.0, 2.0, 3.0]));
        assert_eq!(
            evaluate("{msg: $.greeting}", &ctx()).unwrap(),
            json!({"msg": "Hi"})
        );
    }

    #[test]
    fn indexing() {
        let mut c = ctx();
        c.publish("items", json!(["a", "b", "c"]));
        assert_eq!(evaluate("$.items[1]", &c).unwrap(), json!("b"));
    }

    #[test]
    fn builtins() {
        assert_eq!(evaluate("len('hello')", &ctx()).unwrap(), json!(5));
        assert_eq!(evaluate("len([1,2,3])", &ctx()).unwrap(), json!(3));
        assert_eq!(evaluate("bool('')", &ctx()).unwrap(), json!(false));
        assert_eq!(evaluate("bool('x')", &ctx()).unwrap(), json!(true));
        assert_eq!(evaluate("in(2, [1,2,3])", &ctx()).unwrap(), json!(true));
        assert_eq!(
            evaluate("default($.missing, 'fallback')", &ctx()).unwrap(),
            json!("fallback")
        );
    }

    #[test]
    fn referenced_roots_collects_published_names() {
        let roots = referenced_roots("{summary: $.greeting, total: len($.items) + extra}").unwrap();
        assert_eq!(
            roots,
            ["greeting", "items", "extra"].into_iter().map(String::from).collect()
        );
    }

    #[test]
    fn malformed_expression_is_expression_error() {
        assert!(evaluate("1 +", &ctx()).is_err());
        assert!(evaluate("(1 + 2", &ctx()).is_err());
    }

    #[test]
    fn unknown_function_is_expression_error() {
        assert!(matches!(
            evaluate("nope(1)", &ctx()),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }

    #[test]
    fn wrong_arity_is_expression_error() {
        assert!(matches!(
            evaluate("len(1, 2)", &ctx()),
            Err(ExpressionError::Arity(_))
        ));
    }

    #[test]
    fn type_mismatch_is_expression_error() {
        assert!(matches!(
            evaluate("'a' - 1", &ctx()),
            Err(ExpressionError::Type { .. })
        ));
    }

    #[test]
    fn deterministic_and_total_over_well_formed_input() {
        let expr = "1 + 2 == 3 && len('abc') == 3";
        let c = ctx();
        for _ in 0..5 {
            assert_eq!(evaluate(expr, &c).unwrap(), json!(true));
        }
    }
}
