use serde_json::Value;

/// A parsed data-flow expression.
///
/// Built once by [`super::parse_expr`] and evaluated any number of times
/// against different [`super::EvalContext`]s; the AST itself holds no
/// context and is safe to cache per `TaskSpec`/`WorkflowSpec` field.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A dotted/indexed path, e.g. `greeting`, `input.user.id`, `items[0]`.
    /// Segments are resolved left to right against the context root.
    Path(Vec<PathSegment>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    List(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Field(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}
