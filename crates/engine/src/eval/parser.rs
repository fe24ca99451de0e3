use serde_json::Value;

use super::ast::{BinaryOp, Expr, PathSegment, UnaryOp};
use super::lexer::{tokenize, Token};
use super::error::ExpressionError;

/// Parses a single expression string into an [`Expr`].
///
/// Grammar (lowest to highest precedence):
/// `or := and ('||' and)*`
/// `and := not ('&&' not)*`
/// `not := '!' not | cmp`
/// `cmp := add (('=='|'!='|'<'|'<='|'>'|'>=') add)?`
/// `add := mul (('+'|'-') mul)*`
/// `mul := unary (('*'|'/') unary)*`
/// `unary := '-' unary | primary`
/// `primary := number | string | bool | null | list | object | path | call | '(' or ')'`
pub fn parse_expr(src: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(src).map_err(|reason| ExpressionError::Syntax {
        expr: src.to_string(),
        reason,
    })?;
    let mut p = Parser { tokens, pos: 0, src };
    let expr = p.parse_or()?;
    p.expect(Token::Eof)?;
    Ok(expr)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, reason: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expr: self.src.to_string(),
            reason: reason.into(),
        }
    }

    fn expect(&mut self, want: Token) -> Result<(), ExpressionError> {
        if *self.peek() == want {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {want:?}, found {:?}", self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_not()?;
        while *self.peek() == Token::And {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == Token::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_add(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_mul()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if *self.peek() == Token::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        self.parse_postfix()
    }

    /// Parses a primary, then any trailing `.field` / `[expr]` segments,
    /// folding a bare identifier/`$` primary into a `Path`.
    fn parse_postfix(&mut self) -> Result<Expr, ExpressionError> {
        let mut segments: Vec<PathSegment> = match self.peek().clone() {
            Token::Dollar => {
                self.advance();
                Vec::new()
            }
            Token::Ident(name) => {
                self.advance();
                if *self.peek() == Token::LParen {
                    return self.parse_call(name);
                }
                vec![PathSegment::Field(name)]
            }
            _ => return self.parse_primary(),
        };

        loop {
            match self.peek().clone() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        other => return Err(self.err(format!("expected field name, found {other:?}"))),
                    };
                    segments.push(PathSegment::Field(name));
                }
                Token::LBracket => {
                    self.advance();
                    let index_expr = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    segments.push(PathSegment::Index(Box::new(index_expr)));
                }
                _ => break,
            }
        }

        Ok(Expr::Path(segments))
    }

    fn parse_call(&mut self, name: String) -> Result<Expr, ExpressionError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            args.push(self.parse_or()?);
            while *self.peek() == Token::Comma {
                self.advance();
                args.push(self.parse_or()?);
            }
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Call(name, args))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::from(n))),
            Token::String(s) => Ok(Expr::Literal(Value::from(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    items.push(self.parse_or()?);
                    while *self.peek() == Token::Comma {
                        self.advance();
                        items.push(self.parse_or()?);
                    }
                }
                self.expect(Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                if *self.peek() != Token::RBrace {
                    fields.push(self.parse_object_field()?);
                    while *self.peek() == Token::Comma {
                        self.advance();
                        fields.push(self.parse_object_field()?);
                    }
                }
                self.expect(Token::RBrace)?;
                Ok(Expr::Object(fields))
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_object_field(&mut self) -> Result<(String, Expr), ExpressionError> {
        let key = match self.advance() {
            Token::Ident(s) | Token::String(s) => s,
            other => return Err(self.err(format!("expected object key, found {other:?}"))),
        };
        self.expect(Token::Colon)?;
        let value = self.parse_or()?;
        Ok((key, value))
    }
}
