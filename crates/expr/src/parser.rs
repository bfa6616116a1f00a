use std::ops::Range;

use crate::ast::{BinaryOp, Expr, UnaryOp};
use crate::errors::ExprError;
use crate::lexer::{tokenize, unquote, Token};

/// Recursive-descent parser. Precedence, loosest first:
/// `||`, `&&`, `==`/`!=`, `|`, `+`/`-`, `*`/`/`, unary, primary.
pub fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        len: input.len(),
    };
    let expr = parser.or_expr()?;
    if let Some((_, span)) = parser.peek_with_span() {
        return Err(ExprError::Parse {
            offset: span.start,
            message: "unexpected trailing input".to_string(),
        });
    }
    Ok(expr)
}

struct Parser<'src> {
    tokens: Vec<(Token<'src>, Range<usize>)>,
    pos: usize,
    len: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn peek_with_span(&self) -> Option<(&Token<'src>, &Range<usize>)> {
        self.tokens.get(self.pos).map(|(t, s)| (t, s))
    }

    fn advance(&mut self) -> Option<Token<'src>> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, s)| s.start)
            .unwrap_or(self.len)
    }

    fn expect(&mut self, expected: Token<'src>, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            _ => Err(ExprError::Parse {
                offset: self.offset(),
                message: format!("expected {what}"),
            }),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.advance();
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.equality_expr()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.advance();
            let rhs = self.equality_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.default_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.default_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn default_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.additive_expr()?;
        while matches!(self.peek(), Some(Token::Pipe)) {
            self.advance();
            let rhs = self.additive_expr()?;
            lhs = Expr::Binary(BinaryOp::Default, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.multiplicative_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.advance();
                let inner = self.unary_expr()?;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
            }
            Some(Token::Minus) => {
                self.advance();
                let inner = self.unary_expr()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            _ => self.primary_expr(),
        }
    }

    fn primary_expr(&mut self) -> Result<Expr, ExprError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Ident("true")) => Ok(Expr::BoolLit(true)),
            Some(Token::Ident("false")) => Ok(Expr::BoolLit(false)),
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.advance();
                    let args = self.call_args()?;
                    Ok(Expr::Call(name.to_string(), args))
                } else {
                    Ok(Expr::Attribute(name.to_string()))
                }
            }
            Some(Token::Str(raw)) => Ok(Expr::StringLit(unquote(raw))),
            Some(Token::Int(raw)) => raw.parse::<i64>().map(Expr::IntLit).map_err(|_| {
                ExprError::Parse {
                    offset,
                    message: format!("integer literal {raw} out of range"),
                }
            }),
            Some(Token::Float(raw)) => raw.parse::<f64>().map(Expr::FloatLit).map_err(|_| {
                ExprError::Parse {
                    offset,
                    message: format!("invalid float literal {raw}"),
                }
            }),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen, ")")?;
                Ok(inner)
            }
            _ => Err(ExprError::Parse {
                offset,
                message: "expected expression".to_string(),
            }),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.or_expr()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => {
                    return Err(ExprError::Parse {
                        offset: self.offset(),
                        message: "expected ',' or ')' in argument list".to_string(),
                    })
                }
            }
        }
        Ok(args)
    }
}
