use logos::Logos;

use crate::errors::ExprError;

/// Token stream for the attribute expression language.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
pub enum Token<'src> {
    /// Attribute reference or builtin name; segments are `.`-separated.
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*(\.[a-zA-Z0-9_]+)*")]
    Ident(&'src str),

    /// Double-quoted string literal, raw (quotes included, escapes intact).
    #[regex(r#""([^"\\]|\\.)*""#)]
    Str(&'src str),

    #[regex(r"[0-9]+\.[0-9]+")]
    Float(&'src str),

    #[regex(r"[0-9]+")]
    Int(&'src str),

    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("|")]
    Pipe,
    #[token("!")]
    Bang,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
}

/// Tokenizes the full input up front; the parser walks the vector.
pub fn tokenize(input: &str) -> Result<Vec<(Token<'_>, std::ops::Range<usize>)>, ExprError> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(input);
    while let Some(token) = lexer.next() {
        match token {
            Ok(token) => tokens.push((token, lexer.span())),
            Err(()) => {
                return Err(ExprError::Parse {
                    offset: lexer.span().start,
                    message: format!("unexpected character {:?}", lexer.slice()),
                })
            }
        }
    }
    Ok(tokens)
}

/// Strips quotes and resolves the two supported escapes.
pub fn unquote(raw: &str) -> String {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_attribute_expression() {
        let tokens = tokenize(r#"source.name == "svc-a" && request.size != 0"#).unwrap();
        let kinds: Vec<&Token> = tokens.iter().map(|(t, _)| t).collect();
        assert!(matches!(kinds[0], Token::Ident("source.name")));
        assert!(matches!(kinds[1], Token::EqEq));
        assert!(matches!(kinds[2], Token::Str(_)));
        assert!(matches!(kinds[3], Token::AndAnd));
    }

    #[test]
    fn rejects_unknown_character() {
        let err = tokenize("attr @ 1").unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
    }

    #[test]
    fn unquote_handles_escapes() {
        assert_eq!(unquote(r#""abcd asd""#), "abcd asd");
        assert_eq!(unquote(r#""a\"b""#), "a\"b");
    }
}
