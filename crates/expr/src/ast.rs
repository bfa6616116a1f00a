/// Parsed expression tree, type-checked during compilation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Attribute(String),
    StringLit(String),
    IntLit(i64),
    FloatLit(f64),
    BoolLit(bool),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
    /// `a | b`: first defined value wins; used to give absent attributes a
    /// fallback.
    Default,
    Add,
    Sub,
    Mul,
    Div,
}
