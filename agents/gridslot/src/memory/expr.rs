// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Batch system removal expressions.
//!
//! HTCondor tells its jobs when they will be removed with a ClassAd
//! expression such as `ResidentSetSize > JobMemoryLimit * 0.95`. Only the
//! arithmetic and boolean subset needed for memory policies is understood:
//! numbers, identifiers, `+ - * /`, comparisons, `&& || !`, parentheses and
//! `true`/`false`. Identifiers are case insensitive and may carry a `MY.` or
//! `TARGET.` scope prefix, which is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;

/// Evaluates a removal policy against per-job variables.
pub trait ExpressionEvaluator: Send + Sync {
    /// Ok(true) means the job would be removed.
    fn is_breached(&self, vars: &BTreeMap<String, f64>) -> Result<bool>;

    fn source(&self) -> &str;
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

fn lex_number(first: char, chars: &mut Peekable<Chars>) -> Result<Token> {
    let mut text = String::from(first);
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
            text.push(c);
            chars.next();
        } else {
            break;
        }
    }
    text.parse::<f64>()
        .map(Token::Num)
        .map_err(|_| anyhow!("Invalid number '{}'", text))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = vec![];
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '+' => Token::Op("+"),
            '-' => Token::Op("-"),
            '*' => Token::Op("*"),
            '/' => Token::Op("/"),
            '<' | '>' | '=' | '!' => {
                let eq = chars.peek() == Some(&'=');
                if eq {
                    chars.next();
                }
                match (c, eq) {
                    ('<', false) => Token::Op("<"),
                    ('<', true) => Token::Op("<="),
                    ('>', false) => Token::Op(">"),
                    ('>', true) => Token::Op(">="),
                    ('=', true) => Token::Op("=="),
                    ('!', true) => Token::Op("!="),
                    ('!', false) => Token::Op("!"),
                    _ => bail!("Unexpected '=' in expression"),
                }
            }
            '&' | '|' => {
                if chars.next() != Some(c) {
                    bail!("Expected '{}{}'", c, c);
                }
                Token::Op(if c == '&' { "&&" } else { "||" })
            }
            c if c.is_ascii_digit() || c == '.' => lex_number(c, &mut chars)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&c) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                Token::Ident(ident)
            }
            c => bail!("Unexpected character '{}'", c),
        };
        tokens.push(token);
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn binary(
        &mut self,
        ops: &[(&str, BinOp)],
        operand: fn(&mut Parser) -> Result<Expr>,
        repeat: bool,
    ) -> Result<Expr> {
        let mut lhs = operand(self)?;
        while let Some(op) = self.peek_op() {
            let Some(&(_, bin)) = ops.iter().find(|(name, _)| *name == op) else {
                break;
            };
            self.pos += 1;
            let rhs = operand(self)?;
            lhs = Expr::Bin(bin, Box::new(lhs), Box::new(rhs));
            if !repeat {
                break;
            }
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr> {
        self.binary(&[("||", BinOp::Or)], Parser::and, true)
    }

    fn and(&mut self) -> Result<Expr> {
        self.binary(&[("&&", BinOp::And)], Parser::not, true)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.peek_op() == Some("!") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let ops = [
            ("<", BinOp::Lt),
            ("<=", BinOp::Le),
            (">", BinOp::Gt),
            (">=", BinOp::Ge),
            ("==", BinOp::Eq),
            ("!=", BinOp::Ne),
        ];
        self.binary(&ops, Parser::sum, false)
    }

    fn sum(&mut self) -> Result<Expr> {
        self.binary(&[("+", BinOp::Add), ("-", BinOp::Sub)], Parser::term, true)
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary(&[("*", BinOp::Mul), ("/", BinOp::Div)], Parser::unary, true)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek_op() == Some("-") {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(n)) => Ok(Expr::Num(n)),
            Some(Token::Ident(name)) => Ok(match name.to_ascii_lowercase().as_str() {
                "true" => Expr::Num(1.0),
                "false" => Expr::Num(0.0),
                _ => Expr::Var(normalize_ident(&name)),
            }),
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => bail!("Missing ')'"),
                }
            }
            Some(token) => bail!("Unexpected token {:?}", token),
            None => bail!("Unexpected end of expression"),
        }
    }
}

fn normalize_ident(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    for scope in ["my.", "target."] {
        if let Some(rest) = lower.strip_prefix(scope) {
            return rest.to_string();
        }
    }
    lower
}

fn truth(v: f64) -> bool {
    v != 0.0
}

fn bool_val(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

impl Expr {
    fn eval(&self, vars: &BTreeMap<String, f64>) -> Result<f64> {
        Ok(match self {
            Expr::Num(n) => *n,
            Expr::Var(name) => *vars
                .get(name)
                .ok_or_else(|| anyhow!("Undefined attribute '{}'", name))?,
            Expr::Neg(e) => -e.eval(vars)?,
            Expr::Not(e) => bool_val(!truth(e.eval(vars)?)),
            Expr::Bin(BinOp::And, l, r) => bool_val(truth(l.eval(vars)?) && truth(r.eval(vars)?)),
            Expr::Bin(BinOp::Or, l, r) => bool_val(truth(l.eval(vars)?) || truth(r.eval(vars)?)),
            Expr::Bin(op, l, r) => {
                let (l, r) = (l.eval(vars)?, r.eval(vars)?);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => {
                        if r == 0.0 {
                            bail!("Division by zero");
                        }
                        l / r
                    }
                    BinOp::Lt => bool_val(l < r),
                    BinOp::Le => bool_val(l <= r),
                    BinOp::Gt => bool_val(l > r),
                    BinOp::Ge => bool_val(l >= r),
                    BinOp::Eq => bool_val(l == r),
                    BinOp::Ne => bool_val(l != r),
                    BinOp::And | BinOp::Or => unreachable!(),
                }
            }
        })
    }
}

/// A parsed removal expression.
#[derive(Clone, Debug)]
pub struct RemovalExpr {
    source: String,
    root: Expr,
}

impl RemovalExpr {
    pub fn parse(source: &str) -> Result<RemovalExpr> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.or()?;
        if parser.pos < parser.tokens.len() {
            bail!(
                "Trailing tokens after position {} in '{}'",
                parser.pos,
                source
            );
        }
        Ok(RemovalExpr {
            source: source.trim().to_string(),
            root,
        })
    }

    /// Evaluate to a number. Booleans are 1 and 0.
    pub fn eval(&self, vars: &BTreeMap<String, f64>) -> Result<f64> {
        self.root.eval(vars)
    }
}

impl fmt::Display for RemovalExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl ExpressionEvaluator for RemovalExpr {
    fn is_breached(&self, vars: &BTreeMap<String, f64>) -> Result<bool> {
        let vars = vars
            .iter()
            .map(|(k, v)| (normalize_ident(k), *v))
            .collect();
        Ok(truth(self.eval(&vars)?))
    }

    fn source(&self) -> &str {
        &self.source
    }
}
