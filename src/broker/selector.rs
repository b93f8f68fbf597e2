//! Message selectors.
//!
//! A subset of the SQL-92 conditional syntax used by JMS selectors,
//! evaluated against message properties:
//!
//! ```text
//! expr    := and ( OR and )*
//! and     := unary ( AND unary )*
//! unary   := NOT unary | primary
//! primary := '(' expr ')' | ident op literal | ident IS [NOT] NULL
//! op      := = | <> | < | <= | > | >=
//! literal := 'string' | number | TRUE | FALSE
//! ```
//!
//! Keywords are case-insensitive. A comparison against an absent property is false.
//! Parentheses and `NOT` nest at most `MAX_NESTING` levels deep.

use std::collections::BTreeMap;

use crate::utils::{Error, Result};

/// Deepest allowed nesting of parentheses and `NOT`.
pub const MAX_NESTING: usize = 100;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(String, CmpOp, Literal),
    IsNull(String, bool),
}

/// A compiled selector expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    expression: String,
    root: Expr,
}

impl Selector {
    pub fn parse(expression: &str) -> Result<Self> {
        let fail = |reason: String| Error::InvalidSelector {
            expression: expression.to_string(),
            reason,
        };

        let tokens = tokenize(expression).map_err(fail)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_or().map_err(fail)?;
        if parser.pos != parser.tokens.len() {
            return Err(fail(format!(
                "unexpected token {:?}",
                parser.tokens[parser.pos]
            )));
        }

        Ok(Self {
            expression: expression.to_string(),
            root,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn matches(&self, properties: &BTreeMap<String, String>) -> bool {
        eval(&self.root, properties)
    }
}

fn eval(expr: &Expr, props: &BTreeMap<String, String>) -> bool {
    match expr {
        Expr::Or(terms) => terms.iter().any(|term| eval(term, props)),
        Expr::And(terms) => terms.iter().all(|term| eval(term, props)),
        Expr::Not(inner) => !eval(inner, props),
        Expr::IsNull(name, negated) => props.contains_key(name) == *negated,
        Expr::Compare(name, op, literal) => {
            let Some(value) = props.get(name) else {
                return false;
            };
            let ordering = match literal {
                Literal::Num(n) => match value.trim().parse::<f64>() {
                    Ok(v) => v.partial_cmp(n),
                    Err(_) => return false,
                },
                Literal::Str(s) => Some(value.as_str().cmp(s.as_str())),
                Literal::Bool(b) => match value.to_ascii_lowercase().as_str() {
                    "true" => Some(true.cmp(b)),
                    "false" => Some(false.cmp(b)),
                    _ => return false,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                CmpOp::Eq => ordering.is_eq(),
                CmpOp::Ne => ordering.is_ne(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
            }
        }
    }
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Op(CmpOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Op(CmpOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Op(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Op(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        // '' is an escaped quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn descend(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(format!("nested deeper than {MAX_NESTING} levels"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> ParseResult {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::Or(terms),
        })
    }

    fn parse_and(&mut self) -> ParseResult {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(match terms.len() {
            1 => terms.remove(0),
            _ => Expr::And(terms),
        })
    }

    fn parse_unary(&mut self) -> ParseResult {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ParseResult {
        match self.next() {
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(name)) => match self.next() {
                Some(Token::Op(op)) => {
                    let literal = match self.next() {
                        Some(Token::Str(s)) => Literal::Str(s),
                        Some(Token::Num(n)) => Literal::Num(n),
                        Some(Token::True) => Literal::Bool(true),
                        Some(Token::False) => Literal::Bool(false),
                        other => return Err(format!("expected literal, found {other:?}")),
                    };
                    Ok(Expr::Compare(name, op, literal))
                }
                Some(Token::Is) => {
                    let negated = if self.peek() == Some(&Token::Not) {
                        self.pos += 1;
                        true
                    } else {
                        false
                    };
                    match self.next() {
                        Some(Token::Null) => Ok(Expr::IsNull(name, negated)),
                        _ => Err("expected NULL".to_string()),
                    }
                }
                other => Err(format!("expected operator after '{name}', found {other:?}")),
            },
            other => Err(format!("expected identifier or '(', found {other:?}")),
        }
    }
}
