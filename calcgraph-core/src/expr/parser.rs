//! Expression Parser
//!
//! A tokenizer and recursive-descent parser for the calculation language.
//! The grammar is a small, Python-flavoured expression subset:
//!
//! ```text
//! expr       := or_expr ["if" or_expr "else" expr]
//! or_expr    := and_expr ("or" and_expr)*
//! and_expr   := not_expr ("and" not_expr)*
//! not_expr   := "not" not_expr | comparison
//! comparison := arith (cmp_op arith)*
//! arith      := term (("+" | "-") term)*
//! term       := factor (("*" | "/" | "//" | "%") factor)*
//! factor     := ("-" | "+") factor | power
//! power      := postfix ["**" factor]
//! postfix    := atom ("(" args ")" | "[" expr "]" | "." ident)*
//! atom       := number | string | ident | "True" | "False" | "None"
//!             | "(" expr ")" | "[" [expr ("," expr)* [","]] "]"
//! ```
//!
//! Newlines are plain whitespace and `#` starts a comment, so multi-line
//! calculations need no indentation cleanup before parsing.
//!
//! Nesting depth is capped at [`MAX_DEPTH`]. Every bracket, unary operator,
//! exponent and chained binary or postfix operator counts one level, so the
//! resulting tree can be walked recursively without exhausting the stack.

use crate::error::SyntaxError;

use super::ir::{BinOp, Expr, UnaryOp};

/// Deepest expression the parser accepts.
pub const MAX_DEPTH: usize = 200;

/// Operators and punctuation, longest first so that `**` wins over `*`.
const PUNCTUATION: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+", "-", "*", "/", "%", "<", ">", "(", ")", "[", "]",
    ",", ".",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    Punct(&'static str),
    Eof,
}

/// Parse a complete expression.
pub fn parse(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(SyntaxError::new(
            format!("unexpected {}", describe(other)),
            parser.offset(),
        )),
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '#' {
            while let Some(&(_, c)) = chars.peek() {
                if c == '\n' {
                    break;
                }
                chars.next();
            }
            continue;
        }

        if c.is_ascii_digit()
            || (c == '.' && source[start + 1..].starts_with(|n: char| n.is_ascii_digit()))
        {
            let mut end = start;
            let mut seen_exp = false;
            let mut prev = '\0';
            while let Some(&(i, c)) = chars.peek() {
                let accept = c.is_ascii_digit()
                    || c == '.'
                    || c == '_'
                    || (!seen_exp && (c == 'e' || c == 'E'))
                    || ((c == '+' || c == '-') && (prev == 'e' || prev == 'E'));
                if !accept {
                    break;
                }
                if c == 'e' || c == 'E' {
                    seen_exp = true;
                }
                prev = c;
                end = i + c.len_utf8();
                chars.next();
            }
            let literal: String = source[start..end].chars().filter(|c| *c != '_').collect();
            let value = literal
                .parse::<f64>()
                .map_err(|_| SyntaxError::new(format!("invalid number literal {literal:?}"), start))?;
            tokens.push((Token::Number(value), start));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            chars.next();
            let mut text = String::new();
            let mut closed = false;
            while let Some((_, c)) = chars.next() {
                match c {
                    '\\' => {
                        let (_, escaped) = chars
                            .next()
                            .ok_or_else(|| SyntaxError::new("unterminated string literal", start))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '0' => '\0',
                            other => other,
                        });
                    }
                    '\n' => break,
                    c if c == quote => {
                        closed = true;
                        break;
                    }
                    c => text.push(c),
                }
            }
            if !closed {
                return Err(SyntaxError::new("unterminated string literal", start));
            }
            tokens.push((Token::Text(text), start));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, c)) = chars.peek() {
                if !(c.is_alphanumeric() || c == '_') {
                    break;
                }
                end = i + c.len_utf8();
                chars.next();
            }
            tokens.push((Token::Ident(source[start..end].to_string()), start));
            continue;
        }

        let rest = &source[start..];
        match PUNCTUATION.iter().find(|p| rest.starts_with(**p)) {
            Some(punct) => {
                for _ in 0..punct.len() {
                    chars.next();
                }
                tokens.push((Token::Punct(punct), start));
            }
            None => {
                return Err(SyntaxError::new(format!("unexpected character {c:?}"), start));
            }
        }
    }

    tokens.push((Token::Eof, source.len()));
    Ok(tokens)
}

fn describe(token: &Token) -> String {
    match token {
        Token::Number(n) => format!("number {n}"),
        Token::Text(s) => format!("string {s:?}"),
        Token::Ident(s) => format!("name '{s}'"),
        Token::Punct(p) => format!("'{p}'"),
        Token::Eof => "end of input".to_string(),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].1
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn at_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), Token::Punct(p) if *p == punct)
    }

    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Token::Ident(s) if s == keyword)
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), SyntaxError> {
        if self.at_punct(punct) {
            self.advance();
            Ok(())
        } else {
            Err(SyntaxError::new(
                format!("expected '{punct}', found {}", describe(self.peek())),
                self.offset(),
            ))
        }
    }

    /// Take one level of nesting, failing once the cap is reached.
    fn descend(&mut self) -> Result<(), SyntaxError> {
        if self.depth >= MAX_DEPTH {
            return Err(SyntaxError::new(
                "expression nested too deeply",
                self.offset(),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested(
        &mut self,
        rule: fn(&mut Self) -> Result<Expr, SyntaxError>,
    ) -> Result<Expr, SyntaxError> {
        self.descend()?;
        let expr = rule(self);
        self.depth -= 1;
        expr
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> Result<Expr, SyntaxError> {
        let body = self.or_expr()?;
        if !self.at_keyword("if") {
            return Ok(body);
        }
        self.advance();
        let test = self.or_expr()?;
        if !self.at_keyword("else") {
            return Err(SyntaxError::new(
                "expected 'else' in conditional expression",
                self.offset(),
            ));
        }
        self.advance();
        let orelse = self.expr()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            body: Box::new(body),
            orelse: Box::new(orelse),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        let depth = self.depth;
        while self.at_keyword("or") {
            self.advance();
            self.descend()?;
            let right = self.and_expr()?;
            left = binary(BinOp::Or, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        let depth = self.depth;
        while self.at_keyword("and") {
            self.advance();
            self.descend()?;
            let right = self.not_expr()?;
            left = binary(BinOp::And, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.at_keyword("not") {
            self.advance();
            let operand = self.nested(Self::not_expr)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.comparison()
    }

    /// Chained comparisons `a < b < c` mean `a < b and b < c`.
    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.arith()?;
        let mut left = first.clone();
        let mut chain: Option<Expr> = None;
        let depth = self.depth;

        loop {
            let op = match self.peek() {
                Token::Punct(p) => match BinOp::from_punct(p) {
                    Some(op @ (BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne)) => op,
                    _ => break,
                },
                _ => break,
            };
            self.advance();
            self.descend()?;
            let right = self.arith()?;
            let link = binary(op, left, right.clone());
            chain = Some(match chain {
                Some(prev) => binary(BinOp::And, prev, link),
                None => link,
            });
            left = right;
        }

        self.depth = depth;
        Ok(chain.unwrap_or(first))
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        let depth = self.depth;
        loop {
            let op = if self.at_punct("+") {
                BinOp::Add
            } else if self.at_punct("-") {
                BinOp::Sub
            } else {
                break;
            };
            self.advance();
            self.descend()?;
            let right = self.term()?;
            left = binary(op, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        let depth = self.depth;
        loop {
            let op = match self.peek() {
                Token::Punct("*") => BinOp::Mul,
                Token::Punct("/") => BinOp::Div,
                Token::Punct("//") => BinOp::FloorDiv,
                Token::Punct("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            self.descend()?;
            let right = self.factor()?;
            left = binary(op, left, right);
        }
        self.depth = depth;
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        let op = if self.at_punct("-") {
            UnaryOp::Neg
        } else if self.at_punct("+") {
            UnaryOp::Pos
        } else {
            return self.power();
        };
        self.advance();
        let operand = self.nested(Self::factor)?;
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.postfix()?;
        if self.at_punct("**") {
            self.advance();
            // Right associative, and binds tighter than a unary minus on the left.
            let exponent = self.nested(Self::factor)?;
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        let depth = self.depth;
        loop {
            if self.at_punct("(") || self.at_punct("[") || self.at_punct(".") {
                self.descend()?;
            }
            if self.at_punct("(") {
                self.advance();
                let args = self.sequence(")")?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.at_punct("[") {
                self.advance();
                let index = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.at_punct(".") {
                self.advance();
                let offset = self.offset();
                match self.advance() {
                    Token::Ident(attr) => {
                        expr = Expr::Attribute {
                            value: Box::new(expr),
                            attr,
                        };
                    }
                    other => {
                        return Err(SyntaxError::new(
                            format!("expected attribute name, found {}", describe(&other)),
                            offset,
                        ));
                    }
                }
            } else {
                self.depth = depth;
                return Ok(expr);
            }
        }
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Text(s) => {
                // Adjacent literals concatenate: 'a' 'b' == 'ab'.
                let mut text = s;
                while let Token::Text(next) = self.peek() {
                    text.push_str(next);
                    self.advance();
                }
                Ok(Expr::Text(text))
            }
            Token::Ident(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                "and" | "or" | "not" | "if" | "else" => Err(SyntaxError::new(
                    format!("unexpected keyword '{name}'"),
                    offset,
                )),
                _ => Ok(Expr::Name(name)),
            },
            Token::Punct("(") => {
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Token::Punct("[") => Ok(Expr::List(self.sequence("]")?)),
            other => Err(SyntaxError::new(format!("unexpected {}", describe(&other)), offset)),
        }
    }

    /// Comma separated expressions up to `close`, allowing a trailing comma.
    fn sequence(&mut self, close: &str) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        loop {
            if self.at_punct(close) {
                self.advance();
                return Ok(items);
            }
            items.push(self.expr()?);
            if self.at_punct(",") {
                self.advance();
            } else {
                self.expect_punct(close)?;
                return Ok(items);
            }
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
