//! Expression AST: a small recursive-descent compiler over a closed
//! operator/function allow-list — deliberately not a general scripting
//! evaluator.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "**",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Free function call, e.g. `sin(o0)`, `where(o0, o1, o2)`.
    Call(String, Vec<Expr>),
    /// Method-call-as-text fusion point: `o0.sum(axis=0)`,
    /// `o0.where(o1, o2)`.
    MethodCall(Box<Expr>, String, Vec<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Var(v) => write!(f, "{v}"),
            Self::Unary(UnaryOp::Neg, e) => write!(f, "(-{e})"),
            Self::Unary(UnaryOp::Not, e) => write!(f, "(~{e})"),
            Self::Binary(op, l, r) => write!(f, "({l}{op}{r})"),
            Self::Call(name, args) => {
                write!(f, "{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Self::MethodCall(recv, name, args) => {
                write!(f, "{recv}.{name}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl Expr {
    /// Every `Var` name referenced, in first-occurrence order.
    pub fn var_names(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars(&self, out: &mut Vec<String>) {
        match self {
            Self::Num(_) => {}
            Self::Var(v) => {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            Self::Unary(_, e) => e.collect_vars(out),
            Self::Binary(_, l, r) => {
                l.collect_vars(out);
                r.collect_vars(out);
            }
            Self::Call(_, args) => args.iter().for_each(|a| a.collect_vars(out)),
            Self::MethodCall(recv, _, args) => {
                recv.collect_vars(out);
                args.iter().for_each(|a| a.collect_vars(out));
            }
        }
    }

    /// Rewrite every `Var(oK)` reference using `remap`, leaving
    /// `_where_x`/`_where_y` untouched.
    pub fn remap_vars(&self, remap: &std::collections::HashMap<String, String>) -> Expr {
        match self {
            Self::Num(n) => Self::Num(*n),
            Self::Var(v) => Self::Var(remap.get(v).cloned().unwrap_or_else(|| v.clone())),
            Self::Unary(op, e) => Self::Unary(*op, Box::new(e.remap_vars(remap))),
            Self::Binary(op, l, r) => Self::Binary(
                *op,
                Box::new(l.remap_vars(remap)),
                Box::new(r.remap_vars(remap)),
            ),
            Self::Call(name, args) => Self::Call(
                name.clone(),
                args.iter().map(|a| a.remap_vars(remap)).collect(),
            ),
            Self::MethodCall(recv, name, args) => Self::MethodCall(
                Box::new(recv.remap_vars(remap)),
                name.clone(),
                args.iter().map(|a| a.remap_vars(remap)).collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Dot,
    Eq,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error: {}", self.0)
    }
}
impl std::error::Error for ParseError {}

fn tokenize(s: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)) {
            let start = i;
            while i < chars.len()
                && (chars[i].is_ascii_digit()
                    || chars[i] == '.'
                    || chars[i] == 'e'
                    || chars[i] == 'E'
                    || ((chars[i] == '+' || chars[i] == '-')
                        && matches!(chars.get(i.wrapping_sub(1)), Some('e') | Some('E'))))
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n = text
                .parse::<f64>()
                .map_err(|_| ParseError(format!("bad number literal {text:?}")))?;
            out.push(Token::Num(n));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            out.push(Token::Ident(chars[start..i].iter().collect()));
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let op2 = match two.as_str() {
            "**" => Some("**"),
            "<=" => Some("<="),
            ">=" => Some(">="),
            "==" => Some("=="),
            "!=" => Some("!="),
            _ => None,
        };
        if let Some(op) = op2 {
            out.push(Token::Op(op));
            i += 2;
            continue;
        }
        match c {
            '+' => out.push(Token::Op("+")),
            '-' => out.push(Token::Op("-")),
            '*' => out.push(Token::Op("*")),
            '/' => out.push(Token::Op("/")),
            '%' => out.push(Token::Op("%")),
            '&' => out.push(Token::Op("&")),
            '|' => out.push(Token::Op("|")),
            '~' => out.push(Token::Op("~")),
            '<' => out.push(Token::Op("<")),
            '>' => out.push(Token::Op(">")),
            '(' => out.push(Token::LParen),
            ')' => out.push(Token::RParen),
            ',' => out.push(Token::Comma),
            '.' => out.push(Token::Dot),
            '=' => out.push(Token::Eq),
            other => return Err(ParseError(format!("unexpected character {other:?}"))),
        }
        i += 1;
    }
    out.push(Token::End);
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
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

    fn expect(&mut self, t: &Token) -> Result<(), ParseError> {
        if self.peek() == t {
            self.advance();
            Ok(())
        } else {
            Err(ParseError(format!("expected {t:?}, found {:?}", self.peek())))
        }
    }

    // comparison (lowest) -> bitor -> bitand -> additive -> multiplicative -> power -> unary -> postfix -> atom
    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bitor()?;
        loop {
            let op = match self.peek() {
                Token::Op("<") => BinOp::Lt,
                Token::Op("<=") => BinOp::Le,
                Token::Op(">") => BinOp::Gt,
                Token::Op(">=") => BinOp::Ge,
                Token::Op("==") => BinOp::Eq,
                Token::Op("!=") => BinOp::Ne,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_bitor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_bitand()?;
        while matches!(self.peek(), Token::Op("|")) {
            self.advance();
            let rhs = self.parse_bitand()?;
            lhs = Expr::Binary(BinOp::BitOr, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_bitand(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        while matches!(self.peek(), Token::Op("&")) {
            self.advance();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(BinOp::BitAnd, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Op("+") => BinOp::Add,
                Token::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Token::Op("*") => BinOp::Mul,
                Token::Op("/") => BinOp::Div,
                Token::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_power()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_unary()?;
        if matches!(self.peek(), Token::Op("**")) {
            self.advance();
            // right-associative
            let rhs = self.parse_power()?;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Token::Op("-") => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Op("~") => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            if matches!(self.peek(), Token::Dot) {
                self.advance();
                let name = match self.advance() {
                    Token::Ident(n) => n,
                    other => return Err(ParseError(format!("expected method name, found {other:?}"))),
                };
                if matches!(self.peek(), Token::LParen) {
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall(Box::new(expr), name, args);
                } else {
                    // bare attribute access, e.g. `.real`/`.imag`
                    expr = Expr::MethodCall(Box::new(expr), name, Vec::new());
                }
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !matches!(self.peek(), Token::RParen) {
            loop {
                // accept `kw=expr` keyword args (e.g. `axis=0`, `ddof=1`) by
                // discarding the keyword name; the evaluator keys reduction
                // options off position/semantics, not the AST.
                if let Token::Ident(_) = self.peek().clone() {
                    let save = self.pos;
                    let name = self.advance();
                    if matches!(self.peek(), Token::Eq) {
                        self.advance();
                        let val = self.parse_expr()?;
                        args.push(Expr::MethodCall(
                            Box::new(Expr::Var("__kwarg__".to_string())),
                            match name {
                                Token::Ident(n) => n,
                                _ => unreachable!(),
                            },
                            vec![val],
                        ));
                    } else {
                        self.pos = save;
                        args.push(self.parse_expr()?);
                    }
                } else {
                    args.push(self.parse_expr()?);
                }
                if matches!(self.peek(), Token::Comma) {
                    self.advance();
                    continue;
                }
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(args)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Token::Num(n) => Ok(Expr::Num(n)),
            Token::Ident(name) => {
                if matches!(self.peek(), Token::LParen) {
                    let args = self.parse_call_args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            other => Err(ParseError(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parse a canonical (or user-authored, pre-validated) expression string
/// into an [Expr] tree.
pub fn parse(s: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(s)?;
    let mut p = Parser { tokens, pos: 0 };
    let e = p.parse_expr()?;
    if !matches!(p.peek(), Token::End) {
        return Err(ParseError(format!("trailing input at {:?}", p.peek())));
    }
    Ok(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_precedence() {
        let e = parse("o0+o1*o2").unwrap();
        assert_eq!(e.to_string(), "(o0+(o1*o2))");
    }

    #[test]
    fn parses_power_right_associative() {
        let e = parse("o0**o1**o2").unwrap();
        assert_eq!(e.to_string(), "(o0**(o1**o2))");
    }

    #[test]
    fn parses_function_call() {
        let e = parse("sin(o0)+1").unwrap();
        assert_eq!(e.to_string(), "(sin(o0)+1)");
    }

    #[test]
    fn parses_where_method_call() {
        let e = parse("o0.where(o1,o2)").unwrap();
        match e {
            Expr::MethodCall(_, name, args) => {
                assert_eq!(name, "where");
                assert_eq!(args.len(), 2);
            }
            _ => panic!("expected method call"),
        }
    }

    #[test]
    fn var_names_are_insertion_ordered_and_deduped() {
        let e = parse("o1+o0*o1").unwrap();
        assert_eq!(e.var_names(), vec!["o1".to_string(), "o0".to_string()]);
    }

    #[test]
    fn remap_vars_rewrites_operand_names() {
        let e = parse("o0+o1").unwrap();
        let mut remap = std::collections::HashMap::new();
        remap.insert("o0".to_string(), "o2".to_string());
        remap.insert("o1".to_string(), "o3".to_string());
        assert_eq!(e.remap_vars(&remap).to_string(), "(o2+o3)");
    }
}
