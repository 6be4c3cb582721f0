//! Local arithmetic evaluation.
//!
//! Expressions are parsed into a closed [`Expr`] tree and evaluated by
//! matching on it. Anything the grammar doesn't know fails with
//! [`CalcError::Unsupported`]; there is no fallback evaluator.

use std::fmt;

/// Inputs longer than this are never treated as expressions.
const MAX_EXPRESSION_LEN: usize = 200;

/// Maximum nesting of parentheses and unary operators.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CalcError {
    /// A construct outside the whitelist (names, calls, unknown symbols).
    Unsupported(String),
    /// Malformed expression.
    Syntax(String),
    DivisionByZero,
    /// Result is infinite or NaN.
    OutOfRange,
}

impl fmt::Display for CalcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(what) => write!(f, "不支援的運算：{what}"),
            Self::Syntax(msg) => write!(f, "算式格式錯誤：{msg}"),
            Self::DivisionByZero => write!(f, "不能除以零"),
            Self::OutOfRange => write!(f, "結果超出範圍"),
        }
    }
}

impl std::error::Error for CalcError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Mod,
    FloorDiv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    Pi,
    E,
}

/// Syntax tree. These are the only node kinds that can ever be evaluated.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Constant(Constant),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(BinOp),
    LParen,
    RParen,
}

/// Cheap check whether a message is meant as a calculation.
///
/// Requires at least one operand and one operator, and nothing but digits,
/// operators, parentheses and the constants `pi` / `e`.
pub fn looks_like_expression(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || text.chars().count() > MAX_EXPRESSION_LEN {
        return false;
    }

    let lowered = text.to_lowercase();
    let has_constant = lowered.contains("pi") || lowered.contains('e');
    let stripped = lowered.replace("pi", " ").replace('e', " ");

    let allowed = |c: char| {
        c.is_ascii_digit()
            || c.is_whitespace()
            || matches!(c, '.' | '+' | '-' | '*' | '/' | '^' | '%' | '(' | ')' | '×' | '÷' | 'x')
    };
    if !stripped.chars().all(allowed) {
        return false;
    }

    let has_operand = has_constant || stripped.chars().any(|c| c.is_ascii_digit());
    // A lone leading minus is a negative number, not a calculation.
    let body = stripped.trim_start().trim_start_matches(['-', '+']);
    let has_operator = body
        .chars()
        .any(|c| matches!(c, '+' | '-' | '*' | '/' | '^' | '%' | '×' | '÷' | 'x'));

    has_operand && has_operator
}

/// Parse and evaluate an expression.
pub fn evaluate(input: &str) -> Result<f64, CalcError> {
    let expr = parse(input)?;
    eval(&expr)
}

/// Parse an expression into its syntax tree.
pub fn parse(input: &str) -> Result<Expr, CalcError> {
    if input.chars().count() > MAX_EXPRESSION_LEN {
        return Err(CalcError::Unsupported("算式過長".to_string()));
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    let expr = parser.expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(Token::RParen) => Err(CalcError::Syntax("多餘的右括號".to_string())),
        Some(_) => Err(CalcError::Syntax("算式不完整".to_string())),
    }
}

/// Evaluate a syntax tree.
pub fn eval(expr: &Expr) -> Result<f64, CalcError> {
    let value = match expr {
        Expr::Number(n) => *n,
        Expr::Constant(Constant::Pi) => std::f64::consts::PI,
        Expr::Constant(Constant::E) => std::f64::consts::E,
        Expr::Unary(UnaryOp::Neg, operand) => -eval(operand)?,
        Expr::Unary(UnaryOp::Pos, operand) => eval(operand)?,
        Expr::Binary(op, lhs, rhs) => apply(*op, eval(lhs)?, eval(rhs)?)?,
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CalcError::OutOfRange)
    }
}

fn apply(op: BinOp, a: f64, b: f64) -> Result<f64, CalcError> {
    match op {
        BinOp::Add => Ok(a + b),
        BinOp::Sub => Ok(a - b),
        BinOp::Mul => Ok(a * b),
        BinOp::Pow => Ok(a.powf(b)),
        BinOp::Div | BinOp::Mod | BinOp::FloorDiv if b == 0.0 => Err(CalcError::DivisionByZero),
        BinOp::Div => Ok(a / b),
        BinOp::FloorDiv => Ok((a / b).floor()),
        BinOp::Mod => {
            // Result takes the sign of the divisor: -7 % 3 == 2, 7 % -3 == -2
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                Ok(r + b)
            } else {
                Ok(r)
            }
        }
    }
}

/// Render a result: integers without a decimal point, everything else
/// rounded to 6 decimal places.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 {
        if value.abs() < 1e15 {
            return format!("{}", value as i64);
        }
        return format!("{value}");
    }
    let rounded = (value * 1e6).round() / 1e6;
    if rounded == 0.0 {
        // -0.0000001 would otherwise print as "-0"
        return "0".to_string();
    }
    format!("{rounded}")
}

fn tokenize(input: &str) -> Result<Vec<Token>, CalcError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Exponent: 1e5, 2.5E-3
                if matches!(chars.get(i), Some('e' | 'E')) {
                    let sign = usize::from(matches!(chars.get(i + 1), Some('+' | '-')));
                    if chars.get(i + 1 + sign).is_some_and(|c| c.is_ascii_digit()) {
                        i += 1 + sign;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| CalcError::Syntax(format!("無效的數字 '{literal}'")))?;
                tokens.push(Token::Number(n));
            }
            // `x` right after an operand is multiplication, e.g. "3x4" or "(1+2)x3"
            'x' | 'X' if matches!(tokens.last(), Some(Token::Number(_) | Token::RParen)) => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                if chars.get(i) == Some(&'.') {
                    return Err(CalcError::Unsupported(format!("屬性存取 {name}.")));
                }
                // `x` between operands is multiplication, e.g. "3 x 4"
                if name == "x" || name == "X" {
                    tokens.push(Token::Op(BinOp::Mul));
                } else {
                    tokens.push(Token::Name(name));
                }
            }
            '+' => {
                tokens.push(Token::Op(BinOp::Add));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op(BinOp::Sub));
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    tokens.push(Token::Op(BinOp::Pow));
                    i += 2;
                } else {
                    tokens.push(Token::Op(BinOp::Mul));
                    i += 1;
                }
            }
            '×' => {
                tokens.push(Token::Op(BinOp::Mul));
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    tokens.push(Token::Op(BinOp::FloorDiv));
                    i += 2;
                } else {
                    tokens.push(Token::Op(BinOp::Div));
                    i += 1;
                }
            }
            '÷' => {
                tokens.push(Token::Op(BinOp::Div));
                i += 1;
            }
            '^' => {
                tokens.push(Token::Op(BinOp::Pow));
                i += 1;
            }
            '%' => {
                tokens.push(Token::Op(BinOp::Mod));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            other => return Err(CalcError::Unsupported(format!("'{other}'"))),
        }
    }

    Ok(tokens)
}

/// Recursive-descent parser.
///
/// ```text
/// expression := term (('+' | '-') term)*
/// term       := unary (('*' | '/' | '//' | '%') unary)*
/// unary      := ('-' | '+') unary | power
/// power      := atom ('^' unary)?
/// atom       := number | 'pi' | 'e' | '(' expression ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn descend(&mut self) -> Result<(), CalcError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CalcError::Unsupported("巢狀層數過多".to_string()));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ (BinOp::Add | BinOp::Sub))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, CalcError> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ (BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod))) =
            self.peek()
        {
            let op = *op;
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CalcError> {
        let op = match self.peek() {
            Some(Token::Op(BinOp::Sub)) => Some(UnaryOp::Neg),
            Some(Token::Op(BinOp::Add)) => Some(UnaryOp::Pos),
            _ => None,
        };
        match op {
            Some(op) => {
                self.pos += 1;
                self.descend()?;
                let operand = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Unary(op, Box::new(operand)))
            }
            None => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, CalcError> {
        let base = self.atom()?;
        if let Some(Token::Op(BinOp::Pow)) = self.peek() {
            self.pos += 1;
            self.descend()?;
            let exponent = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, CalcError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Name(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    return Err(CalcError::Unsupported(format!("函式呼叫 {name}()")));
                }
                match name.as_str() {
                    "pi" | "PI" | "Pi" => Ok(Expr::Constant(Constant::Pi)),
                    "e" | "E" => Ok(Expr::Constant(Constant::E)),
                    _ => Err(CalcError::Unsupported(format!("名稱 '{name}'"))),
                }
            }
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.expression()?;
                self.depth -= 1;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CalcError::Syntax("缺少右括號".to_string())),
                }
            }
            Some(Token::RParen) => Err(CalcError::Syntax("多餘的右括號".to_string())),
            Some(Token::Op(_)) => Err(CalcError::Syntax("運算子位置錯誤".to_string())),
            None => Err(CalcError::Syntax("算式不完整".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc(input: &str) -> String {
        format_number(evaluate(input).unwrap())
    }

    #[test]
    fn test_precedence() {
        assert_eq!(calc("2+2*3"), "8");
        assert_eq!(calc("(2+2)*3"), "12");
        assert_eq!(calc("10 - 4 - 3"), "3");
        assert_eq!(calc("2*3^2"), "18");
    }

    #[test]
    fn test_division_and_power() {
        assert_eq!(calc("10/4"), "2.5");
        assert_eq!(calc("2^10"), "1024");
        assert_eq!(calc("2**10"), "1024");
        assert_eq!(calc("2^3^2"), "512");
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(calc("-3+5"), "2");
        assert_eq!(calc("-2^2"), "-4");
        assert_eq!(calc("2^-1"), "0.5");
        assert_eq!(calc("--4"), "4");
    }

    #[test]
    fn test_mod_and_floor_div() {
        assert_eq!(calc("7 % 3"), "1");
        assert_eq!(calc("-7 % 3"), "2");
        assert_eq!(calc("7 % -3"), "-2");
        assert_eq!(calc("7 // 2"), "3");
        assert_eq!(calc("-7 // 2"), "-4");
    }

    #[test]
    fn test_constants() {
        assert_eq!(calc("pi*2"), "6.283185");
        assert_eq!(calc("e^1"), "2.718282");
    }

    #[test]
    fn test_alternate_symbols() {
        assert_eq!(calc("3 × 4"), "12");
        assert_eq!(calc("12 ÷ 4"), "3");
        assert_eq!(calc("3 x 4"), "12");
        assert_eq!(calc("2x3"), "6");
        assert_eq!(calc("3X4"), "12");
        assert_eq!(calc("(1+2)x3"), "9");
    }

    #[test]
    fn test_exponent_literals() {
        assert_eq!(calc("1e5+1"), "100001");
        assert_eq!(calc("2.5e3*2"), "5000");
        assert_eq!(calc("1E-2*100"), "1");
        assert_eq!(calc("2*e"), "5.436564");
    }

    #[test]
    fn test_accepted_inputs_evaluate() {
        for input in ["2x3", "3x4", "1e5+1", "2.5e3*2", "2 x pi"] {
            assert!(looks_like_expression(input), "{input}");
            assert!(evaluate(input).is_ok(), "{input}");
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(8.0), "8");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-0.0000001), "0");
    }

    #[test]
    fn test_rejects_names_and_calls() {
        assert!(matches!(evaluate("foo+1"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("abs(1)+2"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("__import__('os')"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("pi(2)"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("a.b + 1"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("x = 1"), Err(CalcError::Unsupported(_))));
        assert!(matches!(evaluate("[i for i in 1]"), Err(CalcError::Unsupported(_))));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(evaluate("1/0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("1//0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("5 % 0"), Err(CalcError::DivisionByZero));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(evaluate("10^1000"), Err(CalcError::OutOfRange));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!(evaluate("1+"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("(1+2"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("1+2)"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("1..2+3"), Err(CalcError::Syntax(_))));
        assert!(matches!(evaluate("*3"), Err(CalcError::Syntax(_))));
    }

    #[test]
    fn test_deep_nesting_rejected() {
        let deep = format!("{}1{}", "(".repeat(90), ")".repeat(90));
        assert!(deep.len() <= MAX_EXPRESSION_LEN);
        assert!(matches!(evaluate(&deep), Err(CalcError::Unsupported(_))));
    }

    #[test]
    fn test_looks_like_expression() {
        assert!(looks_like_expression("2+2*3"));
        assert!(looks_like_expression(" (1 + 2) / 3 "));
        assert!(looks_like_expression("pi * 2"));
        assert!(looks_like_expression("3 x 4"));
        assert!(!looks_like_expression("hello"));
        assert!(!looks_like_expression("42"));
        assert!(!looks_like_expression("-5"));
        assert!(!looks_like_expression("what is 2+2"));
        assert!(!looks_like_expression("pie"));
        assert!(!looks_like_expression(&"1+".repeat(150)));
    }

    #[test]
    fn test_tree_shape() {
        let expr = parse("1+2*3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0)),
                )),
            )
        );
    }
}
