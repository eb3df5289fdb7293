//! Expression evaluation seam
//!
//! The engine only needs expressions to produce booleans (branch, while,
//! guards) or stringifiable values (switch, foreach). The seam is the
//! [`ExpressionEvaluator`] trait; [`SimpleEvaluator`] is the built-in
//! implementation covering comparison, boolean, and arithmetic operators
//! over dotted paths into the variable bags (`globals.x`, `input.item`).

use serde_json::{Number, Value};
use std::collections::HashMap;
use thiserror::Error;

use crate::message::Bag;

/// Evaluation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// The expression text could not be parsed
    #[error("parse error at offset {offset}: {message}")]
    Parse {
        /// Byte offset of the failure
        offset: usize,
        /// What was expected or found
        message: String,
    },
    /// The expression parsed but produced or consumed a mistyped value
    #[error("type error: {message}")]
    Type {
        /// Operand/operator mismatch description
        message: String,
    },
}

/// Maps an expression plus a variable bag to a typed value
///
/// Variables are presented as `{globals: {...}, input: {...}, output: {...}}`
/// as appropriate for the call site.
pub trait ExpressionEvaluator: Send + Sync {
    /// Evaluate `text` against `vars`
    fn evaluate(&self, text: &str, vars: &Bag) -> Result<Value, EvalError>;
}

/// Convenience: evaluate and insist on a boolean result
pub fn evaluate_bool(
    evaluator: &dyn ExpressionEvaluator,
    text: &str,
    vars: &Bag,
) -> Result<bool, EvalError> {
    match evaluator.evaluate(text, vars)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Type {
            message: format!("expected boolean, got {}", type_name(&other)),
        }),
    }
}

/// Convenience: evaluate and stringify the result for case matching
pub fn evaluate_string(
    evaluator: &dyn ExpressionEvaluator,
    text: &str,
    vars: &Bag,
) -> Result<String, EvalError> {
    Ok(stringify(&evaluator.evaluate(text, vars)?))
}

/// Case-key rendering of a value: strings verbatim, scalars via display
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Built-in recursive-descent evaluator
///
/// Grammar, loosest binding first:
/// ```text
/// or      := and ('||' and)*
/// and     := cmp ('&&' cmp)*
/// cmp     := add (relop add)?
/// add     := mul (('+'|'-') mul)*
/// mul     := unary (('*'|'/'|'%') unary)*
/// unary   := ('!'|'-')* primary
/// primary := literal | path | '(' or ')' | '[' list ']'
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleEvaluator;

impl SimpleEvaluator {
    /// Create an evaluator
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for SimpleEvaluator {
    fn evaluate(&self, text: &str, vars: &Bag) -> Result<Value, EvalError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            vars,
        };
        let value = parser.parse_or()?;
        if let Some((tok, offset)) = parser.peek() {
            return Err(EvalError::Parse {
                offset: *offset,
                message: format!("unexpected trailing token {:?}", tok),
            });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, EvalError> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, i));
                i += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, i));
                i += 1;
            }
            ',' => {
                tokens.push((Token::Comma, i));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, i));
                i += 1;
            }
            '+' => {
                tokens.push((Token::Op("+"), i));
                i += 1;
            }
            '-' => {
                tokens.push((Token::Op("-"), i));
                i += 1;
            }
            '*' => {
                tokens.push((Token::Op("*"), i));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Op("/"), i));
                i += 1;
            }
            '%' => {
                tokens.push((Token::Op("%"), i));
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op("!="), i));
                    i += 2;
                } else {
                    tokens.push((Token::Op("!"), i));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op("=="), i));
                    i += 2;
                } else {
                    return Err(EvalError::Parse {
                        offset: i,
                        message: "single '=' is not an operator".to_string(),
                    });
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op("<="), i));
                    i += 2;
                } else {
                    tokens.push((Token::Op("<"), i));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::Op(">="), i));
                    i += 2;
                } else {
                    tokens.push((Token::Op(">"), i));
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push((Token::Op("&&"), i));
                    i += 2;
                } else {
                    return Err(EvalError::Parse {
                        offset: i,
                        message: "single '&' is not an operator".to_string(),
                    });
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push((Token::Op("||"), i));
                    i += 2;
                } else {
                    return Err(EvalError::Parse {
                        offset: i,
                        message: "single '|' is not an operator".to_string(),
                    });
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    if ch == '\\' && i + 1 < bytes.len() {
                        let esc = bytes[i + 1] as char;
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                        i += 2;
                    } else {
                        s.push(ch);
                        i += 1;
                    }
                }
                if !closed {
                    return Err(EvalError::Parse {
                        offset: start,
                        message: "unterminated string literal".to_string(),
                    });
                }
                tokens.push((Token::Str(s), start));
            }
            '0'..='9' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    // A dot followed by a non-digit belongs to path syntax, not the number
                    if bytes[i] == b'.'
                        && !bytes.get(i + 1).map(u8::is_ascii_digit).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let raw = &text[start..i];
                let n = raw.parse::<f64>().map_err(|_| EvalError::Parse {
                    offset: start,
                    message: format!("invalid number literal '{}'", raw),
                })?;
                tokens.push((Token::Number(n), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                let word = &text[start..i];
                tokens.push((
                    match word {
                        "true" => Token::True,
                        "false" => Token::False,
                        "null" => Token::Null,
                        _ => Token::Ident(word.to_string()),
                    },
                    start,
                ));
            }
            other => {
                return Err(EvalError::Parse {
                    offset: i,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(Token, usize)],
    pos: usize,
    vars: &'a HashMap<String, Value>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&(Token, usize)> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        if let Some((Token::Op(op), _)) = self.peek() {
            if ops.contains(op) {
                let op = *op;
                self.pos += 1;
                return Some(op);
            }
        }
        None
    }

    fn expect(&mut self, token: Token, what: &str) -> Result<(), EvalError> {
        match self.bump() {
            Some((tok, _)) if *tok == token => Ok(()),
            Some((tok, offset)) => Err(EvalError::Parse {
                offset: *offset,
                message: format!("expected {}, found {:?}", what, tok),
            }),
            None => Err(EvalError::Parse {
                offset: usize::MAX,
                message: format!("expected {}, found end of input", what),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Value, EvalError> {
        let mut left = self.parse_and()?;
        while self.eat_op(&["||"]).is_some() {
            let right = self.parse_and()?;
            left = Value::Bool(as_bool(&left)? || as_bool(&right)?);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value, EvalError> {
        let mut left = self.parse_cmp()?;
        while self.eat_op(&["&&"]).is_some() {
            let right = self.parse_cmp()?;
            left = Value::Bool(as_bool(&left)? && as_bool(&right)?);
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Value, EvalError> {
        let left = self.parse_add()?;
        if let Some(op) = self.eat_op(&["==", "!=", "<=", ">=", "<", ">"]) {
            let right = self.parse_add()?;
            let result = match op {
                "==" => values_equal(&left, &right),
                "!=" => !values_equal(&left, &right),
                _ => {
                    let l = as_number(&left)?;
                    let r = as_number(&right)?;
                    match op {
                        "<" => l < r,
                        "<=" => l <= r,
                        ">" => l > r,
                        ">=" => l >= r,
                        _ => unreachable!(),
                    }
                }
            };
            return Ok(Value::Bool(result));
        }
        Ok(left)
    }

    fn parse_add(&mut self) -> Result<Value, EvalError> {
        let mut left = self.parse_mul()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.parse_mul()?;
            left = match op {
                "+" => match (&left, &right) {
                    // String concatenation when either side is a string
                    (Value::String(_), _) | (_, Value::String(_)) => {
                        Value::String(format!("{}{}", stringify(&left), stringify(&right)))
                    }
                    _ => number_value(as_number(&left)? + as_number(&right)?),
                },
                _ => number_value(as_number(&left)? - as_number(&right)?),
            };
        }
        Ok(left)
    }

    fn parse_mul(&mut self) -> Result<Value, EvalError> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.parse_unary()?;
            let l = as_number(&left)?;
            let r = as_number(&right)?;
            left = match op {
                "*" => number_value(l * r),
                "/" => {
                    if r == 0.0 {
                        return Err(EvalError::Type {
                            message: "division by zero".to_string(),
                        });
                    }
                    number_value(l / r)
                }
                _ => {
                    if r == 0.0 {
                        return Err(EvalError::Type {
                            message: "modulo by zero".to_string(),
                        });
                    }
                    number_value(l % r)
                }
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Value, EvalError> {
        if self.eat_op(&["!"]).is_some() {
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!as_bool(&value)?));
        }
        if self.eat_op(&["-"]).is_some() {
            let value = self.parse_unary()?;
            return Ok(number_value(-as_number(&value)?));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value, EvalError> {
        let (token, offset) = match self.bump() {
            Some(t) => (t.0.clone(), t.1),
            None => {
                return Err(EvalError::Parse {
                    offset: usize::MAX,
                    message: "unexpected end of expression".to_string(),
                });
            }
        };
        match token {
            Token::Number(n) => Ok(number_value(n)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::True => Ok(Value::Bool(true)),
            Token::False => Ok(Value::Bool(false)),
            Token::Null => Ok(Value::Null),
            Token::LParen => {
                let value = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(value)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if let Some((Token::RBracket, _)) = self.peek() {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                loop {
                    items.push(self.parse_or()?);
                    if let Some((Token::Comma, _)) = self.peek() {
                        self.pos += 1;
                        continue;
                    }
                    break;
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Value::Array(items))
            }
            Token::Ident(root) => self.parse_path(root),
            other => Err(EvalError::Parse {
                offset,
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    /// Resolve `root.field[index]...` against the variable bag.
    /// Missing segments resolve to null rather than erroring, so guards can
    /// probe for absent keys.
    fn parse_path(&mut self, root: String) -> Result<Value, EvalError> {
        let mut current = self.vars.get(&root).cloned().unwrap_or(Value::Null);
        loop {
            if let Some((Token::Dot, _)) = self.peek() {
                self.pos += 1;
                let field = match self.bump() {
                    Some((Token::Ident(name), _)) => name.clone(),
                    Some((tok, offset)) => {
                        return Err(EvalError::Parse {
                            offset: *offset,
                            message: format!("expected field name, found {:?}", tok),
                        });
                    }
                    None => {
                        return Err(EvalError::Parse {
                            offset: usize::MAX,
                            message: "expected field name after '.'".to_string(),
                        });
                    }
                };
                current = match &current {
                    Value::Object(map) => map.get(&field).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
            } else if let Some((Token::LBracket, _)) = self.peek() {
                self.pos += 1;
                let index = self.parse_or()?;
                self.expect(Token::RBracket, "']'")?;
                current = match (&current, &index) {
                    (Value::Array(items), Value::Number(n)) => {
                        let idx = n.as_f64().unwrap_or(-1.0);
                        if idx >= 0.0 && (idx as usize) < items.len() {
                            items[idx as usize].clone()
                        } else {
                            Value::Null
                        }
                    }
                    (Value::Object(map), Value::String(key)) => {
                        map.get(key).cloned().unwrap_or(Value::Null)
                    }
                    _ => Value::Null,
                };
            } else {
                break;
            }
        }
        Ok(current)
    }
}

fn as_bool(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(EvalError::Type {
            message: format!("expected boolean operand, got {}", type_name(other)),
        }),
    }
}

fn as_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| EvalError::Type {
            message: "number out of range".to_string(),
        }),
        other => Err(EvalError::Type {
            message: format!("expected numeric operand, got {}", type_name(other)),
        }),
    }
}

fn number_value(n: f64) -> Value {
    // Render whole results as integers so case keys compare cleanly
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            l.as_f64().unwrap_or(f64::NAN) == r.as_f64().unwrap_or(f64::NAN)
        }
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars_with(globals: Value) -> Bag {
        let mut vars = Bag::new();
        vars.insert("globals".to_string(), globals);
        vars
    }

    #[test]
    fn test_comparison() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"x": 10}));
        assert_eq!(
            eval.evaluate("globals.x > 5", &vars).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval.evaluate("globals.x >= 11", &vars).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval.evaluate("globals.x == 10", &vars).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_boolean_logic() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"a": true, "b": false}));
        assert_eq!(
            eval.evaluate("globals.a && !globals.b", &vars).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval.evaluate("globals.b || false", &vars).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_arithmetic() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"n": 7}));
        assert_eq!(eval.evaluate("globals.n * 2 + 1", &vars).unwrap(), json!(15));
        assert_eq!(eval.evaluate("(globals.n - 1) / 2", &vars).unwrap(), json!(3));
        assert_eq!(eval.evaluate("globals.n % 2", &vars).unwrap(), json!(1));
    }

    #[test]
    fn test_missing_path_is_null() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({}));
        assert_eq!(eval.evaluate("globals.absent", &vars).unwrap(), Value::Null);
        assert_eq!(
            eval.evaluate("globals.absent == null", &vars).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_string_literals_and_concat() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"name": "world"}));
        assert_eq!(
            eval.evaluate("'hello ' + globals.name", &vars).unwrap(),
            json!("hello world")
        );
        assert_eq!(
            eval.evaluate("globals.name == \"world\"", &vars).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_list_literal_and_index() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"items": ["a", "b", "c"]}));
        assert_eq!(
            eval.evaluate("['a', 'b', 'c']", &vars).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(eval.evaluate("globals.items[1]", &vars).unwrap(), json!("b"));
        assert_eq!(eval.evaluate("globals.items[9]", &vars).unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_errors() {
        let eval = SimpleEvaluator::new();
        let vars = Bag::new();
        assert!(matches!(
            eval.evaluate("globals.x >", &vars),
            Err(EvalError::Parse { .. })
        ));
        assert!(matches!(
            eval.evaluate("1 ~ 2", &vars),
            Err(EvalError::Parse { .. })
        ));
    }

    #[test]
    fn test_type_errors() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"s": "text"}));
        assert!(matches!(
            eval.evaluate("globals.s > 3", &vars),
            Err(EvalError::Type { .. })
        ));
        assert!(matches!(
            eval.evaluate("1 / 0", &vars),
            Err(EvalError::Type { .. })
        ));
    }

    #[test]
    fn test_evaluate_bool_rejects_non_boolean() {
        let eval = SimpleEvaluator::new();
        let vars = vars_with(json!({"x": 3}));
        assert!(evaluate_bool(&eval, "globals.x", &vars).is_err());
        assert!(evaluate_bool(&eval, "globals.x < 5", &vars).unwrap());
    }

    #[test]
    fn test_stringify_case_keys() {
        assert_eq!(stringify(&json!("abc")), "abc");
        assert_eq!(stringify(&json!(10)), "10");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&Value::Null), "null");
    }
}
