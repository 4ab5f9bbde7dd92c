//! Parser for intrinsic calls: `States.Name(arg, ...)`.
//!
//! Arguments are single-quoted strings, numbers, booleans, `null`, nested
//! intrinsic calls, or path expressions.

use serde_json::{Number, Value};

use super::IntrinsicError;

/// A parsed call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    /// Function name without the `States.` prefix.
    pub name: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Call(Call),
    Path(String),
}

pub fn parse(text: &str) -> Result<Call, IntrinsicError> {
    let mut parser = Parser {
        text,
        chars: text.trim().chars().collect(),
        pos: 0,
    };
    let call = parser.call()?;
    parser.skip_whitespace();
    if parser.pos < parser.chars.len() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(call)
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> IntrinsicError {
        IntrinsicError::Syntax {
            expression: self.text.to_string(),
            message: format!("{message} at offset {}", self.pos),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    fn call(&mut self) -> Result<Call, IntrinsicError> {
        if !self.starts_with("States.") {
            return Err(self.error("intrinsic calls start with 'States.'"));
        }
        self.pos += "States.".len();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("missing function name"));
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.skip_whitespace();
        if self.peek() != Some('(') {
            return Err(self.error("expected '('"));
        }
        self.pos += 1;

        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
            return Ok(Call { name, args });
        }
        loop {
            args.push(self.arg()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.pos += 1;
                }
                Some(')') => {
                    self.pos += 1;
                    return Ok(Call { name, args });
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    fn arg(&mut self) -> Result<Arg, IntrinsicError> {
        self.skip_whitespace();
        match self.peek() {
            Some('\'') => self.string().map(|s| Arg::Literal(Value::String(s))),
            Some('$') => self.path().map(Arg::Path),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number().map(Arg::Literal),
            _ if self.starts_with("States.") => self.call().map(Arg::Call),
            _ if self.starts_with("true") => {
                self.pos += 4;
                Ok(Arg::Literal(Value::Bool(true)))
            }
            _ if self.starts_with("false") => {
                self.pos += 5;
                Ok(Arg::Literal(Value::Bool(false)))
            }
            _ if self.starts_with("null") => {
                self.pos += 4;
                Ok(Arg::Literal(Value::Null))
            }
            _ => Err(self.error("unrecognized argument")),
        }
    }

    /// Single-quoted string. `\'` and `\\` are unescaped; `\{` and `\}` are
    /// kept so `States.Format` can tell literal braces from placeholders.
    fn string(&mut self) -> Result<String, IntrinsicError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    let next = self
                        .chars
                        .get(self.pos + 1)
                        .copied()
                        .ok_or_else(|| self.error("unterminated escape"))?;
                    match next {
                        '{' | '}' => {
                            out.push('\\');
                            out.push(next);
                        }
                        other => out.push(other),
                    }
                    self.pos += 2;
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// A path argument runs until the next top-level `,` or `)`.
    fn path(&mut self) -> Result<String, IntrinsicError> {
        let start = self.pos;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some(_), _) => {}
                (None, '\'') | (None, '"') => quote = Some(c),
                (None, '[') | (None, '(') => depth += 1,
                (None, ']') => depth = depth.saturating_sub(1),
                (None, ')') if depth == 0 => break,
                (None, ')') => depth -= 1,
                (None, ',') if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        let path: String = self.chars[start..self.pos].iter().collect();
        Ok(path.trim_end().to_string())
    }

    fn number(&mut self) -> Result<Value, IntrinsicError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if let Ok(int) = text.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.error("invalid number"))
    }
}
