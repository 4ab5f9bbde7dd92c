//! Recursive-descent parser for path expressions.

use serde_json::{Number, Value};

use super::PathError;
use super::ast::{
    ComparisonOp, FilterExpression, FilterOperand, LogicalOp, PathExpr, PathRoot, Selector,
};

/// Characters that end an unquoted member name.
const NAME_TERMINATORS: &[char] = &[
    '.', '[', ']', '(', ')', ' ', '\t', '=', '!', '<', '>', '&', '|', ',',
];

/// Parse a full expression starting with `$`, `$$` or `$name`.
pub fn parse(text: &str) -> Result<PathExpr, PathError> {
    let mut parser = Parser::new(text);
    let expr = parser.expression()?;
    parser.skip_whitespace();
    if !parser.at_end() {
        return Err(parser.error("unexpected trailing characters"));
    }
    Ok(expr)
}

struct Parser<'a> {
    text: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            chars: text.trim().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> PathError {
        PathError::Syntax {
            path: self.text.to_string(),
            message: format!("{} at offset {}", message.into(), self.pos),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        let matches = s
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c));
        if matches {
            self.pos += s.chars().count();
        }
        matches
    }

    fn expect(&mut self, c: char) -> Result<(), PathError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}'")))
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn expression(&mut self) -> Result<PathExpr, PathError> {
        if !self.eat('$') {
            return Err(self.error("path must start with '$'"));
        }
        let root = if self.eat('$') {
            PathRoot::Context
        } else if matches!(self.peek(), Some(c) if c.is_alphabetic() || c == '_') {
            let start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            PathRoot::Variable(self.chars[start..self.pos].iter().collect())
        } else {
            PathRoot::Input
        };
        let selectors = self.selectors()?;
        Ok(PathExpr { root, selectors })
    }

    fn selectors(&mut self) -> Result<Vec<Selector>, PathError> {
        let mut selectors = Vec::new();
        loop {
            match self.peek() {
                Some('.') if self.peek_at(1) == Some('.') => {
                    self.pos += 2;
                    let inner = match self.peek() {
                        Some('*') => {
                            self.pos += 1;
                            Selector::Wildcard
                        }
                        Some('[') => self.bracket()?,
                        _ => Selector::Child(self.name()?),
                    };
                    selectors.push(Selector::RecursiveDescent(Box::new(inner)));
                }
                Some('.') => {
                    self.pos += 1;
                    if self.eat('*') {
                        selectors.push(Selector::Wildcard);
                    } else {
                        selectors.push(Selector::Child(self.name()?));
                    }
                }
                Some('[') => selectors.push(self.bracket()?),
                _ => return Ok(selectors),
            }
        }
    }

    fn name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !NAME_TERMINATORS.contains(&c)) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected a member name"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    /// `[ ... ]` - wildcard, filter, names, indices, slices or unions.
    fn bracket(&mut self) -> Result<Selector, PathError> {
        self.expect('[')?;
        self.skip_whitespace();

        if self.eat('*') {
            self.skip_whitespace();
            self.expect(']')?;
            return Ok(Selector::Wildcard);
        }

        if self.eat('?') {
            self.skip_whitespace();
            self.expect('(')?;
            let filter = self.filter_or()?;
            self.skip_whitespace();
            self.expect(')')?;
            self.skip_whitespace();
            self.expect(']')?;
            return Ok(Selector::Filter(filter));
        }

        let mut members = vec![self.bracket_member()?];
        self.skip_whitespace();
        while self.eat(',') {
            self.skip_whitespace();
            members.push(self.bracket_member()?);
            self.skip_whitespace();
        }
        self.expect(']')?;

        if members.len() == 1 {
            Ok(members.remove(0))
        } else {
            if members.iter().any(|m| matches!(m, Selector::Slice { .. })) {
                return Err(self.error("slices cannot appear in a union"));
            }
            Ok(Selector::Union(members))
        }
    }

    fn bracket_member(&mut self) -> Result<Selector, PathError> {
        match self.peek() {
            Some('\'') | Some('"') => Ok(Selector::Child(self.quoted()?)),
            _ => {
                let start = self.optional_integer()?;
                self.skip_whitespace();
                if !self.eat(':') {
                    return start
                        .map(Selector::Index)
                        .ok_or_else(|| self.error("expected an index, name or slice"));
                }
                self.skip_whitespace();
                let end = self.optional_integer()?;
                self.skip_whitespace();
                let step = if self.eat(':') {
                    self.skip_whitespace();
                    self.optional_integer()?
                } else {
                    None
                };
                Ok(Selector::Slice { start, end, step })
            }
        }
    }

    fn optional_integer(&mut self) -> Result<Option<i64>, PathError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        if digits.is_empty() {
            return Ok(None);
        }
        digits
            .parse::<i64>()
            .map(Some)
            .map_err(|_| self.error(format!("invalid integer '{digits}'")))
    }

    fn quoted(&mut self) -> Result<String, PathError> {
        let quote = self.peek().ok_or_else(|| self.error("expected a quote"))?;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some('\\') => {
                    let escaped = self
                        .peek_at(1)
                        .ok_or_else(|| self.error("unterminated escape"))?;
                    out.push(escaped);
                    self.pos += 2;
                }
                Some(c) if c == quote => {
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

    // -----------------------------------------------------------------------
    // Filters
    // -----------------------------------------------------------------------

    fn filter_or(&mut self) -> Result<FilterExpression, PathError> {
        let mut left = self.filter_and()?;
        loop {
            self.skip_whitespace();
            if !self.eat_str("||") {
                return Ok(left);
            }
            let right = self.filter_and()?;
            left = FilterExpression::Logical {
                left: Box::new(left),
                operator: LogicalOp::Or,
                right: Box::new(right),
            };
        }
    }

    fn filter_and(&mut self) -> Result<FilterExpression, PathError> {
        let mut left = self.filter_unary()?;
        loop {
            self.skip_whitespace();
            if !self.eat_str("&&") {
                return Ok(left);
            }
            let right = self.filter_unary()?;
            left = FilterExpression::Logical {
                left: Box::new(left),
                operator: LogicalOp::And,
                right: Box::new(right),
            };
        }
    }

    fn filter_unary(&mut self) -> Result<FilterExpression, PathError> {
        self.skip_whitespace();
        if self.peek() == Some('!') && self.peek_at(1) != Some('=') {
            self.pos += 1;
            return Ok(FilterExpression::Not(Box::new(self.filter_unary()?)));
        }
        if self.eat('(') {
            let inner = self.filter_or()?;
            self.skip_whitespace();
            self.expect(')')?;
            return Ok(inner);
        }
        self.filter_comparison()
    }

    fn filter_comparison(&mut self) -> Result<FilterExpression, PathError> {
        let left = self.filter_operand()?;
        self.skip_whitespace();
        let operator = if self.eat_str("==") {
            Some(ComparisonOp::Eq)
        } else if self.eat_str("!=") {
            Some(ComparisonOp::Ne)
        } else if self.eat_str("<=") {
            Some(ComparisonOp::Le)
        } else if self.eat_str(">=") {
            Some(ComparisonOp::Ge)
        } else if self.eat('<') {
            Some(ComparisonOp::Lt)
        } else if self.eat('>') {
            Some(ComparisonOp::Gt)
        } else {
            None
        };

        match (operator, left) {
            (Some(operator), left) => {
                self.skip_whitespace();
                let right = self.filter_operand()?;
                Ok(FilterExpression::Comparison {
                    left,
                    operator,
                    right,
                })
            }
            (None, FilterOperand::Current(selectors)) => Ok(FilterExpression::Exists(selectors)),
            (None, FilterOperand::Literal(_)) => {
                Err(self.error("a literal cannot stand alone in a filter"))
            }
        }
    }

    fn filter_operand(&mut self) -> Result<FilterOperand, PathError> {
        self.skip_whitespace();
        match self.peek() {
            Some('@') => {
                self.pos += 1;
                Ok(FilterOperand::Current(self.selectors()?))
            }
            Some('\'') | Some('"') => Ok(FilterOperand::Literal(Value::String(self.quoted()?))),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number().map(FilterOperand::Literal),
            _ => {
                if self.eat_str("true") {
                    Ok(FilterOperand::Literal(Value::Bool(true)))
                } else if self.eat_str("false") {
                    Ok(FilterOperand::Literal(Value::Bool(false)))
                } else if self.eat_str("null") {
                    Ok(FilterOperand::Literal(Value::Null))
                } else {
                    Err(self.error("expected '@' or a literal"))
                }
            }
        }
    }

    fn number(&mut self) -> Result<Value, PathError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
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
            .ok_or_else(|| self.error(format!("invalid number '{text}'")))
    }
}
