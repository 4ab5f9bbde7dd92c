//! Path expression abstract syntax tree.

use serde_json::Value;

/// What the leading `$` of an expression refers to.
#[derive(Debug, Clone, PartialEq)]
pub enum PathRoot {
    /// `$` - the current input.
    Input,
    /// `$$` - the context object.
    Context,
    /// `$name` - an execution variable.
    Variable(String),
}

/// A parsed path expression: a root followed by selectors.
#[derive(Debug, Clone, PartialEq)]
pub struct PathExpr {
    pub root: PathRoot,
    pub selectors: Vec<Selector>,
}

impl PathExpr {
    /// Reference paths address exactly one location: only `.name`,
    /// `['name']` and non-negative `[n]` below `$`.
    pub fn is_reference(&self) -> bool {
        self.root == PathRoot::Input
            && self.selectors.iter().all(|s| match s {
                Selector::Child(_) => true,
                Selector::Index(i) => *i >= 0,
                _ => false,
            })
    }
}

/// Individual selector component.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// `.name` or `['name']`
    Child(String),
    /// `[n]`; negative indices count from the end.
    Index(i64),
    /// `.*` or `[*]`
    Wildcard,
    /// `[start:end:step]`
    Slice {
        start: Option<i64>,
        end: Option<i64>,
        step: Option<i64>,
    },
    /// `['a','b']` or `[0,2]`
    Union(Vec<Selector>),
    /// `[?(...)]`
    Filter(FilterExpression),
    /// `..` followed by the selector applied at every depth.
    RecursiveDescent(Box<Selector>),
}

/// Predicate inside `[?( ... )]`, evaluated per element with `@` bound.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpression {
    /// `@.a.b` alone: true when the relative path matches something.
    Exists(Vec<Selector>),
    Comparison {
        left: FilterOperand,
        operator: ComparisonOp,
        right: FilterOperand,
    },
    Logical {
        left: Box<FilterExpression>,
        operator: LogicalOp,
        right: Box<FilterExpression>,
    },
    Not(Box<FilterExpression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOperand {
    /// `@` followed by selectors.
    Current(Vec<Selector>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}
