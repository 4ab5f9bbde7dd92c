//! Selector evaluation and reference-path placement.

use serde_json::{Map, Value};

use super::PathError;
use super::ast::{ComparisonOp, FilterExpression, FilterOperand, LogicalOp, Selector};

/// Apply a selector chain to a root value, collecting every match.
pub fn select<'v>(root: &'v Value, selectors: &[Selector]) -> Vec<&'v Value> {
    let mut nodes = vec![root];
    for selector in selectors {
        nodes = nodes
            .into_iter()
            .flat_map(|node| apply(selector, node))
            .collect();
        if nodes.is_empty() {
            break;
        }
    }
    nodes
}

fn apply<'v>(selector: &Selector, node: &'v Value) -> Vec<&'v Value> {
    match selector {
        Selector::Child(name) => node.get(name.as_str()).into_iter().collect(),
        Selector::Index(index) => match node {
            Value::Array(items) => resolve_index(*index, items.len())
                .map(|i| &items[i])
                .into_iter()
                .collect(),
            _ => Vec::new(),
        },
        Selector::Wildcard => children(node),
        Selector::Slice { start, end, step } => match node {
            Value::Array(items) => slice(items, *start, *end, *step),
            _ => Vec::new(),
        },
        Selector::Union(members) => members
            .iter()
            .flat_map(|member| apply(member, node))
            .collect(),
        Selector::Filter(filter) => children(node)
            .into_iter()
            .filter(|child| matches_filter(filter, child))
            .collect(),
        Selector::RecursiveDescent(inner) => {
            let mut all = Vec::new();
            descendants(node, &mut all);
            all.into_iter().flat_map(|n| apply(inner, n)).collect()
        }
    }
}

fn children(node: &Value) -> Vec<&Value> {
    match node {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        _ => Vec::new(),
    }
}

/// The node itself and every nested value, depth first.
fn descendants<'v>(node: &'v Value, out: &mut Vec<&'v Value>) {
    out.push(node);
    for child in children(node) {
        descendants(child, out);
    }
}

/// Map a possibly negative index onto `0..len`.
pub fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    (0..len).contains(&resolved).then(|| resolved as usize)
}

fn slice(items: &[Value], start: Option<i64>, end: Option<i64>, step: Option<i64>) -> Vec<&Value> {
    let len = items.len() as i64;
    let step = step.unwrap_or(1);
    if step == 0 {
        return Vec::new();
    }
    let clamp = |bound: i64| -> i64 {
        let b = if bound < 0 { len + bound } else { bound };
        b.clamp(if step > 0 { 0 } else { -1 }, if step > 0 { len } else { len - 1 })
    };
    let mut out = Vec::new();
    if step > 0 {
        let mut i = start.map(clamp).unwrap_or(0);
        let stop = end.map(clamp).unwrap_or(len);
        while i < stop {
            out.push(&items[i as usize]);
            i += step;
        }
    } else {
        let mut i = start.map(clamp).unwrap_or(len - 1);
        let stop = end.map(clamp).unwrap_or(-1);
        while i > stop {
            out.push(&items[i as usize]);
            i += step;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn matches_filter(filter: &FilterExpression, current: &Value) -> bool {
    match filter {
        FilterExpression::Exists(selectors) => !select(current, selectors).is_empty(),
        FilterExpression::Not(inner) => !matches_filter(inner, current),
        FilterExpression::Logical {
            left,
            operator,
            right,
        } => match operator {
            LogicalOp::And => matches_filter(left, current) && matches_filter(right, current),
            LogicalOp::Or => matches_filter(left, current) || matches_filter(right, current),
        },
        FilterExpression::Comparison {
            left,
            operator,
            right,
        } => {
            let (Some(left), Some(right)) = (operand(left, current), operand(right, current)) else {
                return false;
            };
            compare(left, *operator, right)
        }
    }
}

fn operand<'v>(operand: &'v FilterOperand, current: &'v Value) -> Option<&'v Value> {
    match operand {
        FilterOperand::Literal(value) => Some(value),
        FilterOperand::Current(selectors) => select(current, selectors).into_iter().next(),
    }
}

fn compare(left: &Value, operator: ComparisonOp, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                return false;
            };
            match operator {
                ComparisonOp::Eq => a == b,
                ComparisonOp::Ne => a != b,
                ComparisonOp::Lt => a < b,
                ComparisonOp::Le => a <= b,
                ComparisonOp::Gt => a > b,
                ComparisonOp::Ge => a >= b,
            }
        }
        (Value::String(a), Value::String(b)) => match operator {
            ComparisonOp::Eq => a == b,
            ComparisonOp::Ne => a != b,
            ComparisonOp::Lt => a < b,
            ComparisonOp::Le => a <= b,
            ComparisonOp::Gt => a > b,
            ComparisonOp::Ge => a >= b,
        },
        _ => match operator {
            ComparisonOp::Eq => left == right,
            ComparisonOp::Ne => left != right,
            _ => false,
        },
    }
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

/// Write `value` at the location named by reference `selectors` inside
/// `target`, creating intermediate objects as needed.
pub fn place(
    path: &str,
    mut target: Value,
    selectors: &[Selector],
    value: Value,
) -> Result<Value, PathError> {
    let Some((last, parents)) = selectors.split_last() else {
        return Ok(value);
    };

    let mismatch = |message: String| PathError::ResultPathMismatch {
        path: path.to_string(),
        message,
    };

    let mut cursor = &mut target;
    for selector in parents {
        cursor = match (selector, cursor) {
            (Selector::Child(name), Value::Object(map)) => map
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            (Selector::Index(index), Value::Array(items)) => {
                let len = items.len();
                let i = resolve_index(*index, len)
                    .ok_or_else(|| mismatch(format!("index {index} is out of bounds ({len})")))?;
                &mut items[i]
            }
            (selector, other) => {
                return Err(mismatch(format!(
                    "cannot apply {selector:?} to {}",
                    type_name(other)
                )));
            }
        };
    }

    match (last, cursor) {
        (Selector::Child(name), Value::Object(map)) => {
            map.insert(name.clone(), value);
        }
        (Selector::Index(index), Value::Array(items)) => {
            let len = items.len();
            let i = resolve_index(*index, len)
                .ok_or_else(|| mismatch(format!("index {index} is out of bounds ({len})")))?;
            items[i] = value;
        }
        (selector, other) => {
            return Err(mismatch(format!(
                "cannot apply {selector:?} to {}",
                type_name(other)
            )));
        }
    }
    Ok(target)
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
