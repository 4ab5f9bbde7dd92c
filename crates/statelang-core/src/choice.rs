//! Choice rule evaluation.
//!
//! Rules are evaluated recursively with a depth counter. `And`/`Or`
//! short-circuit. A data test whose `Variable` resolves to nothing is false
//! for every operator except `IsPresent`, and a comparison between values of
//! the wrong types is false rather than an error.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use statelang_types::choice::{ChoiceBranch, ChoiceRule, ComparisonOperator, DataTest, Operand};
use statelang_types::definition::is_expression;

use crate::error::{EvalError, RunError};
use crate::functional;
use crate::path;
use crate::scope::Scope;

/// Errors raised while evaluating a rule tree.
#[derive(Debug, thiserror::Error)]
pub enum ChoiceError {
    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("choice rules nest deeper than {max} levels")]
    TooDeep { max: usize },
}

impl From<ChoiceError> for RunError {
    fn from(err: ChoiceError) -> Self {
        match err {
            ChoiceError::Eval(eval) => eval.into(),
            ChoiceError::TooDeep { max } => RunError::Syntax {
                message: format!("choice rules nest deeper than {max} levels"),
            },
        }
    }
}

/// Index of the first branch whose rule holds, if any.
pub fn first_match(branches: &[ChoiceBranch], scope: &Scope<'_>) -> Result<Option<usize>, ChoiceError> {
    for (index, branch) in branches.iter().enumerate() {
        if evaluate(&branch.rule, 1, scope)? {
            tracing::debug!(branch = index, next = branch.next.as_str(), "choice rule matched");
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Evaluate `rule` at nesting level `depth` (top-level rules are depth 1).
pub fn evaluate(rule: &ChoiceRule, depth: usize, scope: &Scope<'_>) -> Result<bool, ChoiceError> {
    let max = scope.config.max_choice_depth;
    if depth > max {
        return Err(ChoiceError::TooDeep { max });
    }
    match rule {
        ChoiceRule::And(rules) => {
            for r in rules {
                if !evaluate(r, depth + 1, scope)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        ChoiceRule::Or(rules) => {
            for r in rules {
                if evaluate(r, depth + 1, scope)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        ChoiceRule::Not(inner) => Ok(!evaluate(inner, depth + 1, scope)?),
        ChoiceRule::Condition(text) => functional::evaluate_condition(text, scope)
            .map_err(|e| ChoiceError::Eval(e.into())),
        ChoiceRule::Test(test) => evaluate_test(test, scope),
    }
}

fn resolve(expr: &str, scope: &Scope<'_>) -> Result<Option<Value>, EvalError> {
    if is_expression(expr) {
        Ok(Some(functional::evaluate(expr, scope)?))
    } else {
        Ok(path::evaluate(expr, scope)?)
    }
}

fn evaluate_test(test: &DataTest, scope: &Scope<'_>) -> Result<bool, ChoiceError> {
    let variable = resolve(&test.variable, scope)?;

    if test.operator == ComparisonOperator::IsPresent {
        let expected = test_flag(&test.operand);
        return Ok(variable.is_some() == expected);
    }
    let Some(value) = variable else {
        return Ok(false);
    };

    if test.operator.is_type_test() {
        let expected = test_flag(&test.operand);
        let actual = match test.operator {
            ComparisonOperator::IsBoolean => value.is_boolean(),
            ComparisonOperator::IsNull => value.is_null(),
            ComparisonOperator::IsNumeric => value.is_number(),
            ComparisonOperator::IsString => value.is_string(),
            ComparisonOperator::IsTimestamp => value.as_str().and_then(parse_timestamp).is_some(),
            _ => false,
        };
        return Ok(actual == expected);
    }

    let operand = match &test.operand {
        Operand::Literal(v) => v.clone(),
        Operand::Path(p) => match resolve(p, scope)? {
            Some(v) => v,
            None => return Ok(false),
        },
    };
    Ok(compare(test.operator, &value, &operand))
}

fn test_flag(operand: &Operand) -> bool {
    match operand {
        Operand::Literal(Value::Bool(b)) => *b,
        _ => true,
    }
}

fn compare(operator: ComparisonOperator, value: &Value, operand: &Value) -> bool {
    use ComparisonOperator as Op;
    use std::cmp::Ordering;

    let ordering: Option<Ordering> = match operator {
        Op::BooleanEquals => {
            return matches!((value, operand), (Value::Bool(a), Value::Bool(b)) if a == b);
        }
        Op::NumericEquals
        | Op::NumericGreaterThan
        | Op::NumericGreaterThanEquals
        | Op::NumericLessThan
        | Op::NumericLessThanEquals => match (value.as_f64(), operand.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        Op::StringMatches => {
            return match (value.as_str(), operand.as_str()) {
                (Some(text), Some(pattern)) => wildcard_match(pattern, text),
                _ => false,
            };
        }
        Op::StringEquals
        | Op::StringGreaterThan
        | Op::StringGreaterThanEquals
        | Op::StringLessThan
        | Op::StringLessThanEquals => match (value.as_str(), operand.as_str()) {
            (Some(a), Some(b)) => Some(a.cmp(b)),
            _ => None,
        },
        Op::TimestampEquals
        | Op::TimestampGreaterThan
        | Op::TimestampGreaterThanEquals
        | Op::TimestampLessThan
        | Op::TimestampLessThanEquals => {
            let a = value.as_str().and_then(parse_timestamp);
            let b = operand.as_str().and_then(parse_timestamp);
            match (a, b) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => None,
            }
        }
        _ => None,
    };

    let Some(ordering) = ordering else {
        return false;
    };
    match operator {
        Op::NumericEquals | Op::StringEquals | Op::TimestampEquals => ordering == Ordering::Equal,
        Op::NumericGreaterThan | Op::StringGreaterThan | Op::TimestampGreaterThan => {
            ordering == Ordering::Greater
        }
        Op::NumericGreaterThanEquals | Op::StringGreaterThanEquals | Op::TimestampGreaterThanEquals => {
            ordering != Ordering::Less
        }
        Op::NumericLessThan | Op::StringLessThan | Op::TimestampLessThan => ordering == Ordering::Less,
        Op::NumericLessThanEquals | Op::StringLessThanEquals | Op::TimestampLessThanEquals => {
            ordering != Ordering::Greater
        }
        _ => false,
    }
}

/// RFC 3339 timestamps, compared as instants regardless of offset.
pub fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text).ok()
}

/// `*` matches any run of characters; `\*` and `\\` are literal.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Token {
        Star,
        Char(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Token::Char(escaped)),
                None => tokens.push(Token::Char('\\')),
            },
            '*' => tokens.push(Token::Star),
            other => tokens.push(Token::Char(other)),
        }
    }

    let text: Vec<char> = text.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match tokens.get(p) {
            Some(Token::Char(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            Some(Token::Star) => {
                backtrack = Some((p, t));
                p += 1;
            }
            _ => match backtrack {
                Some((star_p, star_t)) => {
                    p = star_p + 1;
                    t = star_t + 1;
                    backtrack = Some((star_p, star_t + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|token| *token == Token::Star)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::random::SeededRandom;
    use crate::scope::Variables;
    use serde_json::json;
    use statelang_types::config::EngineConfig;

    fn rule(doc: Value) -> ChoiceRule {
        ChoiceRule::from_object(doc.as_object().unwrap(), false).unwrap()
    }

    fn holds(doc: Value, input: Value) -> bool {
        let context = json!({});
        let variables = Variables::new();
        let random = SeededRandom::new(1);
        let config = EngineConfig::default();
        let scope = Scope::new(&input, &context, &variables, &random, &config);
        evaluate(&rule(doc), 1, &scope).unwrap()
    }

    #[test]
    fn numeric_comparisons() {
        let input = json!({ "n": 5, "limit": 5 });
        assert!(holds(json!({ "Variable": "$.n", "NumericEquals": 5 }), input.clone()));
        assert!(holds(json!({ "Variable": "$.n", "NumericLessThan": 5.5 }), input.clone()));
        assert!(holds(json!({ "Variable": "$.n", "NumericGreaterThanEqualsPath": "$.limit" }), input.clone()));
        assert!(!holds(json!({ "Variable": "$.n", "NumericGreaterThan": 5 }), input));
    }

    #[test]
    fn type_mismatch_is_false() {
        let input = json!({ "n": "5" });
        assert!(!holds(json!({ "Variable": "$.n", "NumericEquals": 5 }), input.clone()));
        assert!(!holds(json!({ "Variable": "$.n", "BooleanEquals": true }), input));
    }

    #[test]
    fn absent_variable_is_false_except_is_present() {
        let input = json!({});
        assert!(!holds(json!({ "Variable": "$.x", "StringEquals": "a" }), input.clone()));
        assert!(!holds(json!({ "Variable": "$.x", "IsNull": false }), input.clone()));
        assert!(holds(json!({ "Variable": "$.x", "IsPresent": false }), input.clone()));
        assert!(!holds(json!({ "Variable": "$.x", "IsPresent": true }), input));
    }

    #[test]
    fn type_tests() {
        let input = json!({ "b": true, "z": null, "s": "x", "t": "2024-01-01T00:00:00Z" });
        assert!(holds(json!({ "Variable": "$.b", "IsBoolean": true }), input.clone()));
        assert!(holds(json!({ "Variable": "$.z", "IsNull": true }), input.clone()));
        assert!(holds(json!({ "Variable": "$.s", "IsString": true }), input.clone()));
        assert!(holds(json!({ "Variable": "$.s", "IsNumeric": false }), input.clone()));
        assert!(holds(json!({ "Variable": "$.t", "IsTimestamp": true }), input.clone()));
        assert!(holds(json!({ "Variable": "$.s", "IsTimestamp": false }), input));
    }

    #[test]
    fn timestamps_compare_as_instants_across_offsets() {
        let input = json!({ "t": "2024-03-01T12:00:00+02:00" });
        assert!(holds(
            json!({ "Variable": "$.t", "TimestampEquals": "2024-03-01T10:00:00Z" }),
            input.clone()
        ));
        assert!(holds(
            json!({ "Variable": "$.t", "TimestampLessThan": "2024-03-01T10:00:01Z" }),
            input
        ));
    }

    #[test]
    fn string_comparisons_and_matches() {
        let input = json!({ "s": "log-2024.txt" });
        assert!(holds(json!({ "Variable": "$.s", "StringMatches": "log-*.txt" }), input.clone()));
        assert!(!holds(json!({ "Variable": "$.s", "StringMatches": "log-*.csv" }), input.clone()));
        assert!(holds(json!({ "Variable": "$.s", "StringGreaterThan": "log" }), input));
    }

    #[test]
    fn wildcard_escapes() {
        assert!(wildcard_match(r"a\*b", "a*b"));
        assert!(!wildcard_match(r"a\*b", "axxb"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("a*b*c", "aXbYbZc"));
        assert!(!wildcard_match("a*b", "ac"));
    }

    #[test]
    fn boolean_composition() {
        let input = json!({ "a": 1, "b": "x" });
        assert!(holds(
            json!({ "And": [
                { "Variable": "$.a", "NumericEquals": 1 },
                { "Not": { "Variable": "$.b", "StringEquals": "y" } }
            ]}),
            input.clone()
        ));
        assert!(holds(
            json!({ "Or": [
                { "Variable": "$.a", "NumericEquals": 2 },
                { "Variable": "$.b", "StringEquals": "x" }
            ]}),
            input
        ));
    }

    #[test]
    fn depth_is_bounded() {
        let mut doc = json!({ "Variable": "$.a", "IsPresent": true });
        for _ in 0..5 {
            doc = json!({ "Not": doc });
        }
        let input = json!({ "a": 1 });
        let context = json!({});
        let variables = Variables::new();
        let random = SeededRandom::new(1);
        let config = EngineConfig {
            max_choice_depth: 3,
            ..EngineConfig::default()
        };
        let scope = Scope::new(&input, &context, &variables, &random, &config);
        let err = evaluate(&rule(doc), 1, &scope).unwrap_err();
        assert!(matches!(err, ChoiceError::TooDeep { max: 3 }));
    }

    #[test]
    fn condition_rules_use_functional_dialect() {
        assert!(holds(json!({ "Condition": "{% n > 2 %}" }), json!({ "n": 3 })));
    }
}
