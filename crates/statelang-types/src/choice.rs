//! Choice rule model.
//!
//! A Choice state holds an ordered list of `ChoiceBranch`es. Each branch owns a
//! rule tree plus the transition data (`Next`, `Assign`, `Output`) that only a
//! top-level rule may carry. Rules are parsed from and written back to their
//! JSON object form by hand because the operator is encoded in the key name
//! (`StringEquals`, `NumericLessThanPath`, ...).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// A data-test predicate. Every comparison also has a `...Path` form whose
/// operand is read from the data instead of given literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComparisonOperator {
    BooleanEquals,
    IsBoolean,
    IsNull,
    IsNumeric,
    IsPresent,
    IsString,
    IsTimestamp,
    NumericEquals,
    NumericGreaterThan,
    NumericGreaterThanEquals,
    NumericLessThan,
    NumericLessThanEquals,
    StringEquals,
    StringGreaterThan,
    StringGreaterThanEquals,
    StringLessThan,
    StringLessThanEquals,
    StringMatches,
    TimestampEquals,
    TimestampGreaterThan,
    TimestampGreaterThanEquals,
    TimestampLessThan,
    TimestampLessThanEquals,
}

const OPERATORS: &[(&str, ComparisonOperator)] = &[
    ("BooleanEquals", ComparisonOperator::BooleanEquals),
    ("IsBoolean", ComparisonOperator::IsBoolean),
    ("IsNull", ComparisonOperator::IsNull),
    ("IsNumeric", ComparisonOperator::IsNumeric),
    ("IsPresent", ComparisonOperator::IsPresent),
    ("IsString", ComparisonOperator::IsString),
    ("IsTimestamp", ComparisonOperator::IsTimestamp),
    ("NumericEquals", ComparisonOperator::NumericEquals),
    ("NumericGreaterThan", ComparisonOperator::NumericGreaterThan),
    ("NumericGreaterThanEquals", ComparisonOperator::NumericGreaterThanEquals),
    ("NumericLessThan", ComparisonOperator::NumericLessThan),
    ("NumericLessThanEquals", ComparisonOperator::NumericLessThanEquals),
    ("StringEquals", ComparisonOperator::StringEquals),
    ("StringGreaterThan", ComparisonOperator::StringGreaterThan),
    ("StringGreaterThanEquals", ComparisonOperator::StringGreaterThanEquals),
    ("StringLessThan", ComparisonOperator::StringLessThan),
    ("StringLessThanEquals", ComparisonOperator::StringLessThanEquals),
    ("StringMatches", ComparisonOperator::StringMatches),
    ("TimestampEquals", ComparisonOperator::TimestampEquals),
    ("TimestampGreaterThan", ComparisonOperator::TimestampGreaterThan),
    ("TimestampGreaterThanEquals", ComparisonOperator::TimestampGreaterThanEquals),
    ("TimestampLessThan", ComparisonOperator::TimestampLessThan),
    ("TimestampLessThanEquals", ComparisonOperator::TimestampLessThanEquals),
];

impl ComparisonOperator {
    pub fn name(self) -> &'static str {
        OPERATORS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
            .unwrap_or("Unknown")
    }

    /// Type tests take a boolean literal and have no `...Path` form.
    pub fn is_type_test(self) -> bool {
        matches!(
            self,
            Self::IsBoolean
                | Self::IsNull
                | Self::IsNumeric
                | Self::IsPresent
                | Self::IsString
                | Self::IsTimestamp
        )
    }

    /// Parse an operator key, returning the operator and whether it is the
    /// `...Path` form.
    pub fn from_key(key: &str) -> Option<(Self, bool)> {
        if let Some((_, op)) = OPERATORS.iter().find(|(name, _)| *name == key) {
            return Some((*op, false));
        }
        let base = key.strip_suffix("Path")?;
        OPERATORS
            .iter()
            .find(|(name, op)| *name == base && !op.is_type_test())
            .map(|(_, op)| (*op, true))
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// The right-hand side of a data test.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Path(String),
}

/// `Variable <operator> operand`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTest {
    pub variable: String,
    pub operator: ComparisonOperator,
    pub operand: Operand,
}

/// A boolean rule tree.
#[derive(Debug, Clone, PartialEq)]
pub enum ChoiceRule {
    And(Vec<ChoiceRule>),
    Or(Vec<ChoiceRule>),
    Not(Box<ChoiceRule>),
    Test(DataTest),
    /// Functional dialect: a `{% %}` expression that must yield a boolean.
    Condition(String),
}

const BRANCH_ONLY_KEYS: &[&str] = &["Next", "Assign", "Output", "Comment"];

impl ChoiceRule {
    /// Parse a rule object. `nested` is true below the top level, where
    /// branch-only keys are rejected.
    pub fn from_object(object: &Map<String, Value>, nested: bool) -> Result<Self, String> {
        if nested {
            if let Some(key) = BRANCH_ONLY_KEYS.iter().find(|k| object.contains_key(**k)) {
                return Err(format!("nested choice rules must not carry '{key}'"));
            }
        }

        let mut predicate: Option<ChoiceRule> = None;
        let mut set = |rule: ChoiceRule| -> Result<(), String> {
            if predicate.is_some() {
                return Err("choice rule must have exactly one predicate".to_string());
            }
            predicate = Some(rule);
            Ok(())
        };

        let variable = match object.get("Variable") {
            Some(Value::String(v)) => Some(v.clone()),
            Some(_) => return Err("'Variable' must be a string".to_string()),
            None => None,
        };

        for (key, value) in object {
            match key.as_str() {
                "Variable" => {}
                k if !nested && BRANCH_ONLY_KEYS.contains(&k) => {}
                "And" | "Or" => {
                    let items = value
                        .as_array()
                        .ok_or_else(|| format!("'{key}' must be an array of rules"))?;
                    if items.is_empty() {
                        return Err(format!("'{key}' must not be empty"));
                    }
                    let rules = items
                        .iter()
                        .map(|item| {
                            item.as_object()
                                .ok_or_else(|| format!("'{key}' entries must be objects"))
                                .and_then(|o| Self::from_object(o, true))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    set(if key == "And" { Self::And(rules) } else { Self::Or(rules) })?;
                }
                "Not" => {
                    let inner = value
                        .as_object()
                        .ok_or_else(|| "'Not' must be a rule object".to_string())?;
                    set(Self::Not(Box::new(Self::from_object(inner, true)?)))?;
                }
                "Condition" => {
                    let text = value
                        .as_str()
                        .ok_or_else(|| "'Condition' must be a string".to_string())?;
                    set(Self::Condition(text.to_string()))?;
                }
                other => {
                    let (operator, is_path) = ComparisonOperator::from_key(other)
                        .ok_or_else(|| format!("unknown choice rule field '{other}'"))?;
                    let variable = variable
                        .clone()
                        .ok_or_else(|| format!("'{other}' requires 'Variable'"))?;
                    let operand = if is_path {
                        let path = value
                            .as_str()
                            .ok_or_else(|| format!("'{other}' must be a path string"))?;
                        Operand::Path(path.to_string())
                    } else {
                        Operand::Literal(value.clone())
                    };
                    set(Self::Test(DataTest {
                        variable,
                        operator,
                        operand,
                    }))?;
                }
            }
        }

        let rule = predicate.ok_or_else(|| "choice rule has no predicate".to_string())?;
        if variable.is_some() && !matches!(rule, Self::Test(_)) {
            return Err("'Variable' is only valid on a data test".to_string());
        }
        Ok(rule)
    }

    /// JSON object form of this rule.
    pub fn to_object(&self) -> Map<String, Value> {
        let mut object = Map::new();
        match self {
            Self::And(rules) | Self::Or(rules) => {
                let key = if matches!(self, Self::And(_)) { "And" } else { "Or" };
                let items = rules.iter().map(|r| Value::Object(r.to_object())).collect();
                object.insert(key.to_string(), Value::Array(items));
            }
            Self::Not(inner) => {
                object.insert("Not".to_string(), Value::Object(inner.to_object()));
            }
            Self::Condition(text) => {
                object.insert("Condition".to_string(), Value::String(text.clone()));
            }
            Self::Test(test) => {
                object.insert("Variable".to_string(), Value::String(test.variable.clone()));
                match &test.operand {
                    Operand::Literal(value) => {
                        object.insert(test.operator.name().to_string(), value.clone());
                    }
                    Operand::Path(path) => {
                        object.insert(
                            format!("{}Path", test.operator.name()),
                            Value::String(path.clone()),
                        );
                    }
                }
            }
        }
        object
    }
}

// ---------------------------------------------------------------------------
// ChoiceBranch
// ---------------------------------------------------------------------------

/// A top-level entry of a Choice state's `Choices` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ChoiceBranch {
    pub rule: ChoiceRule,
    pub next: String,
    pub assign: Option<Value>,
    pub output: Option<Value>,
    pub comment: Option<String>,
}

impl TryFrom<Map<String, Value>> for ChoiceBranch {
    type Error = String;

    fn try_from(object: Map<String, Value>) -> Result<Self, Self::Error> {
        let next = object
            .get("Next")
            .and_then(Value::as_str)
            .ok_or_else(|| "choice rule is missing 'Next'".to_string())?
            .to_string();
        let comment = match object.get("Comment") {
            Some(Value::String(c)) => Some(c.clone()),
            Some(_) => return Err("'Comment' must be a string".to_string()),
            None => None,
        };
        Ok(Self {
            rule: ChoiceRule::from_object(&object, false)?,
            next,
            assign: object.get("Assign").cloned(),
            output: object.get("Output").cloned(),
            comment,
        })
    }
}

impl From<ChoiceBranch> for Map<String, Value> {
    fn from(branch: ChoiceBranch) -> Self {
        let mut object = branch.rule.to_object();
        object.insert("Next".to_string(), Value::String(branch.next));
        if let Some(assign) = branch.assign {
            object.insert("Assign".to_string(), assign);
        }
        if let Some(output) = branch.output {
            object.insert("Output".to_string(), output);
        }
        if let Some(comment) = branch.comment {
            object.insert("Comment".to_string(), Value::String(comment));
        }
        object
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
