//! Definition loading and validation.
//!
//! Loading runs in two passes. The raw JSON is walked first: every state's
//! dialect is resolved and its keys are checked against the fields that are
//! legal for its `(Type, dialect)` pair. The document is then deserialized
//! into the typed model and each graph is validated structurally: `StartAt`
//! and every transition target exist, non-terminal states declare exactly one
//! of `Next` / `End`, Choice rules match the dialect, and every state is
//! reachable from `StartAt`.

use std::collections::HashMap;

use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use serde_json::{Map, Value};
use statelang_types::choice::ChoiceRule;
use statelang_types::definition::{QueryLanguage, State, StateGraph, StateMachine};
use statelang_types::error::DefinitionError;

/// Longest legal state name, in characters.
pub const MAX_STATE_NAME_LEN: usize = 80;

const MACHINE_FIELDS: &[&str] = &[
    "StartAt",
    "States",
    "Comment",
    "QueryLanguage",
    "TimeoutSeconds",
    "Version",
];

const GRAPH_FIELDS: &[&str] = &["StartAt", "States", "Comment", "ProcessorConfig"];

const COMMON_FIELDS: &[&str] = &["Type", "Comment", "QueryLanguage"];

// ---------------------------------------------------------------------------
// Field table
// ---------------------------------------------------------------------------

struct FieldSet {
    both: &'static [&'static str],
    path: &'static [&'static str],
    functional: &'static [&'static str],
}

fn field_set(state_type: &str) -> Option<FieldSet> {
    let set = match state_type {
        "Task" => FieldSet {
            both: &[
                "Resource",
                "Next",
                "End",
                "Retry",
                "Catch",
                "TimeoutSeconds",
                "HeartbeatSeconds",
                "Credentials",
                "Assign",
            ],
            path: &[
                "InputPath",
                "OutputPath",
                "Parameters",
                "ResultSelector",
                "ResultPath",
                "TimeoutSecondsPath",
                "HeartbeatSecondsPath",
            ],
            functional: &["Arguments", "Output"],
        },
        "Pass" => FieldSet {
            both: &["Next", "End", "Assign"],
            path: &["InputPath", "OutputPath", "Parameters", "Result", "ResultPath"],
            functional: &["Output"],
        },
        "Choice" => FieldSet {
            both: &["Choices", "Default", "Assign"],
            path: &["InputPath", "OutputPath"],
            functional: &["Output"],
        },
        "Wait" => FieldSet {
            both: &["Next", "End", "Seconds", "Timestamp", "Assign"],
            path: &["InputPath", "OutputPath", "SecondsPath", "TimestampPath"],
            functional: &["Output"],
        },
        "Succeed" => FieldSet {
            both: &[],
            path: &["InputPath", "OutputPath"],
            functional: &["Output"],
        },
        "Fail" => FieldSet {
            both: &["Error", "Cause"],
            path: &["ErrorPath", "CausePath"],
            functional: &[],
        },
        "Map" => FieldSet {
            both: &[
                "Next",
                "End",
                "ItemProcessor",
                "Iterator",
                "ItemReader",
                "ItemBatcher",
                "ResultWriter",
                "MaxConcurrency",
                "ToleratedFailureCount",
                "ToleratedFailurePercentage",
                "Label",
                "Retry",
                "Catch",
                "Assign",
                "ItemSelector",
            ],
            path: &[
                "InputPath",
                "OutputPath",
                "ItemsPath",
                "Parameters",
                "ResultSelector",
                "ResultPath",
                "MaxConcurrencyPath",
                "ToleratedFailureCountPath",
                "ToleratedFailurePercentagePath",
            ],
            functional: &["Items", "Output"],
        },
        "Parallel" => FieldSet {
            both: &["Next", "End", "Branches", "Retry", "Catch", "Assign"],
            path: &["InputPath", "OutputPath", "Parameters", "ResultSelector", "ResultPath"],
            functional: &["Arguments", "Output"],
        },
        _ => return None,
    };
    Some(set)
}

impl FieldSet {
    fn allows(&self, field: &str, dialect: QueryLanguage) -> bool {
        COMMON_FIELDS.contains(&field)
            || self.both.contains(&field)
            || match dialect {
                QueryLanguage::JsonPath => self.path.contains(&field),
                QueryLanguage::Functional => self.functional.contains(&field),
            }
    }
}

fn required_fields(state_type: &str) -> &'static [&'static str] {
    match state_type {
        "Task" => &["Resource"],
        "Choice" => &["Choices"],
        "Parallel" => &["Branches"],
        _ => &[],
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse and validate a definition from JSON text, defaulting to the path
/// dialect for states that do not declare one.
pub fn load_definition(text: &str) -> Result<StateMachine, DefinitionError> {
    let doc: Value = serde_json::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    load_value(&doc, QueryLanguage::default())
}

/// Validate and convert a parsed definition document.
///
/// `default_dialect` applies when neither the machine nor a state declares a
/// `QueryLanguage`.
pub fn load_value(doc: &Value, default_dialect: QueryLanguage) -> Result<StateMachine, DefinitionError> {
    let root = doc
        .as_object()
        .ok_or_else(|| DefinitionError::Parse("a definition must be a JSON object".to_string()))?;
    check_keys("", "StateMachine", "any", root, MACHINE_FIELDS)?;
    let machine_dialect = match root.get("QueryLanguage") {
        Some(value) => parse_dialect("", value)?,
        None => default_dialect,
    };
    check_graph(root, machine_dialect)?;

    let machine: StateMachine =
        serde_json::from_value(doc.clone()).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_graph(&machine.graph, machine_dialect)?;
    tracing::debug!(
        start_at = machine.graph.start_at.as_str(),
        states = machine.graph.states.len(),
        dialect = %machine_dialect,
        "loaded state machine"
    );
    Ok(machine)
}

/// Serialize a machine back to its JSON document.
pub fn to_value(machine: &StateMachine) -> Result<Value, DefinitionError> {
    serde_json::to_value(machine).map_err(|e| DefinitionError::Parse(e.to_string()))
}

fn parse_dialect(state: &str, value: &Value) -> Result<QueryLanguage, DefinitionError> {
    serde_json::from_value(value.clone()).map_err(|_| DefinitionError::InvalidValue {
        state: state.to_string(),
        field: "QueryLanguage".to_string(),
        message: format!("unknown query language {value}"),
    })
}

fn check_keys(
    state: &str,
    state_type: &str,
    dialect: &str,
    object: &Map<String, Value>,
    allowed: &[&str],
) -> Result<(), DefinitionError> {
    match object.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(field) => Err(DefinitionError::FieldNotAllowed {
            state: state.to_string(),
            state_type: state_type.to_string(),
            dialect: dialect.to_string(),
            field: field.clone(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Raw pass
// ---------------------------------------------------------------------------

fn check_graph(graph: &Map<String, Value>, default_dialect: QueryLanguage) -> Result<(), DefinitionError> {
    let states = match graph.get("States") {
        Some(Value::Object(states)) => states,
        Some(_) => return Err(DefinitionError::Parse("'States' must be an object".to_string())),
        None => {
            return Err(DefinitionError::MissingField {
                state: String::new(),
                field: "States".to_string(),
            });
        }
    };
    for (name, raw) in states {
        let len = name.chars().count();
        if len == 0 || len > MAX_STATE_NAME_LEN {
            return Err(DefinitionError::InvalidStateName(name.clone()));
        }
        let object = raw
            .as_object()
            .ok_or_else(|| DefinitionError::Parse(format!("state '{name}' must be a JSON object")))?;
        check_state(name, object, default_dialect)?;
    }
    Ok(())
}

fn check_state(
    name: &str,
    object: &Map<String, Value>,
    default_dialect: QueryLanguage,
) -> Result<(), DefinitionError> {
    let state_type = object
        .get("Type")
        .and_then(Value::as_str)
        .ok_or_else(|| DefinitionError::MissingField {
            state: name.to_string(),
            field: "Type".to_string(),
        })?;
    let fields = field_set(state_type).ok_or_else(|| DefinitionError::InvalidValue {
        state: name.to_string(),
        field: "Type".to_string(),
        message: format!("unknown state type '{state_type}'"),
    })?;
    let dialect = match object.get("QueryLanguage") {
        Some(value) => parse_dialect(name, value)?,
        None => default_dialect,
    };

    if let Some(field) = object.keys().find(|key| !fields.allows(key, dialect)) {
        return Err(DefinitionError::FieldNotAllowed {
            state: name.to_string(),
            state_type: state_type.to_string(),
            dialect: dialect.to_string(),
            field: field.clone(),
        });
    }
    for field in required_fields(state_type) {
        if !object.contains_key(*field) {
            return Err(DefinitionError::MissingField {
                state: name.to_string(),
                field: field.to_string(),
            });
        }
    }
    if state_type == "Map" && !object.contains_key("ItemProcessor") && !object.contains_key("Iterator") {
        return Err(DefinitionError::MissingField {
            state: name.to_string(),
            field: "ItemProcessor".to_string(),
        });
    }

    if let Some(Value::Array(catchers)) = object.get("Catch") {
        let disallowed = match dialect {
            QueryLanguage::JsonPath => "Output",
            QueryLanguage::Functional => "ResultPath",
        };
        if catchers
            .iter()
            .any(|catcher| catcher.get(disallowed).is_some())
        {
            return Err(DefinitionError::FieldNotAllowed {
                state: name.to_string(),
                state_type: "Catch".to_string(),
                dialect: dialect.to_string(),
                field: disallowed.to_string(),
            });
        }
    }

    // Nested graphs inherit the enclosing default, not this state's dialect.
    for key in ["ItemProcessor", "Iterator"] {
        if let Some(graph) = object.get(key) {
            let graph = graph
                .as_object()
                .ok_or_else(|| DefinitionError::Parse(format!("'{key}' of state '{name}' must be an object")))?;
            check_keys(name, key, &dialect.to_string(), graph, GRAPH_FIELDS)?;
            check_graph(graph, default_dialect)?;
        }
    }
    if let Some(branches) = object.get("Branches") {
        let branches = branches
            .as_array()
            .ok_or_else(|| DefinitionError::Parse(format!("'Branches' of state '{name}' must be an array")))?;
        for branch in branches {
            let graph = branch
                .as_object()
                .ok_or_else(|| DefinitionError::Parse(format!("a branch of state '{name}' must be an object")))?;
            check_keys(name, "Branch", &dialect.to_string(), graph, GRAPH_FIELDS)?;
            check_graph(graph, default_dialect)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed pass
// ---------------------------------------------------------------------------

fn validate_graph(graph: &StateGraph, default_dialect: QueryLanguage) -> Result<(), DefinitionError> {
    if graph.get(&graph.start_at).is_none() {
        return Err(DefinitionError::MissingStart(graph.start_at.clone()));
    }

    for (name, state) in &graph.states {
        validate_transition(name, state)?;
        for target in state.successors() {
            if graph.get(target).is_none() {
                return Err(DefinitionError::UnknownTarget {
                    state: name.clone(),
                    target: target.to_string(),
                });
            }
        }
        let dialect = state.query_language().unwrap_or(default_dialect);
        match state {
            State::Choice(choice) => {
                for branch in &choice.choices {
                    validate_rule_dialect(name, &branch.rule, dialect)?;
                }
            }
            State::Map(map) => {
                if let Some(processor) = map.processor() {
                    validate_graph(processor, default_dialect)?;
                }
            }
            State::Parallel(parallel) => {
                for branch in &parallel.branches {
                    validate_graph(branch, default_dialect)?;
                }
            }
            _ => {}
        }
    }

    check_reachability(graph)
}

fn validate_transition(name: &str, state: &State) -> Result<(), DefinitionError> {
    let has_transition = matches!(
        state,
        State::Task(_) | State::Pass(_) | State::Wait(_) | State::Map(_) | State::Parallel(_)
    );
    if !has_transition {
        return Ok(());
    }
    match state.transition_fields() {
        (Some(_), None) | (None, Some(true)) => Ok(()),
        _ => Err(DefinitionError::Transition {
            state: name.to_string(),
        }),
    }
}

fn validate_rule_dialect(name: &str, rule: &ChoiceRule, dialect: QueryLanguage) -> Result<(), DefinitionError> {
    let ok = match dialect {
        QueryLanguage::Functional => matches!(rule, ChoiceRule::Condition(_)),
        QueryLanguage::JsonPath => !contains_condition(rule),
    };
    if ok {
        return Ok(());
    }
    let message = match dialect {
        QueryLanguage::Functional => "choice rules must be a 'Condition' expression",
        QueryLanguage::JsonPath => "'Condition' rules require the functional query language",
    };
    Err(DefinitionError::InvalidValue {
        state: name.to_string(),
        field: "Choices".to_string(),
        message: message.to_string(),
    })
}

fn contains_condition(rule: &ChoiceRule) -> bool {
    match rule {
        ChoiceRule::Condition(_) => true,
        ChoiceRule::And(rules) | ChoiceRule::Or(rules) => rules.iter().any(contains_condition),
        ChoiceRule::Not(inner) => contains_condition(inner),
        ChoiceRule::Test(_) => false,
    }
}

/// Every state must be reachable from `StartAt` through `Next`, `Default`,
/// Choice targets and catcher targets.
fn check_reachability(graph: &StateGraph) -> Result<(), DefinitionError> {
    let mut dag = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = graph
        .states
        .keys()
        .map(|name| (name.as_str(), dag.add_node(name.as_str())))
        .collect();
    for (name, state) in &graph.states {
        for target in state.successors() {
            if let Some(&to) = nodes.get(target) {
                dag.add_edge(nodes[name.as_str()], to, ());
            }
        }
    }

    let Some(&start) = nodes.get(graph.start_at.as_str()) else {
        return Err(DefinitionError::MissingStart(graph.start_at.clone()));
    };
    let mut visited = std::collections::HashSet::new();
    let mut dfs = Dfs::new(&dag, start);
    while let Some(node) = dfs.next(&dag) {
        visited.insert(dag[node]);
    }

    let mut unreachable: Vec<&str> = graph
        .states
        .keys()
        .map(String::as_str)
        .filter(|name| !visited.contains(name))
        .collect();
    unreachable.sort_unstable();
    match unreachable.first() {
        Some(name) => Err(DefinitionError::Unreachable {
            state: name.to_string(),
        }),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
