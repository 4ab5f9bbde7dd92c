//! The intrinsic function catalog.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Number, Value};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

use super::IntrinsicError;
use crate::scope::Scope;

/// Call `States.<name>` with already-evaluated arguments.
pub fn dispatch(name: &str, args: Vec<Value>, scope: &Scope<'_>) -> Result<Value, IntrinsicError> {
    let f = Args { name, args };
    match name {
        "Array" => Ok(Value::Array(f.args)),
        "ArrayContains" => array_contains(f),
        "ArrayGetItem" => array_get_item(f),
        "ArrayLength" => array_length(f),
        "ArrayPartition" => array_partition(f),
        "ArrayRange" => array_range(f, scope.config.max_array_range),
        "ArrayUnique" => array_unique(f),
        "Base64Encode" => base64_encode(f),
        "Base64Decode" => base64_decode(f),
        "Format" => format(f),
        "Hash" => hash(f),
        "JsonMerge" => json_merge(f),
        "JsonToString" => json_to_string(f),
        "StringToJson" => string_to_json(f),
        "MathAdd" => math_add(f),
        "MathRandom" => math_random(f, scope),
        "StringSplit" => string_split(f),
        "UUID" => uuid(f, scope),
        other => Err(IntrinsicError::UnknownFunction(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

struct Args<'n> {
    name: &'n str,
    args: Vec<Value>,
}

impl Args<'_> {
    fn arity(&self, min: usize, max: usize) -> Result<(), IntrinsicError> {
        if (min..=max).contains(&self.args.len()) {
            return Ok(());
        }
        let expected = if min == max {
            min.to_string()
        } else if max == usize::MAX {
            format!("at least {min}")
        } else {
            format!("{min} to {max}")
        };
        Err(IntrinsicError::Arity {
            function: self.name.to_string(),
            expected,
            actual: self.args.len(),
        })
    }

    fn invalid(&self, message: impl Into<String>) -> IntrinsicError {
        IntrinsicError::InvalidArgument {
            function: self.name.to_string(),
            message: message.into(),
        }
    }

    fn array(&self, i: usize) -> Result<&Vec<Value>, IntrinsicError> {
        self.args[i]
            .as_array()
            .ok_or_else(|| self.invalid(format!("argument {} must be an array", i + 1)))
    }

    fn string(&self, i: usize) -> Result<&str, IntrinsicError> {
        self.args[i]
            .as_str()
            .ok_or_else(|| self.invalid(format!("argument {} must be a string", i + 1)))
    }

    fn integer(&self, i: usize) -> Result<i64, IntrinsicError> {
        let value = &self.args[i];
        value
            .as_i64()
            .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| self.invalid(format!("argument {} must be an integer", i + 1)))
    }

    fn boolean(&self, i: usize) -> Result<bool, IntrinsicError> {
        self.args[i]
            .as_bool()
            .ok_or_else(|| self.invalid(format!("argument {} must be a boolean", i + 1)))
    }
}

// ---------------------------------------------------------------------------
// Arrays
// ---------------------------------------------------------------------------

fn array_contains(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    Ok(Value::Bool(f.array(0)?.contains(&f.args[1])))
}

fn array_get_item(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    let items = f.array(0)?;
    let index = f.integer(1)?;
    usize::try_from(index)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .ok_or_else(|| f.invalid(format!("index {index} is out of bounds ({})", items.len())))
}

fn array_length(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    Ok(Value::from(f.array(0)?.len()))
}

fn array_partition(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    let items = f.array(0)?;
    let size = f.integer(1)?;
    if size <= 0 {
        return Err(f.invalid("chunk size must be positive"));
    }
    let chunks = items
        .chunks(size as usize)
        .map(|chunk| Value::Array(chunk.to_vec()))
        .collect();
    Ok(Value::Array(chunks))
}

/// Inclusive of `end` when the step lands on it.
fn array_range(f: Args<'_>, max_len: usize) -> Result<Value, IntrinsicError> {
    f.arity(3, 3)?;
    let (start, end, step) = (f.integer(0)?, f.integer(1)?, f.integer(2)?);
    if step == 0 {
        return Err(f.invalid("step must not be zero"));
    }
    let mut out = Vec::new();
    let mut current = start;
    while (step > 0 && current <= end) || (step < 0 && current >= end) {
        if out.len() >= max_len {
            return Err(f.invalid(format!("range exceeds {max_len} elements")));
        }
        out.push(Value::from(current));
        current = match current.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::Array(out))
}

fn array_unique(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    let mut unique: Vec<Value> = Vec::new();
    for item in f.array(0)? {
        if !unique.contains(item) {
            unique.push(item.clone());
        }
    }
    Ok(Value::Array(unique))
}

// ---------------------------------------------------------------------------
// Encoding and hashing
// ---------------------------------------------------------------------------

fn base64_encode(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    Ok(Value::String(BASE64.encode(f.string(0)?)))
}

fn base64_decode(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    let bytes = BASE64
        .decode(f.string(0)?)
        .map_err(|e| f.invalid(format!("invalid base64: {e}")))?;
    String::from_utf8(bytes)
        .map(Value::String)
        .map_err(|_| f.invalid("decoded data is not valid UTF-8"))
}

fn hash(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    let data = f.string(0)?.as_bytes();
    let digest = match f.string(1)? {
        "MD5" => to_hex(&md5::compute(data).0),
        "SHA-1" => to_hex(&Sha1::digest(data)),
        "SHA-256" => to_hex(&Sha256::digest(data)),
        "SHA-384" => to_hex(&Sha384::digest(data)),
        "SHA-512" => to_hex(&Sha512::digest(data)),
        other => return Err(f.invalid(format!("unsupported algorithm '{other}'"))),
    };
    Ok(Value::String(digest))
}

fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

// ---------------------------------------------------------------------------
// Strings and JSON
// ---------------------------------------------------------------------------

/// `{}` placeholders are filled in order; `\{` and `\}` are literal braces.
fn format(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, usize::MAX)?;
    let template = f.string(0)?;
    let mut values = f.args[1..].iter();
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if matches!(chars.peek(), Some('{') | Some('}')) => {
                if let Some(brace) = chars.next() {
                    out.push(brace);
                }
            }
            '{' if chars.peek() == Some(&'}') => {
                chars.next();
                let value = values
                    .next()
                    .ok_or_else(|| f.invalid("more placeholders than arguments"))?;
                match value {
                    Value::String(s) => out.push_str(s),
                    other => out.push_str(&other.to_string()),
                }
            }
            other => out.push(other),
        }
    }
    if values.next().is_some() {
        return Err(f.invalid("more arguments than placeholders"));
    }
    Ok(Value::String(out))
}

fn json_merge(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(3, 3)?;
    let (Value::Object(left), Value::Object(right)) = (&f.args[0], &f.args[1]) else {
        return Err(f.invalid("both inputs must be objects"));
    };
    let deep = f.boolean(2)?;
    let mut merged = left.clone();
    merge_into(&mut merged, right, deep);
    Ok(Value::Object(merged))
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>, deep: bool) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) if deep => {
                merge_into(existing, incoming, deep);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn json_to_string(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    serde_json::to_string(&f.args[0])
        .map(Value::String)
        .map_err(|e| f.invalid(e.to_string()))
}

fn string_to_json(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(1, 1)?;
    serde_json::from_str(f.string(0)?).map_err(|e| f.invalid(format!("invalid JSON: {e}")))
}

/// Splits on any of the delimiter characters and drops empty pieces.
fn string_split(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    let text = f.string(0)?;
    let delimiters: Vec<char> = f.string(1)?.chars().collect();
    let parts = text
        .split(|c| delimiters.contains(&c))
        .filter(|part| !part.is_empty())
        .map(|part| Value::String(part.to_string()))
        .collect();
    Ok(Value::Array(parts))
}

// ---------------------------------------------------------------------------
// Math and identifiers
// ---------------------------------------------------------------------------

fn math_add(f: Args<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 2)?;
    let (a, b) = (&f.args[0], &f.args[1]);
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x
            .checked_add(y)
            .map(Value::from)
            .ok_or_else(|| f.invalid("integer overflow"));
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Number::from_f64(x + y)
            .map(Value::Number)
            .ok_or_else(|| f.invalid("result is not a finite number")),
        _ => Err(f.invalid("both arguments must be numbers")),
    }
}

/// Integer in `[start, end)`. A seed makes the result deterministic.
fn math_random(f: Args<'_>, scope: &Scope<'_>) -> Result<Value, IntrinsicError> {
    f.arity(2, 3)?;
    let (start, end) = (f.integer(0)?, f.integer(1)?);
    if start >= end {
        return Err(f.invalid("start must be less than end"));
    }
    let value = if f.args.len() == 3 {
        let seed = f.integer(2)?;
        StdRng::seed_from_u64(seed as u64).gen_range(start..end)
    } else {
        let span = end.abs_diff(start);
        start.wrapping_add((scope.random.next_u64() % span) as i64)
    };
    Ok(Value::from(value))
}

fn uuid(f: Args<'_>, scope: &Scope<'_>) -> Result<Value, IntrinsicError> {
    f.arity(0, 0)?;
    let mut bytes = [0u8; 16];
    scope.random.fill_bytes(&mut bytes);
    let id = uuid::Builder::from_random_bytes(bytes).into_uuid();
    Ok(Value::String(id.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
