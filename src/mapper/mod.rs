//! A small, side-effect-free data-shaping engine over JSON value trees.
//!
//! Source expressions are either literals or substitutions of the form
//! `${path.to[0].value}` / `${path|fallback}`. Paths walk objects by key
//! and arrays by `[n]` index. The engine powers the Enrichment module's
//! input/output mappings and the `when:` condition gates.

pub mod conditions;
pub mod context;

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{Number, Value};

/// One parsed component of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Key(String),
    Index(usize),
}

/// A parsed source expression. `path == None` means the expression was a
/// bare literal (which doubles as its own default).
#[derive(Debug, Clone, Default)]
pub struct Expr {
    path: Option<String>,
    default: Option<Value>,
}

/// Parse `${path}`, `${path|default}` or a bare literal.
pub fn parse_expr(expr: &str) -> Result<Expr> {
    let s = expr.trim();
    let inner = match s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
        Some(inner) => inner.trim(),
        None => {
            return Ok(Expr {
                path: None,
                default: Some(parse_literal(s)),
            })
        }
    };

    let (path, default) = match inner.split_once('|') {
        Some((path, default)) => (path.trim(), Some(parse_literal(default.trim()))),
        None => (inner, None),
    };
    if path.is_empty() {
        bail!("empty path");
    }
    Ok(Expr {
        path: Some(path.to_string()),
        default,
    })
}

/// Interpret common literals; anything unrecognized stays a raw string.
fn parse_literal(s: &str) -> Value {
    let s = s.trim();
    if s.is_empty() {
        return Value::String(String::new());
    }
    match s.to_ascii_lowercase().as_str() {
        "null" | "nil" => return Value::Null,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    let quoted = (s.starts_with('"') && s.ends_with('"') && s.len() >= 2)
        || (s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2);
    if quoted {
        return Value::String(s[1..s.len() - 1].to_string());
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(s.to_string())
}

fn parse_path(path: &str) -> Result<Vec<Step>> {
    let p = path.trim();
    if p.is_empty() {
        bail!("empty path");
    }
    let mut steps = Vec::new();
    let mut buf = String::new();
    let mut chars = p.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '.' => {
                if !buf.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut buf)));
                }
            }
            '[' => {
                if !buf.is_empty() {
                    steps.push(Step::Key(std::mem::take(&mut buf)));
                }
                let close = p[i..]
                    .find(']')
                    .map(|off| i + off)
                    .ok_or_else(|| anyhow!("missing closing ] at position {i}"))?;
                let content = p[i + 1..close].trim();
                let idx: usize = content
                    .parse()
                    .map_err(|_| anyhow!("invalid index {content:?} at position {i}"))?;
                steps.push(Step::Index(idx));
                while chars.peek().map(|(j, _)| *j <= close).unwrap_or(false) {
                    chars.next();
                }
            }
            c => buf.push(c),
        }
    }
    if !buf.is_empty() {
        steps.push(Step::Key(buf));
    }
    if steps.is_empty() {
        bail!("empty path");
    }
    Ok(steps)
}

/// Walk `root` along `path`. Any missing key, out-of-bounds index or
/// container-kind mismatch yields `None`; only an unparseable path is an
/// error.
pub fn get(root: &Value, path: &str) -> Result<Option<Value>> {
    let steps = parse_path(path)?;
    let mut cur = root;
    for step in &steps {
        match step {
            Step::Key(key) => match cur.as_object().and_then(|obj| obj.get(key)) {
                Some(next) => cur = next,
                None => return Ok(None),
            },
            Step::Index(idx) => match cur.as_array().and_then(|arr| arr.get(*idx)) {
                Some(next) => cur = next,
                None => return Ok(None),
            },
        }
    }
    Ok(Some(cur.clone()))
}

fn empty_for(step: &Step) -> Value {
    match step {
        Step::Key(_) => Value::Object(serde_json::Map::new()),
        Step::Index(_) => Value::Array(Vec::new()),
    }
}

/// Write `val` into `root` at `path`, creating intermediate objects and
/// arrays based on the kind of the next step and padding arrays with
/// nulls. Fails when a non-terminal step meets a value of the wrong
/// container kind.
pub fn set(root: &mut Value, path: &str, val: Value) -> Result<()> {
    let steps = parse_path(path)?;
    set_steps(root, &steps, val)
}

fn set_steps(cur: &mut Value, steps: &[Step], val: Value) -> Result<()> {
    let (step, rest) = steps.split_first().expect("steps are never empty");
    match step {
        Step::Key(key) => {
            let obj = cur
                .as_object_mut()
                .ok_or_else(|| anyhow!("expected object at {key:?}"))?;
            if rest.is_empty() {
                obj.insert(key.clone(), val);
                return Ok(());
            }
            let entry = obj.entry(key.clone()).or_insert(Value::Null);
            if entry.is_null() {
                *entry = empty_for(&rest[0]);
            }
            set_steps(entry, rest, val)
        }
        Step::Index(idx) => {
            let arr = cur
                .as_array_mut()
                .ok_or_else(|| anyhow!("expected array at index [{idx}]"))?;
            if arr.len() <= *idx {
                arr.resize(*idx + 1, Value::Null);
            }
            if rest.is_empty() {
                arr[*idx] = val;
                return Ok(());
            }
            if arr[*idx].is_null() {
                arr[*idx] = empty_for(&rest[0]);
            }
            set_steps(&mut arr[*idx], rest, val)
        }
    }
}

/// Resolve an expression against `src`: literal -> literal, path -> looked
/// up value, falling back to the default when the path is missing.
/// `None` means "nothing to contribute" (no path and no default, or the
/// path is missing and there is no default).
pub fn resolve_expr(src: &Value, expr: &str) -> Result<Option<Value>> {
    let parsed = parse_expr(expr)?;
    let path = match &parsed.path {
        Some(path) => path,
        None => return Ok(parsed.default),
    };
    match get(src, path)? {
        Some(val) => Ok(Some(val)),
        None => Ok(parsed.default),
    }
}

/// Apply mapping rules `dst_path -> src_expr` from `src` onto `dst`.
/// Unresolvable rules are skipped; rules iterate in key order so the
/// outcome is deterministic.
pub fn apply(dst: &mut Value, src: &Value, rules: &BTreeMap<String, String>) -> Result<()> {
    for (dst_path, src_expr) in rules {
        let resolved = resolve_expr(src, src_expr)
            .with_context(|| format!("mapper expression for {dst_path:?}"))?;
        if let Some(val) = resolved {
            set(dst, dst_path, val).with_context(|| format!("set dst {dst_path:?}"))?;
        }
    }
    Ok(())
}
