//! Boolean condition trees evaluated against a mapper source map.
//!
//! A condition is either a leaf `{left, op, right}` or exactly one of the
//! logical groups `and:` / `or:` / `not:`. Leaves resolve their operands
//! with the same expression syntax the mapper uses.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::resolve_expr;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    #[serde(default)]
    pub left: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub right: Option<String>,

    #[serde(default)]
    pub and: Vec<Condition>,
    #[serde(default)]
    pub or: Vec<Condition>,
    #[serde(default)]
    pub not: Option<Box<Condition>>,
}

pub fn eval(cond: &Condition, src: &Value) -> Result<bool> {
    let has_leaf = cond.op.is_some() || cond.left.is_some() || cond.right.is_some();
    let groups =
        usize::from(!cond.and.is_empty()) + usize::from(!cond.or.is_empty()) + usize::from(cond.not.is_some());

    if has_leaf && groups > 0 {
        bail!("invalid condition: cannot combine op with logical groups");
    }
    if groups > 1 {
        bail!("invalid condition: multiple logical groups set");
    }

    if !cond.and.is_empty() {
        for (i, child) in cond.and.iter().enumerate() {
            if !eval(child, src).with_context(|| format!("and[{i}]"))? {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    if !cond.or.is_empty() {
        for (i, child) in cond.or.iter().enumerate() {
            if eval(child, src).with_context(|| format!("or[{i}]"))? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    if let Some(inner) = &cond.not {
        return Ok(!eval(inner, src).context("not")?);
    }

    eval_leaf(cond, src)
}

fn eval_leaf(cond: &Condition, src: &Value) -> Result<bool> {
    let op = match cond.op.as_deref() {
        Some(op) => op.to_ascii_lowercase(),
        None => bail!("invalid condition: missing op"),
    };
    match op.as_str() {
        "eq" => {
            let (left, right) = match (&cond.left, &cond.right) {
                (Some(l), Some(r)) if !l.is_empty() && !r.is_empty() => (l, r),
                _ => bail!("invalid eq condition: left/right required"),
            };
            let left = resolve_expr(src, left)?;
            let right = resolve_expr(src, right)?;
            match (left, right) {
                (Some(l), Some(r)) => Ok(l == r),
                // a missing operand is never equal to anything
                _ => Ok(false),
            }
        }
        "empty" => {
            let expr = match &cond.left {
                Some(l) if !l.is_empty() => l,
                _ => bail!("invalid empty condition: left required"),
            };
            match resolve_expr(src, expr)? {
                Some(val) => Ok(is_empty(&val)),
                None => Ok(true),
            }
        }
        other => bail!("invalid condition: unsupported op {other:?}"),
    }
}

fn is_empty(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
