use serde_yaml::Value;

use super::Run;
use crate::error::ConfigurationError;

/// Values a run name template can refer to besides the run itself.
#[derive(Debug, Clone)]
pub struct NameContext {
    pub exp_name: String,
    pub exp_id: u64,
    pub time: i64,
}

impl NameContext {
    pub fn placeholder() -> Self {
        NameContext {
            exp_name: "exp".to_owned(),
            exp_id: 0,
            time: 0,
        }
    }
}

/// Expands the run's name template into the artifact stem.
///
/// Fields look like `{exp.name}`, `{exp.exp_id}`, `{time}`,
/// `{run[env][DNS_TRANSPORT]}` or `{run.args[avg_queries_per_sec]:d}`.
/// Unless the template already uses the experiment id or the time, both are
/// appended so that stems stay unique.
pub fn run_stem(run: &Run, ctx: &NameContext) -> Result<String, ConfigurationError> {
    let template = run.name_template();
    let run_value = serde_yaml::to_value(run)
        .map_err(|e| ConfigurationError::invalid(e.to_string()))?;

    let mut out = String::new();
    let mut unique = false;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => field.push(c),
                        None => return Err(bad(template, "unterminated field")),
                    }
                }
                let (path, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                unique |= path == "time" || path == "exp.exp_id";
                let value = lookup(path, &run_value, ctx).map_err(|e| bad(template, &e))?;
                out.push_str(&format_value(&value, spec).map_err(|e| bad(template, &e))?);
            }
            '}' => return Err(bad(template, "single '}'")),
            c => out.push(c),
        }
    }

    if !unique {
        out = format!("{}-{}-{}", out, ctx.exp_id, ctx.time);
    }
    Ok(out)
}

fn bad(template: &str, why: &str) -> ConfigurationError {
    ConfigurationError::invalid(format!("run name '{}': {}", template, why))
}

fn split_path(path: &str) -> Result<Vec<&str>, String> {
    let mut parts = vec![];
    let mut rest = path;
    let root_end = rest.find(&['.', '['][..]).unwrap_or(rest.len());
    parts.push(&rest[..root_end]);
    rest = &rest[root_end..];
    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix('.') {
            let end = r.find(&['.', '['][..]).unwrap_or(r.len());
            parts.push(&r[..end]);
            rest = &r[end..];
        } else if let Some(r) = rest.strip_prefix('[') {
            let end = r.find(']').ok_or_else(|| format!("unclosed '[' in {}", path))?;
            parts.push(&r[..end]);
            rest = &r[end + 1..];
        } else {
            return Err(format!("cannot parse field {}", path));
        }
    }
    Ok(parts)
}

fn lookup(path: &str, run: &Value, ctx: &NameContext) -> Result<Value, String> {
    let parts = split_path(path)?;
    match parts.as_slice() {
        ["time"] => Ok(Value::from(ctx.time)),
        ["exp", "name"] => Ok(Value::from(ctx.exp_name.as_str())),
        ["exp", "exp_id"] => Ok(Value::from(ctx.exp_id)),
        ["run", keys @ ..] => {
            let mut current = run;
            for key in keys {
                match current.get(*key) {
                    Some(v) => current = v,
                    // absent optional fields read as None
                    None if current.is_mapping() => return Ok(Value::Null),
                    None => return Err(format!("{} does not name a value", path)),
                }
            }
            Ok(current.clone())
        }
        _ => Err(format!("unknown field {}", path)),
    }
}

fn format_value(value: &Value, spec: &str) -> Result<String, String> {
    match spec {
        "" | "s" => Ok(match value {
            Value::Null => "None".to_owned(),
            Value::Bool(true) => "True".to_owned(),
            Value::Bool(false) => "False".to_owned(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            other => serde_yaml::to_string(other)
                .map_err(|e| e.to_string())?
                .trim()
                .to_owned(),
        }),
        "d" => match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(i.to_string())
                } else if let Some(f) = n.as_f64().filter(|f| f.fract() == 0.0) {
                    Ok(format!("{}", f as i64))
                } else {
                    Err(format!("{} is not an integer", n))
                }
            }
            other => Err(format!("{:?} is not an integer", other)),
        },
        other => Err(format!("unsupported format spec '{}'", other)),
    }
}
