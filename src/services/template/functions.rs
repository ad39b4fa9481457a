//! Template function library
//!
//! The builtins mirror Go's `text/template`, the helpers are a subset of the
//! common sprig library, and the extras (`duration`, `percent`, `sum`,
//! `resources`, `resourceRequests` and the utilization query builders) are
//! specific to trial evaluation. Nothing here can read the process
//! environment.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use super::utilization;
use super::value::{format_float, Value};
use crate::domain::models::Quantity;
use crate::services::jsonpath::JsonPath;

/// A template function; the final pipeline value arrives as the last argument
pub type Function = fn(&[Value]) -> Result<Value, String>;

/// Name to function lookup used at parse and execution time
#[derive(Clone)]
pub struct FuncMap {
    funcs: HashMap<&'static str, Function>,
}

impl std::fmt::Debug for FuncMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("FuncMap").field("funcs", &names).finish()
    }
}

impl FuncMap {
    /// Builtins, helpers and trial extras
    pub fn standard() -> Self {
        let mut funcs: HashMap<&'static str, Function> = HashMap::new();

        // text/template builtins
        funcs.insert("and", and);
        funcs.insert("or", or);
        funcs.insert("not", not);
        funcs.insert("len", len);
        funcs.insert("index", index);
        funcs.insert("print", print);
        funcs.insert("printf", printf);
        funcs.insert("println", println);
        funcs.insert("eq", eq);
        funcs.insert("ne", ne);
        funcs.insert("lt", lt);
        funcs.insert("le", le);
        funcs.insert("gt", gt);
        funcs.insert("ge", ge);

        // strings
        funcs.insert("upper", upper);
        funcs.insert("lower", lower);
        funcs.insert("title", title);
        funcs.insert("trim", trim);
        funcs.insert("trimAll", trim_all);
        funcs.insert("trimPrefix", trim_prefix);
        funcs.insert("trimSuffix", trim_suffix);
        funcs.insert("replace", replace);
        funcs.insert("contains", contains);
        funcs.insert("hasPrefix", has_prefix);
        funcs.insert("hasSuffix", has_suffix);
        funcs.insert("quote", quote);
        funcs.insert("squote", squote);
        funcs.insert("repeat", repeat);
        funcs.insert("substr", substr);
        funcs.insert("trunc", trunc);
        funcs.insert("splitList", split_list);
        funcs.insert("join", join);

        // defaults and conversion
        funcs.insert("default", default);
        funcs.insert("empty", empty);
        funcs.insert("coalesce", coalesce);
        funcs.insert("ternary", ternary);
        funcs.insert("toString", to_string);
        funcs.insert("toJson", to_json);
        funcs.insert("toYaml", to_yaml);
        funcs.insert("int", int);
        funcs.insert("int64", int);
        funcs.insert("float64", float64);
        funcs.insert("atoi", atoi);

        // math
        funcs.insert("add", add);
        funcs.insert("add1", add1);
        funcs.insert("sub", sub);
        funcs.insert("mul", mul);
        funcs.insert("div", div);
        funcs.insert("mod", modulo);
        funcs.insert("max", max);
        funcs.insert("min", min);
        funcs.insert("floor", floor);
        funcs.insert("ceil", ceil);
        funcs.insert("round", round);

        // lists and dictionaries
        funcs.insert("list", list);
        funcs.insert("first", first);
        funcs.insert("last", last);
        funcs.insert("rest", rest);
        funcs.insert("has", has);
        funcs.insert("dict", dict);
        funcs.insert("keys", keys);
        funcs.insert("hasKey", has_key);
        funcs.insert("get", get);

        // trial extras
        funcs.insert("duration", duration);
        funcs.insert("percent", percent);
        funcs.insert("sum", sum);
        funcs.insert("resources", resources);
        funcs.insert("resourceRequests", resource_requests);
        funcs.insert("cpuUtilization", utilization::cpu_utilization);
        funcs.insert("memoryUtilization", utilization::memory_utilization);
        funcs.insert("cpuRequests", utilization::cpu_requests);
        funcs.insert("memoryRequests", utilization::memory_requests);

        Self { funcs }
    }

    pub fn get(&self, name: &str) -> Option<Function> {
        self.funcs.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }
}

fn arity(args: &[Value], want: usize) -> Result<(), String> {
    if args.len() == want {
        Ok(())
    } else {
        Err(format!("wrong number of args: want {want} got {}", args.len()))
    }
}

fn at_least(args: &[Value], want: usize) -> Result<(), String> {
    if args.len() >= want {
        Ok(())
    } else {
        Err(format!("wrong number of args: want at least {want} got {}", args.len()))
    }
}

fn string_arg(value: &Value) -> String {
    match value {
        Value::Nil => String::new(),
        other => other.to_string(),
    }
}

/// Strict integer conversion for typed parameters
fn int_arg(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Float(_) => value.as_i64().ok_or_else(|| "expected integer".to_string()),
        other => Err(format!("expected integer; found {}", other.type_name())),
    }
}

/// Lenient integer conversion used by the helper math functions
fn to_int(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

fn to_float(value: &Value) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

fn time_arg(value: &Value) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        Value::Time(t) => Ok(Some(*t)),
        Value::Nil => Ok(None),
        Value::Str(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| format!("invalid time {s:?}: {e}")),
        other => Err(format!("expected time; found {}", other.type_name())),
    }
}

// ---- builtins ----

fn and(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(args
        .iter()
        .find(|v| !v.is_truthy())
        .unwrap_or(&args[args.len() - 1])
        .clone())
}

fn or(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(args
        .iter()
        .find(|v| v.is_truthy())
        .unwrap_or(&args[args.len() - 1])
        .clone())
}

fn not(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn len(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    let n = match &args[0] {
        Value::Str(s) => s.len(),
        Value::List(items) => items.len(),
        Value::Map(map) => map.len(),
        other => return Err(format!("len of type {}", other.type_name())),
    };
    Ok(Value::Int(i64::try_from(n).unwrap_or(i64::MAX)))
}

fn index(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    let mut current = args[0].clone();
    for key in &args[1..] {
        current = match current {
            Value::List(items) => {
                let i = int_arg(key)?;
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| format!("index out of range: {i}"))?
            }
            Value::Map(map) => map.get(&string_arg(key)).cloned().unwrap_or(Value::Nil),
            Value::Nil => return Err("index of untyped nil".to_string()),
            other => return Err(format!("can't index item of type {}", other.type_name())),
        };
    }
    Ok(current)
}

fn print(args: &[Value]) -> Result<Value, String> {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        let is_str = matches!(arg, Value::Str(_));
        if i > 0 && !is_str && !matches!(args[i - 1], Value::Str(_)) {
            out.push(' ');
        }
        out.push_str(&arg.to_string());
    }
    Ok(Value::Str(out))
}

fn println(args: &[Value]) -> Result<Value, String> {
    let mut out = args.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ");
    out.push('\n');
    Ok(Value::Str(out))
}

fn printf(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(Value::Str(sprintf(&string_arg(&args[0]), &args[1..])))
}

/// Minimal `fmt.Sprintf`: `%v %s %d %f %g %t %q %x` with optional precision, and `%%`
pub fn sprintf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut args = args.iter();
    let mut chars = format.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut precision: Option<usize> = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut digits = String::new();
            while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                digits.push(*d);
                chars.next();
            }
            precision = Some(digits.parse().unwrap_or(0));
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let Some(arg) = args.next() else {
            let _ = write!(out, "%!{verb}(MISSING)");
            continue;
        };
        match verb {
            'v' | 's' => out.push_str(&arg.to_string()),
            'd' => {
                let _ = write!(out, "{}", to_int(arg));
            }
            'f' | 'F' => {
                let _ = write!(out, "{:.*}", precision.unwrap_or(6), to_float(arg));
            }
            'g' => out.push_str(&format_float(to_float(arg))),
            't' => {
                let _ = write!(out, "{}", arg.is_truthy());
            }
            'q' => {
                let _ = write!(out, "{:?}", arg.to_string());
            }
            'x' => match arg {
                Value::Str(s) => s.bytes().for_each(|b| {
                    let _ = write!(out, "{b:02x}");
                }),
                other => {
                    let _ = write!(out, "{:x}", to_int(other));
                }
            },
            other => {
                let _ = write!(out, "%!{other}({arg})");
            }
        }
    }
    out
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => to_float(a)
            .partial_cmp(&to_float(b))
            .ok_or_else(|| "incomparable values".to_string()),
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) => Ok(x.cmp(y)),
        _ => Err(format!(
            "incompatible types for comparison: {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            compare(a, b).is_ok_and(std::cmp::Ordering::is_eq)
        }
        _ => a == b,
    }
}

fn eq(args: &[Value]) -> Result<Value, String> {
    at_least(args, 2)?;
    Ok(Value::Bool(args[1..].iter().any(|v| equal(&args[0], v))))
}

fn ne(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(!equal(&args[0], &args[1])))
}

fn lt(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_lt()))
}

fn le(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_le()))
}

fn gt(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_gt()))
}

fn ge(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(compare(&args[0], &args[1])?.is_ge()))
}

// ---- strings ----

fn upper(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Str(string_arg(&args[0]).to_uppercase()))
}

fn lower(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Str(string_arg(&args[0]).to_lowercase()))
}

fn title(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    let mut out = String::new();
    let mut boundary = true;
    for c in string_arg(&args[0]).chars() {
        if boundary {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        boundary = c.is_whitespace();
    }
    Ok(Value::Str(out))
}

fn trim(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Str(string_arg(&args[0]).trim().to_string()))
}

fn trim_all(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let cutset: Vec<char> = string_arg(&args[0]).chars().collect();
    Ok(Value::Str(
        string_arg(&args[1]).trim_matches(cutset.as_slice()).to_string(),
    ))
}

fn trim_prefix(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let s = string_arg(&args[1]);
    let prefix = string_arg(&args[0]);
    Ok(Value::Str(s.strip_prefix(prefix.as_str()).unwrap_or(&s).to_string()))
}

fn trim_suffix(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let s = string_arg(&args[1]);
    let suffix = string_arg(&args[0]);
    Ok(Value::Str(s.strip_suffix(suffix.as_str()).unwrap_or(&s).to_string()))
}

fn replace(args: &[Value]) -> Result<Value, String> {
    arity(args, 3)?;
    Ok(Value::Str(
        string_arg(&args[2]).replace(&string_arg(&args[0]), &string_arg(&args[1])),
    ))
}

fn contains(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(string_arg(&args[1]).contains(&string_arg(&args[0]))))
}

fn has_prefix(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(string_arg(&args[1]).starts_with(&string_arg(&args[0]))))
}

fn has_suffix(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(string_arg(&args[1]).ends_with(&string_arg(&args[0]))))
}

fn quote(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Str(
        args.iter()
            .filter(|v| !matches!(v, Value::Nil))
            .map(|v| format!("{:?}", v.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

fn squote(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Str(
        args.iter()
            .filter(|v| !matches!(v, Value::Nil))
            .map(|v| format!("'{v}'"))
            .collect::<Vec<_>>()
            .join(" "),
    ))
}

fn repeat(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let count = usize::try_from(to_int(&args[0])).unwrap_or(0);
    Ok(Value::Str(string_arg(&args[1]).repeat(count)))
}

fn substr(args: &[Value]) -> Result<Value, String> {
    arity(args, 3)?;
    let chars: Vec<char> = string_arg(&args[2]).chars().collect();
    let start = usize::try_from(to_int(&args[0])).unwrap_or(0);
    let end = usize::try_from(to_int(&args[1])).map_or(chars.len(), |e| e.min(chars.len()));
    if start >= end {
        return Ok(Value::Str(chars[start.min(chars.len())..].iter().collect()));
    }
    Ok(Value::Str(chars[start..end].iter().collect()))
}

fn trunc(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let s = string_arg(&args[1]);
    let chars: Vec<char> = s.chars().collect();
    let n = to_int(&args[0]);
    let width = usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX);
    if width >= chars.len() {
        return Ok(Value::Str(s));
    }
    if n < 0 {
        Ok(Value::Str(chars[chars.len() - width..].iter().collect()))
    } else {
        Ok(Value::Str(chars[..width].iter().collect()))
    }
}

fn split_list(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let sep = string_arg(&args[0]);
    Ok(Value::List(
        string_arg(&args[1])
            .split(sep.as_str())
            .map(Value::from)
            .collect(),
    ))
}

fn join(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let items = match &args[1] {
        Value::List(items) => items.iter().map(ToString::to_string).collect::<Vec<_>>(),
        Value::Nil => Vec::new(),
        other => vec![other.to_string()],
    };
    Ok(Value::Str(items.join(&string_arg(&args[0]))))
}

// ---- defaults and conversion ----

fn default(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    match args.get(1) {
        Some(given) if given.is_truthy() => Ok(given.clone()),
        _ => Ok(args[0].clone()),
    }
}

fn empty(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

fn coalesce(args: &[Value]) -> Result<Value, String> {
    Ok(args.iter().find(|v| v.is_truthy()).cloned().unwrap_or(Value::Nil))
}

fn ternary(args: &[Value]) -> Result<Value, String> {
    arity(args, 3)?;
    Ok(if args[2].is_truthy() {
        args[0].clone()
    } else {
        args[1].clone()
    })
}

fn to_string(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Str(args[0].to_string()))
}

fn to_json(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    serde_json::to_string(&args[0].to_json())
        .map(Value::Str)
        .map_err(|e| e.to_string())
}

fn to_yaml(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    serde_yaml::to_string(&args[0].to_json())
        .map(|s| Value::Str(s.trim_end().to_string()))
        .map_err(|e| e.to_string())
}

fn int(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Int(to_int(&args[0])))
}

fn float64(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Float(to_float(&args[0])))
}

fn atoi(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Int(string_arg(&args[0]).trim().parse().unwrap_or(0)))
}

// ---- math ----

fn add(args: &[Value]) -> Result<Value, String> {
    Ok(Value::Int(args.iter().map(to_int).fold(0i64, i64::wrapping_add)))
}

fn add1(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Int(to_int(&args[0]).wrapping_add(1)))
}

fn sub(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Int(to_int(&args[0]).wrapping_sub(to_int(&args[1]))))
}

fn mul(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(Value::Int(args.iter().map(to_int).fold(1i64, i64::wrapping_mul)))
}

fn div(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let d = to_int(&args[1]);
    if d == 0 {
        return Err("integer divide by zero".to_string());
    }
    Ok(Value::Int(to_int(&args[0]).wrapping_div(d)))
}

fn modulo(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let d = to_int(&args[1]);
    if d == 0 {
        return Err("integer divide by zero".to_string());
    }
    Ok(Value::Int(to_int(&args[0]).wrapping_rem(d)))
}

fn max(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(Value::Int(args.iter().map(to_int).max().unwrap_or(0)))
}

fn min(args: &[Value]) -> Result<Value, String> {
    at_least(args, 1)?;
    Ok(Value::Int(args.iter().map(to_int).min().unwrap_or(0)))
}

fn floor(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Float(to_float(&args[0]).floor()))
}

fn ceil(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(Value::Float(to_float(&args[0]).ceil()))
}

fn round(args: &[Value]) -> Result<Value, String> {
    at_least(args, 2)?;
    let value = to_float(&args[0]);
    let precision = i32::try_from(to_int(&args[1])).unwrap_or(0);
    let round_on = args.get(2).map_or(0.5, to_float);
    let pow = 10f64.powi(precision);
    let digit = pow * value;
    let (int_part, frac) = (digit.trunc(), digit.fract());
    let rounded = if frac.abs() >= round_on {
        int_part + frac.signum()
    } else {
        int_part
    };
    Ok(Value::Float(rounded / pow))
}

// ---- lists and dictionaries ----

fn list(args: &[Value]) -> Result<Value, String> {
    Ok(Value::List(args.to_vec()))
}

fn list_arg(value: &Value) -> Result<&[Value], String> {
    match value {
        Value::List(items) => Ok(items),
        Value::Nil => Ok(&[]),
        other => Err(format!("cannot find first on type {}", other.type_name())),
    }
}

fn first(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(list_arg(&args[0])?.first().cloned().unwrap_or(Value::Nil))
}

fn last(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    Ok(list_arg(&args[0])?.last().cloned().unwrap_or(Value::Nil))
}

fn rest(args: &[Value]) -> Result<Value, String> {
    arity(args, 1)?;
    let items = list_arg(&args[0])?;
    Ok(Value::List(items.iter().skip(1).cloned().collect()))
}

fn has(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Bool(
        list_arg(&args[1])?.iter().any(|v| equal(v, &args[0])),
    ))
}

fn dict(args: &[Value]) -> Result<Value, String> {
    let mut map = BTreeMap::new();
    for pair in args.chunks(2) {
        let value = pair.get(1).cloned().unwrap_or_else(|| Value::from(""));
        map.insert(string_arg(&pair[0]), value);
    }
    Ok(Value::Map(map))
}

fn keys(args: &[Value]) -> Result<Value, String> {
    let mut out = Vec::new();
    for arg in args {
        if let Value::Map(map) = arg {
            out.extend(map.keys().cloned().map(Value::Str));
        }
    }
    Ok(Value::List(out))
}

fn has_key(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    match &args[0] {
        Value::Map(map) => Ok(Value::Bool(map.contains_key(&string_arg(&args[1])))),
        _ => Ok(Value::Bool(false)),
    }
}

fn get(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    match &args[0] {
        Value::Map(map) => Ok(map
            .get(&string_arg(&args[1]))
            .cloned()
            .unwrap_or_else(|| Value::from(""))),
        _ => Ok(Value::from("")),
    }
}

// ---- trial extras ----

/// Seconds between two times, zero unless `start` is strictly before `completion`
#[allow(clippy::cast_precision_loss)]
fn duration(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let seconds = match (time_arg(&args[0])?, time_arg(&args[1])?) {
        (Some(start), Some(completion)) if start < completion => {
            (completion - start).num_microseconds().map_or_else(
                || (completion - start).num_seconds() as f64,
                |us| us as f64 / 1_000_000.0,
            )
        }
        _ => 0.0,
    };
    Ok(Value::Float(seconds))
}

/// Integer percentage of a value, formatted as a base-10 string
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn percent(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let value = int_arg(&args[0])?;
    let percent = int_arg(&args[1])?;
    let result = (value as f64 * (percent as f64 / 100.0)) as i64;
    Ok(Value::Str(result.to_string()))
}

fn quantity_of(value: &serde_json::Value) -> Option<Quantity> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Sums a JSONPath result set: integers as-is, quantity strings by milli-value
pub fn sum_json(data: &serde_json::Value, path: &str) -> i64 {
    let Ok(jp) = JsonPath::parse(path) else {
        return 0;
    };
    let Ok(results) = jp.find_results(data) else {
        return 0;
    };
    if results.len() != 1 {
        return 0;
    }
    results[0]
        .iter()
        .map(|v| match v {
            serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
            serde_json::Value::String(s) => s.parse::<Quantity>().map_or(0, |q| q.milli_value()),
            _ => 0,
        })
        .fold(0i64, i64::wrapping_add)
}

fn sum(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    Ok(Value::Int(sum_json(&args[0].to_json(), &string_arg(&args[1]))))
}

const RESOURCE_KEYS: [&str; 2] = ["cpu", "memory"];

fn container_requests(pods: &Value) -> Vec<serde_json::Value> {
    let pods = pods.to_json();
    let Some(items) = pods.get("items").and_then(serde_json::Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|pod| pod.pointer("/spec/containers").and_then(serde_json::Value::as_array))
        .flatten()
        .map(|c| {
            c.pointer("/resources/requests")
                .cloned()
                .unwrap_or(serde_json::Value::Null)
        })
        .collect()
}

/// Weighted sum of container requests; any bad weight or missing request yields 0
#[allow(clippy::cast_precision_loss)]
fn resources(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let mut weights = Vec::new();
    for entry in string_arg(&args[1]).split(',') {
        let Some((key, weight)) = entry.trim().split_once('=') else {
            return Ok(Value::Float(0.0));
        };
        let key = key.trim();
        let Ok(weight) = weight.trim().parse::<i64>() else {
            return Ok(Value::Float(0.0));
        };
        if !RESOURCE_KEYS.contains(&key) {
            return Ok(Value::Float(0.0));
        }
        weights.push((key.to_string(), weight as f64));
    }

    let mut total = 0.0;
    for requests in container_requests(&args[0]) {
        for (key, weight) in &weights {
            let Some(quantity) = requests.get(key).and_then(quantity_of) else {
                return Ok(Value::Float(0.0));
            };
            total += weight * quantity.milli_value() as f64;
        }
    }
    Ok(Value::Float(total))
}

/// Weighted sum of container requests with float weights; missing requests contribute 0
#[allow(clippy::cast_precision_loss)]
fn resource_requests(args: &[Value]) -> Result<Value, String> {
    arity(args, 2)?;
    let mut weights = Vec::new();
    for entry in string_arg(&args[1]).split(',') {
        let (key, weight) = entry.trim().split_once('=').unwrap_or((entry.trim(), ""));
        let weight = weight
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("unable to parse weight for {key}"))?;
        weights.push((key.trim().to_string(), weight));
    }

    let mut total = 0.0;
    for requests in container_requests(&args[0]) {
        for (key, weight) in &weights {
            if let Some(quantity) = requests.get(key).and_then(quantity_of) {
                total += weight * quantity.milli_value() as f64;
            }
        }
    }
    Ok(Value::Float(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use serde_json::json;

    fn pods() -> Value {
        Value::from_json(&json!({
            "kind": "PodList",
            "items": [
                {"spec": {"containers": [
                    {"resources": {"requests": {"cpu": "100m", "memory": "1Ki"}}},
                    {"resources": {"requests": {"cpu": "1", "memory": "1"}}}
                ]}},
                {"spec": {"containers": [
                    {"resources": {"requests": {"cpu": "250m"}}}
                ]}}
            ]
        }))
    }

    #[test]
    fn test_percent_truncates() {
        assert_eq!(percent(&[Value::Int(500), Value::Int(80)]).unwrap(), Value::from("400"));
        assert_eq!(percent(&[Value::Int(333), Value::Int(50)]).unwrap(), Value::from("166"));
        assert!(percent(&[Value::from("x"), Value::Int(50)]).is_err());
    }

    #[test]
    fn test_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = start + chrono::Duration::seconds(30);
        assert_eq!(duration(&[Value::Time(start), Value::Time(end)]).unwrap(), Value::Float(30.0));
        assert_eq!(duration(&[Value::Time(end), Value::Time(start)]).unwrap(), Value::Float(0.0));
        assert_eq!(duration(&[Value::Nil, Value::Time(end)]).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_sum_integers_and_quantities() {
        let data = json!({"items": [{"n": 2, "q": "100m"}, {"n": 3, "q": "1"}]});
        assert_eq!(sum_json(&data, "{.items[*].n}"), 5);
        assert_eq!(sum_json(&data, "{.items[*].q}"), 1100);
        assert_eq!(sum_json(&data, "{.items[*"), 0);
        assert_eq!(sum_json(&data, "{.items[*].n}{.items[*].n}"), 0);
        assert_eq!(sum_json(&data, "{.missing}"), 0);
    }

    #[test]
    fn test_resources_is_all_or_nothing() {
        // memory is missing on the second pod's container
        assert_eq!(resources(&[pods(), Value::from("cpu=1,memory=1")]).unwrap(), Value::Float(0.0));
        assert_eq!(resources(&[pods(), Value::from("cpu=2")]).unwrap(), Value::Float(2700.0));
        assert_eq!(resources(&[pods(), Value::from("cpu=x")]).unwrap(), Value::Float(0.0));
        assert_eq!(resources(&[pods(), Value::from("gpu=1")]).unwrap(), Value::Float(0.0));
    }

    #[test]
    fn test_resource_requests_skips_missing() {
        let total = resource_requests(&[pods(), Value::from("cpu=0.5,memory=1")]).unwrap();
        assert_eq!(total, Value::Float(675.0 + 1_024_000.0 + 1000.0));
        assert_eq!(
            resource_requests(&[pods(), Value::from("cpu=abc")]).unwrap_err(),
            "unable to parse weight for cpu"
        );
    }

    #[test]
    fn test_sprintf() {
        assert_eq!(sprintf("%d%% of %s", &[Value::Int(80), Value::from("cpu")]), "80% of cpu");
        assert_eq!(sprintf("%.2f", &[Value::Float(1.234)]), "1.23");
        assert_eq!(sprintf("%q", &[Value::from("a")]), "\"a\"");
        assert_eq!(sprintf("%d", &[]), "%!d(MISSING)");
    }

    #[test]
    fn test_environment_functions_are_absent() {
        let funcs = FuncMap::standard();
        assert!(!funcs.contains("env"));
        assert!(!funcs.contains("expandenv"));
        assert!(funcs.contains("duration"));
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(trunc(&[Value::Int(3), Value::from("abcdef")]).unwrap(), Value::from("abc"));
        assert_eq!(trunc(&[Value::Int(-2), Value::from("abcdef")]).unwrap(), Value::from("ef"));
        assert_eq!(title(&[Value::from("hello world")]).unwrap(), Value::from("Hello World"));
        assert_eq!(default(&[Value::from("d"), Value::from("")]).unwrap(), Value::from("d"));
        assert_eq!(round(&[Value::Float(1.2345), Value::Int(2)]).unwrap(), Value::Float(1.23));
    }

    proptest! {
        #[test]
        fn prop_sum_is_order_independent(mut values in prop::collection::vec(-1_000_000i64..1_000_000, 0..20)) {
            let forward = json!({"items": values.iter().map(|v| json!({"n": v})).collect::<Vec<_>>()});
            values.reverse();
            let reversed = json!({"items": values.iter().map(|v| json!({"n": v})).collect::<Vec<_>>()});
            prop_assert_eq!(sum_json(&forward, "{.items[*].n}"), sum_json(&reversed, "{.items[*].n}"));
            prop_assert_eq!(sum_json(&forward, "{.items[*].n}"), values.iter().sum::<i64>());
        }

        #[test]
        fn prop_duration_never_negative(a in 0i64..4_000_000_000, b in 0i64..4_000_000_000) {
            let start = Utc.timestamp_opt(a, 0).unwrap();
            let end = Utc.timestamp_opt(b, 0).unwrap();
            let expected = if a < b { (b - a) as f64 } else { 0.0 };
            prop_assert_eq!(duration(&[Value::Time(start), Value::Time(end)]).unwrap(), Value::Float(expected));
        }
    }
}
