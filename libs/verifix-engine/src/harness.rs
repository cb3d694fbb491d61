/// Test Harness - Generated Wrapper Programs and Verdict Parsing
///
/// **Core Responsibility:**
/// Turn test cases into a program that exercises the candidate code exactly
/// as a real caller would, and turn that program's output back into
/// `TestCaseResult`s.
///
/// **Verdict Line Format (one per case, on stdout):**
/// `{"index": N, "passed": bool, "actual": <json>, "error": "..."|null}`
///
/// **Canonical Equality (shared by every harness and the stdio judge):**
/// - Values are compared as JSON
/// - Object key order is ignored
/// - Integral floats equal integers (`3.0 == 3`)
/// - Booleans never equal numbers
/// - Other floats compare exactly

use crate::language::HarnessStyle;
use crate::sandbox::truncate_chars;
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use verifix_common::types::{ExecutionResult, TestCase, TestCaseResult};

pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Error text attached to a case is bounded to this many characters.
const MAX_ERROR_CHARS: usize = 500;

/// Largest integer exactly representable as f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Normalize a JSON value for comparison.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER => Value::from(f as i64),
            _ => value.clone(),
        },
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        _ => value.clone(),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    canonicalize(a) == canonicalize(b)
}

/// The entry point to call, falling back to `main` for anything that is not a plain identifier.
pub fn resolve_entry_point(entry_point: Option<&str>) -> &str {
    match entry_point {
        Some(name) if is_identifier(name) => name,
        _ => DEFAULT_ENTRY_POINT,
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Case table embedded into a harness, base64-encoded so no quoting is needed.
fn encoded_cases(cases: &[TestCase]) -> String {
    let table: Vec<Value> = cases
        .iter()
        .map(|case| {
            json!({
                "input": Value::Object(case.input.clone()),
                "expected": case.expected_output,
                "smoke": case.is_smoke(),
            })
        })
        .collect();
    general_purpose::STANDARD.encode(Value::Array(table).to_string())
}

/// Generate harness source for `style`, or `None` for stdio-judged languages.
pub fn generate_harness(style: HarnessStyle, code: &str, cases: &[TestCase], entry_point: Option<&str>) -> Option<String> {
    let entry = resolve_entry_point(entry_point);
    match style {
        HarnessStyle::EmbeddedPython => Some(python_harness(code, cases, entry)),
        HarnessStyle::EmbeddedJavascript => Some(javascript_harness(code, cases, entry)),
        HarnessStyle::Stdio => None,
    }
}

/// The candidate is exec'd in its own namespace under a non-`__main__` name,
/// so `if __name__ == "__main__":` blocks do not fire.
fn python_harness(code: &str, cases: &[TestCase], entry: &str) -> String {
    let source = general_purpose::STANDARD.encode(code);
    let cases = encoded_cases(cases);
    format!(
        r#"import base64 as __verifix_b64
import inspect as __verifix_inspect
import json as __verifix_json
import sys as __verifix_sys

__verifix_source = __verifix_b64.b64decode("{source}").decode("utf-8")
__verifix_cases = __verifix_json.loads(__verifix_b64.b64decode("{cases}").decode("utf-8"))
__verifix_entry = "{entry}"


def __verifix_canon(value):
    if value is None or isinstance(value, (bool, str)):
        return value
    if isinstance(value, float):
        return int(value) if value.is_integer() else value
    if isinstance(value, int):
        return value
    if isinstance(value, dict):
        return {{str(k): __verifix_canon(v) for k, v in value.items()}}
    if isinstance(value, (list, tuple)):
        return [__verifix_canon(v) for v in value]
    if isinstance(value, (set, frozenset)):
        return sorted((__verifix_canon(v) for v in value), key=lambda v: __verifix_json.dumps(v, sort_keys=True))
    return __verifix_canon(__verifix_json.loads(__verifix_json.dumps(value, default=str)))


def __verifix_key(value):
    return __verifix_json.dumps(__verifix_canon(value), sort_keys=True, separators=(",", ":"))


def __verifix_emit(index, passed, actual, error):
    try:
        line = __verifix_json.dumps(
            {{"index": index, "passed": passed, "actual": actual, "error": error}}, default=str, allow_nan=False
        )
    except Exception:
        line = __verifix_json.dumps({{"index": index, "passed": passed, "actual": repr(actual), "error": error}})
    __verifix_sys.stdout.write("\n" + line + "\n")
    __verifix_sys.stdout.flush()


def __verifix_call(fn, args):
    try:
        __verifix_inspect.signature(fn).bind(**args)
    except (TypeError, ValueError):
        return fn(*args.values())
    return fn(**args)


__verifix_namespace = {{"__name__": "__verifix_candidate__"}}
__verifix_load_error = None
try:
    exec(compile(__verifix_source, "main.py", "exec"), __verifix_namespace)
except BaseException as __verifix_error:
    __verifix_load_error = "%s: %s" % (type(__verifix_error).__name__, __verifix_error)

for __verifix_index, __verifix_case in enumerate(__verifix_cases):
    if __verifix_load_error is not None:
        __verifix_emit(__verifix_index, False, None, __verifix_load_error)
        continue
    if __verifix_case.get("smoke"):
        __verifix_emit(__verifix_index, True, None, None)
        continue
    try:
        __verifix_fn = __verifix_namespace.get(__verifix_entry)
        if not callable(__verifix_fn):
            raise NameError("entry point '%s' is not defined" % __verifix_entry)
        __verifix_actual = __verifix_call(__verifix_fn, __verifix_case.get("input") or {{}})
        __verifix_passed = __verifix_key(__verifix_actual) == __verifix_key(__verifix_case.get("expected"))
        __verifix_emit(__verifix_index, __verifix_passed, __verifix_canon(__verifix_actual), None)
    except BaseException as __verifix_error:
        __verifix_emit(__verifix_index, False, None, "%s: %s" % (type(__verifix_error).__name__, __verifix_error))
"#
    )
}

/// The candidate runs first, verbatim; the harness follows in an async IIFE.
/// Plain JavaScript is also valid input for node's TypeScript type stripping.
///
/// Arguments are spread in input-key order when the entry point's arity
/// matches the number of keys; otherwise the input object is passed whole.
fn javascript_harness(code: &str, cases: &[TestCase], entry: &str) -> String {
    let cases = encoded_cases(cases);
    format!(
        r#"{code}

;(async () => {{
  const __verifix_cases = JSON.parse(Buffer.from("{cases}", "base64").toString("utf8"));
  const __verifix_canon = (v) => {{
    if (v === undefined) return null;
    if (typeof v === "bigint") return Number(v);
    if (typeof v === "number" && !Number.isFinite(v)) return String(v);
    if (v === null || typeof v !== "object") return v;
    if (typeof v.toJSON === "function") return __verifix_canon(v.toJSON());
    if (Array.isArray(v)) return v.map(__verifix_canon);
    if (v instanceof Set) return Array.from(v).map(__verifix_canon);
    if (v instanceof Map) v = Object.fromEntries(v);
    const out = {{}};
    for (const k of Object.keys(v).sort()) out[k] = __verifix_canon(v[k]);
    return out;
  }};
  const __verifix_key = (v) => JSON.stringify(__verifix_canon(v));
  const __verifix_emit = (index, passed, actual, error) => {{
    let line;
    try {{
      line = JSON.stringify({{ index, passed, actual: __verifix_canon(actual), error }});
    }} catch (e) {{
      line = JSON.stringify({{ index, passed, actual: String(actual), error }});
    }}
    process.stdout.write("\n" + line + "\n");
  }};
  const __verifix_fn =
    typeof {entry} === "function"
      ? {entry}
      : typeof module !== "undefined" && module.exports && typeof module.exports.{entry} === "function"
        ? module.exports.{entry}
        : undefined;
  for (let i = 0; i < __verifix_cases.length; i++) {{
    const c = __verifix_cases[i];
    if (c.smoke) {{
      __verifix_emit(i, true, null, null);
      continue;
    }}
    try {{
      if (typeof __verifix_fn !== "function") throw new ReferenceError("entry point '{entry}' is not defined");
      const input = c.input || {{}};
      const keys = Object.keys(input);
      let actual;
      if (keys.length === 0) actual = __verifix_fn();
      else if (__verifix_fn.length === keys.length) actual = __verifix_fn(...keys.map((k) => input[k]));
      else actual = __verifix_fn(input);
      if (actual && typeof actual.then === "function") actual = await actual;
      __verifix_emit(i, __verifix_key(actual) === __verifix_key(c.expected), actual, null);
    }} catch (e) {{
      __verifix_emit(i, false, null, (e && e.name ? e.name + ": " : "") + (e && e.message !== undefined ? e.message : String(e)));
    }}
  }}
}})();
"#
    )
}

#[derive(Debug, Deserialize)]
struct VerdictLine {
    index: usize,
    passed: bool,
    #[serde(default)]
    actual: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Scan harness stdout for verdict lines. Cases with no line are failed with
/// the run's stderr, since the process died before reaching them.
pub fn parse_verdicts(stdout: &str, stderr: &str, cases: &[TestCase]) -> Vec<TestCaseResult> {
    let mut verdicts: Vec<Option<VerdictLine>> = cases.iter().map(|_| None).collect();

    for line in stdout.lines() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("index").is_none() {
            continue;
        }
        let Ok(verdict) = serde_json::from_value::<VerdictLine>(value) else {
            continue;
        };
        if let Some(slot) = verdicts.get_mut(verdict.index) {
            if slot.is_none() {
                *slot = Some(verdict);
            }
        }
    }

    let crash_error = if stderr.trim().is_empty() {
        "No result reported; the harness exited before reaching this case".to_string()
    } else {
        truncate_chars(stderr.trim(), MAX_ERROR_CHARS)
    };

    cases
        .iter()
        .zip(verdicts)
        .map(|(case, verdict)| match verdict {
            Some(v) => TestCaseResult {
                test_case: case.clone(),
                passed: v.passed,
                actual_output: v.actual,
                error: v.error.map(|e| truncate_chars(&e, MAX_ERROR_CHARS)),
            },
            None => TestCaseResult {
                test_case: case.clone(),
                passed: false,
                actual_output: Value::Null,
                error: Some(crash_error.clone()),
            },
        })
        .collect()
}

/// Case input as fed to stdio-judged programs.
pub fn stdio_input(case: &TestCase) -> String {
    let mut input = Value::Object(case.input.clone()).to_string();
    input.push('\n');
    input
}

/// Judge one stdio run: stdout is parsed as JSON when possible, otherwise
/// compared as trimmed text against a string expectation.
pub fn judge_stdio(case: &TestCase, result: &ExecutionResult) -> TestCaseResult {
    let stdout = result.stdout.trim();
    let actual = serde_json::from_str::<Value>(stdout).unwrap_or_else(|_| Value::String(stdout.to_string()));

    if result.exit_code != 0 {
        let error = if result.stderr.trim().is_empty() {
            format!("Process exited with code {}", result.exit_code)
        } else {
            truncate_chars(result.stderr.trim(), MAX_ERROR_CHARS)
        };
        return TestCaseResult {
            test_case: case.clone(),
            passed: false,
            actual_output: actual,
            error: Some(error),
        };
    }

    let passed = case.is_smoke()
        || values_equal(&actual, &case.expected_output)
        || matches!(&case.expected_output, Value::String(s) if s.trim() == stdout);

    TestCaseResult {
        test_case: case.clone(),
        passed,
        actual_output: actual,
        error: None,
    }
}
