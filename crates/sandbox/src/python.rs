//! Wrapper for running untrusted Python snippets.
//!
//! The generated script swaps `__import__` for an allow-list check and runs
//! the snippet with a reduced builtins table. This is a best-effort filter
//! only: the interpreter still runs with the privileges of the sandboxed
//! process, and escapes through object introspection are well known. The
//! boundary that actually holds is the separate process with its own
//! environment, working directory and resource ceilings.

/// Modules a snippet may import when the caller does not say otherwise.
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "json",
    "os",
    "sys",
    "time",
    "datetime",
    "re",
    "urllib.parse",
    "base64",
    "hashlib",
    "hmac",
    "requests",
    "yaml",
    "pathlib",
];

/// Builtins left reachable from the snippet.
const SAFE_BUILTINS: &[&str] = &[
    "abs", "all", "any", "bin", "bool", "bytearray", "bytes", "callable", "chr",
    "classmethod", "complex", "dict", "dir", "divmod", "enumerate", "filter", "float",
    "format", "frozenset", "getattr", "hasattr", "hash", "hex", "id", "int", "isinstance",
    "issubclass", "iter", "len", "list", "map", "max", "memoryview", "min", "next",
    "object", "oct", "ord", "pow", "print", "property", "range", "repr", "reversed",
    "round", "set", "slice", "sorted", "staticmethod", "str", "sum", "super", "tuple",
    "type", "zip", "Exception", "ValueError", "TypeError", "KeyError", "IndexError",
    "ImportError", "StopIteration", "ZeroDivisionError", "RuntimeError",
];

/// Exit status used when the snippet raises.
pub const SNIPPET_ERROR_EXIT: i32 = 1;

/// Build the wrapper script for `code`.
///
/// The snippet and both allow-lists are embedded as JSON string/array
/// literals, which are also valid Python literals, so no user text is ever
/// spliced into Python syntax.
pub fn restricted_script(code: &str, allowed_imports: &[String]) -> String {
    let code = serde_json::Value::String(code.to_string()).to_string();
    let imports = serde_json::Value::from(allowed_imports.to_vec()).to_string();
    let builtins = serde_json::Value::from(
        SAFE_BUILTINS.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
    )
    .to_string();

    format!(
        r#"import builtins
import sys

_USER_CODE = {code}
_ALLOWED_IMPORTS = set({imports})
_SAFE_BUILTINS = {builtins}
_original_import = builtins.__import__


def _restricted_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level != 0 or name.split(".")[0] not in {{m.split(".")[0] for m in _ALLOWED_IMPORTS}}:
        raise ImportError("Import of '%s' is not allowed in sandbox" % name)
    return _original_import(name, globals, locals, fromlist, level)


_safe = {{n: getattr(builtins, n) for n in _SAFE_BUILTINS if hasattr(builtins, n)}}
_safe["__import__"] = _restricted_import

try:
    exec(compile(_USER_CODE, "<sandbox>", "exec"), {{"__builtins__": _safe, "__name__": "__sandbox__"}})
except SystemExit:
    raise
except BaseException as e:
    print("Sandbox execution error: %s" % e, file=sys.stderr)
    sys.exit({exit})
"#,
        exit = SNIPPET_ERROR_EXIT,
    )
}

pub fn default_allowed_imports() -> Vec<String> {
    DEFAULT_ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect()
}
