//! The seam between the controller and the Python interpreter.
//!
//! [`HostRuntime`] is all the controller knows about the interpreter. The
//! browser build implements it over Pyodide in `web::PyodideHost`; tests use
//! a scripted fake.

use serde::Deserialize;

use crate::cell::CellId;
use crate::error::ExecError;
use crate::input::InputChannel;
use crate::session::OutputSink;

/// What the last expression of a cell evaluated to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RunValue {
    None,
    /// `str()` of the value, echoed like an interactive top level.
    Text { text: String },
    /// A data frame, already rendered to markup.
    Table { html: String },
}

/// Everything the runtime needs to know about the run that is starting.
#[derive(Clone)]
pub struct RunScope {
    pub cell: CellId,
    pub sink: OutputSink,
    pub input: InputChannel,
}

#[allow(async_fn_in_trait)]
pub trait HostRuntime {
    /// Route stdout/stderr to `scope.sink` and bind the input helpers to
    /// `scope.cell` for the coming run.
    async fn begin_run(&self, scope: RunScope) -> Result<(), ExecError>;

    /// Execute code with top-level await allowed.
    async fn run(&self, code: &str) -> Result<RunValue, ExecError>;

    async fn install_packages(&self, packages: &[String]) -> Result<(), ExecError>;

    /// Write into the runtime's virtual filesystem.
    fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecError>;

    /// PNG bytes of every open figure.
    fn capture_figures(&self) -> Result<Vec<Vec<u8>>, ExecError>;

    fn close_figures(&self) -> Result<(), ExecError>;

    /// Ask the interpreter to stop. Returns false if it cannot.
    fn interrupt(&self) -> bool {
        false
    }
}

/// Global JS function the input helpers await on.
pub const INPUT_FUNCTION: &str = "pynotebook_request_input";

/// Global JS function the output streams write through, as `(run, stream, text)`.
pub const STREAM_FUNCTION: &str = "pynotebook_stream";

pub const SUPPORT_MODULE_NAME: &str = "pynotebook_support";

/// Streams, result description and figure helpers, imported once at startup.
pub const SUPPORT_MODULE: &str = r#"
import contextvars
import io
import json
import sys

from js import pynotebook_stream as _stream

# Tasks copy the context when created, so a coroutine left over from a
# stopped run keeps reporting that run's number.
_run = contextvars.ContextVar("pynotebook_run", default=0)


def begin_run(run):
    _run.set(run)


def current_run():
    return _run.get()


class _Stream:
    def __init__(self, name):
        self.name = name

    def write(self, text):
        _stream(_run.get(), self.name, text)
        return len(text)

    def flush(self):
        pass

    def isatty(self):
        return False


sys.stdout = _Stream("stdout")
sys.stderr = _Stream("stderr")


def describe(value):
    if value is None:
        return json.dumps({"kind": "none"})
    try:
        import pandas
        if isinstance(value, pandas.DataFrame):
            return json.dumps({"kind": "table", "html": value.to_html()})
    except ImportError:
        pass
    return json.dumps({"kind": "text", "text": str(value)})


def _pyplot():
    if "matplotlib.pyplot" not in sys.modules:
        return None
    return sys.modules["matplotlib.pyplot"]


def capture_figures():
    plt = _pyplot()
    if plt is None:
        return []
    images = []
    for number in plt.get_fignums():
        buffer = io.BytesIO()
        plt.figure(number).savefig(buffer, format="png", bbox_inches="tight")
        images.append(buffer.getvalue())
    return images


def close_figures():
    plt = _pyplot()
    if plt is not None:
        plt.close("all")
"#;

/// Statements that mark `run` as the one in progress inside the interpreter.
pub fn run_marker(run: u64) -> String {
    format!("import {SUPPORT_MODULE_NAME}\n{SUPPORT_MODULE_NAME}.begin_run({run})\n")
}

/// Defines `async_input`, `async_textinput` and `async_numinput` for one
/// run. Requests carry the asking coroutine's run number; a rejected request
/// surfaces in Python as `KeyboardInterrupt`.
pub fn input_prelude(cell: &CellId) -> String {
    let cell = serde_json::Value::String(cell.to_string());
    format!(
        r#"
from js import {INPUT_FUNCTION} as _pynotebook_request
import {SUPPORT_MODULE_NAME} as _pynotebook_support


async def _pynotebook_ask(prompt, title):
    try:
        return await _pynotebook_request(
            _pynotebook_support.current_run(), {cell}, str(prompt), title
        )
    except Exception:
        raise KeyboardInterrupt("Stopped by user") from None


async def async_input(prompt=""):
    return await _pynotebook_ask(prompt, None)


async def async_textinput(title, prompt):
    return await _pynotebook_ask(prompt, title)


async def async_numinput(title, prompt, default=None, minval=None, maxval=None):
    text = await _pynotebook_ask(prompt, title)
    if text is None:
        return None
    try:
        value = float(text)
    except ValueError:
        return None
    if minval is not None and value < minval:
        return minval
    if maxval is not None and value > maxval:
        return maxval
    return value
"#
    )
}
