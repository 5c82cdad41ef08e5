//! Python side of the turtle shim and the call dispatcher behind it.
//!
//! The runtime gets a small pure-Python `turtle` module whose every call is
//! serialised to JSON and handed to the global JS function
//! [`BRIDGE_FUNCTION`], which forwards it to [`dispatch`]. State lives only in
//! the Rust [`TurtleShim`].

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{MAX_CIRCLE_STEPS, TurtleShim, speed_from_name, speed_from_number};
use crate::command_log::TurtleId;
use crate::error::BridgeError;

/// Global JS function the Python module calls into.
pub const BRIDGE_FUNCTION: &str = "pynotebook_turtle_call";

/// Source of the replacement `turtle` module.
pub const TURTLE_MODULE: &str = r#"
import json as _json
from js import pynotebook_turtle_call as _bridge


class TurtleGraphicsError(Exception):
    pass


def _call(target, method, args, kwargs):
    payload = _json.dumps({"target": target, "method": method, "args": list(args), "kwargs": kwargs})
    reply = _json.loads(_bridge(payload))
    if "error" in reply:
        raise TurtleGraphicsError(reply["error"])
    value = reply.get("value")
    return tuple(value) if isinstance(value, list) else value


class TurtleScreen:
    def __getattr__(self, name):
        if name.startswith("_"):
            raise AttributeError(name)
        def method(*args, **kwargs):
            return _call("screen", name, args, kwargs)
        method.__name__ = name
        return method

    def textinput(self, title, prompt):
        print(f"Warning: textinput('{title}', '{prompt}') called synchronously. It might not work as expected.")
        return None

    def numinput(self, title, prompt, default=None, minval=None, maxval=None):
        print(f"Warning: numinput('{title}', '{prompt}') called synchronously.")
        return default


_SCREEN = TurtleScreen()


def Screen():
    return _SCREEN


class Turtle:
    def __init__(self, shape="classic", undobuffersize=1000, visible=True):
        self._id = _call("new", "create_turtle", (shape, visible), {})

    def __getattr__(self, name):
        if name.startswith("_"):
            raise AttributeError(name)
        def method(*args, **kwargs):
            return _call(self._id, name, args, kwargs)
        method.__name__ = name
        return method

    def write(self, arg, move=False, align="left", font=("Arial", 8, "normal")):
        return _call(self._id, "write", (str(arg), move, align, font), {})

    def getscreen(self):
        return _SCREEN


Pen = RawTurtle = Turtle


def _turtle_function(name):
    def function(*args, **kwargs):
        return _call(None, name, args, kwargs)
    function.__name__ = name
    return function


def _screen_function(name):
    def function(*args, **kwargs):
        return _call("screen", name, args, kwargs)
    function.__name__ = name
    return function


_TURTLE_FUNCTIONS = [
    "forward", "fd", "backward", "bk", "back", "right", "rt", "left", "lt",
    "goto", "setpos", "setposition", "setx", "sety", "home", "setheading", "seth",
    "circle", "speed", "penup", "pu", "up", "pendown", "pd", "down", "isdown",
    "width", "pensize", "color", "pencolor", "fillcolor", "begin_fill", "end_fill",
    "filling", "showturtle", "st", "hideturtle", "ht", "isvisible", "shape",
    "heading", "xcor", "ycor", "position", "pos", "distance", "towards",
    "clear", "reset",
]
_SCREEN_FUNCTIONS = [
    "bgcolor", "clearscreen", "bye", "done", "mainloop", "exitonclick",
    "setup", "title", "tracer", "update",
]

for _name in _TURTLE_FUNCTIONS:
    globals()[_name] = _turtle_function(_name)
for _name in _SCREEN_FUNCTIONS:
    globals()[_name] = _screen_function(_name)


def write(arg, move=False, align="left", font=("Arial", 8, "normal")):
    return _call(None, "write", (str(arg), move, align, font), {})


def textinput(title, prompt):
    return _SCREEN.textinput(title, prompt)


def numinput(title, prompt, default=None, minval=None, maxval=None):
    return _SCREEN.numinput(title, prompt, default, minval, maxval)


__all__ = ["Turtle", "Pen", "RawTurtle", "Screen", "TurtleScreen", "TurtleGraphicsError",
           "write", "textinput", "numinput"] + _TURTLE_FUNCTIONS + _SCREEN_FUNCTIONS
"#;

/// Registers the bridge module as `turtle`, given the module's file name stem.
pub fn install_snippet(module: &str) -> String {
    format!("import sys\nimport {module}\nsys.modules['turtle'] = {module}\n")
}

// ----------------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------------

/// One call as serialised by `_call` in the Python module.
#[derive(Debug, Deserialize)]
pub struct BridgeCall {
    /// `null` (module level), a turtle id, `"screen"` or `"new"`.
    #[serde(default)]
    pub target: Value,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Decode a JSON call, run it against the shim and encode the reply
/// as `{"value": ...}` or `{"error": "..."}`.
pub fn handle(shim: &mut TurtleShim, payload: &str) -> String {
    let reply = serde_json::from_str::<BridgeCall>(payload)
        .map_err(BridgeError::from)
        .and_then(|call| dispatch(shim, &call));
    match reply {
        Ok(value) => json!({ "value": value }).to_string(),
        Err(e) => {
            log::warn!("turtle bridge: {e}");
            json!({ "error": e.to_string() }).to_string()
        }
    }
}

pub fn dispatch(shim: &mut TurtleShim, call: &BridgeCall) -> Result<Value, BridgeError> {
    let args = Args {
        method: &call.method,
        positional: &call.args,
        keyword: &call.kwargs,
    };
    match &call.target {
        Value::String(t) if t == "screen" => screen_call(shim, &args),
        Value::String(t) if t == "new" => {
            let shape = args.string(0, "shape")?;
            let visible = args.boolean(1, "visible")?.unwrap_or(true);
            Ok(json!(shim.create_turtle(shape.as_deref(), visible)))
        }
        Value::Null => {
            let id = shim.default_turtle();
            turtle_call(shim, id, &args)
        }
        Value::Number(n) => match n.as_u64().and_then(|n| TurtleId::try_from(n).ok()) {
            Some(id) => turtle_call(shim, id, &args),
            None => Err(args.bad(format!("invalid turtle id {n}"))),
        },
        other => Err(args.bad(format!("invalid target {other}"))),
    }
}

fn turtle_call(shim: &mut TurtleShim, id: TurtleId, args: &Args) -> Result<Value, BridgeError> {
    match args.method {
        "forward" | "fd" => shim.forward(id, args.require_number(0, "distance")?),
        "backward" | "bk" | "back" => shim.back(id, args.require_number(0, "distance")?),
        "left" | "lt" => shim.left(id, args.require_number(0, "angle")?),
        "right" | "rt" => shim.right(id, args.require_number(0, "angle")?),
        "goto" | "setpos" | "setposition" => {
            let (x, y) = args.point()?;
            shim.goto(id, x, y);
        }
        "setx" => shim.setx(id, args.require_number(0, "x")?),
        "sety" => shim.sety(id, args.require_number(0, "y")?),
        "home" => shim.home(id),
        "setheading" | "seth" => shim.setheading(id, args.require_number(0, "to_angle")?),
        "circle" => {
            let radius = args.require_number(0, "radius")?;
            let extent = args.number(1, "extent")?;
            let steps = args
                .number(2, "steps")?
                .map(|s| s.clamp(0.0, f64::from(MAX_CIRCLE_STEPS)) as u32);
            shim.circle(id, radius, extent, steps);
        }
        "penup" | "pu" | "up" => shim.penup(id),
        "pendown" | "pd" | "down" => shim.pendown(id),
        "pensize" | "width" => match args.number(0, "width")? {
            Some(w) => shim.pensize(id, w),
            None => return Ok(json!(shim.state(id).pen_size)),
        },
        "color" => {
            let colors = args.colors()?;
            match colors.as_slice() {
                [] => {
                    let state = shim.state(id);
                    return Ok(json!([state.pen_color, state.fill_color]));
                }
                [both] => shim.color(id, both, both),
                [pen, fill] => shim.color(id, pen, fill),
                _ => return Err(args.bad("expected at most two colours")),
            }
        }
        "pencolor" => match args.colors()?.first() {
            Some(c) => shim.pencolor(id, c),
            None => return Ok(json!(shim.state(id).pen_color)),
        },
        "fillcolor" => match args.colors()?.first() {
            Some(c) => shim.fillcolor(id, c),
            None => return Ok(json!(shim.state(id).fill_color)),
        },
        "speed" => match args.get(0, "speed") {
            None => return Ok(json!(shim.state(id).speed)),
            Some(Value::String(name)) => match speed_from_name(name) {
                Some(s) => shim.speed(id, s),
                None => return Err(args.bad(format!("unknown speed '{name}'"))),
            },
            Some(Value::Number(n)) => shim.speed(id, speed_from_number(n.as_f64().unwrap_or(0.0))),
            Some(other) => return Err(args.bad(format!("bad speed {other}"))),
        },
        "begin_fill" => shim.begin_fill(id),
        "end_fill" => shim.end_fill(id),
        "filling" => return Ok(json!(shim.state(id).fill_path.is_some())),
        "write" => {
            let text = args.string(0, "arg")?.unwrap_or_default();
            let align = args.string(2, "align")?.unwrap_or_else(|| "left".into());
            let font = args.get(3, "font").map(font_value).unwrap_or_else(|| "normal 8px Arial".into());
            shim.write(id, &text, &align, &font);
        }
        "showturtle" | "st" => shim.showturtle(id),
        "hideturtle" | "ht" => shim.hideturtle(id),
        "isvisible" => return Ok(json!(shim.state(id).visible)),
        "isdown" => return Ok(json!(shim.state(id).pen_down)),
        "shape" => match args.string(0, "name")? {
            Some(name) => shim.shape(id, &name),
            None => return Ok(json!(shim.state(id).shape)),
        },
        "heading" => return Ok(json!(shim.state(id).pose.normalized_heading())),
        "xcor" => return Ok(json!(shim.state(id).pose.x)),
        "ycor" => return Ok(json!(shim.state(id).pose.y)),
        "position" | "pos" => {
            let pose = shim.state(id).pose;
            return Ok(json!([pose.x, pose.y]));
        }
        "distance" => {
            let (x, y) = args.point()?;
            let pose = shim.state(id).pose;
            return Ok(json!((x - pose.x).hypot(y - pose.y)));
        }
        "towards" => {
            let (x, y) = args.point()?;
            let pose = shim.state(id).pose;
            let angle = (y - pose.y).atan2(x - pose.x).to_degrees().rem_euclid(360.0);
            return Ok(json!(angle));
        }
        "clear" => shim.clear(id),
        "reset" => shim.reset(id),
        "done" | "mainloop" | "exitonclick" => {}
        other => return Err(BridgeError::UnknownMethod(other.to_string())),
    }
    Ok(Value::Null)
}

fn screen_call(shim: &mut TurtleShim, args: &Args) -> Result<Value, BridgeError> {
    match args.method {
        "bgcolor" => match args.colors()?.first() {
            Some(c) => shim.bgcolor(c),
            None => return Ok(json!(shim.screen_bgcolor())),
        },
        "clear" | "clearscreen" | "reset" | "resetscreen" => shim.clear_screen(),
        "bye" => shim.bye(),
        "setup" | "title" | "tracer" | "update" | "done" | "mainloop" | "exitonclick" => {}
        other => return Err(BridgeError::UnknownMethod(other.to_string())),
    }
    Ok(Value::Null)
}

// ----------------------------------------------------------------------------
// Argument helpers
// ----------------------------------------------------------------------------

struct Args<'a> {
    method: &'a str,
    positional: &'a [Value],
    keyword: &'a Map<String, Value>,
}

impl Args<'_> {
    /// Positional argument `index`, else keyword `name`. `None` counts as absent.
    fn get(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional
            .get(index)
            .or_else(|| self.keyword.get(name))
            .filter(|v| !v.is_null())
    }

    fn bad(&self, message: impl Into<String>) -> BridgeError {
        BridgeError::BadArgument {
            method: self.method.to_string(),
            message: message.into(),
        }
    }

    fn number(&self, index: usize, name: &str) -> Result<Option<f64>, BridgeError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(Value::Bool(b)) => Ok(Some(if *b { 1.0 } else { 0.0 })),
            Some(other) => Err(self.bad(format!("{name} must be a number, not {other}"))),
        }
    }

    fn require_number(&self, index: usize, name: &str) -> Result<f64, BridgeError> {
        self.number(index, name)?
            .ok_or_else(|| self.bad(format!("missing argument '{name}'")))
    }

    fn string(&self, index: usize, name: &str) -> Result<Option<String>, BridgeError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.bad(format!("{name} must be a string, not {other}"))),
        }
    }

    fn boolean(&self, index: usize, name: &str) -> Result<Option<bool>, BridgeError> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(self.bad(format!("{name} must be a bool, not {other}"))),
        }
    }

    /// `(x, y)` from two numbers or a single pair.
    fn point(&self) -> Result<(f64, f64), BridgeError> {
        if let Some(Value::Array(pair)) = self.get(0, "x") {
            return match pair.as_slice() {
                [Value::Number(x), Value::Number(y)] => {
                    Ok((x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0)))
                }
                _ => Err(self.bad("expected an (x, y) pair")),
            };
        }
        Ok((self.require_number(0, "x")?, self.require_number(1, "y")?))
    }

    /// Colour arguments as CSS strings. Three bare numbers are one RGB colour.
    fn colors(&self) -> Result<Vec<String>, BridgeError> {
        if self.positional.len() == 3 && self.positional.iter().all(Value::is_number) {
            return Ok(vec![rgb(self.positional).ok_or_else(|| self.bad("bad colour"))?]);
        }
        self.positional
            .iter()
            .map(|v| css_color(v).ok_or_else(|| self.bad(format!("bad colour {v}"))))
            .collect()
    }
}

fn css_color(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => rgb(parts),
        _ => None,
    }
}

/// `rgb(r, g, b)` from floats in 0..=1 or integers in 0..=255.
fn rgb(parts: &[Value]) -> Option<String> {
    let channels: Vec<f64> = parts.iter().map(Value::as_f64).collect::<Option<_>>()?;
    if channels.len() != 3 {
        return None;
    }
    let unit = channels.iter().all(|c| *c <= 1.0);
    let to_byte = |c: f64| {
        let c = if unit { c * 255.0 } else { c };
        c.round().clamp(0.0, 255.0) as u8
    };
    Some(format!(
        "rgb({}, {}, {})",
        to_byte(channels[0]),
        to_byte(channels[1]),
        to_byte(channels[2])
    ))
}

/// Canvas font string from a Python `(family, size, style)` tuple.
fn font_value(value: &Value) -> String {
    match value {
        Value::Array(parts) => {
            let family = parts.first().and_then(Value::as_str).unwrap_or("Arial");
            let size = parts.get(1).and_then(Value::as_f64).unwrap_or(8.0);
            let style = parts.get(2).and_then(Value::as_str).unwrap_or("normal");
            format!("{style} {size}px {family}")
        }
        Value::String(s) => s.clone(),
        _ => "normal 8px Arial".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_log::{CommandLog, Op};
    use crate::turtle::DEFAULT_SPEED;

    fn shim() -> TurtleShim {
        TurtleShim::new(CommandLog::new(), DEFAULT_SPEED)
    }

    fn call(shim: &mut TurtleShim, payload: Value) -> Value {
        serde_json::from_str(&handle(shim, &payload.to_string())).unwrap()
    }

    #[test]
    fn test_module_level_call_creates_default_turtle() {
        let mut s = shim();
        let reply = call(&mut s, json!({"target": null, "method": "fd", "args": [25]}));
        assert_eq!(reply, json!({"value": null}));
        let ops: Vec<Op> = s.log().snapshot().into_iter().map(|e| e.op).collect();
        assert_eq!(ops[0], Op::CreateTurtle);
        assert_eq!(ops.last(), Some(&Op::Forward(25.0)));
    }

    #[test]
    fn test_new_turtle_returns_id() {
        let mut s = shim();
        let reply = call(&mut s, json!({"target": "new", "method": "create_turtle", "args": ["turtle", false]}));
        let id = reply["value"].as_u64().unwrap() as TurtleId;
        let state = s.state(id);
        assert_eq!(state.shape, "turtle");
        assert!(!state.visible);
    }

    #[test]
    fn test_queries_return_values() {
        let mut s = shim();
        call(&mut s, json!({"target": null, "method": "goto", "args": [[3, 4]]}));
        let pos = call(&mut s, json!({"target": null, "method": "pos"}));
        assert_eq!(pos["value"], json!([3.0, 4.0]));
        let d = call(&mut s, json!({"target": null, "method": "distance", "args": [0, 0]}));
        assert_eq!(d["value"], json!(5.0));
        let down = call(&mut s, json!({"target": null, "method": "isdown"}));
        assert_eq!(down["value"], json!(true));
    }

    #[test]
    fn test_color_forms() {
        let mut s = shim();
        call(&mut s, json!({"target": null, "method": "color", "args": ["red", [0, 0, 255]]}));
        let state = s.state(0);
        assert_eq!(state.pen_color, "red");
        assert_eq!(state.fill_color, "rgb(0, 0, 255)");

        call(&mut s, json!({"target": null, "method": "pencolor", "args": [1.0, 0.5, 0.0]}));
        assert_eq!(s.state(0).pen_color, "rgb(255, 128, 0)");

        let both = call(&mut s, json!({"target": null, "method": "color"}));
        assert_eq!(both["value"], json!(["rgb(255, 128, 0)", "rgb(0, 0, 255)"]));
    }

    #[test]
    fn test_speed_names_and_numbers() {
        let mut s = shim();
        call(&mut s, json!({"target": null, "method": "speed", "args": ["fastest"]}));
        assert_eq!(s.state(0).speed, 0);
        call(&mut s, json!({"target": null, "method": "speed", "args": [3]}));
        assert_eq!(s.state(0).speed, 3);
        call(&mut s, json!({"target": null, "method": "speed", "args": [42]}));
        assert_eq!(s.state(0).speed, 0);
        let err = call(&mut s, json!({"target": null, "method": "speed", "args": ["warp"]}));
        assert!(err["error"].as_str().unwrap().contains("unknown speed"));
    }

    #[test]
    fn test_circle_kwargs() {
        let mut s = shim();
        call(&mut s, json!({"target": null, "method": "circle", "args": [10], "kwargs": {"steps": 4}}));
        let forwards = s
            .log()
            .snapshot()
            .iter()
            .filter(|e| matches!(e.op, Op::Forward(_)))
            .count();
        assert_eq!(forwards, 4);

        let mut s = shim();
        call(&mut s, json!({"target": null, "method": "circle", "args": [10, 360, 1e12]}));
        let forwards = s
            .log()
            .snapshot()
            .iter()
            .filter(|e| matches!(e.op, Op::Forward(_)))
            .count();
        assert_eq!(forwards, MAX_CIRCLE_STEPS as usize);
    }

    #[test]
    fn test_write_font_tuple() {
        let mut s = shim();
        call(
            &mut s,
            json!({"target": null, "method": "write", "args": ["hi", false, "center", ["Courier", 14, "bold"]]}),
        );
        match &s.log().snapshot().last().unwrap().op {
            Op::Write { text, align, font } => {
                assert_eq!(text, "hi");
                assert_eq!(align, "center");
                assert_eq!(font, "bold 14px Courier");
            }
            other => panic!("Expected Write, got {other:?}"),
        }
    }

    #[test]
    fn test_screen_calls_are_global() {
        let mut s = shim();
        call(&mut s, json!({"target": "screen", "method": "bgcolor", "args": ["black"]}));
        call(&mut s, json!({"target": "screen", "method": "clearscreen"}));
        let entries = s.log().snapshot();
        assert!(entries.iter().all(|e| e.owner.is_none()));
        assert_eq!(entries[1].op, Op::ClearScreen);
        let bg = call(&mut s, json!({"target": "screen", "method": "bgcolor"}));
        assert_eq!(bg["value"], json!("black"));
    }

    #[test]
    fn test_unknown_method_and_bad_payload() {
        let mut s = shim();
        let reply = call(&mut s, json!({"target": null, "method": "teleport"}));
        assert_eq!(reply["error"], json!("turtle has no method 'teleport'"));
        let bad: Value = serde_json::from_str(&handle(&mut s, "not json")).unwrap();
        assert!(bad["error"].as_str().unwrap().starts_with("malformed turtle call"));
    }

    #[test]
    fn test_install_snippet() {
        let code = install_snippet("pynotebook_turtle");
        assert!(code.contains("sys.modules['turtle'] = pynotebook_turtle"));
        assert!(TURTLE_MODULE.contains(BRIDGE_FUNCTION));
    }
}
