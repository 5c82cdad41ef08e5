use std::cell::RefCell;
use std::rc::Rc;

use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// Sequential turtle id, assigned by the shim starting at 0.
pub type TurtleId = u32;

/// One graphics operation with fully-resolved arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateTurtle,
    Forward(f64),
    Left(f64),
    Right(f64),
    Goto(f64, f64),
    PenUp,
    PenDown,
    /// Pen and fill colour together.
    Color(String, String),
    PenColor(String),
    FillColor(String),
    PenSize(f64),
    Speed(u8),
    BeginFill,
    EndFill,
    Write {
        text: String,
        align: String,
        font: String,
    },
    ShowTurtle,
    HideTurtle,
    Shape(String),
    Clear,
    Reset,
    // Screen-level operations, owned by no turtle.
    Bgcolor(String),
    ClearScreen,
    Bye,
}

impl Op {
    /// Wire opcode.
    pub fn name(&self) -> &'static str {
        match self {
            Op::CreateTurtle => "create_turtle",
            Op::Forward(_) => "forward",
            Op::Left(_) => "left",
            Op::Right(_) => "right",
            Op::Goto(..) => "goto",
            Op::PenUp => "penup",
            Op::PenDown => "pendown",
            Op::Color(..) => "color",
            Op::PenColor(_) => "pencolor",
            Op::FillColor(_) => "fillcolor",
            Op::PenSize(_) => "pensize",
            Op::Speed(_) => "speed",
            Op::BeginFill => "begin_fill",
            Op::EndFill => "end_fill",
            Op::Write { .. } => "write",
            Op::ShowTurtle => "showturtle",
            Op::HideTurtle => "hideturtle",
            Op::Shape(_) => "shape",
            Op::Clear => "clear",
            Op::Reset => "reset",
            Op::Bgcolor(_) => "bgcolor",
            Op::ClearScreen => "clear_screen",
            Op::Bye => "bye",
        }
    }

    /// Ordered argument list as it appears on the wire.
    pub fn args(&self) -> Vec<Value> {
        match self {
            Op::Forward(d) | Op::Left(d) | Op::Right(d) | Op::PenSize(d) => vec![json!(d)],
            Op::Goto(x, y) => vec![json!(x), json!(y)],
            Op::Color(pen, fill) => vec![json!(pen), json!(fill)],
            Op::PenColor(c) | Op::FillColor(c) | Op::Shape(c) | Op::Bgcolor(c) => vec![json!(c)],
            Op::Speed(s) => vec![json!(s)],
            Op::Write { text, align, font } => vec![json!(text), json!(align), json!(font)],
            _ => Vec::new(),
        }
    }

    /// Screen-level operations apply to no particular turtle.
    pub fn is_global(&self) -> bool {
        matches!(self, Op::Bgcolor(_) | Op::ClearScreen | Op::Bye)
    }
}

/// `(owner, op)`; `owner` is `None` for screen-level operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub owner: Option<TurtleId>,
    pub op: Op,
}

impl Entry {
    pub fn turtle(owner: TurtleId, op: Op) -> Self {
        Self {
            owner: Some(owner),
            op,
        }
    }

    pub fn global(op: Op) -> Self {
        Self { owner: None, op }
    }
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire {
            id: Option<TurtleId>,
            cmd: &'static str,
            args: Vec<Value>,
        }
        Wire {
            id: self.owner,
            cmd: self.op.name(),
            args: self.op.args(),
        }
        .serialize(serializer)
    }
}

/// Append-only log shared between the shim (writer) and the controller,
/// which hands a snapshot to the player once the run finishes.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    entries: Rc<RefCell<Vec<Entry>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: Entry) {
        self.entries.borrow_mut().push(entry);
    }

    pub fn clear(&self) {
        self.entries.borrow_mut().clear();
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_wire_format() {
        let entry = Entry::turtle(2, Op::Goto(10.0, -5.5));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json, json!({"id": 2, "cmd": "goto", "args": [10.0, -5.5]}));

        let global = serde_json::to_value(Entry::global(Op::ClearScreen)).unwrap();
        assert_eq!(global, json!({"id": null, "cmd": "clear_screen", "args": []}));
    }

    #[test]
    fn test_log_clones_share_entries() {
        let log = CommandLog::new();
        let writer = log.clone();
        writer.push(Entry::turtle(0, Op::CreateTurtle));
        writer.push(Entry::turtle(0, Op::Forward(5.0)));
        assert_eq!(log.len(), 2);
        assert_eq!(log.snapshot()[1].op, Op::Forward(5.0));
        log.clear();
        assert!(writer.is_empty());
    }

    #[test]
    fn test_global_ops() {
        assert!(Op::Bgcolor("black".into()).is_global());
        assert!(!Op::Clear.is_global());
    }
}
