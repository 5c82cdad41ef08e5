//! Source-to-source rewrite that makes input requests awaitable.
//!
//! A cell is tokenized and parsed into blocks, a call graph over its
//! function definitions is closed under "calls something that requests
//! input", and then every suspending definition becomes `async def` while
//! every call that may request input gets an `await`. Input primitives are
//! redirected to the `async_*` helpers installed before each run.

pub mod analysis;
pub mod lexer;
pub mod parser;
pub mod transform;

use std::collections::BTreeSet;

use crate::error::RewriteError;
use analysis::{Analysis, INPUT_FUNCTIONS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub code: String,
    /// Definitions that became (or already were) coroutines.
    pub suspending: BTreeSet<String>,
    /// Productive fixed-point rounds.
    pub rounds: usize,
    pub changed: bool,
}

impl Rewrite {
    fn unchanged(source: &str) -> Self {
        Self {
            code: source.to_string(),
            suspending: BTreeSet::new(),
            rounds: 0,
            changed: false,
        }
    }
}

/// Rewrite a cell. On error the caller runs the original source.
pub fn rewrite(source: &str) -> Result<Rewrite, RewriteError> {
    // Without an input-family name there is nothing to suspend on.
    if !INPUT_FUNCTIONS.iter().any(|f| source.contains(f)) {
        return Ok(Rewrite::unchanged(source));
    }
    let module = parser::parse(source)?;
    let analysis = Analysis::of(&module);
    let (suspending, rounds) = analysis.graph.close();
    let edits = transform::plan(&module, &analysis, &suspending);
    if edits.is_empty() {
        return Ok(Rewrite::unchanged(source));
    }
    let code = transform::apply(source, &edits)?;
    Ok(Rewrite {
        code,
        suspending,
        rounds,
        changed: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_input_skips_parsing() {
        // not valid Python, but nothing to rewrite
        let source = "x = $weird";
        let out = rewrite(source).unwrap();
        assert_eq!(out.code, source);
        assert!(!out.changed);
    }

    #[test]
    fn test_parse_failure_is_an_error() {
        assert!(rewrite("x = input(\n").is_err());
        assert!(rewrite("def f():\nreturn input()\n").is_err());
    }

    #[test]
    fn test_rewrite_reports_suspending() {
        let source = "\
def ask():
    return input()

def main():
    for _ in range(3):
        print(ask())
";
        let out = rewrite(source).unwrap();
        assert!(out.changed);
        assert_eq!(out.suspending.iter().map(String::as_str).collect::<Vec<_>>(), vec!["ask", "main"]);
        assert!(out.code.contains("async def main():"));
        assert!(out.code.contains("print(await ask())"));
        assert!(out.rounds <= 2);
    }

    #[test]
    fn test_mentions_without_calls_are_unchanged() {
        let source = "# uses input later\nprint('input')\n";
        let out = rewrite(source).unwrap();
        assert!(!out.changed);
        assert_eq!(out.code, source);
    }

    #[test]
    fn test_fstring_input_marks_caller() {
        let source = "def greet():\n    return f\"Hi {input('n')}\"\n\nprint(greet())\n";
        let out = rewrite(source).unwrap();
        assert!(out.changed);
        assert!(out.suspending.contains("greet"));
        assert!(out.code.contains("async def greet():"));
        assert!(out.code.contains("{await async_input('n')}"));
        assert!(out.code.contains("print(await greet())"));
    }

    #[test]
    fn test_turtle_dialog_program() {
        let source = "\
import turtle
t = turtle.Turtle()
sides = int(turtle.numinput('Polygon', 'Sides?', 5, 3, 12))
for _ in range(sides):
    t.forward(50)
    t.left(360 / sides)
";
        let out = rewrite(source).unwrap();
        assert!(out.code.contains("sides = int(await async_numinput('Polygon', 'Sides?', 5, 3, 12))"));
        assert!(out.code.contains("    t.forward(50)\n"));
    }
}
