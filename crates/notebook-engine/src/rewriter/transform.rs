use std::cmp::Reverse;
use std::collections::BTreeSet;

use super::analysis::{Analysis, INPUT_FUNCTIONS, INPUT_METHODS};
use super::lexer::TokenKind;
use super::parser::{CallSite, Callee, Module};
use crate::error::RewriteError;

/// A textual edit against the original source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub at: usize,
    /// End of the replaced span; equal to `at` for insertions.
    pub end: usize,
    pub text: String,
    kind: EditKind,
    /// For openers, where the wrapped expression ends; wider wraps go first.
    reach: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EditKind {
    Open,
    Replace,
    Close,
}

impl Edit {
    fn open(at: usize, reach: usize, text: &str) -> Self {
        Self {
            at,
            end: at,
            text: text.to_string(),
            kind: EditKind::Open,
            reach,
        }
    }

    fn close(at: usize) -> Self {
        Self {
            at,
            end: at,
            text: ")".to_string(),
            kind: EditKind::Close,
            reach: at,
        }
    }

    fn replace(at: usize, end: usize, text: String) -> Self {
        Self {
            at,
            end,
            text,
            kind: EditKind::Replace,
            reach: end,
        }
    }
}

/// Edits turning suspending definitions into coroutines and awaiting every
/// call that may request input.
pub fn plan(module: &Module, analysis: &Analysis, suspending: &BTreeSet<String>) -> Vec<Edit> {
    let tokens = &module.tokens;
    let mut edits = Vec::new();

    for def in &analysis.defs {
        if suspending.contains(&def.name) && !def.is_async {
            edits.push(Edit::open(tokens[def.def_token].start, tokens[def.def_token].end, "async "));
        }
    }

    // Receivers of dialog methods are dropped, along with any call inside them.
    let discarded: Vec<(usize, usize)> = analysis
        .calls
        .iter()
        .filter(|c| is_dialog_method(c))
        .filter_map(|c| c.name_token.map(|name| (c.primary_start, name)))
        .collect();

    for call in &analysis.calls {
        if discarded.iter().any(|&(start, name)| start <= call.open && call.open < name) {
            continue;
        }
        let Some(name_token) = call.name_token else {
            continue;
        };
        let name = &tokens[name_token];
        match &call.callee {
            Callee::Name(n) if INPUT_FUNCTIONS.contains(&n.as_str()) => {
                edits.push(Edit::replace(name.start, name.end, format!("async_{n}")));
            }
            Callee::Method(n) if INPUT_METHODS.contains(&n.as_str()) => {
                let start = tokens[call.primary_start].start;
                edits.push(Edit::replace(start, name.end, format!("async_{n}")));
            }
            Callee::Name(n) | Callee::Method(n) if suspending.contains(n) => {}
            _ => continue,
        }
        edits.extend(awaits(module, call));
    }

    edits.sort_by_key(|e| (e.at, e.kind, Reverse(e.reach)));
    edits
}

fn is_dialog_method(call: &CallSite) -> bool {
    matches!(&call.callee, Callee::Method(n) if INPUT_METHODS.contains(&n.as_str()))
}

/// `await ` before the primary, or `(await ` ... `)` when a trailer follows
/// the call. Nothing if the call is already awaited.
fn awaits(module: &Module, call: &CallSite) -> Vec<Edit> {
    let tokens = &module.tokens;
    let start = call.primary_start;
    if start > 0 && tokens[start - 1].is_name(module.source, "await") {
        return Vec::new();
    }
    let at = tokens[start].start;
    let close_end = tokens[call.close].end;
    let next = tokens[call.close + 1];
    let has_trailer = next.is_op(module.source, ".")
        || (next.kind == TokenKind::Open && matches!(next.text(module.source), "(" | "["));
    if has_trailer {
        vec![Edit::open(at, close_end, "(await "), Edit::close(close_end)]
    } else {
        vec![Edit::open(at, close_end, "await ")]
    }
}

/// Apply sorted edits. Any edit landing inside text already consumed by an
/// earlier replacement is an overlap.
pub fn apply(source: &str, edits: &[Edit]) -> Result<String, RewriteError> {
    let mut out = String::with_capacity(source.len() + edits.len() * 8);
    let mut cursor = 0;
    for edit in edits {
        if edit.at < cursor {
            return Err(RewriteError::OverlappingEdit { offset: edit.at });
        }
        out.push_str(&source[cursor..edit.at]);
        out.push_str(&edit.text);
        cursor = edit.end;
    }
    out.push_str(&source[cursor..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rewriter::parser::parse;

    fn rewrite(source: &str) -> String {
        let module = parse(source).unwrap();
        let analysis = Analysis::of(&module);
        let (suspending, _) = analysis.graph.close();
        let edits = plan(&module, &analysis, &suspending);
        apply(source, &edits).unwrap()
    }

    #[test]
    fn test_bare_input() {
        assert_eq!(rewrite("x = input('name? ')"), "x = await async_input('name? ')");
    }

    #[test]
    fn test_nested_in_conversion() {
        assert_eq!(
            rewrite("n = int(input('n: '))\nprint(n)"),
            "n = int(await async_input('n: '))\nprint(n)"
        );
    }

    #[test]
    fn test_trailer_wraps_in_parentheses() {
        assert_eq!(
            rewrite("name = input().strip().title()"),
            "name = (await async_input()).strip().title()"
        );
        assert_eq!(rewrite("c = input()[0]"), "c = (await async_input())[0]");
    }

    #[test]
    fn test_definitions_and_call_sites() {
        let source = "\
def ask(q):
    return input(q)

def greet():
    print('hi', ask('who? '))

greet()
";
        let expected = "\
async def ask(q):
    return await async_input(q)

async def greet():
    print('hi', await ask('who? '))

await greet()
";
        assert_eq!(rewrite(source), expected);
    }

    #[test]
    fn test_method_dialog_drops_receiver() {
        assert_eq!(
            rewrite("n = turtle.Screen().numinput('Size', 'How big?', 50)"),
            "n = await async_numinput('Size', 'How big?', 50)"
        );
        assert_eq!(
            rewrite("s = screen.textinput('Name', 'Who?').upper()"),
            "s = (await async_textinput('Name', 'Who?')).upper()"
        );
    }

    #[test]
    fn test_free_dialog_functions() {
        assert_eq!(
            rewrite("from turtle import *\ncolor = textinput('c', 'colour?')"),
            "from turtle import *\ncolor = await async_textinput('c', 'colour?')"
        );
    }

    #[test]
    fn test_suspending_method_call() {
        let source = "\
class Quiz:
    def ask(self):
        return input()

    def run(self):
        return self.ask().lower()
";
        let expected = "\
class Quiz:
    async def ask(self):
        return await async_input()

    async def run(self):
        return (await self.ask()).lower()
";
        assert_eq!(rewrite(source), expected);
    }

    #[test]
    fn test_already_async_and_awaited() {
        let source = "async def ask():\n    return input()\n\nawait ask()\n";
        let expected = "async def ask():\n    return await async_input()\n\nawait ask()\n";
        assert_eq!(rewrite(source), expected);
    }

    #[test]
    fn test_receiver_call_is_wrapped() {
        let source = "\
class Q:
    def make(self):
        return input()
    def go(self):
        return self
def run(q):
    return q.make().go()
";
        let out = rewrite(source);
        assert!(out.contains("return (await q.make()).go()"));
    }

    #[test]
    fn test_strings_and_comments_untouched() {
        let source = "# input() here\ns = 'input()'\nt = r\"{input()}\"\nu = f\"{{input()}}\"\n";
        assert_eq!(rewrite(source), source);
    }

    #[test]
    fn test_input_inside_fstring_field() {
        assert_eq!(
            rewrite("print(f\"Hi {input('name? ')}\")\n"),
            "print(f\"Hi {await async_input('name? ')}\")\n"
        );
        assert_eq!(
            rewrite("s = f'{input().strip()!r:>10}'"),
            "s = f'{(await async_input()).strip()!r:>10}'"
        );
    }

    #[test]
    fn test_fstring_call_makes_definition_suspend() {
        let source = "def greet(): return f\"Hi {input('n')}\"\nprint(greet())\n";
        let expected = "async def greet(): return f\"Hi {await async_input('n')}\"\nprint(await greet())\n";
        assert_eq!(rewrite(source), expected);
    }

    #[test]
    fn test_non_input_code_untouched() {
        let source = "def f(x):\n    return x + 1\n\nprint(f(2))\n";
        assert_eq!(rewrite(source), source);
    }

    #[test]
    fn test_overlap_rejected() {
        let edits = vec![
            Edit::replace(0, 5, "abc".into()),
            Edit::open(2, 9, "await "),
        ];
        assert_eq!(
            apply("0123456789", &edits),
            Err(RewriteError::OverlappingEdit { offset: 2 })
        );
    }
}
