use std::ops::Range;

use super::lexer::{Token, TokenKind, tokenize};
use crate::error::RewriteError;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class", "continue",
    "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in",
    "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with",
    "yield",
];

/// Statements that introduce a block.
const COMPOUND: &[&str] = &[
    "if", "elif", "else", "while", "for", "try", "except", "finally", "with", "class",
];

/// Soft keywords that open a block only in block position.
const SOFT_COMPOUND: &[&str] = &["match", "case"];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

// ----------------------------------------------------------------------------
// Tree
// ----------------------------------------------------------------------------

/// Token ranges below index into `Module::tokens` and exclude the Newline.
#[derive(Debug)]
pub struct Module<'s> {
    pub source: &'s str,
    pub tokens: Vec<Token>,
    pub body: Suite,
}

#[derive(Debug, Default)]
pub struct Suite {
    pub statements: Vec<Statement>,
}

#[derive(Debug)]
pub enum Statement {
    Simple(Range<usize>),
    Compound { header: Range<usize>, body: Body },
    Def(FunctionDef),
}

#[derive(Debug)]
pub enum Body {
    Block(Suite),
    /// Statements on the header line, after the colon.
    Inline(Range<usize>),
}

#[derive(Debug)]
pub struct FunctionDef {
    pub name: String,
    pub is_async: bool,
    /// Index of the `def` token.
    pub def_token: usize,
    /// From the first keyword up to, not including, the colon.
    pub header: Range<usize>,
    pub body: Body,
}

/// What a call site calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// `name(...)`
    Name(String),
    /// `receiver.name(...)`
    Method(String),
    /// Anything else: `f()()`, `table[k](...)`.
    Other,
}

impl Callee {
    pub fn name(&self) -> Option<&str> {
        match self {
            Callee::Name(n) | Callee::Method(n) => Some(n),
            Callee::Other => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub callee: Callee,
    /// Token of the called name, when there is one.
    pub name_token: Option<usize>,
    pub open: usize,
    pub close: usize,
    /// First token of the whole primary, receiver included.
    pub primary_start: usize,
}

// ----------------------------------------------------------------------------
// Parsing
// ----------------------------------------------------------------------------

pub fn parse(source: &str) -> Result<Module<'_>, RewriteError> {
    let tokens = tokenize(source)?;
    let body = Parser {
        source,
        tokens: &tokens,
        pos: 0,
    }
    .suite(true)?;
    Ok(Module {
        source,
        tokens,
        body,
    })
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn text(&self, index: usize) -> &'a str {
        self.tokens[index].text(self.source)
    }

    fn syntax(&self, index: usize, message: &str) -> RewriteError {
        RewriteError::Syntax {
            line: self.tokens[index].line,
            message: message.to_string(),
        }
    }

    fn suite(&mut self, top: bool) -> Result<Suite, RewriteError> {
        let mut suite = Suite::default();
        loop {
            let token = self.tokens[self.pos];
            match token.kind {
                TokenKind::EndMarker if top => break,
                TokenKind::EndMarker => return Err(self.syntax(self.pos, "unexpected end of input")),
                TokenKind::Dedent if !top => {
                    self.pos += 1;
                    break;
                }
                TokenKind::Indent | TokenKind::Dedent => {
                    return Err(RewriteError::UnexpectedIndent { line: token.line });
                }
                TokenKind::Newline => self.pos += 1,
                _ => suite.statements.push(self.statement()?),
            }
        }
        Ok(suite)
    }

    /// Index of the Newline ending the logical line that starts at `start`.
    fn line_end(&self, start: usize) -> usize {
        let mut i = start;
        while !matches!(self.tokens[i].kind, TokenKind::Newline | TokenKind::EndMarker) {
            i += 1;
        }
        i
    }

    fn statement(&mut self) -> Result<Statement, RewriteError> {
        let start = self.pos;
        let end = self.line_end(start);
        let is_async = self.text(start) == "async"
            && self.tokens[start].kind == TokenKind::Name
            && matches!(self.text(start + 1), "def" | "for" | "with");
        let keyword = if is_async { start + 1 } else { start };
        let word = if self.tokens[keyword].kind == TokenKind::Name {
            self.text(keyword)
        } else {
            ""
        };

        if word == "def" {
            let name = keyword + 1;
            if self.tokens[name].kind != TokenKind::Name {
                return Err(self.syntax(name, "expected a function name after 'def'"));
            }
            let name = self.text(name).to_string();
            let colon = self.header_colon(keyword, end)?;
            let body = self.body(colon, end)?;
            return Ok(Statement::Def(FunctionDef {
                name,
                is_async,
                def_token: keyword,
                header: start..colon,
                body,
            }));
        }

        let soft_block = SOFT_COMPOUND.contains(&word)
            && end > keyword + 1
            && self.tokens[keyword + 1].kind != TokenKind::Op
            && self.tokens[end - 1].is_op(self.source, ":");
        if COMPOUND.contains(&word) || is_async || soft_block {
            let colon = self.header_colon(keyword, end)?;
            let body = self.body(colon, end)?;
            return Ok(Statement::Compound {
                header: start..colon,
                body,
            });
        }

        self.pos = end + 1;
        Ok(Statement::Simple(start..end))
    }

    /// First `:` at bracket depth zero that is not a lambda's.
    fn header_colon(&self, from: usize, end: usize) -> Result<usize, RewriteError> {
        let mut lambdas = 0;
        let mut i = from;
        while i < end {
            let token = self.tokens[i];
            match token.kind {
                TokenKind::Open => {
                    i = token.pair.unwrap_or(i);
                }
                TokenKind::Name if self.text(i) == "lambda" => lambdas += 1,
                TokenKind::Op if self.text(i) == ":" => {
                    if lambdas == 0 {
                        return Ok(i);
                    }
                    lambdas -= 1;
                }
                _ => {}
            }
            i += 1;
        }
        Err(self.syntax(from, "expected ':'"))
    }

    /// Body after a header colon: inline statements or an indented block.
    fn body(&mut self, colon: usize, end: usize) -> Result<Body, RewriteError> {
        if colon + 1 < end {
            self.pos = end + 1;
            return Ok(Body::Inline(colon + 1..end));
        }
        self.pos = end + 1;
        if self.tokens.get(self.pos).map(|t| t.kind) != Some(TokenKind::Indent) {
            return Err(self.syntax(colon, "expected an indented block"));
        }
        self.pos += 1;
        Ok(Body::Block(self.suite(false)?))
    }
}

// ----------------------------------------------------------------------------
// Call sites
// ----------------------------------------------------------------------------

impl Module<'_> {
    fn text(&self, index: usize) -> &str {
        self.tokens[index].text(self.source)
    }

    fn is_plain_name(&self, index: usize) -> bool {
        self.tokens[index].kind == TokenKind::Name && !is_keyword(self.text(index))
    }

    /// Every call whose opening parenthesis lies in `range`.
    pub fn calls_in(&self, range: Range<usize>) -> Vec<CallSite> {
        let mut calls = Vec::new();
        for open in range.clone() {
            let token = self.tokens[open];
            if token.kind != TokenKind::Open || self.text(open) != "(" || open <= range.start {
                continue;
            }
            let Some(close) = token.pair else { continue };
            let prev = open - 1;
            let site = if self.is_plain_name(prev) {
                let defined = prev > 0 && matches!(self.text(prev - 1), "def" | "class");
                if defined {
                    continue;
                }
                let is_method = prev > 0 && self.tokens[prev - 1].is_op(self.source, ".");
                let name = self.text(prev).to_string();
                CallSite {
                    callee: if is_method {
                        Callee::Method(name)
                    } else {
                        Callee::Name(name)
                    },
                    name_token: Some(prev),
                    open,
                    close,
                    primary_start: self.primary_start(prev),
                }
            } else if self.tokens[prev].kind == TokenKind::Close {
                CallSite {
                    callee: Callee::Other,
                    name_token: None,
                    open,
                    close,
                    primary_start: self.primary_start(open),
                }
            } else {
                continue;
            };
            calls.push(site);
        }
        calls
    }

    /// Walk back from token `p` over attribute access, calls and subscripts
    /// to the first token of the enclosing primary expression.
    fn primary_start(&self, mut p: usize) -> usize {
        loop {
            if p == 0 {
                return p;
            }
            let prev = p - 1;
            if self.tokens[prev].is_op(self.source, ".") && prev > 0 {
                let atom = prev - 1;
                let token = self.tokens[atom];
                p = match token.kind {
                    // a split f-string links its last fragment to its first
                    TokenKind::Close | TokenKind::String => token.pair.unwrap_or(atom),
                    TokenKind::Name | TokenKind::Number => atom,
                    _ => return p,
                };
                continue;
            }
            let trailer = self.tokens[p].kind == TokenKind::Open;
            if trailer && self.is_plain_name(prev) {
                p = prev;
                continue;
            }
            if trailer && self.tokens[prev].kind == TokenKind::Close {
                p = self.tokens[prev].pair.unwrap_or(prev);
                continue;
            }
            return p;
        }
    }
}
