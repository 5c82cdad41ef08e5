use std::ops::Range;

use logos::Logos;

use crate::error::RewriteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    String,
    Op,
    Open,
    Close,
    Newline,
    Indent,
    Dedent,
    EndMarker,
}

/// A token with its byte span in the source and 1-based line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
    pub line: usize,
    /// For `Open` and `Close`, the matching bracket. For the outer literal
    /// fragments of an f-string, the fragment at the other end.
    pub pair: Option<usize>,
}

impl Token {
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }

    pub fn is_op(&self, source: &str, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text(source) == op
    }

    pub fn is_name(&self, source: &str, name: &str) -> bool {
        self.kind == TokenKind::Name && self.text(source) == name
    }
}

// ----------------------------------------------------------------------------
// Raw tokens
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
enum LexFault {
    #[default]
    InvalidCharacter,
    UnterminatedString,
}

impl LexFault {
    fn message(&self) -> &'static str {
        match self {
            LexFault::InvalidCharacter => "invalid character",
            LexFault::UnterminatedString => "unterminated string literal",
        }
    }
}

/// Context-free layer: whitespace, comments and backslash continuations are
/// skipped; indentation is recovered later from the source offsets.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexFault)]
#[logos(skip r"[ \t\f\r]+")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"\\\r?\n")]
enum Raw {
    #[token("\n")]
    Newline,

    /// Replacement-field spans, relative to the start of the literal.
    #[regex(r#"([rRuUbBfF]|[bB][rR]|[rR][bB]|[fF][rR]|[rR][fF])?('|"|'''|""")"#, string_literal)]
    Str(Vec<Range<usize>>),

    #[regex(r"([_a-zA-Z]|[^\x00-\x7F])([_a-zA-Z0-9]|[^\x00-\x7F])*")]
    Name,

    #[regex(r"[0-9][0-9_]*(\.[0-9_]*)?([eE][+-]?[0-9][0-9_]*)?[jJ]?")]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9][0-9_]*)?[jJ]?")]
    #[regex(r"0[xXoObB][0-9a-fA-F_]+")]
    Number,

    #[token("(")]
    #[token("[")]
    #[token("{")]
    Open,

    #[token(")")]
    #[token("]")]
    #[token("}")]
    Close,

    #[regex(r"\*\*=|//=|>>=|<<=|\.\.\.|->|:=|[-+*/%@&|^<>=!]=|\*\*|//|>>|<<|[-+*/%@&|^~<>=.,:;!]")]
    Op,
}

/// Called with the prefix and opening quote matched; consumes the rest.
fn string_literal(lex: &mut logos::Lexer<Raw>) -> Result<Vec<Range<usize>>, LexFault> {
    let opening = lex.slice().as_bytes();
    let quote_len = if opening.len() >= 3 && opening[opening.len() - 3..].iter().all(|&b| b == opening[opening.len() - 1]) {
        3
    } else {
        1
    };
    let (prefix, quote) = opening.split_at(opening.len() - quote_len);
    let is_f = prefix.iter().any(|b| b.eq_ignore_ascii_case(&b'f'));
    let offset = opening.len();
    let (consumed, fields) = scan_body(lex.remainder().as_bytes(), quote, is_f)?;
    lex.bump(consumed);
    Ok(fields
        .into_iter()
        .map(|field| field.start + offset..field.end + offset)
        .collect())
}

/// Scan a literal body up to and including its closing quote. Returns the
/// bytes consumed and, for f-strings, the expression span of each top-level
/// replacement field.
fn scan_body(b: &[u8], quote: &[u8], is_f: bool) -> Result<(usize, Vec<Range<usize>>), LexFault> {
    let triple = quote.len() == 3;
    let mut fields = Vec::new();
    let mut i = 0;
    while let Some(&c) = b.get(i) {
        match c {
            b'\\' => i += 2,
            b'\n' if !triple => break,
            _ if b[i..].starts_with(quote) => return Ok((i + quote.len(), fields)),
            b'{' if is_f && b.get(i + 1) == Some(&b'{') => i += 2,
            b'{' if is_f => {
                let (field, end) = replacement_field(b, i + 1, quote[0], triple)?;
                fields.push(field);
                i = end;
            }
            _ => i += 1,
        }
    }
    Err(LexFault::UnterminatedString)
}

/// The expression of a field starting at `start`, and the offset just past
/// its closing brace. Conversion, `=` and format spec are not part of the
/// expression.
fn replacement_field(b: &[u8], start: usize, quote: u8, triple: bool) -> Result<(Range<usize>, usize), LexFault> {
    let mut depth = 0usize;
    let mut i = start;
    let expr_end = loop {
        let Some(&c) = b.get(i) else {
            return Err(LexFault::UnterminatedString);
        };
        match c {
            b'\n' if !triple => return Err(LexFault::UnterminatedString),
            b'\'' | b'"' => {
                i = nested_string(b, i)?;
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' => depth = depth.saturating_sub(1),
            b'}' if depth > 0 => depth -= 1,
            b'}' | b':' if depth == 0 => break i,
            b'!' if depth == 0 && b.get(i + 1) != Some(&b'=') => break i,
            b'=' if depth == 0 && is_debug_marker(b, i) => break i,
            _ => {}
        }
        i += 1;
    };

    // conversion and format spec; nested `{}` only count
    let mut depth = 0usize;
    loop {
        match b.get(i) {
            None => return Err(LexFault::UnterminatedString),
            Some(b'\n') if !triple => return Err(LexFault::UnterminatedString),
            Some(&c) if c == quote => return Err(LexFault::UnterminatedString),
            Some(b'{') => depth += 1,
            Some(b'}') if depth > 0 => depth -= 1,
            Some(b'}') => return Ok((start..expr_end, i + 1)),
            Some(_) => {}
        }
        i += 1;
    }
}

/// `{x=}`, `{x = !r}`: a lone `=` followed only by the field's tail.
fn is_debug_marker(b: &[u8], i: usize) -> bool {
    let after_operator = i > 0 && matches!(b[i - 1], b'=' | b'!' | b'<' | b'>');
    !after_operator
        && b[i + 1..]
            .iter()
            .find(|c| !c.is_ascii_whitespace())
            .is_some_and(|c| matches!(c, b'}' | b'!' | b':'))
}

/// Skip a string literal inside a replacement field; returns the offset after it.
fn nested_string(b: &[u8], i: usize) -> Result<usize, LexFault> {
    let q = b[i];
    let quote_len = if b[i..].starts_with(&[q, q, q]) { 3 } else { 1 };
    let prefix = b[..i].iter().rev().take_while(|c| c.is_ascii_alphabetic()).take(3);
    let is_f = prefix.clone().count() <= 2 && prefix.clone().any(|c| c.eq_ignore_ascii_case(&b'f'));
    let body = i + quote_len;
    let (consumed, _) = scan_body(&b[body..], &b[i..body], is_f)?;
    Ok(body + consumed)
}

// ----------------------------------------------------------------------------
// Logical lines
// ----------------------------------------------------------------------------

/// Tokenize Python source into the token kinds the block parser needs.
///
/// Follows the shape of CPython's tokenizer: indentation is measured only at
/// the start of a logical line, newlines inside brackets or after a
/// backslash are joined, blank and comment-only lines produce nothing.
/// Plain string literals are single tokens. An f-string is split into
/// literal fragments with the tokens of each replacement field in between,
/// so calls written inside `{}` are seen like any other call.
pub fn tokenize(source: &str) -> Result<Vec<Token>, RewriteError> {
    let mut tokenizer = Tokenizer {
        source,
        lines: std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect(),
        tokens: Vec::new(),
        brackets: Vec::new(),
        indents: vec![0],
    };
    tokenizer.run()?;
    Ok(tokenizer.tokens)
}

struct Tokenizer<'s> {
    source: &'s str,
    /// Byte offset of each physical line start.
    lines: Vec<usize>,
    tokens: Vec<Token>,
    /// Token indices of unclosed brackets.
    brackets: Vec<usize>,
    indents: Vec<usize>,
}

impl Tokenizer<'_> {
    fn run(&mut self) -> Result<(), RewriteError> {
        let source = self.source;
        let mut lexer = Raw::lexer(source);
        let mut line_begin = Some(0);
        while let Some(raw) = lexer.next() {
            let span = lexer.span();
            let raw = raw.map_err(|fault| self.fault(&fault, span.start))?;
            if raw == Raw::Newline {
                if self.brackets.is_empty() {
                    self.newline(span.start);
                    line_begin = Some(span.end);
                }
                continue;
            }
            if let Some(begin) = line_begin.take() {
                self.indentation(begin, span.start)?;
            }
            self.emit(raw, span, 0)?;
        }
        if let Some(&open) = self.brackets.last() {
            let token = self.tokens[open];
            return Err(RewriteError::Unbalanced {
                line: token.line,
                bracket: source.as_bytes()[token.start] as char,
            });
        }
        let end = source.len();
        self.newline(end);
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(TokenKind::Dedent, end..end);
        }
        self.push(TokenKind::EndMarker, end..end);
        Ok(())
    }

    fn line(&self, offset: usize) -> usize {
        self.lines.partition_point(|&start| start <= offset)
    }

    fn fault(&self, fault: &LexFault, offset: usize) -> RewriteError {
        RewriteError::Lex {
            line: self.line(offset),
            message: fault.message().to_string(),
        }
    }

    fn push(&mut self, kind: TokenKind, span: Range<usize>) -> usize {
        self.tokens.push(Token {
            kind,
            start: span.start,
            end: span.end,
            line: self.line(span.start),
            pair: None,
        });
        self.tokens.len() - 1
    }

    /// Ends a logical line, unless it is empty.
    fn newline(&mut self, offset: usize) {
        let ends_line = matches!(
            self.tokens.last().map(|t| t.kind),
            None | Some(TokenKind::Newline | TokenKind::Indent | TokenKind::Dedent)
        );
        if !ends_line {
            self.push(TokenKind::Newline, offset..offset);
        }
    }

    /// Emit Indent/Dedent for a logical line whose first token is at `first`.
    fn indentation(&mut self, begin: usize, first: usize) -> Result<(), RewriteError> {
        let column = self.source[begin..first].bytes().fold(0, |column, b| match b {
            b' ' => column + 1,
            b'\t' => (column / 8 + 1) * 8,
            b'\x0c' => 0,
            _ => column,
        });
        let current = self.indents.last().copied().unwrap_or(0);
        if column > current {
            self.indents.push(column);
            self.push(TokenKind::Indent, first..first);
        } else if column < current {
            while self.indents.last().is_some_and(|&i| i > column) {
                self.indents.pop();
                self.push(TokenKind::Dedent, first..first);
            }
            if self.indents.last() != Some(&column) {
                return Err(RewriteError::Dedent { line: self.line(first) });
            }
        }
        Ok(())
    }

    /// `floor` is the bracket depth a replacement field started at; its
    /// closers may not reach below it.
    fn emit(&mut self, raw: Raw, span: Range<usize>, floor: usize) -> Result<(), RewriteError> {
        match raw {
            // inside a multi-line replacement field
            Raw::Newline => {}
            Raw::Name => {
                self.push(TokenKind::Name, span);
            }
            Raw::Number => {
                self.push(TokenKind::Number, span);
            }
            Raw::Op => {
                self.push(TokenKind::Op, span);
            }
            Raw::Open => {
                let index = self.push(TokenKind::Open, span);
                self.brackets.push(index);
            }
            Raw::Close => self.close(span, floor)?,
            Raw::Str(fields) => self.string(span, &fields)?,
        }
        Ok(())
    }

    fn close(&mut self, span: Range<usize>, floor: usize) -> Result<(), RewriteError> {
        let bytes = self.source.as_bytes();
        let closer = bytes[span.start];
        let expected = match closer {
            b')' => b'(',
            b']' => b'[',
            _ => b'{',
        };
        let open = match self.brackets.last() {
            Some(&open) if self.brackets.len() > floor && bytes[self.tokens[open].start] == expected => open,
            _ => {
                return Err(RewriteError::Unbalanced {
                    line: self.line(span.start),
                    bracket: closer as char,
                });
            }
        };
        self.brackets.pop();
        let index = self.push(TokenKind::Close, span);
        self.tokens[index].pair = Some(open);
        self.tokens[open].pair = Some(index);
        Ok(())
    }

    fn string(&mut self, span: Range<usize>, fields: &[Range<usize>]) -> Result<(), RewriteError> {
        let first = self.tokens.len();
        let mut cursor = span.start;
        for field in fields {
            let field = span.start + field.start..span.start + field.end;
            self.push(TokenKind::String, cursor..field.start);
            self.field(field.clone())?;
            cursor = field.end;
        }
        let last = self.push(TokenKind::String, cursor..span.end);
        if last != first {
            self.tokens[first].pair = Some(last);
            self.tokens[last].pair = Some(first);
        }
        Ok(())
    }

    /// Tokens of one replacement field. Newlines inside it never end a line.
    fn field(&mut self, range: Range<usize>) -> Result<(), RewriteError> {
        let source = self.source;
        let floor = self.brackets.len();
        let mut lexer = Raw::lexer(&source[range.clone()]);
        while let Some(raw) = lexer.next() {
            let local = lexer.span();
            let span = range.start + local.start..range.start + local.end;
            let raw = raw.map_err(|fault| self.fault(&fault, span.start))?;
            self.emit(raw, span, floor)?;
        }
        if self.brackets.len() > floor {
            let open = self.tokens[self.brackets[floor]];
            return Err(RewriteError::Unbalanced {
                line: open.line,
                bracket: source.as_bytes()[open.start] as char,
            });
        }
        Ok(())
    }
}
