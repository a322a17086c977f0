use std::fmt;

use anyhow::anyhow;

/// Keywords recognized at word boundaries. `return` is special-cased by the
/// lexer because the parser consumes it through a dedicated helper.
const KEYWORDS: [&str; 24] = [
    "if", "else", "while", "for", "int", "char", "sizeof", "struct", "typedef", "short", "long",
    "void", "_Bool", "enum", "static", "break", "continue", "goto", "switch", "case", "default",
    "extern", "_Alignof", "do",
];

const PUNCT3: [&str; 2] = ["<<=", ">>="];

const PUNCT2: [&str; 18] = [
    "<=", ">=", "==", "!=", "->", "++", "--", "+=", "-=", "*=", "/=", "&&", "||", "<<", ">>", "&=",
    "|=", "^=",
];

const PUNCT1: &[u8] = b"+-*/(){}[]<>;:=,.&!?~|^";

/// One translation unit of preprocessed source plus its file name, used both
/// as lexer input and to render caret diagnostics:
///
/// ```text
/// foo.c:10: x = y + + 5;
///                   ^ expected an expression
/// ```
pub struct SourceFile {
    pub name: String,
    pub src: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, src: impl Into<String>) -> Self {
        let mut src = src.into();
        if !src.ends_with('\n') {
            src.push('\n');
        }
        SourceFile {
            name: name.into(),
            src,
        }
    }

    /// Fatal diagnostic anchored at byte offset `loc`.
    pub fn error_at(&self, loc: usize, msg: impl fmt::Display) -> anyhow::Error {
        anyhow!("{}", self.render_at(loc, &msg.to_string()))
    }

    /// Non-fatal diagnostic; printed to stderr immediately.
    pub fn warn_at(&self, loc: usize, msg: impl fmt::Display) {
        eprintln!("{}", self.render_at(loc, &msg.to_string()));
    }

    fn render_at(&self, loc: usize, msg: &str) -> String {
        let src = self.src.as_bytes();
        let loc = loc.min(src.len().saturating_sub(1));

        let mut line_start = loc;
        while line_start > 0 && src[line_start - 1] != b'\n' {
            line_start -= 1;
        }
        let mut line_end = loc;
        while line_end < src.len() && src[line_end] != b'\n' {
            line_end += 1;
        }
        let line_num = 1 + src[..line_start].iter().filter(|&&b| b == b'\n').count();

        let prefix = format!("{}:{}: ", self.name, line_num);
        let line = String::from_utf8_lossy(&src[line_start..line_end]);
        let caret_col = prefix.len() + (loc - line_start);
        format!("{}{}\n{}^ {}", prefix, line, " ".repeat(caret_col), msg)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Punctuator or keyword; the lexeme is read back from the source.
    Reserved,
    Ident,
    /// Integer or character literal.
    Num(i64),
    /// Decoded string literal contents, NUL terminator included.
    Str(Vec<u8>),
    Return,
    Eof,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the lexeme in the source.
    pub loc: usize,
    pub len: usize,
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_alnum(c: u8) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

fn escape_char(c: u8) -> u8 {
    match c {
        b'a' => 7,
        b'b' => 8,
        b't' => b'\t',
        b'n' => b'\n',
        b'v' => 11,
        b'f' => 12,
        b'r' => b'\r',
        b'e' => 27,
        b'0' => 0,
        _ => c,
    }
}

struct Lexer<'a> {
    file: &'a SourceFile,
    src: &'a [u8],
    pos: usize,
    out: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn push(&mut self, kind: TokenKind, loc: usize, len: usize) {
        self.out.push(Token { kind, loc, len });
    }

    fn rest(&self) -> &'a [u8] {
        &self.src[self.pos..]
    }

    fn reserved_word(&self) -> Option<&'static str> {
        let rest = self.rest();
        for kw in KEYWORDS {
            if rest.starts_with(kw.as_bytes()) && !rest.get(kw.len()).copied().is_some_and(is_alnum)
            {
                return Some(kw);
            }
        }
        None
    }

    fn read_string_literal(&mut self) -> anyhow::Result<()> {
        let start = self.pos;
        self.pos += 1;
        let mut buf = Vec::new();
        loop {
            if buf.len() == 1024 {
                return Err(self.file.error_at(start, "string literal too large"));
            }
            match self.rest().first() {
                None => return Err(self.file.error_at(start, "unclosed string literal")),
                Some(b'"') => break,
                Some(b'\\') => {
                    let c = *self
                        .src
                        .get(self.pos + 1)
                        .ok_or_else(|| self.file.error_at(start, "unclosed string literal"))?;
                    buf.push(escape_char(c));
                    self.pos += 2;
                }
                Some(&c) => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
        self.pos += 1;
        buf.push(0);
        self.push(TokenKind::Str(buf), start, self.pos - start);
        Ok(())
    }

    fn read_char_literal(&mut self) -> anyhow::Result<()> {
        let start = self.pos;
        self.pos += 1;
        let c = match self.rest().first() {
            None => return Err(self.file.error_at(start, "unclosed character literal")),
            Some(b'\\') => {
                let c = *self
                    .src
                    .get(self.pos + 1)
                    .ok_or_else(|| self.file.error_at(start, "unclosed character literal"))?;
                self.pos += 2;
                escape_char(c)
            }
            Some(&c) => {
                self.pos += 1;
                c
            }
        };
        if self.rest().first() != Some(&b'\'') {
            return Err(self.file.error_at(start, "character literal too long"));
        }
        self.pos += 1;
        self.push(TokenKind::Num(i64::from(c)), start, self.pos - start);
        Ok(())
    }

    fn read_int_literal(&mut self) -> anyhow::Result<()> {
        let start = self.pos;
        let rest = self.rest();

        let base: u32 = if (rest.starts_with(b"0x") || rest.starts_with(b"0X"))
            && rest.get(2).copied().is_some_and(is_alnum)
        {
            self.pos += 2;
            16
        } else if (rest.starts_with(b"0b") || rest.starts_with(b"0B"))
            && rest.get(2).copied().is_some_and(is_alnum)
        {
            self.pos += 2;
            2
        } else if rest[0] == b'0' {
            8
        } else {
            10
        };

        let mut val: i64 = 0;
        while let Some(d) = self
            .rest()
            .first()
            .and_then(|&c| char::from(c).to_digit(base))
        {
            val = val.wrapping_mul(i64::from(base)).wrapping_add(i64::from(d));
            self.pos += 1;
        }
        if self.rest().first().copied().is_some_and(is_alnum) {
            return Err(self.file.error_at(self.pos, "invalid digit in number"));
        }
        self.push(TokenKind::Num(val), start, self.pos - start);
        Ok(())
    }

    fn run(mut self) -> anyhow::Result<Vec<Token>> {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];

            if c.is_ascii_whitespace() {
                self.pos += 1;
                continue;
            }

            if self.rest().starts_with(b"//") {
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }

            if self.rest().starts_with(b"/*") {
                let close = (self.pos + 2..self.src.len())
                    .find(|&i| self.src[i..].starts_with(b"*/"))
                    .ok_or_else(|| self.file.error_at(self.pos, "unclosed block comment"))?;
                self.pos = close + 2;
                continue;
            }

            if self.rest().starts_with(b"return") && !self.rest().get(6).copied().is_some_and(is_alnum) {
                self.push(TokenKind::Return, self.pos, 6);
                self.pos += 6;
                continue;
            }

            if let Some(kw) = self.reserved_word() {
                self.push(TokenKind::Reserved, self.pos, kw.len());
                self.pos += kw.len();
                continue;
            }

            if let Some(p) = PUNCT3.iter().find(|p| self.rest().starts_with(p.as_bytes())) {
                self.push(TokenKind::Reserved, self.pos, p.len());
                self.pos += p.len();
                continue;
            }

            if let Some(p) = PUNCT2.iter().find(|p| self.rest().starts_with(p.as_bytes())) {
                self.push(TokenKind::Reserved, self.pos, p.len());
                self.pos += p.len();
                continue;
            }

            if PUNCT1.contains(&c) {
                self.push(TokenKind::Reserved, self.pos, 1);
                self.pos += 1;
                continue;
            }

            if c == b'"' {
                self.read_string_literal()?;
                continue;
            }

            if c == b'\'' {
                self.read_char_literal()?;
                continue;
            }

            if is_alpha(c) {
                let start = self.pos;
                while self.rest().first().copied().is_some_and(is_alnum) {
                    self.pos += 1;
                }
                self.push(TokenKind::Ident, start, self.pos - start);
                continue;
            }

            if c.is_ascii_digit() {
                self.read_int_literal()?;
                continue;
            }

            return Err(self.file.error_at(self.pos, "invalid token"));
        }

        self.push(TokenKind::Eof, self.pos, 0);
        Ok(self.out)
    }
}

/// Splits the whole translation unit into tokens, ending with [`TokenKind::Eof`].
pub fn tokenize(file: &SourceFile) -> anyhow::Result<Vec<Token>> {
    Lexer {
        file,
        src: file.src.as_bytes(),
        pos: 0,
        out: Vec::new(),
    }
    .run()
}
