use crate::token::{Span, SpannedToken, Token};
use lunaria_core::string::StringInterner;
use std::fmt;

/// Lexer error.
#[derive(Clone, Debug, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

impl std::error::Error for LexError {}

/// Pull-based lexer for Lua 5.2 with one token of lookahead.
pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
    current: Option<Result<SpannedToken, LexError>>,
    pub strings: StringInterner,
    /// Original text of the current token, for "near '...'" messages.
    pub token_text: String,
    /// Line number of the last consumed token.
    pub lastline: u32,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source bytes.
    pub fn new(source: &'a [u8]) -> Self {
        Self::with_strings(source, StringInterner::new())
    }

    /// Create a new lexer reusing an existing string interner.
    pub fn with_strings(source: &'a [u8], strings: StringInterner) -> Self {
        let mut lexer = Lexer {
            source,
            pos: 0,
            line: 1,
            column: 1,
            current: None,
            strings,
            token_text: String::new(),
            lastline: 1,
        };
        // Prime the first token
        lexer.current = Some(lexer.scan_token());
        lexer
    }

    /// Peek at the current token without consuming.
    pub fn current(&self) -> Result<&SpannedToken, &LexError> {
        match &self.current {
            Some(Ok(tok)) => Ok(tok),
            Some(Err(e)) => Err(e),
            None => unreachable!("lexer should always have a current token"),
        }
    }

    /// Consume the current token and advance to the next one.
    pub fn advance(&mut self) -> Result<SpannedToken, LexError> {
        if let Some(Ok(ref tok)) = self.current {
            self.lastline = tok.span.line;
        }
        let prev = self.current.take().unwrap();
        self.current = Some(self.scan_token());
        prev
    }

    /// Get current line number.
    pub fn line(&self) -> u32 {
        self.line
    }

    // ---- Internal scanning ----

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance_char(&mut self) -> Option<u8> {
        let ch = self.source.get(self.pos).copied()?;
        self.pos += 1;
        if ch == b'\n' {
            // \n\r counts as a single newline
            if self.peek() == Some(b'\r') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else if ch == b'\r' {
            if self.peek() == Some(b'\n') {
                self.pos += 1;
            }
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while let Some(ch) = self.peek() {
                if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0C' | b'\x0B') {
                    self.advance_char();
                } else {
                    break;
                }
            }

            if self.peek() == Some(b'-') && self.peek_at(1) == Some(b'-') {
                self.advance_char();
                self.advance_char();
                if self.peek() == Some(b'[') {
                    if let Some(level) = self.check_long_bracket() {
                        // Long comment; an unterminated one errors at the
                        // next scan_token call.
                        if self.scan_long_string_content(level).is_err() {
                            return;
                        }
                        continue;
                    }
                }
                // Short comment: to end of line
                while let Some(ch) = self.peek() {
                    if ch == b'\n' || ch == b'\r' {
                        break;
                    }
                    self.advance_char();
                }
                continue;
            }

            break;
        }
    }

    /// Check if current position starts a long bracket `[=*[`. Returns the level if so.
    fn check_long_bracket(&self) -> Option<usize> {
        if self.peek() != Some(b'[') {
            return None;
        }
        let mut level = 0;
        let mut offset = 1;
        while self.peek_at(offset) == Some(b'=') {
            level += 1;
            offset += 1;
        }
        if self.peek_at(offset) == Some(b'[') {
            Some(level)
        } else {
            None
        }
    }

    fn scan_token(&mut self) -> Result<SpannedToken, LexError> {
        self.skip_whitespace_and_comments();

        let token_start = self.pos;
        let result = self.scan_token_inner();
        let token_end = self.pos;
        if token_start < token_end && token_start < self.source.len() {
            self.token_text =
                String::from_utf8_lossy(&self.source[token_start..token_end]).into_owned();
        }
        result
    }

    fn err(&self, span: Span, message: String) -> LexError {
        LexError {
            message,
            line: span.line,
            column: span.column,
        }
    }

    fn scan_token_inner(&mut self) -> Result<SpannedToken, LexError> {
        let span = Span {
            line: self.line,
            column: self.column,
        };
        let tok = |token| Ok(SpannedToken { token, span });

        let ch = match self.peek() {
            Some(ch) => ch,
            None => {
                self.token_text = "<eof>".to_string();
                return tok(Token::Eof);
            }
        };

        match ch {
            b'+' => {
                self.advance_char();
                tok(Token::Plus)
            }
            b'-' => {
                // Comments were consumed by skip_whitespace_and_comments
                self.advance_char();
                tok(Token::Minus)
            }
            b'*' => {
                self.advance_char();
                tok(Token::Star)
            }
            b'/' => {
                self.advance_char();
                tok(Token::Slash)
            }
            b'%' => {
                self.advance_char();
                tok(Token::Percent)
            }
            b'^' => {
                self.advance_char();
                tok(Token::Caret)
            }
            b'#' => {
                self.advance_char();
                tok(Token::Hash)
            }
            b'(' => {
                self.advance_char();
                tok(Token::LParen)
            }
            b')' => {
                self.advance_char();
                tok(Token::RParen)
            }
            b'{' => {
                self.advance_char();
                tok(Token::LBrace)
            }
            b'}' => {
                self.advance_char();
                tok(Token::RBrace)
            }
            b']' => {
                self.advance_char();
                tok(Token::RBracket)
            }
            b';' => {
                self.advance_char();
                tok(Token::Semi)
            }
            b',' => {
                self.advance_char();
                tok(Token::Comma)
            }
            b'<' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    tok(Token::LessEq)
                } else {
                    tok(Token::Less)
                }
            }
            b'>' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    tok(Token::GreaterEq)
                } else {
                    tok(Token::Greater)
                }
            }
            b'=' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    tok(Token::Equal)
                } else {
                    tok(Token::Assign)
                }
            }
            b'~' => {
                self.advance_char();
                if self.peek() == Some(b'=') {
                    self.advance_char();
                    tok(Token::NotEqual)
                } else {
                    // Lua 5.2 has no standalone '~'
                    Err(self.err(span, "unexpected symbol near '~'".to_string()))
                }
            }
            b':' => {
                self.advance_char();
                if self.peek() == Some(b':') {
                    self.advance_char();
                    tok(Token::DoubleColon)
                } else {
                    tok(Token::Colon)
                }
            }
            b'.' => {
                self.advance_char();
                if self.peek() == Some(b'.') {
                    self.advance_char();
                    if self.peek() == Some(b'.') {
                        self.advance_char();
                        tok(Token::DotDotDot)
                    } else {
                        tok(Token::DotDot)
                    }
                } else if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.scan_number_after_dot(span)
                } else {
                    tok(Token::Dot)
                }
            }
            b'[' => {
                if let Some(level) = self.check_long_bracket() {
                    self.scan_long_string(level, span)
                } else {
                    self.advance_char();
                    tok(Token::LBracket)
                }
            }
            b'"' | b'\'' => self.scan_short_string(span),
            b'0'..=b'9' => self.scan_number(span),
            _ if is_ident_start(ch) => self.scan_name(span),
            _ => {
                self.advance_char();
                let near_str = if ch.is_ascii_graphic() || ch == b' ' {
                    format!("'{}'", ch as char)
                } else {
                    format!("'<\\{}>'", ch)
                };
                Err(self.err(span, format!("unexpected symbol near {near_str}")))
            }
        }
    }

    fn scan_name(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let start = self.pos;
        while let Some(ch) = self.peek() {
            if is_ident_continue(ch) {
                self.advance_char();
            } else {
                break;
            }
        }
        let name = &self.source[start..self.pos];
        let name_str = std::str::from_utf8(name).unwrap_or("");

        if let Some(keyword) = Token::keyword_from_str(name_str) {
            Ok(SpannedToken {
                token: keyword,
                span,
            })
        } else {
            let id = self.strings.intern(name);
            Ok(SpannedToken {
                token: Token::Name(id),
                span,
            })
        }
    }

    fn scan_number(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let start = self.pos;

        if self.peek() == Some(b'0') && self.peek_at(1).is_some_and(|c| c == b'x' || c == b'X') {
            self.advance_char(); // 0
            self.advance_char(); // x/X
            self.scan_hex_number(start, span)
        } else {
            self.scan_decimal_number(start, span)
        }
    }

    /// Consume exponent digits after an already-consumed e/E/p/P marker.
    fn scan_exponent_digits(&mut self, span: Span) -> Result<(), LexError> {
        if let Some(s) = self.peek() {
            if s == b'+' || s == b'-' {
                self.advance_char();
            }
        }
        let exp_start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance_char();
            } else {
                break;
            }
        }
        if self.pos == exp_start {
            return Err(self.err(span, "malformed number: expected exponent digits".to_string()));
        }
        Ok(())
    }

    /// A number immediately followed by a letter is malformed; consume
    /// the rest of the word so the message shows the whole thing.
    fn check_number_suffix(&mut self, start: usize, span: Span) -> Result<(), LexError> {
        if let Some(ch) = self.peek() {
            if ch.is_ascii_alphabetic() || ch == b'_' {
                while let Some(ch) = self.peek() {
                    if ch.is_ascii_alphanumeric() || ch == b'_' || ch == b'.' {
                        self.advance_char();
                    } else {
                        break;
                    }
                }
                let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap_or("?");
                return Err(self.err(span, format!("malformed number near '{text}'")));
            }
        }
        Ok(())
    }

    fn scan_decimal_number(&mut self, start: usize, span: Span) -> Result<SpannedToken, LexError> {
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance_char();
            } else {
                break;
            }
        }

        // Fractional part ('..' is the concat operator, not a fraction)
        if self.peek() == Some(b'.') && self.peek_at(1) != Some(b'.') {
            self.advance_char();
            while let Some(ch) = self.peek() {
                if ch.is_ascii_digit() {
                    self.advance_char();
                } else {
                    break;
                }
            }
        }

        if let Some(ch) = self.peek() {
            if ch == b'e' || ch == b'E' {
                self.advance_char();
                self.scan_exponent_digits(span)?;
            }
        }

        self.check_number_suffix(start, span)?;

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        match text.parse::<f64>() {
            Ok(f) => Ok(SpannedToken {
                token: Token::Number(f),
                span,
            }),
            Err(_) => Err(self.err(span, format!("malformed number: '{text}'"))),
        }
    }

    fn scan_hex_number(&mut self, start: usize, span: Span) -> Result<SpannedToken, LexError> {
        let hex_start = self.pos;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_hexdigit() {
                self.advance_char();
            } else {
                break;
            }
        }
        let mut saw_digits = self.pos > hex_start;

        if self.peek() == Some(b'.') {
            self.advance_char();
            let frac_start = self.pos;
            while let Some(ch) = self.peek() {
                if ch.is_ascii_hexdigit() {
                    self.advance_char();
                } else {
                    break;
                }
            }
            saw_digits |= self.pos > frac_start;
        }

        if !saw_digits {
            return Err(self.err(span, "malformed number: no hex digits after '0x'".to_string()));
        }

        if let Some(ch) = self.peek() {
            if ch == b'p' || ch == b'P' {
                self.advance_char();
                self.scan_exponent_digits(span)?;
            }
        }

        self.check_number_suffix(start, span)?;

        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        match parse_hex_number(text) {
            Some(f) => Ok(SpannedToken {
                token: Token::Number(f),
                span,
            }),
            None => Err(self.err(span, format!("malformed number: '{text}'"))),
        }
    }

    /// Scan a number that started with a dot (already consumed).
    fn scan_number_after_dot(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let start = self.pos - 1; // include the dot
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                self.advance_char();
            } else {
                break;
            }
        }
        if let Some(ch) = self.peek() {
            if ch == b'e' || ch == b'E' {
                self.advance_char();
                self.scan_exponent_digits(span)?;
            }
        }
        self.check_number_suffix(start, span)?;
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        match text.parse::<f64>() {
            Ok(f) => Ok(SpannedToken {
                token: Token::Number(f),
                span,
            }),
            Err(_) => Err(self.err(span, format!("malformed number: '{text}'"))),
        }
    }

    /// Build the "near" token for string error messages: the raw source
    /// from `start_pos` up to (optionally including) the current byte.
    fn string_near_token(&self, start_pos: usize, include_current: bool) -> String {
        let end = if include_current && self.pos < self.source.len() {
            self.pos + 1
        } else {
            self.pos
        };
        let end = end.min(self.source.len());
        let raw = &self.source[start_pos..end];
        let truncated = if raw.len() > 50 { &raw[..50] } else { raw };
        format!("'{}'", String::from_utf8_lossy(truncated))
    }

    fn scan_short_string(&mut self, span: Span) -> Result<SpannedToken, LexError> {
        let string_start = self.pos; // position of the opening quote
        let quote = self.advance_char().unwrap();
        let mut buf = Vec::new();

        loop {
            match self.peek() {
                None => {
                    return Err(self.err(span, "unfinished string near <eof>".to_string()));
                }
                Some(b'\n') | Some(b'\r') => {
                    return Err(self.err(
                        span,
                        format!(
                            "unfinished string near {}",
                            self.string_near_token(string_start, false)
                        ),
                    ));
                }
                Some(ch) if ch == quote => {
                    self.advance_char();
                    break;
                }
                Some(b'\\') => {
                    self.advance_char();
                    self.scan_escape(string_start, span, &mut buf)?;
                }
                Some(ch) => {
                    self.advance_char();
                    buf.push(ch);
                }
            }
        }

        let id = self.strings.intern(&buf);
        Ok(SpannedToken {
            token: Token::String(id),
            span,
        })
    }

    /// One escape sequence; the backslash is already consumed.
    fn scan_escape(
        &mut self,
        string_start: usize,
        span: Span,
        buf: &mut Vec<u8>,
    ) -> Result<(), LexError> {
        let invalid = |lx: &Self| {
            lx.err(
                span,
                format!(
                    "invalid escape sequence near {}",
                    lx.string_near_token(string_start, true)
                ),
            )
        };
        match self.peek() {
            Some(b'a') => {
                self.advance_char();
                buf.push(0x07);
            }
            Some(b'b') => {
                self.advance_char();
                buf.push(0x08);
            }
            Some(b'f') => {
                self.advance_char();
                buf.push(0x0C);
            }
            Some(b'n') => {
                self.advance_char();
                buf.push(b'\n');
            }
            Some(b'r') => {
                self.advance_char();
                buf.push(b'\r');
            }
            Some(b't') => {
                self.advance_char();
                buf.push(b'\t');
            }
            Some(b'v') => {
                self.advance_char();
                buf.push(0x0B);
            }
            Some(b'\\') => {
                self.advance_char();
                buf.push(b'\\');
            }
            Some(b'\'') => {
                self.advance_char();
                buf.push(b'\'');
            }
            Some(b'"') => {
                self.advance_char();
                buf.push(b'"');
            }
            Some(b'\n') | Some(b'\r') => {
                // Escaped newline becomes \n in the string
                self.advance_char();
                buf.push(b'\n');
            }
            Some(b'x') => {
                self.advance_char();
                let mut val: u8 = 0;
                for _ in 0..2 {
                    match self.peek() {
                        Some(ch) if ch.is_ascii_hexdigit() => {
                            self.advance_char();
                            val = (val << 4) | hex_value(ch);
                        }
                        _ => return Err(invalid(self)),
                    }
                }
                buf.push(val);
            }
            Some(b'z') => {
                self.advance_char();
                while let Some(ch) = self.peek() {
                    if matches!(ch, b' ' | b'\t' | b'\n' | b'\r' | b'\x0C' | b'\x0B') {
                        self.advance_char();
                    } else {
                        break;
                    }
                }
            }
            Some(ch) if ch.is_ascii_digit() => {
                // \ddd, up to 3 decimal digits
                let mut val: u16 = (ch - b'0') as u16;
                self.advance_char();
                for _ in 0..2 {
                    if let Some(d) = self.peek() {
                        if d.is_ascii_digit() {
                            val = val * 10 + (d - b'0') as u16;
                            self.advance_char();
                        } else {
                            break;
                        }
                    }
                }
                if val > 255 {
                    return Err(self.err(
                        span,
                        format!(
                            "decimal escape too large near {}",
                            self.string_near_token(string_start, true)
                        ),
                    ));
                }
                buf.push(val as u8);
            }
            Some(_) => return Err(invalid(self)),
            None => {
                return Err(self.err(span, "unfinished string near <eof>".to_string()));
            }
        }
        Ok(())
    }

    fn scan_long_string(&mut self, level: usize, span: Span) -> Result<SpannedToken, LexError> {
        // Skip opening [=*[
        self.advance_char(); // [
        for _ in 0..level {
            self.advance_char(); // =
        }
        self.advance_char(); // [

        let content = self.scan_long_string_content(level)?;
        let id = self.strings.intern(&content);
        Ok(SpannedToken {
            token: Token::String(id),
            span,
        })
    }

    fn scan_long_string_content(&mut self, level: usize) -> Result<Vec<u8>, LexError> {
        let mut buf = Vec::new();
        let mut first_newline = true;

        loop {
            match self.peek() {
                None => {
                    return Err(LexError {
                        message: "unfinished long string near <eof>".to_string(),
                        line: self.line,
                        column: self.column,
                    });
                }
                Some(b']') => {
                    if self.check_closing_long_bracket(level) {
                        self.advance_char(); // ]
                        for _ in 0..level {
                            self.advance_char(); // =
                        }
                        self.advance_char(); // ]
                        return Ok(buf);
                    }
                    self.advance_char();
                    buf.push(b']');
                }
                Some(b'\n') | Some(b'\r') => {
                    self.advance_char();
                    if first_newline && buf.is_empty() {
                        // First newline right after the bracket is dropped
                        first_newline = false;
                        continue;
                    }
                    buf.push(b'\n');
                    first_newline = false;
                }
                Some(ch) => {
                    first_newline = false;
                    self.advance_char();
                    buf.push(ch);
                }
            }
        }
    }

    fn check_closing_long_bracket(&self, level: usize) -> bool {
        if self.peek() != Some(b']') {
            return false;
        }
        let mut offset = 1;
        for _ in 0..level {
            if self.peek_at(offset) != Some(b'=') {
                return false;
            }
            offset += 1;
        }
        self.peek_at(offset) == Some(b']')
    }
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_ident_continue(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

fn hex_value(ch: u8) -> u8 {
    match ch {
        b'0'..=b'9' => ch - b'0',
        b'a'..=b'f' => ch - b'a' + 10,
        b'A'..=b'F' => ch - b'A' + 10,
        _ => unreachable!(),
    }
}

/// Parse a hex literal (with optional fraction and p-exponent) into a
/// double, like PUC's lua_strx2number.
fn parse_hex_number(text: &str) -> Option<f64> {
    let text = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))?;

    let (mantissa_str, exp_str) = match text.find(['p', 'P']) {
        Some(p) => (&text[..p], Some(&text[p + 1..])),
        None => (text, None),
    };

    let (int_part, frac_part) = match mantissa_str.find('.') {
        Some(dot) => (&mantissa_str[..dot], Some(&mantissa_str[dot + 1..])),
        None => (mantissa_str, None),
    };

    let mut mantissa: f64 = 0.0;
    for ch in int_part.bytes() {
        if !ch.is_ascii_hexdigit() {
            return None;
        }
        mantissa = mantissa * 16.0 + hex_value(ch) as f64;
    }
    if let Some(frac) = frac_part {
        let mut place = 1.0 / 16.0;
        for ch in frac.bytes() {
            if !ch.is_ascii_hexdigit() {
                return None;
            }
            mantissa += hex_value(ch) as f64 * place;
            place /= 16.0;
        }
    }

    let exponent: i32 = match exp_str {
        Some(s) => s.parse().ok()?,
        None => 0,
    };

    Some(mantissa * (2.0f64).powi(exponent))
}
