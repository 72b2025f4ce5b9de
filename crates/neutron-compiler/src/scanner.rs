//! scanner.rs — Lexeur Neutron : source → tokens.
//!
//! - Commentaires `//` et `/* ... */`
//! - Chaînes avec échappements `\n \t \r \\ \" \0`
//! - Nombres : partie entière, fraction, exposant optionnel
//! - Identifiants / mots-clés (dont les annotations `int`, `float`, …)
//!
//! Le scanner suit ligne et colonne pour le rapport d'erreurs ; une erreur
//! lexicale arrête tout (LexicalError).

use crate::error::{CompileError, CompileErrorKind};
use crate::token::{Token, TokenKind};

pub struct Scanner<'src> {
    src: &'src [u8],
    file: String,
    start: usize,
    current: usize,
    line: u32,
    column: u32,
    start_column: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str, file: impl Into<String>) -> Self {
        Self {
            src: source.as_bytes(),
            file: file.into(),
            start: 0,
            current: 0,
            line: 1,
            column: 1,
            start_column: 1,
        }
    }

    /// Scanne tout le fichier d'un coup.
    pub fn scan_tokens(mut self) -> Result<Vec<Token>, CompileError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.scan_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn scan_token(&mut self) -> Result<Token, CompileError> {
        self.skip_whitespace()?;
        self.start = self.current;
        self.start_column = self.column;

        let Some(c) = self.advance() else {
            return Ok(self.make(TokenKind::Eof));
        };

        use TokenKind::*;
        let kind = match c {
            b'(' => LeftParen,
            b')' => RightParen,
            b'{' => LeftBrace,
            b'}' => RightBrace,
            b'[' => LeftBracket,
            b']' => RightBracket,
            b',' => Comma,
            b'.' => Dot,
            b'-' => Minus,
            b'+' => Plus,
            b';' => Semicolon,
            b'/' => Slash,
            b'*' => Star,
            b':' => Colon,
            b'%' => Percent,
            b'^' => Caret,
            b'~' => Tilde,
            b'?' => Question,
            b'&' => {
                if self.matches(b'&') {
                    AmpAmp
                } else {
                    Ampersand
                }
            }
            b'|' => {
                if self.matches(b'|') {
                    PipePipe
                } else {
                    Pipe
                }
            }
            b'!' => {
                if self.matches(b'=') {
                    BangEqual
                } else {
                    Bang
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    EqualEqual
                } else if self.matches(b'>') {
                    Arrow
                } else {
                    Equal
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    LessEqual
                } else if self.matches(b'<') {
                    LessLess
                } else {
                    Less
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    GreaterEqual
                } else if self.matches(b'>') {
                    GreaterGreater
                } else {
                    Greater
                }
            }
            b'"' => return self.string(),
            b'0'..=b'9' => return self.number(),
            c if is_ident_start(c) => return Ok(self.identifier()),
            other => {
                return Err(self.error(format!(
                    "Unexpected character '{}'.",
                    other as char
                )));
            }
        };
        Ok(self.make(kind))
    }

    fn skip_whitespace(&mut self) -> Result<(), CompileError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\r') | Some(b'\t') => {
                    self.advance();
                }
                Some(b'\n') => {
                    self.advance();
                }
                Some(b'/') if self.peek_next() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some(b'/') if self.peek_next() == Some(b'*') => {
                    self.advance();
                    self.advance();
                    let open_line = self.line;
                    loop {
                        match self.peek() {
                            None => {
                                return Err(CompileError::new(
                                    CompileErrorKind::Lexical,
                                    format!("Unterminated block comment (opened line {open_line})."),
                                    self.file.clone(),
                                    self.line,
                                    self.column,
                                ));
                            }
                            Some(b'*') if self.peek_next() == Some(b'/') => {
                                self.advance();
                                self.advance();
                                break;
                            }
                            _ => {
                                self.advance();
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn string(&mut self) -> Result<Token, CompileError> {
        let mut value = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(self.error("Unterminated string."));
                }
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => value.push('\n'),
                    Some(b't') => value.push('\t'),
                    Some(b'r') => value.push('\r'),
                    Some(b'\\') => value.push('\\'),
                    Some(b'"') => value.push('"'),
                    Some(b'0') => value.push('\0'),
                    Some(other) => {
                        return Err(self.error(format!(
                            "Unknown escape sequence '\\{}'.",
                            other as char
                        )));
                    }
                    None => return Err(self.error("Unterminated string.")),
                },
                Some(c) => {
                    // UTF-8 : recopie les octets de continuation tels quels.
                    if c < 0x80 {
                        value.push(c as char);
                    } else {
                        let mut buf = vec![c];
                        while let Some(n) = self.peek() {
                            if n & 0xC0 == 0x80 {
                                buf.push(n);
                                self.advance();
                            } else {
                                break;
                            }
                        }
                        value.push_str(&String::from_utf8_lossy(&buf));
                    }
                }
            }
        }
        Ok(self.make(TokenKind::Str(value)))
    }

    fn number(&mut self) -> Result<Token, CompileError> {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.advance();
        }
        if self.peek() == Some(b'.') && matches!(self.peek_next(), Some(b'0'..=b'9')) {
            self.advance();
            while matches!(self.peek(), Some(b'0'..=b'9')) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            let mut ahead = self.current + 1;
            if matches!(self.src.get(ahead), Some(b'+') | Some(b'-')) {
                ahead += 1;
            }
            if matches!(self.src.get(ahead), Some(b'0'..=b'9')) {
                self.advance(); // e
                if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                    self.advance();
                }
                while matches!(self.peek(), Some(b'0'..=b'9')) {
                    self.advance();
                }
            }
        }
        let text = std::str::from_utf8(&self.src[self.start..self.current]).unwrap_or("");
        match text.parse::<f64>() {
            Ok(n) => Ok(self.make(TokenKind::Number(n))),
            Err(_) => Err(self.error(format!("Invalid number literal '{text}'."))),
        }
    }

    fn identifier(&mut self) -> Token {
        while let Some(c) = self.peek() {
            if is_ident_part(c) {
                self.advance();
            } else {
                break;
            }
        }
        let text = std::str::from_utf8(&self.src[self.start..self.current])
            .unwrap_or("")
            .to_string();
        let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier(text));
        self.make(kind)
    }

    // ---- primitives ----

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.current).copied()
    }

    #[inline]
    fn peek_next(&self) -> Option<u8> {
        self.src.get(self.current + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.current += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn make(&self, kind: TokenKind) -> Token {
        let lexeme = std::str::from_utf8(&self.src[self.start..self.current])
            .unwrap_or("")
            .to_string();
        Token { kind, lexeme, line: self.line, column: self.start_column }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(
            CompileErrorKind::Lexical,
            message,
            self.file.clone(),
            self.line,
            self.start_column,
        )
    }
}

#[inline]
fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

#[inline]
fn is_ident_part(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use neutron_core::TypeTag;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Scanner::new(src, "<test>")
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn symbols_and_keywords() {
        let ks = kinds("var x = 1; say x;");
        assert_eq!(ks[0], TokenKind::Var);
        assert!(matches!(&ks[1], TokenKind::Identifier(s) if s == "x"));
        assert_eq!(ks[2], TokenKind::Equal);
        assert!(matches!(ks[3], TokenKind::Number(n) if n == 1.0));
        assert_eq!(ks[4], TokenKind::Semicolon);
        assert_eq!(ks[5], TokenKind::Say);
    }

    #[test]
    fn two_char_operators() {
        let ks = kinds("== != <= >= && || => << >>");
        assert_eq!(
            &ks[..9],
            &[
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::AmpAmp,
                TokenKind::PipePipe,
                TokenKind::Arrow,
                TokenKind::LessLess,
                TokenKind::GreaterGreater,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let ks = kinds(r#""a\nb\t\"c\"""#);
        assert!(matches!(&ks[0], TokenKind::Str(s) if s == "a\nb\t\"c\""));
    }

    #[test]
    fn numbers() {
        let ks = kinds("0 3.5 120.25 1e3");
        assert!(matches!(ks[0], TokenKind::Number(n) if n == 0.0));
        assert!(matches!(ks[1], TokenKind::Number(n) if n == 3.5));
        assert!(matches!(ks[2], TokenKind::Number(n) if n == 120.25));
        assert!(matches!(ks[3], TokenKind::Number(n) if n == 1000.0));
    }

    #[test]
    fn comments_are_skipped() {
        let ks = kinds("1 // ligne\n/* bloc\nsur deux lignes */ 2");
        assert!(matches!(ks[0], TokenKind::Number(n) if n == 1.0));
        assert!(matches!(ks[1], TokenKind::Number(n) if n == 2.0));
        assert_eq!(ks[2], TokenKind::Eof);
    }

    #[test]
    fn type_annotations() {
        let ks = kinds("int float string bool array object any");
        assert_eq!(ks[0], TokenKind::Type(TypeTag::Int));
        assert_eq!(ks[6], TokenKind::Type(TypeTag::Any));
    }

    #[test]
    fn lines_are_tracked() {
        let toks = Scanner::new("1\n2\n3", "<test>").scan_tokens().unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].line, 2);
        assert_eq!(toks[2].line, 3);
    }

    #[test]
    fn bad_character_is_lexical_error() {
        let err = Scanner::new("var @ = 1;", "<test>").scan_tokens().unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::Lexical);
    }

    #[test]
    fn unterminated_string_is_reported() {
        assert!(Scanner::new("\"abc", "<test>").scan_tokens().is_err());
    }
}
