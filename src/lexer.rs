use thiserror::Error;

use crate::input::{Input, Position};
use crate::token::{Token, TokenKind, keyword_kind};

/// Bytes skipped between tokens. `\n` is absent: it is a significant token.
const WHITESPACE: &[u8] = b" \x0c\r\t\x08";

/// Token texts tried in order against the input. Longer operators come
/// before their single-byte prefixes so that `++` never lexes as `+` `+`.
const OPERATORS: &[(&str, TokenKind)] = &[
    ("++", TokenKind::Increment),
    ("--", TokenKind::Decrement),
    ("<=", TokenKind::LessThanOrEqual),
    (">=", TokenKind::GreaterThanOrEqual),
    ("==", TokenKind::Equal),
    ("!=", TokenKind::NotEqual),
    ("+=", TokenKind::AddAssign),
    ("-=", TokenKind::SubAssign),
    ("*=", TokenKind::MulAssign),
    ("/=", TokenKind::DivAssign),
    ("%=", TokenKind::ModAssign),
    ("&&", TokenKind::LogicalAnd),
    ("||", TokenKind::LogicalOr),
    ("{", TokenKind::LeftBrace),
    ("}", TokenKind::RightBrace),
    (")", TokenKind::RightParen),
    ("(", TokenKind::LeftParen),
    ("]", TokenKind::RightBracket),
    ("[", TokenKind::LeftBracket),
    (";", TokenKind::Semicolon),
    (",", TokenKind::Comma),
    ("\n", TokenKind::Newline),
    ("<", TokenKind::LessThan),
    (">", TokenKind::GreaterThan),
    ("&", TokenKind::BinaryAnd),
    ("|", TokenKind::BinaryOr),
    ("!", TokenKind::Not),
    ("=", TokenKind::Assign),
    ("+", TokenKind::Add),
    ("-", TokenKind::Sub),
    ("*", TokenKind::Mul),
    ("/", TokenKind::Div),
    ("%", TokenKind::Mod),
    ("^", TokenKind::Exponent),
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("unexpected character '{character}' at line {}, column {}", .position.line, .position.column)]
    UnexpectedCharacter { character: char, position: Position },
    #[error("invalid identifier at line {}, column {}", .position.line, .position.column)]
    InvalidIdentifier { position: Position },
    #[error("invalid numeric constant at line {}, column {}", .position.line, .position.column)]
    InvalidNumericConstant { position: Position },
    #[error("invalid escape sequence at line {}, column {}", .position.line, .position.column)]
    InvalidEscapeSequence { position: Position },
    #[error("unterminated string literal at line {}, column {}", .position.line, .position.column)]
    UnterminatedString { position: Position },
}

impl LexError {
    pub fn position(&self) -> Position {
        match self {
            LexError::UnexpectedCharacter { position, .. }
            | LexError::InvalidIdentifier { position }
            | LexError::InvalidNumericConstant { position }
            | LexError::InvalidEscapeSequence { position }
            | LexError::UnterminatedString { position } => *position,
        }
    }
}

pub type LexResult<T> = Result<T, LexError>;

pub struct Lexer<'a> {
    input: Input<'a>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self {
            input: Input::new(input),
            tokens: Vec::new(),
        }
    }

    pub fn tokenize(mut self) -> LexResult<Vec<Token>> {
        loop {
            self.skip_whitespace_and_comments();
            if self.input.eof() {
                break;
            }

            let position = self.input.position();

            // a backslash before a physical newline continues the line
            if self.input.match_bytes(b"\\\n") {
                continue;
            }

            if let Some(token) = self.match_operator(position) {
                self.tokens.push(token);
                continue;
            }

            let ch = self.input.peek();
            let token = if ch.is_ascii_digit() {
                self.read_integer(position)?
            } else if ch.is_ascii_alphabetic() || ch == b'_' || ch == b'$' {
                self.read_identifier(position)?
            } else if ch == b'"' {
                self.read_string(position)?
            } else {
                return Err(LexError::UnexpectedCharacter {
                    character: char::from(ch),
                    position,
                });
            };
            self.tokens.push(token);
        }

        Ok(self.tokens)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            self.input.consume(WHITESPACE);
            if self.input.match_byte(b'#') {
                while !self.input.eof() && self.input.peek() != b'\n' {
                    self.input.read();
                }
            } else {
                break;
            }
        }
    }

    fn match_operator(&mut self, position: Position) -> Option<Token> {
        for &(text, kind) in OPERATORS {
            if self.input.match_bytes(text.as_bytes()) {
                return Some(Token::new(kind, text, position));
            }
        }
        None
    }

    /// Integers are `0` or a nonzero digit followed by any digits; a leading
    /// zero never begins a longer literal. The lexeme must fit a 32-bit
    /// signed integer.
    fn read_integer(&mut self, position: Position) -> LexResult<Token> {
        let lexeme = if self.input.peek() == b'0' {
            self.input.read();
            "0".to_string()
        } else {
            latin1_string(self.input.consume_while(|b| b.is_ascii_digit()))
        };

        if lexeme.parse::<i32>().is_err() {
            return Err(LexError::InvalidNumericConstant { position });
        }

        Ok(Token::new(TokenKind::Integer, lexeme, position))
    }

    fn read_identifier(&mut self, position: Position) -> LexResult<Token> {
        let first = self.input.read();
        let rest = self
            .input
            .consume_while(|b| b.is_ascii_alphanumeric() || b == b'_');

        let mut lexeme = String::with_capacity(1 + rest.len());
        lexeme.push(char::from(first));
        lexeme.push_str(&latin1_string(rest));

        let kind = keyword_kind(&lexeme).unwrap_or(TokenKind::Identifier);
        Ok(Token::new(kind, lexeme, position))
    }

    /// Reads a double-quoted string literal, decoding escape sequences as it
    /// goes. A numeric escape that evaluates to 0 is not embedded: the
    /// reader rewinds to the byte just after the backslash and the digits
    /// are re-lexed as ordinary characters, so a NUL never enters a string.
    fn read_string(&mut self, position: Position) -> LexResult<Token> {
        self.input.read(); // opening quote

        let mut value = Vec::new();
        loop {
            if self.input.eof() {
                return Err(LexError::UnterminatedString { position });
            }

            let ch = self.input.read();
            if ch == b'"' {
                break;
            }
            if ch != b'\\' {
                value.push(ch);
                continue;
            }

            let after_backslash = self.input;
            let escape = self.input.read();
            let byte = match escape {
                // escaped physical newline continues the literal
                b'\n' => continue,
                b'\'' => b'\'',
                b'"' => b'"',
                b'\\' => b'\\',
                b'a' => 0x07,
                b'b' => 0x08,
                b'f' => 0x0c,
                b'n' => b'\n',
                b'r' => b'\r',
                b't' => b'\t',
                b'v' => 0x0b,
                b'e' => 0x1b,
                b'x' | b'X' => {
                    let digits = self.input.consume_while(|b| b.is_ascii_hexdigit());
                    if digits.is_empty() {
                        return Err(LexError::InvalidEscapeSequence {
                            position: self.input.position(),
                        });
                    }
                    let byte = digits
                        .iter()
                        .fold(0u8, |acc, &d| acc.wrapping_mul(16).wrapping_add(hex_value(d)));
                    if byte == 0 {
                        self.input = after_backslash;
                        continue;
                    }
                    byte
                }
                b'0'..=b'7' => {
                    let rest = self.input.consume_while(|b| (b'0'..b'8').contains(&b));
                    let byte = rest
                        .iter()
                        .fold(escape - b'0', |acc, &d| acc.wrapping_mul(8).wrapping_add(d - b'0'));
                    if byte == 0 {
                        self.input = after_backslash;
                        continue;
                    }
                    byte
                }
                _ => {
                    return Err(LexError::InvalidEscapeSequence {
                        position: self.input.position(),
                    });
                }
            };
            value.push(byte);
        }

        Ok(Token::new(TokenKind::String, latin1_string(&value), position))
    }
}

/// Byte-for-byte conversion: each byte becomes the code point of the same
/// value, so string lengths and contents stay byte-faithful.
fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        b'A'..=b'F' => digit - b'A' + 10,
        _ => unreachable!("hex_value called on a non-hex digit"),
    }
}

pub fn tokenize(input: &[u8]) -> LexResult<Vec<Token>> {
    Lexer::new(input).tokenize()
}
