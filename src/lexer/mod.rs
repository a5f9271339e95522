pub mod token;

use self::token::{keyword_kind, Token, TokenKind};

/// Single forward pass over the source text. Whitespace and comments are
/// dropped; every surviving character becomes part of exactly one token.
/// Errors are collected, never fatal: the scanner always reaches `Eof`.
pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    tokens: Vec<Token>,
    errors: Vec<String>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> char {
        if self.at_end() { '\0' } else { self.chars[self.pos] }
    }

    fn peek_next(&self) -> char {
        self.chars.get(self.pos + 1).copied().unwrap_or('\0')
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.pos];
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        c
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>, line: usize, col: usize) {
        self.tokens.push(Token::new(kind, text, line, col));
    }

    fn error(&mut self, message: &str) {
        self.errors.push(format!(
            "Lexer error at line {}, column {}: {}",
            self.line, self.col, message
        ));
    }

    pub fn tokenize(&mut self) -> Vec<Token> {
        while !self.at_end() {
            self.scan_token();
        }
        self.tokens
            .push(Token::new(TokenKind::Eof, "", self.line, self.col));
        std::mem::take(&mut self.tokens)
    }

    fn scan_token(&mut self) {
        let (line, col) = (self.line, self.col);
        let c = self.advance();

        macro_rules! op {
            ($plain:ident, $eq:ident, $txt:expr, $eqtxt:expr) => {
                if self.matches('=') {
                    self.push(TokenKind::$eq, $eqtxt, line, col)
                } else {
                    self.push(TokenKind::$plain, $txt, line, col)
                }
            };
        }

        match c {
            '(' => self.push(TokenKind::LParen, "(", line, col),
            ')' => self.push(TokenKind::RParen, ")", line, col),
            '{' => self.push(TokenKind::LBrace, "{", line, col),
            '}' => self.push(TokenKind::RBrace, "}", line, col),
            '[' => self.push(TokenKind::LBracket, "[", line, col),
            ']' => self.push(TokenKind::RBracket, "]", line, col),
            ',' => self.push(TokenKind::Comma, ",", line, col),
            '.' => self.push(TokenKind::Dot, ".", line, col),
            ';' => self.push(TokenKind::Semicolon, ";", line, col),
            ':' => self.push(TokenKind::Colon, ":", line, col),

            '!' => op!(Bang, BangEq, "!", "!="),
            '=' => op!(Eq, EqEq, "=", "=="),
            '>' => op!(Greater, GreaterEq, ">", ">="),
            '<' => op!(Less, LessEq, "<", "<="),
            '+' => op!(Plus, PlusEq, "+", "+="),
            '-' => op!(Minus, MinusEq, "-", "-="),
            '*' => op!(Star, StarEq, "*", "*="),
            '%' => op!(Percent, PercentEq, "%", "%="),
            '/' => {
                if self.matches('/') {
                    while self.peek() != '\n' && !self.at_end() {
                        self.advance();
                    }
                } else if self.matches('=') {
                    self.push(TokenKind::SlashEq, "/=", line, col);
                } else {
                    self.push(TokenKind::Slash, "/", line, col);
                }
            }

            ' ' | '\r' | '\t' | '\n' => {}

            '"' => self.scan_string(line, col),

            _ if c.is_ascii_digit() => self.scan_number(c, line, col),
            _ if c.is_ascii_alphabetic() || c == '_' => self.scan_identifier(c, line, col),

            _ => self.error(&format!("Unexpected character: {}", c)),
        }
    }

    fn scan_string(&mut self, line: usize, col: usize) {
        let mut value = String::new();
        while self.peek() != '"' && !self.at_end() {
            if self.peek() == '\\' {
                self.advance();
                match self.peek() {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '"' => value.push('"'),
                    '\\' => value.push('\\'),
                    other => {
                        value.push('\\');
                        value.push(other);
                    }
                }
                if !self.at_end() {
                    self.advance();
                }
            } else {
                value.push(self.advance());
            }
        }

        if self.at_end() {
            self.error("Unterminated string");
            return;
        }

        self.advance(); // closing quote
        self.push(TokenKind::Str, value, line, col);
    }

    fn scan_number(&mut self, first: char, line: usize, col: usize) {
        let mut text = String::new();
        text.push(first);
        let mut is_float = false;

        while self.peek().is_ascii_digit() {
            text.push(self.advance());
        }

        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            is_float = true;
            text.push(self.advance());
            while self.peek().is_ascii_digit() {
                text.push(self.advance());
            }
        }

        let kind = if is_float { TokenKind::Float } else { TokenKind::Number };
        self.push(kind, text, line, col);
    }

    fn scan_identifier(&mut self, first: char, line: usize, col: usize) {
        let mut text = String::new();
        text.push(first);
        while self.peek().is_ascii_alphanumeric() || self.peek() == '_' {
            text.push(self.advance());
        }

        match keyword_kind(&text) {
            Some(kind) => self.push(kind, text, line, col),
            None => self.push(TokenKind::Ident, text, line, col),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::token::TokenKind;
    use super::Lexer;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).tokenize().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn ends_with_eof() {
        assert_eq!(kinds(""), vec![TokenKind::Eof]);
        assert_eq!(kinds("   \n\t "), vec![TokenKind::Eof]);
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("fn Main include unmut byte wibble"),
            vec![
                TokenKind::Fn,
                TokenKind::Ident,
                TokenKind::Include,
                TokenKind::Unmut,
                TokenKind::ByteType,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn two_character_operators() {
        assert_eq!(
            kinds("== != <= >= += -= *= /= %= = < !"),
            vec![
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::LessEq,
                TokenKind::GreaterEq,
                TokenKind::PlusEq,
                TokenKind::MinusEq,
                TokenKind::StarEq,
                TokenKind::SlashEq,
                TokenKind::PercentEq,
                TokenKind::Eq,
                TokenKind::Less,
                TokenKind::Bang,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_split_into_int_and_float() {
        let tokens = Lexer::new("12 3.5 7.").tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text, "12");
        assert_eq!(tokens[1].kind, TokenKind::Float);
        assert_eq!(tokens[1].text, "3.5");
        // a trailing dot is not part of the number
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[2].text, "7");
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn string_escapes() {
        let tokens = Lexer::new(r#""a\nb\t\"q\"\\ \x""#).tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "a\nb\t\"q\"\\ \\x");
    }

    #[test]
    fn unterminated_string_is_an_error_not_a_token() {
        let mut lexer = Lexer::new("\"oops");
        let tokens = lexer.tokenize();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert_eq!(lexer.errors().len(), 1);
        assert!(lexer.errors()[0].contains("Unterminated string"));
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("1 // comment ; fn\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let tokens = Lexer::new("fn\n  x").tokenize();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        assert_eq!((tokens[1].line, tokens[1].column), (2, 3));
    }

    #[test]
    fn unexpected_characters_are_recovered() {
        let mut lexer = Lexer::new("@ # 1");
        let tokens = lexer.tokenize();
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(lexer.errors().len(), 2);
        assert!(lexer.errors()[0].contains("Unexpected character"));
    }
}
