#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // --- Punctuation ---
    LParen, RParen, LBrace, RBrace, LBracket, RBracket,
    Comma, Dot, Semicolon, Colon,

    // --- Operators ---
    Bang, BangEq,
    Eq, EqEq,
    Greater, GreaterEq,
    Less, LessEq,
    Plus, PlusEq,
    Minus, MinusEq,
    Star, StarEq,
    Slash, SlashEq,
    Percent, PercentEq,

    // --- Literals ---
    Ident, Str, Number, Float,

    // --- Keywords ---
    And, Or, Not, If, Else, For, While, Do, Break, Continue, Return,
    True, False, Nil, Fn, Include,
    IntType, FloatType, StrType, BoolType, ByteType,
    Unmut, Mut,

    // --- Special ---
    Eof,
}

/// A single lexed token: kind, original lexeme, and source position.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, line: usize, column: usize) -> Self {
        Self { kind, text: text.into(), line, column }
    }
}

pub fn keyword_kind(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "do" => TokenKind::Do,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "nil" => TokenKind::Nil,
        "fn" => TokenKind::Fn,
        "include" => TokenKind::Include,
        "int" => TokenKind::IntType,
        "float" => TokenKind::FloatType,
        "str" => TokenKind::StrType,
        "bool" => TokenKind::BoolType,
        "byte" => TokenKind::ByteType,
        "unmut" => TokenKind::Unmut,
        "mut" => TokenKind::Mut,
        _ => return None,
    };
    Some(kind)
}
