pub mod ast;

use std::collections::HashMap;

use crate::lexer::token::{Token, TokenKind};
use self::ast::*;

/// Classical recursive descent over the token stream.
///
/// Errors are collected rather than thrown: on a syntax error the parser
/// records a positioned message and resynchronizes at the next statement
/// boundary, so one pass reports as many errors as it can find.
pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<String>,
    includes: HashMap<String, String>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0, errors: Vec::new(), includes: HashMap::new() }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// `include foo;` lines recorded during parsing: base name -> path text.
    pub fn includes(&self) -> &HashMap<String, String> {
        &self.includes
    }

    pub fn parse(&mut self) -> Vec<Stmt> {
        let mut statements = Vec::new();
        while !self.at_end() {
            match self.parse_declaration() {
                Ok(Some(stmt)) => statements.push(stmt),
                Ok(None) => {}
                Err(message) => {
                    self.errors.push(message);
                    self.synchronize();
                }
            }
        }
        statements
    }

    // ── Cursor helpers ─────────────────────────────

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len() || self.tokens[self.pos].kind == TokenKind::Eof
    }

    fn peek(&self) -> &Token {
        if self.pos < self.tokens.len() {
            &self.tokens[self.pos]
        } else {
            self.tokens.last().expect("token stream ends with Eof")
        }
    }

    fn peek_kind(&self, offset: usize) -> TokenKind {
        self.tokens
            .get(self.pos + offset)
            .map(|t| t.kind)
            .unwrap_or(TokenKind::Eof)
    }

    fn advance(&mut self) -> &Token {
        if !self.at_end() {
            self.pos += 1;
        }
        &self.tokens[self.pos - 1]
    }

    fn check(&self, kind: TokenKind) -> bool {
        !self.at_end() && self.tokens[self.pos].kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) -> Result<Token, String> {
        if self.check(kind) {
            Ok(self.advance().clone())
        } else {
            Err(self.err(message))
        }
    }

    fn err(&self, message: &str) -> String {
        let token = self.peek();
        format!(
            "Parse error at line {}, column {}: {}",
            token.line, token.column, message
        )
    }

    fn synchronize(&mut self) {
        self.advance();
        while !self.at_end() {
            if self.tokens[self.pos - 1].kind == TokenKind::Semicolon {
                return;
            }
            match self.peek().kind {
                TokenKind::Fn
                | TokenKind::If
                | TokenKind::For
                | TokenKind::While
                | TokenKind::Return
                | TokenKind::Include => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn type_name(kind: TokenKind) -> Option<TypeName> {
        match kind {
            TokenKind::IntType => Some(TypeName::Int),
            TokenKind::FloatType => Some(TypeName::Float),
            TokenKind::StrType => Some(TypeName::Str),
            TokenKind::BoolType => Some(TypeName::Bool),
            TokenKind::ByteType => Some(TypeName::Byte),
            _ => None,
        }
    }

    // ── Declarations ───────────────────────────────

    fn parse_declaration(&mut self) -> Result<Option<Stmt>, String> {
        if self.matches(TokenKind::Include) {
            self.parse_include()?;
            return Ok(None);
        }
        if self.matches(TokenKind::Fn) {
            return Ok(Some(self.parse_function()?));
        }
        Ok(Some(self.parse_statement()?))
    }

    fn parse_include(&mut self) -> Result<(), String> {
        let name = self.consume(TokenKind::Ident, "Expected library name after 'include'")?;
        self.consume(TokenKind::Semicolon, "Expected ';' after include")?;
        self.includes
            .insert(base_name(&name.text), name.text.clone());
        Ok(())
    }

    fn parse_function(&mut self) -> Result<Stmt, String> {
        let name = self.consume(TokenKind::Ident, "Expected function name")?;
        self.consume(TokenKind::LParen, "Expected '(' after function name")?;

        let mut params = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                let ty = Self::type_name(self.peek().kind).ok_or_else(|| {
                    self.err(&format!(
                        "Expected parameter type (int, float, str, bool, byte), got: '{}'",
                        self.peek().text
                    ))
                })?;
                self.advance();
                let pname = self.consume(TokenKind::Ident, "Expected parameter name")?;
                params.push((ty, pname.text));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }

        self.consume(TokenKind::RParen, "Expected ')' after parameters")?;
        self.consume(TokenKind::LBrace, "Expected '{' before function body")?;
        let body = self.parse_block_statements()?;

        Ok(Stmt::Function(FunctionStmt { name: name.text, params, body }))
    }

    // ── Statements ─────────────────────────────────

    fn parse_statement(&mut self) -> Result<Stmt, String> {
        if self.matches(TokenKind::If) {
            return self.parse_if();
        }
        if self.matches(TokenKind::While) {
            return self.parse_while();
        }
        if self.matches(TokenKind::For) {
            return self.parse_for();
        }
        if self.matches(TokenKind::Return) {
            return self.parse_return();
        }
        if self.matches(TokenKind::Break) {
            self.consume(TokenKind::Semicolon, "Expected ';' after break")?;
            return Ok(Stmt::Break);
        }
        if self.matches(TokenKind::Continue) {
            self.consume(TokenKind::Semicolon, "Expected ';' after continue")?;
            return Ok(Stmt::Continue);
        }
        if self.matches(TokenKind::LBrace) {
            return Ok(Stmt::Block(self.parse_block_statements()?));
        }

        if self.starts_declaration() {
            return self.parse_var_declaration();
        }

        let stmt = self.parse_assign_or_expr()?;
        self.consume(TokenKind::Semicolon, "Expected ';' after expression")?;
        Ok(stmt)
    }

    /// True when the cursor sits on `[unmut|mut] <type>`.
    fn starts_declaration(&self) -> bool {
        match self.peek().kind {
            TokenKind::Unmut | TokenKind::Mut => Self::type_name(self.peek_kind(1)).is_some(),
            kind => Self::type_name(kind).is_some(),
        }
    }

    fn parse_block_statements(&mut self) -> Result<Vec<Stmt>, String> {
        let mut statements = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.at_end() {
            statements.push(self.parse_statement()?);
        }
        self.consume(TokenKind::RBrace, "Expected '}' after block")?;
        Ok(statements)
    }

    fn parse_var_declaration(&mut self) -> Result<Stmt, String> {
        let mut mutable = true;
        if self.matches(TokenKind::Unmut) {
            mutable = false;
        } else {
            self.matches(TokenKind::Mut);
        }

        let ty = Self::type_name(self.peek().kind)
            .ok_or_else(|| self.err("Expected type name"))?;
        self.advance();
        let name = self.consume(TokenKind::Ident, "Expected variable name")?;

        if self.matches(TokenKind::LBracket) {
            return self.parse_array_declaration(ty, name.text);
        }

        let init = if self.matches(TokenKind::Eq) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration")?;

        Ok(Stmt::VarDecl { mutable, ty, name: name.text, init })
    }

    fn parse_array_declaration(&mut self, elem_ty: TypeName, name: String) -> Result<Stmt, String> {
        let size = if self.check(TokenKind::RBracket) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::RBracket, "Expected ']' after array size")?;

        let init = if self.matches(TokenKind::Eq) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after array declaration")?;

        Ok(Stmt::ArrayDecl { elem_ty, name, size, init })
    }

    fn parse_if(&mut self) -> Result<Stmt, String> {
        self.consume(TokenKind::LParen, "Expected '(' after 'if'")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "Expected ')' after condition")?;

        self.consume(TokenKind::LBrace, "Expected '{' after if condition")?;
        let then_branch = Box::new(Stmt::Block(self.parse_block_statements()?));

        let else_branch = if self.matches(TokenKind::Else) {
            if self.matches(TokenKind::If) {
                Some(Box::new(self.parse_if()?))
            } else {
                self.consume(TokenKind::LBrace, "Expected '{' after 'else'")?;
                Some(Box::new(Stmt::Block(self.parse_block_statements()?)))
            }
        } else {
            None
        };

        Ok(Stmt::If { condition, then_branch, else_branch })
    }

    fn parse_while(&mut self) -> Result<Stmt, String> {
        self.consume(TokenKind::LParen, "Expected '(' after 'while'")?;
        let condition = self.parse_expression()?;
        self.consume(TokenKind::RParen, "Expected ')' after condition")?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::While { condition, body })
    }

    fn parse_for(&mut self) -> Result<Stmt, String> {
        self.consume(TokenKind::LParen, "Expected '(' after 'for'")?;

        let init = if self.matches(TokenKind::Semicolon) {
            None
        } else if self.starts_declaration() {
            Some(Box::new(self.parse_var_declaration()?))
        } else {
            let stmt = self.parse_assign_or_expr()?;
            self.consume(TokenKind::Semicolon, "Expected ';' after for initializer")?;
            Some(Box::new(stmt))
        };

        let condition = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after for condition")?;

        let increment = if self.check(TokenKind::RParen) {
            None
        } else {
            Some(Box::new(self.parse_assign_or_expr()?))
        };
        self.consume(TokenKind::RParen, "Expected ')' after for clauses")?;

        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::For { init, condition, increment, body })
    }

    fn parse_return(&mut self) -> Result<Stmt, String> {
        let value = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume(TokenKind::Semicolon, "Expected ';' after return")?;
        Ok(Stmt::Return(value))
    }

    /// Parses an expression, then upgrades it to an assignment statement when
    /// an `=` follows. Assignment binds at statement level only.
    fn parse_assign_or_expr(&mut self) -> Result<Stmt, String> {
        let expr = self.parse_expression()?;
        if self.matches(TokenKind::Eq) {
            let value = self.parse_expression()?;
            return match expr {
                Expr::Variable(name) => Ok(Stmt::Assign { name, value }),
                Expr::Index { array, index } => match *array {
                    Expr::Variable(name) => Ok(Stmt::IndexAssign { name, index: *index, value }),
                    _ => Err(self.err("Invalid assignment target")),
                },
                _ => Err(self.err("Invalid assignment target")),
            };
        }
        Ok(Stmt::Expr(expr))
    }

    // ── Expressions ────────────────────────────────

    fn parse_expression(&mut self) -> Result<Expr, String> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_logical_and()?;
        while self.matches(TokenKind::Or) {
            let right = self.parse_logical_and()?;
            expr = Expr::Logical {
                left: Some(Box::new(expr)),
                op: LogicalOp::Or,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_equality()?;
        while self.matches(TokenKind::And) {
            let right = self.parse_equality()?;
            expr = Expr::Logical {
                left: Some(Box::new(expr)),
                op: LogicalOp::And,
                right: Box::new(right),
            };
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = if self.matches(TokenKind::EqEq) {
                CompareOp::Eq
            } else if self.matches(TokenKind::BangEq) {
                CompareOp::Ne
            } else {
                break;
            };
            let right = self.parse_comparison()?;
            expr = Expr::Compare { left: Box::new(expr), op, right: Box::new(right) };
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_term()?;
        loop {
            let op = if self.matches(TokenKind::Less) {
                CompareOp::Lt
            } else if self.matches(TokenKind::LessEq) {
                CompareOp::Le
            } else if self.matches(TokenKind::Greater) {
                CompareOp::Gt
            } else if self.matches(TokenKind::GreaterEq) {
                CompareOp::Ge
            } else {
                break;
            };
            let right = self.parse_term()?;
            expr = Expr::Compare { left: Box::new(expr), op, right: Box::new(right) };
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_factor()?;
        loop {
            let op = if self.matches(TokenKind::Plus) {
                BinaryOp::Add
            } else if self.matches(TokenKind::Minus) {
                BinaryOp::Sub
            } else {
                break;
            };
            let right = self.parse_factor()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right) };
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = if self.matches(TokenKind::Star) {
                BinaryOp::Mul
            } else if self.matches(TokenKind::Slash) {
                BinaryOp::Div
            } else if self.matches(TokenKind::Percent) {
                BinaryOp::Mod
            } else {
                break;
            };
            let right = self.parse_unary()?;
            expr = Expr::Binary { left: Box::new(expr), op, right: Box::new(right) };
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.matches(TokenKind::Bang) || self.matches(TokenKind::Not) {
            let right = self.parse_unary()?;
            return Ok(Expr::Logical { left: None, op: LogicalOp::Not, right: Box::new(right) });
        }
        if self.matches(TokenKind::Minus) {
            let right = self.parse_unary()?;
            return Ok(Expr::Logical { left: None, op: LogicalOp::Neg, right: Box::new(right) });
        }
        self.parse_call()
    }

    fn parse_call(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.matches(TokenKind::LParen) {
                expr = self.finish_call(expr)?;
            } else if self.matches(TokenKind::Dot) {
                let name = self.consume(TokenKind::Ident, "Expected property name after '.'")?;
                expr = Expr::Get { object: Box::new(expr), name: name.text };
            } else if self.matches(TokenKind::LBracket) {
                let index = self.parse_expression()?;
                self.consume(TokenKind::RBracket, "Expected ']' after index")?;
                expr = Expr::Index { array: Box::new(expr), index: Box::new(index) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn finish_call(&mut self, callee: Expr) -> Result<Expr, String> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RParen, "Expected ')' after arguments")?;

        match callee {
            Expr::Get { object, name } => match *object {
                Expr::Variable(class_name) => {
                    let is_native = is_native_class(&class_name);
                    Ok(Expr::Call { class_name, method_name: name, args, is_native })
                }
                _ => Ok(Expr::Call {
                    class_name: String::new(),
                    method_name: name,
                    args,
                    is_native: true,
                }),
            },
            Expr::Variable(name) => Ok(Expr::Call {
                class_name: String::new(),
                method_name: name,
                args,
                is_native: false,
            }),
            _ => Err(self.err("Expected function name before '('")),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        if self.matches(TokenKind::Number) {
            let text = &self.tokens[self.pos - 1].text;
            let value: i64 = text
                .parse()
                .map_err(|_| self.err(&format!("Invalid integer literal '{}'", text)))?;
            return Ok(Expr::Literal(Literal::Int(value)));
        }
        if self.matches(TokenKind::Float) {
            let text = &self.tokens[self.pos - 1].text;
            let value: f64 = text
                .parse()
                .map_err(|_| self.err(&format!("Invalid float literal '{}'", text)))?;
            return Ok(Expr::Literal(Literal::Float(value)));
        }
        if self.matches(TokenKind::Str) {
            return Ok(Expr::Literal(Literal::Str(self.tokens[self.pos - 1].text.clone())));
        }
        if self.matches(TokenKind::True) {
            return Ok(Expr::Literal(Literal::Bool(true)));
        }
        if self.matches(TokenKind::False) {
            return Ok(Expr::Literal(Literal::Bool(false)));
        }
        if self.matches(TokenKind::Nil) {
            return Ok(Expr::Literal(Literal::Nil));
        }
        if self.matches(TokenKind::Ident) {
            return Ok(Expr::Variable(self.tokens[self.pos - 1].text.clone()));
        }
        if self.matches(TokenKind::LParen) {
            let expr = self.parse_expression()?;
            self.consume(TokenKind::RParen, "Expected ')' after expression")?;
            return Ok(expr);
        }
        if self.matches(TokenKind::LBracket) {
            let mut elements = Vec::new();
            if !self.check(TokenKind::RBracket) {
                loop {
                    elements.push(self.parse_expression()?);
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RBracket, "Expected ']' after array elements")?;
            return Ok(Expr::Array(elements));
        }

        Err(self.err("Expected expression"))
    }
}

fn base_name(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match file.rfind('.') {
        Some(dot) => file[..dot].to_string(),
        None => file.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::ast::*;
    use super::Parser;
    use crate::lexer::Lexer;

    fn parse(source: &str) -> (Vec<Stmt>, Vec<String>) {
        let tokens = Lexer::new(source).tokenize();
        let mut parser = Parser::new(tokens);
        let stmts = parser.parse();
        (stmts, parser.errors().to_vec())
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (stmts, errors) = parse(source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        stmts
    }

    #[test]
    fn function_with_params() {
        let stmts = parse_ok("fn add(int a, int b) { return a + b; }");
        match &stmts[0] {
            Stmt::Function(f) => {
                assert_eq!(f.name, "add");
                assert_eq!(f.params, vec![(TypeName::Int, "a".into()), (TypeName::Int, "b".into())]);
                assert_eq!(f.body.len(), 1);
            }
            other => panic!("expected function, got {:?}", other),
        }
    }

    #[test]
    fn precedence_multiplication_binds_tighter() {
        let stmts = parse_ok("fn Main() { int x = 1 + 2 * 3; }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        let Stmt::VarDecl { init: Some(Expr::Binary { op, right, .. }), .. } = &f.body[0] else {
            panic!("expected var decl with binary init");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn native_flag_follows_the_closed_receiver_set() {
        let stmts = parse_ok("fn Main() { Console.println(1); Util.helper(2); }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        match &f.body[0] {
            Stmt::Expr(Expr::Call { class_name, method_name, is_native, .. }) => {
                assert_eq!(class_name, "Console");
                assert_eq!(method_name, "println");
                assert!(is_native);
            }
            other => panic!("unexpected {:?}", other),
        }
        match &f.body[1] {
            Stmt::Expr(Expr::Call { class_name, is_native, .. }) => {
                assert_eq!(class_name, "Util");
                assert!(!is_native);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn include_goes_to_the_side_channel() {
        let tokens = Lexer::new("include util;\nfn Main() { }").tokenize();
        let mut parser = Parser::new(tokens);
        let stmts = parser.parse();
        assert_eq!(stmts.len(), 1, "include must not produce a statement");
        assert_eq!(parser.includes().get("util"), Some(&"util".to_string()));
    }

    #[test]
    fn assignment_is_a_statement() {
        let stmts = parse_ok("fn Main() { int i = 0; i = i + 1; }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        assert!(matches!(&f.body[1], Stmt::Assign { name, .. } if name == "i"));
    }

    #[test]
    fn indexed_assignment() {
        let stmts = parse_ok("fn Main() { int a[3]; a[0] = 7; }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        assert!(matches!(&f.body[0], Stmt::ArrayDecl { name, .. } if name == "a"));
        assert!(matches!(&f.body[1], Stmt::IndexAssign { name, .. } if name == "a"));
    }

    #[test]
    fn unmut_clears_the_mutable_flag() {
        let stmts = parse_ok("fn Main() { unmut int x = 1; mut int y = 2; int z = 3; }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        let flags: Vec<bool> = f
            .body
            .iter()
            .map(|s| match s {
                Stmt::VarDecl { mutable, .. } => *mutable,
                _ => panic!(),
            })
            .collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn for_loop_clauses() {
        let stmts = parse_ok("fn Main() { for (int i = 0; i < 3; i = i + 1) { } }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        let Stmt::For { init, condition, increment, .. } = &f.body[0] else { panic!() };
        assert!(matches!(init.as_deref(), Some(Stmt::VarDecl { .. })));
        assert!(matches!(condition, Some(Expr::Compare { op: CompareOp::Lt, .. })));
        assert!(matches!(increment.as_deref(), Some(Stmt::Assign { .. })));
    }

    #[test]
    fn errors_are_collected_and_parsing_continues() {
        let (stmts, errors) = parse("fn Main() { int = 5; }\nfn Other() { return 1; }");
        assert!(!errors.is_empty());
        assert!(errors[0].starts_with("Parse error at line 1"));
        // the second function still parses
        assert!(stmts
            .iter()
            .any(|s| matches!(s, Stmt::Function(f) if f.name == "Other")));
    }

    #[test]
    fn else_if_chains() {
        let stmts = parse_ok("fn Main() { if (1 < 2) { } else if (2 < 3) { } else { } }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        let Stmt::If { else_branch: Some(else_branch), .. } = &f.body[0] else { panic!() };
        assert!(matches!(**else_branch, Stmt::If { .. }));
    }

    #[test]
    fn unary_forms() {
        let stmts = parse_ok("fn Main() { bool b = !true; int n = -3; }");
        let Stmt::Function(f) = &stmts[0] else { panic!() };
        let Stmt::VarDecl { init: Some(Expr::Logical { left, op, .. }), .. } = &f.body[0] else {
            panic!()
        };
        assert!(left.is_none());
        assert_eq!(*op, LogicalOp::Not);
        let Stmt::VarDecl { init: Some(Expr::Logical { op, .. }), .. } = &f.body[1] else {
            panic!()
        };
        assert_eq!(*op, LogicalOp::Neg);
    }
}
