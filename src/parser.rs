use thiserror::Error;

use crate::ast::{AtomKind, BinaryOp, Expression, Program, Statement, UnaryOp};
use crate::token::{Token, TokenKind};

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("function defined within another function at line {}, column {}", .0.position.line, .0.position.column)]
    FunctionDefinedWithinFunction(Token),
    #[error("expected an identifier at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingIdentifier(Token),
    #[error("expected '{{' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingOpenBrace(Token),
    #[error("expected '}}' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingClosingBrace(Token),
    #[error("expected '(' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingOpenParen(Token),
    #[error("expected ')' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingClosingParen(Token),
    #[error("expected ']' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingClosingBracket(Token),
    #[error("expected a newline at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingNewline(Token),
    #[error("expected ';' at line {}, column {}, got '{}'", .0.position.line, .0.position.column, .0.lexeme)]
    MissingSemicolon(Token),
    #[error("unexpected brace at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedBrace(Token),
    #[error("unexpected bracket at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedBracket(Token),
    #[error("unexpected parenthesis at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedParen(Token),
    #[error("unexpected '{}' at line {}, column {}", .0.lexeme, .0.position.line, .0.position.column)]
    UnexpectedKeyword(Token),
    #[error("unexpected string constant at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedStringConstant(Token),
    #[error("unexpected numeric constant at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedNumericConstant(Token),
    #[error("unexpected identifier '{}' at line {}, column {}", .0.lexeme, .0.position.line, .0.position.column)]
    UnexpectedIdentifier(Token),
    #[error("unexpected ',' at line {}, column {}", .0.position.line, .0.position.column)]
    UnexpectedComma(Token),
    #[error("delete requires an array element target at line {}, column {}", .0.position.line, .0.position.column)]
    InvalidDelete(Token),
}

impl ParseError {
    pub fn token(&self) -> &Token {
        match self {
            ParseError::FunctionDefinedWithinFunction(token)
            | ParseError::MissingIdentifier(token)
            | ParseError::MissingOpenBrace(token)
            | ParseError::MissingClosingBrace(token)
            | ParseError::MissingOpenParen(token)
            | ParseError::MissingClosingParen(token)
            | ParseError::MissingClosingBracket(token)
            | ParseError::MissingNewline(token)
            | ParseError::MissingSemicolon(token)
            | ParseError::UnexpectedBrace(token)
            | ParseError::UnexpectedBracket(token)
            | ParseError::UnexpectedParen(token)
            | ParseError::UnexpectedKeyword(token)
            | ParseError::UnexpectedStringConstant(token)
            | ParseError::UnexpectedNumericConstant(token)
            | ParseError::UnexpectedIdentifier(token)
            | ParseError::UnexpectedComma(token)
            | ParseError::InvalidDelete(token) => token,
        }
    }
}

pub type ParseResult<T> = Result<T, ParseError>;

/// Maps a token that cannot appear where it did to the matching refinement.
/// Shared by the statement dispatch and by every place an operand is
/// required but absent.
fn unexpected_token_error(token: Token) -> ParseError {
    match token.kind {
        TokenKind::LeftBrace | TokenKind::RightBrace => ParseError::UnexpectedBrace(token),
        TokenKind::LeftBracket | TokenKind::RightBracket => ParseError::UnexpectedBracket(token),
        TokenKind::LeftParen | TokenKind::RightParen => ParseError::UnexpectedParen(token),
        TokenKind::String => ParseError::UnexpectedStringConstant(token),
        TokenKind::Integer => ParseError::UnexpectedNumericConstant(token),
        TokenKind::Identifier => ParseError::UnexpectedIdentifier(token),
        TokenKind::Comma => ParseError::UnexpectedComma(token),
        _ => ParseError::UnexpectedKeyword(token),
    }
}

/// The lookahead set that triggers implicit concatenation: any token that
/// can begin a primary expression.
fn starts_primary(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::LeftParen | TokenKind::Identifier | TokenKind::Integer | TokenKind::String
    )
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    in_function: bool,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            in_function: false,
        }
    }

    pub fn parse_program(mut self) -> ParseResult<Program> {
        let mut statements = Vec::new();
        while let Some(statement) = self.parse_statement()? {
            statements.push(statement);
        }
        Ok(Program { statements })
    }

    fn peek_token(&self) -> Token {
        self.tokens.get(self.pos).cloned().unwrap_or_default()
    }

    fn read_token(&mut self) -> Token {
        let token = self.peek_token();
        if token.kind != TokenKind::Invalid {
            self.pos += 1;
        }
        token
    }

    fn consume_required(
        &mut self,
        kind: TokenKind,
        error: fn(Token) -> ParseError,
    ) -> ParseResult<Token> {
        let token = self.read_token();
        if token.kind != kind {
            return Err(error(token));
        }
        Ok(token)
    }

    fn skip_newlines(&mut self) {
        while self.peek_token().kind == TokenKind::Newline {
            self.read_token();
        }
    }

    /// Parses one statement, or `None` at the end of the token stream.
    pub fn parse_statement(&mut self) -> ParseResult<Option<Statement>> {
        let token = self.peek_token();
        let statement = match token.kind {
            TokenKind::Delete => self.parse_delete_statement()?,
            TokenKind::Return => self.parse_return_statement()?,
            TokenKind::LeftBrace => Statement::Block(self.parse_block_statement()?),
            TokenKind::While => self.parse_while_statement()?,
            TokenKind::For => self.parse_for_statement()?,
            TokenKind::If => self.parse_if_statement()?,
            TokenKind::Identifier | TokenKind::Increment | TokenKind::Decrement => {
                self.parse_expression_statement()?
            }
            TokenKind::Newline => self.parse_empty_statement()?,
            TokenKind::Break => self.parse_break_statement()?,
            TokenKind::Continue => self.parse_continue_statement()?,
            TokenKind::Define => self.parse_function_statement()?,
            TokenKind::Invalid => return Ok(None),
            _ => return Err(unexpected_token_error(token)),
        };
        Ok(Some(statement))
    }

    /// Like `parse_statement`, but the end of input is an error: loop and
    /// conditional heads need a body.
    fn parse_required_statement(&mut self) -> ParseResult<Statement> {
        match self.parse_statement()? {
            Some(statement) => Ok(statement),
            None => Err(unexpected_token_error(self.peek_token())),
        }
    }

    fn parse_delete_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // delete keyword, guaranteed by dispatch

        match self.parse_expression()? {
            Some(Expression::ArrayIndex { array, indices }) => Ok(Statement::Delete {
                target: *array,
                indices,
            }),
            _ => Err(ParseError::InvalidDelete(self.peek_token())),
        }
    }

    fn parse_return_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // return keyword, guaranteed by dispatch

        let value = self.parse_expression()?;
        Ok(Statement::Return { value })
    }

    fn parse_block_statement(&mut self) -> ParseResult<Vec<Statement>> {
        self.consume_required(TokenKind::LeftBrace, ParseError::MissingOpenBrace)?;

        let mut statements = Vec::new();
        while self.peek_token().kind != TokenKind::RightBrace {
            match self.parse_statement()? {
                Some(statement) => statements.push(statement),
                None => return Err(ParseError::MissingClosingBrace(self.peek_token())),
            }
        }

        self.consume_required(TokenKind::RightBrace, ParseError::MissingClosingBrace)?;
        Ok(statements)
    }

    fn parse_while_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // while keyword, guaranteed by dispatch
        self.consume_required(TokenKind::LeftParen, ParseError::MissingOpenParen)?;

        let cond = self.require_expression(Self::parse_expression)?;

        self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
        self.skip_newlines();

        let body = self.parse_required_statement()?;

        Ok(Statement::Loop {
            init: Vec::new(),
            cond: Some(cond),
            incr: Vec::new(),
            body: Box::new(body),
        })
    }

    fn parse_for_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // for keyword, guaranteed by dispatch
        self.consume_required(TokenKind::LeftParen, ParseError::MissingOpenParen)?;

        let mut init = self.parse_expression_list()?;

        if self.peek_token().kind == TokenKind::Semicolon {
            // standard C-style loop
            self.read_token();
            let cond = self.parse_expression()?;
            self.consume_required(TokenKind::Semicolon, ParseError::MissingSemicolon)?;
            let incr = self.parse_expression_list()?;
            self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
            self.skip_newlines();

            let body = self.parse_required_statement()?;

            return Ok(Statement::Loop {
                init,
                cond,
                incr,
                body: Box::new(body),
            });
        }

        // without a semicolon the head must be a single "x in y" expression
        if init.len() == 1
            && matches!(init[0], Expression::Binary { op: BinaryOp::In, .. })
            && let Some(Expression::Binary { lhs, rhs, .. }) = init.pop()
        {
            self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
            self.skip_newlines();

            let body = self.parse_required_statement()?;

            return Ok(Statement::ForEach {
                iterator: *lhs,
                container: *rhs,
                body: Box::new(body),
            });
        }

        Err(ParseError::MissingSemicolon(self.peek_token()))
    }

    fn parse_if_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // if keyword, guaranteed by dispatch
        self.consume_required(TokenKind::LeftParen, ParseError::MissingOpenParen)?;

        let cond = self.require_expression(Self::parse_expression)?;

        self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
        self.skip_newlines();

        let then_body = self.parse_required_statement()?;

        // an else may sit on its own line below the then-branch
        self.skip_newlines();

        let else_body = if self.peek_token().kind == TokenKind::Else {
            self.read_token();
            self.skip_newlines();
            Some(Box::new(self.parse_required_statement()?))
        } else {
            None
        };

        Ok(Statement::If {
            cond,
            then_body: Box::new(then_body),
            else_body,
        })
    }

    fn parse_function_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // define keyword, guaranteed by dispatch

        if self.in_function {
            return Err(ParseError::FunctionDefinedWithinFunction(self.peek_token()));
        }

        let name = self.read_token();
        if name.kind != TokenKind::Identifier {
            return Err(ParseError::MissingIdentifier(name));
        }

        self.skip_newlines();

        self.in_function = true;
        let body = self.parse_block_statement();
        self.in_function = false;

        Ok(Statement::Function {
            name: name.lexeme,
            body: body?,
        })
    }

    fn parse_break_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // break keyword, guaranteed by dispatch
        self.consume_required(TokenKind::Newline, ParseError::MissingNewline)?;
        Ok(Statement::Break)
    }

    fn parse_continue_statement(&mut self) -> ParseResult<Statement> {
        self.read_token(); // continue keyword, guaranteed by dispatch
        self.consume_required(TokenKind::Newline, ParseError::MissingNewline)?;
        Ok(Statement::Continue)
    }

    fn parse_expression_statement(&mut self) -> ParseResult<Statement> {
        let expression = self.parse_expression()?;
        self.consume_required(TokenKind::Newline, ParseError::MissingNewline)?;
        self.skip_newlines();
        Ok(Statement::Expression(expression))
    }

    fn parse_empty_statement(&mut self) -> ParseResult<Statement> {
        self.consume_required(TokenKind::Newline, ParseError::MissingNewline)?;
        self.skip_newlines();
        Ok(Statement::Expression(None))
    }

    /// Parses one expression, or `None` when the next token cannot begin
    /// one. Positions that require an operand turn `None` into a syntax
    /// error named after the offending token.
    pub fn parse_expression(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_assignment()
    }

    /// Comma-separated expression list for call arguments, index lists, and
    /// `for` init/increment slots. Empty slots contribute nothing.
    fn parse_expression_list(&mut self) -> ParseResult<Vec<Expression>> {
        let mut expressions = Vec::new();
        loop {
            if let Some(expression) = self.parse_expression()? {
                expressions.push(expression);
            }
            if self.peek_token().kind != TokenKind::Comma {
                break;
            }
            self.read_token();
        }
        Ok(expressions)
    }

    fn require_expression(
        &mut self,
        parse: fn(&mut Self) -> ParseResult<Option<Expression>>,
    ) -> ParseResult<Expression> {
        match parse(self)? {
            Some(expression) => Ok(expression),
            None => Err(unexpected_token_error(self.peek_token())),
        }
    }

    fn parse_left_assoc(
        &mut self,
        next: fn(&mut Self) -> ParseResult<Option<Expression>>,
        op_for: fn(TokenKind) -> Option<BinaryOp>,
    ) -> ParseResult<Option<Expression>> {
        let Some(mut expr) = next(self)? else {
            return Ok(None);
        };

        while let Some(op) = op_for(self.peek_token().kind) {
            self.read_token();
            let rhs = self.require_expression(next)?;
            expr = Expression::Binary {
                op,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }

        Ok(Some(expr))
    }

    // =, +=, -=, *=, /=, %= (right-associative)
    fn parse_assignment(&mut self) -> ParseResult<Option<Expression>> {
        let Some(expr) = self.parse_concatenation()? else {
            return Ok(None);
        };

        let op = match self.peek_token().kind {
            TokenKind::Assign => BinaryOp::Assign,
            TokenKind::AddAssign => BinaryOp::AddAssign,
            TokenKind::SubAssign => BinaryOp::SubAssign,
            TokenKind::MulAssign => BinaryOp::MulAssign,
            TokenKind::DivAssign => BinaryOp::DivAssign,
            TokenKind::ModAssign => BinaryOp::ModAssign,
            _ => return Ok(Some(expr)),
        };

        self.read_token();
        let rhs = self.require_expression(Self::parse_assignment)?;

        Ok(Some(Expression::Binary {
            op,
            lhs: Box::new(expr),
            rhs: Box::new(rhs),
        }))
    }

    // implicit concatenation: no operator token is consumed
    fn parse_concatenation(&mut self) -> ParseResult<Option<Expression>> {
        let Some(mut expr) = self.parse_logical_or()? else {
            return Ok(None);
        };

        while starts_primary(self.peek_token().kind) {
            let rhs = self.require_expression(Self::parse_logical_or)?;
            expr = Expression::Binary {
                op: BinaryOp::Concatenate,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            };
        }

        Ok(Some(expr))
    }

    // ||
    fn parse_logical_or(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_logical_and, |kind| match kind {
            TokenKind::LogicalOr => Some(BinaryOp::LogicalOr),
            _ => None,
        })
    }

    // &&
    fn parse_logical_and(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_bitwise_or, |kind| match kind {
            TokenKind::LogicalAnd => Some(BinaryOp::LogicalAnd),
            _ => None,
        })
    }

    // |
    fn parse_bitwise_or(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_bitwise_and, |kind| match kind {
            TokenKind::BinaryOr => Some(BinaryOp::BinaryOr),
            _ => None,
        })
    }

    // &
    fn parse_bitwise_and(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_comparison, |kind| match kind {
            TokenKind::BinaryAnd => Some(BinaryOp::BinaryAnd),
            _ => None,
        })
    }

    // ==, !=, <, <=, >, >=, in all share one priority, as in NEdit
    fn parse_comparison(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_additive, |kind| match kind {
            TokenKind::Equal => Some(BinaryOp::Equal),
            TokenKind::NotEqual => Some(BinaryOp::NotEqual),
            TokenKind::LessThan => Some(BinaryOp::LessThan),
            TokenKind::LessThanOrEqual => Some(BinaryOp::LessThanOrEqual),
            TokenKind::GreaterThan => Some(BinaryOp::GreaterThan),
            TokenKind::GreaterThanOrEqual => Some(BinaryOp::GreaterThanOrEqual),
            TokenKind::In => Some(BinaryOp::In),
            _ => None,
        })
    }

    // +, -
    fn parse_additive(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_multiplicative, |kind| match kind {
            TokenKind::Add => Some(BinaryOp::Add),
            TokenKind::Sub => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    // *, /, %
    fn parse_multiplicative(&mut self) -> ParseResult<Option<Expression>> {
        self.parse_left_assoc(Self::parse_unary, |kind| match kind {
            TokenKind::Mul => Some(BinaryOp::Mul),
            TokenKind::Div => Some(BinaryOp::Div),
            TokenKind::Mod => Some(BinaryOp::Mod),
            _ => None,
        })
    }

    // prefix -, !, ++, --, then postfix ++, --
    fn parse_unary(&mut self) -> ParseResult<Option<Expression>> {
        let prefix_op = match self.peek_token().kind {
            TokenKind::Increment => Some(UnaryOp::Increment),
            TokenKind::Decrement => Some(UnaryOp::Decrement),
            TokenKind::Sub => Some(UnaryOp::Sub),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = prefix_op {
            self.read_token();
            let operand = self.require_expression(Self::parse_unary)?;
            return Ok(Some(Expression::Unary {
                op,
                operand: Box::new(operand),
                prefix: true,
            }));
        }

        let Some(mut expr) = self.parse_exponent()? else {
            return Ok(None);
        };

        loop {
            let op = match self.peek_token().kind {
                TokenKind::Increment => UnaryOp::Increment,
                TokenKind::Decrement => UnaryOp::Decrement,
                _ => break,
            };
            self.read_token();
            expr = Expression::Unary {
                op,
                operand: Box::new(expr),
                prefix: false,
            };
        }

        Ok(Some(expr))
    }

    // ^ is right-associative, so recurse instead of looping
    fn parse_exponent(&mut self) -> ParseResult<Option<Expression>> {
        let Some(expr) = self.parse_grouping()? else {
            return Ok(None);
        };

        if self.peek_token().kind == TokenKind::Exponent {
            self.read_token();
            let rhs = self.require_expression(Self::parse_exponent)?;
            return Ok(Some(Expression::Binary {
                op: BinaryOp::Exponent,
                lhs: Box::new(expr),
                rhs: Box::new(rhs),
            }));
        }

        Ok(Some(expr))
    }

    // ( ... )
    fn parse_grouping(&mut self) -> ParseResult<Option<Expression>> {
        if self.peek_token().kind == TokenKind::LeftParen {
            self.read_token();
            let expr = self.require_expression(Self::parse_expression)?;
            self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
            return Ok(Some(expr));
        }

        self.parse_primary()
    }

    // atom, then any number of [index-list] suffixes, then one optional
    // (arg-list)
    fn parse_primary(&mut self) -> ParseResult<Option<Expression>> {
        let Some(mut expr) = self.parse_atom() else {
            return Ok(None);
        };

        while self.peek_token().kind == TokenKind::LeftBracket {
            self.read_token();
            let indices = self.parse_expression_list()?;
            self.consume_required(TokenKind::RightBracket, ParseError::MissingClosingBracket)?;
            expr = Expression::ArrayIndex {
                array: Box::new(expr),
                indices,
            };
        }

        if self.peek_token().kind == TokenKind::LeftParen {
            self.read_token();
            let args = if self.peek_token().kind == TokenKind::RightParen {
                Vec::new()
            } else {
                self.parse_expression_list()?
            };
            self.consume_required(TokenKind::RightParen, ParseError::MissingClosingParen)?;
            expr = Expression::Call {
                callee: Box::new(expr),
                args,
            };
        }

        Ok(Some(expr))
    }

    fn parse_atom(&mut self) -> Option<Expression> {
        let kind = match self.peek_token().kind {
            TokenKind::Identifier => AtomKind::Identifier,
            TokenKind::Integer => AtomKind::Integer,
            TokenKind::String => AtomKind::String,
            _ => return None,
        };
        let token = self.read_token();
        Some(Expression::Atom {
            value: token.lexeme,
            kind,
        })
    }
}

pub fn parse_tokens(tokens: Vec<Token>) -> ParseResult<Program> {
    Parser::new(tokens).parse_program()
}
