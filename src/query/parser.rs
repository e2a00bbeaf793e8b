//! Recursive-descent parser over indentation-delimited blocks (§4.D). Lines
//! are pre-tokenized and tagged with their leading indent width; blocks are
//! whatever follows a `:`-terminated header line at a strictly greater
//! indent than its header.
//!
//! The parser does not disambiguate identifiers into column/var/segment
//! references — every bare identifier becomes `Expr::Column(name)`, and the
//! compiler (which has the var and segment tables) resolves it during
//! lowering.

use crate::errors::{Error, Result};
use crate::query::ast::{BinOp, Expr, Program, SegmentDecl, Stmt, TallyTarget, UnOp};
use crate::query::lexer::{self, Token};
use crate::value::Val;

struct Line {
    indent: usize,
    tokens: Vec<Token>,
}

pub fn parse(source: &str) -> Result<Program> {
    let mut lines = Vec::new();
    for raw in source.lines() {
        let trimmed = raw.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = raw.len() - trimmed.len();
        let tokens = lexer::tokenize(trimmed)?;
        if tokens.is_empty() {
            continue;
        }
        lines.push(Line { indent, tokens });
    }
    let mut parser = Parser { lines, pos: 0 };
    parser.parse_program()
}

struct Parser {
    lines: Vec<Line>,
    pos: usize,
}

impl Parser {
    fn peek_indent(&self) -> Option<usize> {
        self.lines.get(self.pos).map(|l| l.indent)
    }

    fn take_line(&mut self) -> Result<Vec<Token>> {
        let line = self
            .lines
            .get(self.pos)
            .ok_or_else(|| Error::QueryCompile("unexpected end of input".into()))?;
        self.pos += 1;
        Ok(line.tokens.clone())
    }

    fn parse_program(&mut self) -> Result<Program> {
        let mut program = Program::default();
        while self.pos < self.lines.len() {
            let indent = self.peek_indent().unwrap();
            if indent != 0 {
                return Err(Error::QueryCompile("unexpected indent at top level".into()));
            }
            let is_segment = matches!(self.lines[self.pos].tokens.first(), Some(Token::Ident(k)) if k == "segment");
            if is_segment {
                program.segments.push(self.parse_segment()?);
            } else {
                program.body.push(self.parse_stmt(0)?);
            }
        }
        Ok(program)
    }

    fn parse_stmts(&mut self, indent: usize) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while let Some(li) = self.peek_indent() {
            if li < indent {
                break;
            }
            if li > indent {
                return Err(Error::QueryCompile("unexpected indent".into()));
            }
            stmts.push(self.parse_stmt(indent)?);
        }
        Ok(stmts)
    }

    /// Consumes the block following a `:`-terminated header line, if one is
    /// present at a deeper indent than `header_indent`.
    fn parse_block_body(&mut self, header_indent: usize) -> Result<Vec<Stmt>> {
        match self.peek_indent() {
            Some(li) if li > header_indent => self.parse_stmts(li),
            _ => Ok(Vec::new()),
        }
    }

    fn parse_segment(&mut self) -> Result<SegmentDecl> {
        let indent = self.peek_indent().unwrap();
        let tokens = self.take_line()?;
        let mut cur = TokenCursor::new(tokens);
        cur.expect_ident("segment")?;
        let name = cur.expect_any_ident()?;
        let mut ttl_ms = None;
        let mut refresh_ms = None;
        loop {
            match cur.peek() {
                Some(Token::Ident(k)) if k == "ttl" => {
                    cur.next();
                    ttl_ms = Some(cur.expect_number()?);
                }
                Some(Token::Ident(k)) if k == "refresh" => {
                    cur.next();
                    refresh_ms = Some(cur.expect_number()?);
                }
                _ => break,
            }
        }
        cur.expect_symbol(":")?;
        let body = self.parse_block_body(indent)?;
        Ok(SegmentDecl { name, ttl_ms, refresh_ms, body })
    }

    fn parse_stmt(&mut self, indent: usize) -> Result<Stmt> {
        let peek_kw = match self.lines[self.pos].tokens.first() {
            Some(Token::Ident(k)) => Some(k.clone()),
            _ => None,
        };
        match peek_kw.as_deref() {
            Some("if") => self.parse_if(indent),
            Some("for_events") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("for_events")?;
                cur.expect_symbol(":")?;
                let body = self.parse_block_body(indent)?;
                Ok(Stmt::ForEvents { body })
            }
            Some("tally") => self.parse_tally(indent),
            Some("emit") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("emit")?;
                let name = cur.expect_any_ident()?;
                Ok(Stmt::Emit(name))
            }
            Some("schedule") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("schedule")?;
                let name = cur.expect_any_ident()?;
                cur.expect_symbol(",")?;
                let expr = cur.parse_expr()?;
                Ok(Stmt::Schedule(name, expr))
            }
            Some("log") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("log")?;
                Ok(Stmt::Log(cur.parse_expr()?))
            }
            Some("debug") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("debug")?;
                Ok(Stmt::Debug(cur.parse_expr()?))
            }
            Some("return") => {
                let tokens = self.take_line()?;
                let mut cur = TokenCursor::new(tokens);
                cur.expect_ident("return")?;
                if cur.at_end() {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(cur.parse_expr()?)))
                }
            }
            Some("break") => {
                self.take_line()?;
                Ok(Stmt::Break)
            }
            Some("continue") => {
                self.take_line()?;
                Ok(Stmt::Continue)
            }
            Some("exit") => {
                self.take_line()?;
                Ok(Stmt::Exit)
            }
            _ => self.parse_assign_or_expr(),
        }
    }

    fn parse_if(&mut self, indent: usize) -> Result<Stmt> {
        let tokens = self.take_line()?;
        let mut cur = TokenCursor::new(tokens);
        cur.expect_ident("if")?;
        let cond = cur.parse_expr()?;
        cur.expect_symbol(":")?;
        let then = self.parse_block_body(indent)?;
        let mut elifs = Vec::new();
        loop {
            let is_elif = self.peek_indent() == Some(indent)
                && matches!(self.lines[self.pos].tokens.first(), Some(Token::Ident(k)) if k == "elif");
            if !is_elif {
                break;
            }
            let tokens = self.take_line()?;
            let mut cur = TokenCursor::new(tokens);
            cur.expect_ident("elif")?;
            let cond = cur.parse_expr()?;
            cur.expect_symbol(":")?;
            let body = self.parse_block_body(indent)?;
            elifs.push((cond, body));
        }
        let is_else = self.peek_indent() == Some(indent)
            && matches!(self.lines[self.pos].tokens.first(), Some(Token::Ident(k)) if k == "else");
        let else_ = if is_else {
            let tokens = self.take_line()?;
            let mut cur = TokenCursor::new(tokens);
            cur.expect_ident("else")?;
            cur.expect_symbol(":")?;
            Some(self.parse_block_body(indent)?)
        } else {
            None
        };
        Ok(Stmt::If { cond, then, elifs, else_ })
    }

    fn parse_tally(&mut self, indent: usize) -> Result<Stmt> {
        let tokens = self.take_line()?;
        let mut cur = TokenCursor::new(tokens);
        cur.expect_ident("tally")?;
        cur.expect_symbol("(")?;
        let mut keys = Vec::new();
        if !cur.peek_symbol_is(")") {
            loop {
                keys.push(cur.parse_expr()?);
                if cur.peek_symbol_is(",") {
                    cur.next();
                } else {
                    break;
                }
            }
        }
        cur.expect_symbol(")")?;
        cur.expect_symbol(":")?;
        let body_indent = match self.peek_indent() {
            Some(li) if li > indent => li,
            _ => return Err(Error::QueryCompile("tally block must not be empty".into())),
        };
        let mut targets = Vec::new();
        while self.peek_indent() == Some(body_indent) {
            let tokens = self.take_line()?;
            let mut c = TokenCursor::new(tokens);
            let column = c.expect_any_ident()?;
            c.expect_symbol("=")?;
            let modifier_name = c.expect_any_ident()?;
            let modifier = crate::query::ast::Modifier::parse(&modifier_name).ok_or_else(|| {
                Error::QueryCompile(format!("unknown tally modifier {modifier_name}"))
            })?;
            c.expect_symbol("(")?;
            let expr = c.parse_expr()?;
            c.expect_symbol(")")?;
            targets.push(TallyTarget { column, modifier, expr });
        }
        Ok(Stmt::Tally { keys, targets })
    }

    fn parse_assign_or_expr(&mut self) -> Result<Stmt> {
        let tokens = self.take_line()?;
        let mut cur = TokenCursor::new(tokens);
        if let Some(Token::Ident(name)) = cur.peek().cloned() {
            if cur.tokens.get(cur.pos + 1) == Some(&Token::Symbol("=".into())) {
                cur.next();
                cur.next();
                let expr = cur.parse_expr()?;
                return Ok(Stmt::Assign(name, expr));
            }
        }
        Ok(Stmt::Expr(cur.parse_expr()?))
    }
}

/// Single-line expression parser (precedence climbing).
struct TokenCursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl TokenCursor {
    fn new(tokens: Vec<Token>) -> TokenCursor {
        TokenCursor { tokens, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_symbol_is(&self, s: &str) -> bool {
        matches!(self.peek(), Some(Token::Symbol(sym)) if sym == s)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect_ident(&mut self, expected: &str) -> Result<()> {
        match self.next() {
            Some(Token::Ident(s)) if s == expected => Ok(()),
            other => Err(Error::QueryCompile(format!("expected `{expected}`, found {other:?}"))),
        }
    }

    fn expect_any_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(Error::QueryCompile(format!("expected identifier, found {other:?}"))),
        }
    }

    fn expect_symbol(&mut self, expected: &str) -> Result<()> {
        match self.next() {
            Some(Token::Symbol(s)) if s == expected => Ok(()),
            other => Err(Error::QueryCompile(format!("expected `{expected}`, found {other:?}"))),
        }
    }

    fn expect_number(&mut self) -> Result<i64> {
        match self.next() {
            Some(Token::Number(Val::Int(i))) => Ok(i),
            other => Err(Error::QueryCompile(format!("expected integer, found {other:?}"))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Ident(k)) if k == "or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(Box::new(lhs), BinOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::Ident(k)) if k == "and") {
            self.next();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(Box::new(lhs), BinOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(s)) if s == "==" => BinOp::Eq,
                Some(Token::Symbol(s)) if s == "!=" => BinOp::Ne,
                _ => break,
            };
            self.next();
            let rhs = self.parse_relational()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(s)) if s == "<" => BinOp::Lt,
                Some(Token::Symbol(s)) if s == "<=" => BinOp::Le,
                Some(Token::Symbol(s)) if s == ">" => BinOp::Gt,
                Some(Token::Symbol(s)) if s == ">=" => BinOp::Ge,
                _ => break,
            };
            self.next();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(s)) if s == "+" => BinOp::Add,
                Some(Token::Symbol(s)) if s == "-" => BinOp::Sub,
                _ => break,
            };
            self.next();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(s)) if s == "*" => BinOp::Mul,
                Some(Token::Symbol(s)) if s == "/" => BinOp::Div,
                _ => break,
            };
            self.next();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Ident(k)) if k == "not") {
            self.next();
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)));
        }
        if self.peek_symbol_is("-") {
            self.next();
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Literal(v)),
            Some(Token::Str(s)) => Ok(Expr::Literal(Val::Text(s))),
            Some(Token::Ident(name)) if name == "true" => Ok(Expr::Literal(Val::Bool(true))),
            Some(Token::Ident(name)) if name == "false" => Ok(Expr::Literal(Val::Bool(false))),
            Some(Token::Ident(name)) if name == "null" => Ok(Expr::Literal(Val::Null)),
            Some(Token::Ident(name)) => {
                if self.peek_symbol_is("(") {
                    self.next();
                    let mut args = Vec::new();
                    if !self.peek_symbol_is(")") {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.peek_symbol_is(",") {
                                self.next();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect_symbol(")")?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Column(name))
                }
            }
            Some(Token::Symbol(s)) if s == "(" => {
                let inner = self.parse_expr()?;
                self.expect_symbol(")")?;
                Ok(inner)
            }
            other => Err(Error::QueryCompile(format!("unexpected token {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tally_with_if_guard() {
        let src = "if country == \"us\":\n    tally(country):\n        revenue = sum(amount)\n";
        let program = parse(src).unwrap();
        assert_eq!(program.body.len(), 1);
        match &program.body[0] {
            Stmt::If { then, .. } => {
                assert_eq!(then.len(), 1);
                assert!(matches!(then[0], Stmt::Tally { .. }));
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn parses_segment_with_ttl_and_refresh() {
        let src = "segment us_users ttl 60000 refresh 5000:\n    tally(1):\n        n = count(1)\n";
        let program = parse(src).unwrap();
        assert_eq!(program.segments.len(), 1);
        assert_eq!(program.segments[0].name, "us_users");
        assert_eq!(program.segments[0].ttl_ms, Some(60000));
        assert_eq!(program.segments[0].refresh_ms, Some(5000));
    }

    #[test]
    fn rejects_unexpected_indent() {
        let src = "x = 1\n    y = 2\n";
        assert!(parse(src).is_err());
    }
}
