use crate::ast::{Ast, Node, NodeId, NodeKind};
use crate::lexer::{Lexer, ParseError, Token, TokenKind};

/// Parse NQ source text into an arena AST rooted at a `Start` node.
pub fn parse(text: &str) -> Result<Ast, ParseError> {
    let tokens = Lexer::new(text).tokenize()?;
    Parser::new(text, tokens).parse()
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    ast: Ast,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, tokens: Vec<Token>) -> Parser<'a> {
        Parser {
            text,
            tokens,
            pos: 0,
            ast: Ast::default(),
        }
    }

    fn parse(mut self) -> Result<Ast, ParseError> {
        let var_list = self.ast.add(Node::new(NodeKind::VarList, 1));
        let func_list = self.ast.add(Node::new(NodeKind::FuncList, 1));

        loop {
            match self.peek() {
                None => break,
                Some(TokenKind::Newline) => {
                    self.advance();
                }
                Some(TokenKind::Var) => {
                    let var = self.var_decl()?;
                    self.ast.nodes[var_list].children.push(var);
                }
                Some(TokenKind::Func) => {
                    let func = self.func_def()?;
                    self.ast.nodes[func_list].children.push(func);
                }
                Some(_) => {
                    return self.error("expected a variable declaration or function definition");
                }
            }
        }

        let mut start = Node::new(NodeKind::Start, 1);
        start.children = vec![var_list, func_list];
        let root = self.ast.add(start);
        self.ast.root = root;
        Ok(self.ast)
    }

    // var name [= expr] | var *name [= expr] | var name[N]
    fn var_decl(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(TokenKind::Var)?;
        let pointer = self.eat(TokenKind::Star);
        let name = self.name()?;

        if !pointer && self.eat(TokenKind::LBracket) {
            let length = match self.peek() {
                Some(TokenKind::Int(value)) => {
                    let value = *value;
                    self.advance();
                    value
                }
                _ => return self.error("expected an array length"),
            };
            self.expect(TokenKind::RBracket)?;
            self.expect(TokenKind::Newline)?;
            let mut node = Node::new(NodeKind::Array, line);
            node.name = Some(name);
            node.value = Some(length);
            return Ok(self.ast.add(node));
        }

        let init = if self.eat(TokenKind::Assign) {
            Some(self.expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Newline)?;

        let mut node = Node::new(NodeKind::Var, line);
        node.name = Some(name);
        node.pointer = pointer;
        node.children = init.into_iter().collect();
        Ok(self.ast.add(node))
    }

    // func name(arg, *arg, ...): block
    fn func_def(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(TokenKind::Func)?;
        let name = self.name()?;
        self.expect(TokenKind::LParen)?;

        let mut arg_list = Node::new(NodeKind::ArgList, line);
        if self.peek() != Some(&TokenKind::RParen) {
            loop {
                let arg_line = self.line();
                let pointer = self.eat(TokenKind::Star);
                let arg_name = self.name()?;
                let mut arg = Node::new(NodeKind::Arg, arg_line);
                arg.name = Some(arg_name);
                arg.pointer = pointer;
                let arg = self.ast.add(arg);
                arg_list.children.push(arg);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        let arg_list = self.ast.add(arg_list);

        self.expect(TokenKind::Colon)?;
        let body = self.block()?;

        let mut node = Node::new(NodeKind::Func, line);
        node.name = Some(name);
        node.children = vec![arg_list, body];
        Ok(self.ast.add(node))
    }

    // An indented statement list.
    fn block(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;

        let mut body = Node::new(NodeKind::Body, line);
        loop {
            match self.peek() {
                Some(TokenKind::Dedent) => {
                    self.advance();
                    break;
                }
                Some(TokenKind::Newline) => {
                    self.advance();
                }
                Some(_) => {
                    let stmt = self.stmt()?;
                    body.children.push(stmt);
                }
                None => return self.error("unexpected end of file inside a block"),
            }
        }
        if body.children.is_empty() {
            return self.error("a block requires at least one statement");
        }
        Ok(self.ast.add(body))
    }

    fn stmt(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::Var) => self.var_decl(),
            Some(TokenKind::If) => self.if_stmt(),
            Some(TokenKind::While) => self.while_stmt(),
            Some(TokenKind::Return) => {
                self.advance();
                let mut node = Node::new(NodeKind::Ret, line);
                if self.peek() != Some(&TokenKind::Newline) {
                    let expr = self.expr()?;
                    node.children.push(expr);
                }
                self.expect(TokenKind::Newline)?;
                Ok(self.ast.add(node))
            }
            Some(TokenKind::Pass) => {
                self.advance();
                self.expect(TokenKind::Newline)?;
                Ok(self.ast.add(Node::new(NodeKind::Pass, line)))
            }
            // *name = expr
            Some(TokenKind::Star) => {
                self.advance();
                let name = self.name()?;
                self.expect(TokenKind::Assign)?;
                let expr = self.expr()?;
                self.expect(TokenKind::Newline)?;
                let mut node = Node::new(NodeKind::MemAssign, line);
                node.name = Some(name);
                node.children = vec![expr];
                Ok(self.ast.add(node))
            }
            Some(TokenKind::Name(_)) => {
                let name = self.name()?;
                match self.peek() {
                    // name = expr
                    Some(TokenKind::Assign) => {
                        self.advance();
                        let expr = self.expr()?;
                        self.expect(TokenKind::Newline)?;
                        let mut node = Node::new(NodeKind::Assign, line);
                        node.name = Some(name);
                        node.children = vec![expr];
                        Ok(self.ast.add(node))
                    }
                    // name[i] = expr
                    Some(TokenKind::LBracket) => {
                        self.advance();
                        let index = self.expr()?;
                        self.expect(TokenKind::RBracket)?;
                        self.expect(TokenKind::Assign)?;
                        let expr = self.expr()?;
                        self.expect(TokenKind::Newline)?;
                        let mut node = Node::new(NodeKind::IndexAssign, line);
                        node.name = Some(name);
                        node.children = vec![index, expr];
                        Ok(self.ast.add(node))
                    }
                    // name(args...)
                    Some(TokenKind::LParen) => {
                        let call = self.call(name, line)?;
                        self.expect(TokenKind::Newline)?;
                        Ok(call)
                    }
                    _ => self.error("expected \"=\", \"[\" or \"(\" after the name"),
                }
            }
            _ => self.error("expected a statement"),
        }
    }

    fn if_stmt(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(TokenKind::If)?;
        let mut node = Node::new(NodeKind::IfStmt, line);

        let cond = self.expr()?;
        self.expect(TokenKind::Colon)?;
        let body = self.block()?;
        let mut branch = Node::new(NodeKind::IfBranch, line);
        branch.children = vec![cond, body];
        let branch = self.ast.add(branch);
        node.children.push(branch);

        loop {
            match self.peek() {
                Some(TokenKind::Elif) => {
                    let branch_line = self.line();
                    self.advance();
                    let cond = self.expr()?;
                    self.expect(TokenKind::Colon)?;
                    let body = self.block()?;
                    let mut branch = Node::new(NodeKind::ElifBranch, branch_line);
                    branch.children = vec![cond, body];
                    let branch = self.ast.add(branch);
                    node.children.push(branch);
                }
                Some(TokenKind::Else) => {
                    let branch_line = self.line();
                    self.advance();
                    self.expect(TokenKind::Colon)?;
                    let body = self.block()?;
                    let mut branch = Node::new(NodeKind::ElseBranch, branch_line);
                    branch.children = vec![body];
                    let branch = self.ast.add(branch);
                    node.children.push(branch);
                    break;
                }
                _ => break,
            }
        }
        Ok(self.ast.add(node))
    }

    fn while_stmt(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        self.expect(TokenKind::While)?;
        let cond = self.expr()?;
        self.expect(TokenKind::Colon)?;
        let body = self.block()?;
        let mut node = Node::new(NodeKind::WhileStmt, line);
        node.children = vec![cond, body];
        Ok(self.ast.add(node))
    }

    // expr := addsub (cmp_op addsub)?
    fn expr(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        let left = self.addsub()?;
        let kind = match self.peek() {
            Some(TokenKind::Eq) => NodeKind::Eq,
            Some(TokenKind::Neq) => NodeKind::Neq,
            Some(TokenKind::Lt) => NodeKind::Lt,
            Some(TokenKind::Leq) => NodeKind::Leq,
            Some(TokenKind::Gt) => NodeKind::Gt,
            Some(TokenKind::Geq) => NodeKind::Geq,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.addsub()?;
        let mut node = Node::new(kind, line);
        node.children = vec![left, right];
        Ok(self.ast.add(node))
    }

    fn addsub(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.muldiv()?;
        loop {
            let kind = match self.peek() {
                Some(TokenKind::Plus) => NodeKind::Add,
                Some(TokenKind::Minus) => NodeKind::Sub,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.muldiv()?;
            let mut node = Node::new(kind, line);
            node.children = vec![left, right];
            left = self.ast.add(node);
        }
    }

    fn muldiv(&mut self) -> Result<NodeId, ParseError> {
        let mut left = self.unary()?;
        loop {
            let kind = match self.peek() {
                Some(TokenKind::Star) => NodeKind::Mul,
                Some(TokenKind::Slash) => NodeKind::Div,
                _ => return Ok(left),
            };
            let line = self.line();
            self.advance();
            let right = self.unary()?;
            let mut node = Node::new(kind, line);
            node.children = vec![left, right];
            left = self.ast.add(node);
        }
    }

    fn unary(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::Minus) => {
                self.advance();
                let operand = self.unary()?;
                let mut node = Node::new(NodeKind::Neg, line);
                node.children = vec![operand];
                Ok(self.ast.add(node))
            }
            Some(TokenKind::Star) => {
                self.advance();
                let name = self.name()?;
                let mut node = Node::new(NodeKind::Deref, line);
                node.name = Some(name);
                Ok(self.ast.add(node))
            }
            Some(TokenKind::Amp) => {
                self.advance();
                let name = self.name()?;
                let mut node = Node::new(NodeKind::GetRef, line);
                node.name = Some(name);
                Ok(self.ast.add(node))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<NodeId, ParseError> {
        let line = self.line();
        match self.peek() {
            Some(TokenKind::Int(value)) => {
                let value = *value;
                self.advance();
                let mut node = Node::new(NodeKind::Imm, line);
                node.value = Some(value);
                Ok(self.ast.add(node))
            }
            Some(TokenKind::LParen) => {
                self.advance();
                let expr = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            Some(TokenKind::Name(_)) => {
                let name = self.name()?;
                match self.peek() {
                    Some(TokenKind::LParen) => self.call(name, line),
                    Some(TokenKind::LBracket) => {
                        self.advance();
                        let index = self.expr()?;
                        self.expect(TokenKind::RBracket)?;
                        let mut node = Node::new(NodeKind::Index, line);
                        node.name = Some(name);
                        node.children = vec![index];
                        Ok(self.ast.add(node))
                    }
                    _ => {
                        let mut node = Node::new(NodeKind::Ref, line);
                        node.name = Some(name);
                        Ok(self.ast.add(node))
                    }
                }
            }
            _ => self.error("expected an expression"),
        }
    }

    fn call(&mut self, name: String, line: usize) -> Result<NodeId, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut node = Node::new(NodeKind::Call, line);
        node.name = Some(name);
        if self.peek() != Some(&TokenKind::RParen) {
            loop {
                let arg = self.expr()?;
                node.children.push(arg);
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(self.ast.add(node))
    }

    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek() == Some(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.eat(kind.clone()) {
            Ok(())
        } else {
            self.error(&format!("expected {:?}", kind))
        }
    }

    fn name(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(TokenKind::Name(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => self.error("expected a name"),
        }
    }

    fn error<T>(&self, message: &str) -> Result<T, ParseError> {
        Err(ParseError::new(
            message.to_string(),
            self.text,
            self.line(),
            0,
        ))
    }
}
