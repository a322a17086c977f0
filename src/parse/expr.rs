use std::rc::Rc;

use anyhow::Result;

use super::{Parser, VarAttr};
use crate::ast::{BinOp, InitValue, Node, NodeKind, VarRef};
use crate::ty::{add_type, array_of, char_type, has_base, int_type, is_integer, TypeKind};

pub(crate) fn new_num(val: i64, loc: usize) -> Node {
    Node::new(NodeKind::Num(val), loc)
}

pub(crate) fn new_binary(op: BinOp, lhs: Node, rhs: Node, loc: usize) -> Node {
    Node::new(
        NodeKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        loc,
    )
}

pub(crate) fn new_var_node(var: &VarRef, loc: usize) -> Node {
    Node::new(
        NodeKind::Var {
            var: Rc::clone(var),
            init: None,
        },
        loc,
    )
}

impl<'a> Parser<'a> {
    /// expr = assign ("," assign)*
    ///
    /// The discarded left side is wrapped as an expression statement so its
    /// value is popped and each expression still leaves exactly one value.
    pub(crate) fn expr(&mut self) -> Result<Node> {
        let mut node = self.assign()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume(",") {
                return Ok(node);
            }
            let rhs = self.assign()?;
            let lhs = Node::new(NodeKind::ExprStmt(Box::new(node)), loc);
            node = Node::new(
                NodeKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
    }

    /// assign = conditional (assign-op assign)?
    ///
    /// `+=`/`-=` pick the pointer-arithmetic forms when the left side has a
    /// pointee.
    pub(crate) fn assign(&mut self) -> Result<Node> {
        let node = self.conditional()?;
        let loc = self.peek().loc;

        if self.consume("=") {
            let rhs = self.assign()?;
            return Ok(Node::new(
                NodeKind::Assign {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                loc,
            ));
        }
        if self.consume("*=") {
            return self.assign_op(BinOp::Mul, node, loc);
        }
        if self.consume("/=") {
            return self.assign_op(BinOp::Div, node, loc);
        }
        if self.consume("<<=") {
            return self.assign_op(BinOp::Shl, node, loc);
        }
        if self.consume(">>=") {
            return self.assign_op(BinOp::Shr, node, loc);
        }
        if self.consume("&=") {
            return self.assign_op(BinOp::BitAnd, node, loc);
        }
        if self.consume("|=") {
            return self.assign_op(BinOp::BitOr, node, loc);
        }
        if self.consume("^=") {
            return self.assign_op(BinOp::BitXor, node, loc);
        }
        if self.consume("+=") {
            let mut lhs = node;
            add_type(self.file, &mut lhs)?;
            let op = if has_base(lhs.ty.as_ref().expect("typed above")) {
                BinOp::PtrAdd
            } else {
                BinOp::Add
            };
            return self.assign_op(op, lhs, loc);
        }
        if self.consume("-=") {
            let mut lhs = node;
            add_type(self.file, &mut lhs)?;
            let op = if has_base(lhs.ty.as_ref().expect("typed above")) {
                BinOp::PtrSub
            } else {
                BinOp::Sub
            };
            return self.assign_op(op, lhs, loc);
        }
        Ok(node)
    }

    fn assign_op(&mut self, op: BinOp, lhs: Node, loc: usize) -> Result<Node> {
        let rhs = self.assign()?;
        Ok(Node::new(
            NodeKind::AssignOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        ))
    }

    /// conditional = logor ("?" expr ":" conditional)?
    pub(crate) fn conditional(&mut self) -> Result<Node> {
        let cond = self.logor()?;
        let loc = self.peek().loc;
        if !self.consume("?") {
            return Ok(cond);
        }
        let then = self.expr()?;
        self.expect(":")?;
        let els = self.conditional()?;
        Ok(Node::new(
            NodeKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
            loc,
        ))
    }

    /// logor = logand ("||" logand)*
    fn logor(&mut self) -> Result<Node> {
        let mut node = self.logand()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume("||") {
                return Ok(node);
            }
            let rhs = self.logand()?;
            node = Node::new(
                NodeKind::LogOr {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
    }

    /// logand = bitor ("&&" bitor)*
    fn logand(&mut self) -> Result<Node> {
        let mut node = self.bitor()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume("&&") {
                return Ok(node);
            }
            let rhs = self.bitor()?;
            node = Node::new(
                NodeKind::LogAnd {
                    lhs: Box::new(node),
                    rhs: Box::new(rhs),
                },
                loc,
            );
        }
    }

    /// bitor = bitxor ("|" bitxor)*
    fn bitor(&mut self) -> Result<Node> {
        let mut node = self.bitxor()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume("|") {
                return Ok(node);
            }
            node = new_binary(BinOp::BitOr, node, self.bitxor()?, loc);
        }
    }

    /// bitxor = bitand ("^" bitand)*
    fn bitxor(&mut self) -> Result<Node> {
        let mut node = self.bitand()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume("^") {
                return Ok(node);
            }
            node = new_binary(BinOp::BitXor, node, self.bitand()?, loc);
        }
    }

    /// bitand = equality ("&" equality)*
    fn bitand(&mut self) -> Result<Node> {
        let mut node = self.equality()?;
        loop {
            let loc = self.peek().loc;
            if !self.consume("&") {
                return Ok(node);
            }
            node = new_binary(BinOp::BitAnd, node, self.equality()?, loc);
        }
    }

    /// equality = relational ("==" relational | "!=" relational)*
    fn equality(&mut self) -> Result<Node> {
        let mut node = self.relational()?;
        loop {
            let loc = self.peek().loc;
            if self.consume("==") {
                node = new_binary(BinOp::Eq, node, self.relational()?, loc);
            } else if self.consume("!=") {
                node = new_binary(BinOp::Ne, node, self.relational()?, loc);
            } else {
                return Ok(node);
            }
        }
    }

    /// relational = shift ("<" shift | "<=" shift | ">" shift | ">=" shift)*
    ///
    /// `>` and `>=` are normalized by swapping the operands.
    fn relational(&mut self) -> Result<Node> {
        let mut node = self.shift()?;
        loop {
            let loc = self.peek().loc;
            if self.consume("<") {
                node = new_binary(BinOp::Lt, node, self.shift()?, loc);
            } else if self.consume("<=") {
                node = new_binary(BinOp::Le, node, self.shift()?, loc);
            } else if self.consume(">") {
                node = new_binary(BinOp::Lt, self.shift()?, node, loc);
            } else if self.consume(">=") {
                node = new_binary(BinOp::Le, self.shift()?, node, loc);
            } else {
                return Ok(node);
            }
        }
    }

    /// shift = add ("<<" add | ">>" add)*
    fn shift(&mut self) -> Result<Node> {
        let mut node = self.add()?;
        loop {
            let loc = self.peek().loc;
            if self.consume("<<") {
                node = new_binary(BinOp::Shl, node, self.add()?, loc);
            } else if self.consume(">>") {
                node = new_binary(BinOp::Shr, node, self.add()?, loc);
            } else {
                return Ok(node);
            }
        }
    }

    /// Builds `lhs + rhs`, dispatching between integer and pointer addition
    /// on the operand types.
    pub(crate) fn new_add(&self, mut lhs: Node, mut rhs: Node, loc: usize) -> Result<Node> {
        add_type(self.file, &mut lhs)?;
        add_type(self.file, &mut rhs)?;
        let lt = lhs.ty.clone().expect("typed above");
        let rt = rhs.ty.clone().expect("typed above");

        if is_integer(&lt) && is_integer(&rt) {
            Ok(new_binary(BinOp::Add, lhs, rhs, loc))
        } else if has_base(&lt) && is_integer(&rt) {
            Ok(new_binary(BinOp::PtrAdd, lhs, rhs, loc))
        } else if is_integer(&lt) && has_base(&rt) {
            Ok(new_binary(BinOp::PtrAdd, rhs, lhs, loc))
        } else {
            Err(self.file.error_at(loc, "invalid operands"))
        }
    }

    fn new_sub(&self, mut lhs: Node, mut rhs: Node, loc: usize) -> Result<Node> {
        add_type(self.file, &mut lhs)?;
        add_type(self.file, &mut rhs)?;
        let lt = lhs.ty.clone().expect("typed above");
        let rt = rhs.ty.clone().expect("typed above");

        if is_integer(&lt) && is_integer(&rt) {
            Ok(new_binary(BinOp::Sub, lhs, rhs, loc))
        } else if has_base(&lt) && is_integer(&rt) {
            Ok(new_binary(BinOp::PtrSub, lhs, rhs, loc))
        } else if has_base(&lt) && has_base(&rt) {
            Ok(new_binary(BinOp::PtrDiff, lhs, rhs, loc))
        } else {
            Err(self.file.error_at(loc, "invalid operands"))
        }
    }

    /// add = mul ("+" mul | "-" mul)*
    fn add(&mut self) -> Result<Node> {
        let mut node = self.mul()?;
        loop {
            let loc = self.peek().loc;
            if self.consume("+") {
                let rhs = self.mul()?;
                node = self.new_add(node, rhs, loc)?;
            } else if self.consume("-") {
                let rhs = self.mul()?;
                node = self.new_sub(node, rhs, loc)?;
            } else {
                return Ok(node);
            }
        }
    }

    /// mul = cast ("*" cast | "/" cast)*
    fn mul(&mut self) -> Result<Node> {
        let mut node = self.cast()?;
        loop {
            let loc = self.peek().loc;
            if self.consume("*") {
                node = new_binary(BinOp::Mul, node, self.cast()?, loc);
            } else if self.consume("/") {
                node = new_binary(BinOp::Div, node, self.cast()?, loc);
            } else {
                return Ok(node);
            }
        }
    }

    /// cast = "(" type-name ")" cast | unary
    ///
    /// `(type-name){...}` is a compound literal, not a cast; the cursor is
    /// rewound and postfix picks it up.
    fn cast(&mut self) -> Result<Node> {
        let save = self.pos;
        let loc = self.peek().loc;
        if self.consume("(") {
            if self.is_typename() {
                let ty = self.type_name()?;
                self.expect(")")?;
                if !self.peek_is("{") {
                    let mut operand = self.cast()?;
                    add_type(self.file, &mut operand)?;
                    let mut node = Node::new(NodeKind::Cast(Box::new(operand)), loc);
                    node.ty = Some(ty);
                    return Ok(node);
                }
            }
            self.pos = save;
        }
        self.unary()
    }

    /// unary = ("+" | "-" | "&" | "*" | "!" | "~") cast
    ///       | ("++" | "--") unary
    ///       | "sizeof" "(" type-name ")" | "sizeof" unary
    ///       | "_Alignof" "(" type-name ")"
    ///       | postfix
    fn unary(&mut self) -> Result<Node> {
        let loc = self.peek().loc;

        if self.consume("+") {
            return self.cast();
        }
        if self.consume("-") {
            let rhs = self.cast()?;
            return Ok(new_binary(BinOp::Sub, new_num(0, loc), rhs, loc));
        }
        if self.consume("&") {
            return Ok(Node::new(NodeKind::Addr(Box::new(self.cast()?)), loc));
        }
        if self.consume("*") {
            return Ok(Node::new(NodeKind::Deref(Box::new(self.cast()?)), loc));
        }
        if self.consume("!") {
            return Ok(Node::new(NodeKind::Not(Box::new(self.cast()?)), loc));
        }
        if self.consume("~") {
            return Ok(Node::new(NodeKind::BitNot(Box::new(self.cast()?)), loc));
        }
        if self.consume("++") {
            return Ok(Node::new(NodeKind::PreInc(Box::new(self.unary()?)), loc));
        }
        if self.consume("--") {
            return Ok(Node::new(NodeKind::PreDec(Box::new(self.unary()?)), loc));
        }

        if self.consume("sizeof") {
            let save = self.pos;
            if self.consume("(") {
                if self.is_typename() {
                    let ty = self.type_name()?;
                    self.expect(")")?;
                    if ty.borrow().is_incomplete {
                        return Err(self.file.error_at(loc, "sizeof of an incomplete type"));
                    }
                    let size = ty.borrow().size;
                    return Ok(new_num(size, loc));
                }
                self.pos = save;
            }
            let mut node = self.unary()?;
            add_type(self.file, &mut node)?;
            let ty = node.ty.expect("typed above");
            if ty.borrow().is_incomplete {
                return Err(self.file.error_at(loc, "sizeof of an incomplete type"));
            }
            let size = ty.borrow().size;
            return Ok(new_num(size, loc));
        }

        if self.consume("_Alignof") {
            self.expect("(")?;
            let ty = self.type_name()?;
            self.expect(")")?;
            if ty.borrow().is_incomplete {
                return Err(self.file.error_at(loc, "_Alignof of an incomplete type"));
            }
            let align = ty.borrow().align;
            return Ok(new_num(align, loc));
        }

        self.postfix()
    }

    /// postfix = (compound-literal | primary)
    ///           ("[" expr "]" | "." ident | "->" ident | "++" | "--")*
    fn postfix(&mut self) -> Result<Node> {
        let mut node = match self.compound_literal()? {
            Some(node) => node,
            None => self.primary()?,
        };

        loop {
            let loc = self.peek().loc;
            if self.consume("[") {
                // x[y] is *(x + y)
                let idx = self.expr()?;
                self.expect("]")?;
                let sum = self.new_add(node, idx, loc)?;
                node = Node::new(NodeKind::Deref(Box::new(sum)), loc);
                continue;
            }
            if self.consume(".") {
                node = self.struct_ref(node)?;
                continue;
            }
            if self.consume("->") {
                // x->y is (*x).y
                let deref = Node::new(NodeKind::Deref(Box::new(node)), loc);
                node = self.struct_ref(deref)?;
                continue;
            }
            if self.consume("++") {
                node = Node::new(NodeKind::PostInc(Box::new(node)), loc);
                continue;
            }
            if self.consume("--") {
                node = Node::new(NodeKind::PostDec(Box::new(node)), loc);
                continue;
            }
            return Ok(node);
        }
    }

    fn struct_ref(&mut self, mut lhs: Node) -> Result<Node> {
        add_type(self.file, &mut lhs)?;
        let ty = lhs.ty.clone().expect("typed above");
        if ty.borrow().kind != TypeKind::Struct {
            return Err(self.file.error_at(lhs.loc, "not a struct"));
        }

        let (name, loc) = self.expect_ident()?;
        let member = ty
            .borrow()
            .members
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .ok_or_else(|| self.file.error_at(loc, format!("no such member '{name}'")))?;

        Ok(Node::new(
            NodeKind::Member {
                base: Box::new(lhs),
                member,
            },
            loc,
        ))
    }

    /// compound-literal = "(" type-name ")" "{" initializer "}"
    ///
    /// At file scope the literal becomes a synthetic static global; inside a
    /// function it becomes a synthetic local whose `init` holds the element
    /// assignments.
    fn compound_literal(&mut self) -> Result<Option<Node>> {
        let save = self.pos;
        let loc = self.peek().loc;

        if !self.consume("(") || !self.is_typename() {
            self.pos = save;
            return Ok(None);
        }
        let ty = self.type_name()?;
        self.expect(")")?;
        if !self.peek_is("{") {
            self.pos = save;
            return Ok(None);
        }

        let label = self.new_data_label();
        if self.scopes.depth == 0 {
            let var = self.new_gvar(label, Rc::clone(&ty), true, true);
            let init = self.gvar_initializer(&ty)?;
            var.borrow_mut().initializer = init;
            return Ok(Some(new_var_node(&var, loc)));
        }

        let var = self.new_lvar(label, Rc::clone(&ty));
        let mut stmts = Vec::new();
        let mut desg = Vec::new();
        self.lvar_initializer(&mut stmts, &var, &ty, &mut desg)?;
        let mut node = new_var_node(&var, loc);
        if let NodeKind::Var { init, .. } = &mut node.kind {
            *init = Some(Box::new(Node::new(NodeKind::Block(stmts), loc)));
        }
        Ok(Some(node))
    }

    fn funcall(&mut self, name: String, loc: usize) -> Result<Node> {
        let args = self.func_args()?;
        let mut node = Node::new(NodeKind::FunCall { name: name.clone(), args }, loc);
        // Types the arguments; the call's own type comes from the scope.
        add_type(self.file, &mut node)?;

        let ret_ty = match self.scopes.find_var(&name).map(|e| e.attr.clone()) {
            Some(VarAttr::Var(var)) => {
                let vty = Rc::clone(&var.borrow().ty);
                let ret = {
                    let t = vty.borrow();
                    if t.kind != TypeKind::Func {
                        return Err(self.file.error_at(loc, format!("'{name}' is not a function")));
                    }
                    Rc::clone(t.return_ty.as_ref().expect("function type has return type"))
                };
                ret
            }
            Some(_) => {
                return Err(self.file.error_at(loc, format!("'{name}' is not a function")))
            }
            None => {
                // the va_start intrinsic is compiled inline and never declared
                if name != "__builtin_va_start" {
                    self.file
                        .warn_at(loc, format!("implicit declaration of function '{name}'"));
                }
                int_type()
            }
        };
        node.ty = Some(ret_ty);
        Ok(node)
    }

    /// func-args = "(" (assign ("," assign)*)? ")"
    ///
    /// The opening parenthesis is already consumed by the caller.
    fn func_args(&mut self) -> Result<Vec<Node>> {
        let mut args = Vec::new();
        if self.consume(")") {
            return Ok(args);
        }
        args.push(self.assign()?);
        while self.consume(",") {
            args.push(self.assign()?);
        }
        self.expect(")")?;
        Ok(args)
    }

    /// stmt-expr = "(" "{" stmt+ "}" ")"
    ///
    /// GNU extension; the value is the last statement, which must be an
    /// expression statement and is promoted to a plain expression here.
    fn stmt_expr(&mut self, loc: usize) -> Result<Node> {
        let mark = self.scopes.enter();
        let mut body = vec![self.stmt()?];
        while !self.consume("}") {
            body.push(self.stmt()?);
        }
        self.expect(")")?;
        self.scopes.leave(mark);

        let last = body.pop().expect("parsed at least one statement");
        match last.kind {
            NodeKind::ExprStmt(inner) => body.push(*inner),
            _ => {
                return Err(self
                    .file
                    .error_at(last.loc, "statement expression returning void is not supported"))
            }
        }
        Ok(Node::new(NodeKind::StmtExpr(body), loc))
    }

    /// primary = "(" "{" stmt-expr | "(" expr ")" | ident func-args?
    ///         | str | num
    fn primary(&mut self) -> Result<Node> {
        let loc = self.peek().loc;

        if self.consume("(") {
            if self.consume("{") {
                return self.stmt_expr(loc);
            }
            let node = self.expr()?;
            self.expect(")")?;
            return Ok(node);
        }

        if let Some((name, name_loc)) = self.consume_ident() {
            if self.consume("(") {
                return self.funcall(name, name_loc);
            }
            return match self.scopes.find_var(&name).map(|e| e.attr.clone()) {
                Some(VarAttr::Var(var)) => Ok(new_var_node(&var, name_loc)),
                Some(VarAttr::EnumConst { val, .. }) => Ok(new_num(val, name_loc)),
                _ => Err(self
                    .file
                    .error_at(name_loc, format!("undefined variable '{name}'"))),
            };
        }

        if let Some((contents, str_loc)) = self.consume_str() {
            let label = self.new_data_label();
            let ty = array_of(&char_type(), contents.len() as i64);
            let var = self.new_gvar(label, ty, true, true);
            var.borrow_mut().initializer = contents
                .iter()
                .map(|&b| InitValue::Val {
                    sz: 1,
                    val: i64::from(b),
                })
                .collect();
            return Ok(new_var_node(&var, str_loc));
        }

        let val = self.expect_number()?;
        Ok(new_num(val, loc))
    }
}
