use std::rc::Rc;

use anyhow::Result;

use super::expr::{new_num, new_var_node};
use super::Parser;
use crate::ast::{InitValue, Node, NodeKind, VarRef};
use crate::token::TokenKind;
use crate::ty::{Member, TypeKind, TypeRef};

/// One step of the path from a variable to the element being initialized.
#[derive(Clone, Debug)]
pub(crate) enum Desg {
    Idx(i64),
    Mem(Member),
}

fn is_char_array(ty: &TypeRef) -> bool {
    let t = ty.borrow();
    t.kind == TypeKind::Array
        && t.base
            .as_ref()
            .is_some_and(|b| b.borrow().kind == TypeKind::Char)
}

/// Completes an unsized array in place once its element count is known.
fn complete_array(ty: &TypeRef, len: i64) {
    let elem_size = ty
        .borrow()
        .base
        .as_ref()
        .map_or(0, |b| b.borrow().size);
    let mut t = ty.borrow_mut();
    t.array_len = len;
    t.size = elem_size * len;
    t.is_incomplete = false;
}

impl<'a> Parser<'a> {
    /// Unwinds a designator chain into an lvalue expression:
    /// `*(…(var + i) + j)` for array steps, `….member` for struct steps.
    fn desg_lvalue(&self, var: &VarRef, desg: &[Desg], loc: usize) -> Result<Node> {
        match desg.split_last() {
            None => Ok(new_var_node(var, loc)),
            Some((Desg::Mem(member), rest)) => {
                let base = self.desg_lvalue(var, rest, loc)?;
                Ok(Node::new(
                    NodeKind::Member {
                        base: Box::new(base),
                        member: member.clone(),
                    },
                    loc,
                ))
            }
            Some((Desg::Idx(idx), rest)) => {
                let base = self.desg_lvalue(var, rest, loc)?;
                let sum = self.new_add(base, new_num(*idx, loc), loc)?;
                Ok(Node::new(NodeKind::Deref(Box::new(sum)), loc))
            }
        }
    }

    fn push_desg_assign(
        &self,
        out: &mut Vec<Node>,
        var: &VarRef,
        desg: &[Desg],
        rhs: Node,
        loc: usize,
    ) -> Result<()> {
        let lhs = self.desg_lvalue(var, desg, loc)?;
        let assign = Node::new(
            NodeKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            loc,
        );
        out.push(Node::new(NodeKind::ExprStmt(Box::new(assign)), loc));
        Ok(())
    }

    fn lvar_init_zero(
        &self,
        out: &mut Vec<Node>,
        var: &VarRef,
        ty: &TypeRef,
        desg: &mut Vec<Desg>,
        loc: usize,
    ) -> Result<()> {
        let kind = ty.borrow().kind;
        match kind {
            TypeKind::Array => {
                let (base, len) = {
                    let t = ty.borrow();
                    (Rc::clone(t.base.as_ref().expect("array has element type")), t.array_len)
                };
                for idx in 0..len {
                    desg.push(Desg::Idx(idx));
                    self.lvar_init_zero(out, var, &base, desg, loc)?;
                    desg.pop();
                }
            }
            TypeKind::Struct => {
                let members = ty.borrow().members.clone();
                for member in members {
                    let member_ty = Rc::clone(&member.ty);
                    desg.push(Desg::Mem(member));
                    self.lvar_init_zero(out, var, &member_ty, desg, loc)?;
                    desg.pop();
                }
            }
            _ => self.push_desg_assign(out, var, desg, new_num(0, loc), loc)?,
        }
        Ok(())
    }

    /// Consumes a surplus initializer element without emitting anything.
    fn skip_excess_element(&mut self) -> Result<()> {
        if self.consume("{") {
            if self.consume("}") {
                return Ok(());
            }
            loop {
                self.skip_excess_element()?;
                if self.consume(",") {
                    if self.consume("}") {
                        return Ok(());
                    }
                    continue;
                }
                return self.expect("}");
            }
        }
        self.assign()?;
        Ok(())
    }

    /// lvar-initializer = string-literal
    ///                  | "{" lvar-initializer ("," lvar-initializer)* ","? "}"
    ///                  | assign
    ///
    /// Walks the declared type and the brace nesting in lockstep, appending
    /// one assignment statement per scalar element. Missing elements are
    /// zero-filled; surplus elements warn and are skipped; an unsized array
    /// takes its length from the element count.
    pub(crate) fn lvar_initializer(
        &mut self,
        out: &mut Vec<Node>,
        var: &VarRef,
        ty: &TypeRef,
        desg: &mut Vec<Desg>,
    ) -> Result<()> {
        let loc = self.peek().loc;

        if is_char_array(ty) && matches!(self.peek().kind, TokenKind::Str(_)) {
            let (contents, str_loc) = self.consume_str().expect("peeked a string literal");
            if ty.borrow().is_incomplete {
                complete_array(ty, contents.len() as i64);
            }
            let array_len = ty.borrow().array_len;
            let used = contents.len().min(array_len as usize);
            for (idx, &byte) in contents.iter().enumerate().take(used) {
                desg.push(Desg::Idx(idx as i64));
                self.push_desg_assign(out, var, desg, new_num(i64::from(byte), str_loc), str_loc)?;
                desg.pop();
            }
            for idx in used as i64..array_len {
                desg.push(Desg::Idx(idx));
                self.push_desg_assign(out, var, desg, new_num(0, str_loc), str_loc)?;
                desg.pop();
            }
            return Ok(());
        }

        let kind = ty.borrow().kind;

        if kind == TypeKind::Array {
            self.expect("{")?;
            let base = {
                let t = ty.borrow();
                Rc::clone(t.base.as_ref().expect("array has element type"))
            };
            let limit = if ty.borrow().is_incomplete {
                i64::MAX
            } else {
                ty.borrow().array_len
            };

            let mut count: i64 = 0;
            if !self.consume("}") {
                loop {
                    if count < limit {
                        desg.push(Desg::Idx(count));
                        self.lvar_initializer(out, var, &base, desg)?;
                        desg.pop();
                    } else {
                        self.file
                            .warn_at(self.peek().loc, "excess elements in array initializer");
                        self.skip_excess_element()?;
                    }
                    count += 1;
                    if self.consume(",") {
                        if self.consume("}") {
                            break;
                        }
                        continue;
                    }
                    self.expect("}")?;
                    break;
                }
            }

            if ty.borrow().is_incomplete {
                complete_array(ty, count);
            }
            let array_len = ty.borrow().array_len;
            for idx in count..array_len {
                desg.push(Desg::Idx(idx));
                self.lvar_init_zero(out, var, &base, desg, loc)?;
                desg.pop();
            }
            return Ok(());
        }

        if kind == TypeKind::Struct {
            self.expect("{")?;
            let members = ty.borrow().members.clone();

            let mut idx = 0;
            if !self.consume("}") {
                loop {
                    if idx < members.len() {
                        let member = members[idx].clone();
                        let member_ty = Rc::clone(&member.ty);
                        desg.push(Desg::Mem(member));
                        self.lvar_initializer(out, var, &member_ty, desg)?;
                        desg.pop();
                    } else {
                        self.file
                            .warn_at(self.peek().loc, "excess elements in struct initializer");
                        self.skip_excess_element()?;
                    }
                    idx += 1;
                    if self.consume(",") {
                        if self.consume("}") {
                            break;
                        }
                        continue;
                    }
                    self.expect("}")?;
                    break;
                }
            }

            while idx < members.len() {
                let member = members[idx].clone();
                let member_ty = Rc::clone(&member.ty);
                desg.push(Desg::Mem(member));
                self.lvar_init_zero(out, var, &member_ty, desg, loc)?;
                desg.pop();
                idx += 1;
            }
            return Ok(());
        }

        // Scalar; a single brace-wrapped expression is accepted.
        let open = self.consume("{");
        let rhs = self.assign()?;
        if open {
            self.expect("}")?;
        }
        self.push_desg_assign(out, var, desg, rhs, loc)
    }

    /// gvar-initializer: same walk as the local form, but flattened into
    /// emission records. Struct holes and trailing elements become zero
    /// bytes; a scalar folds to either a literal of the scalar's size or a
    /// label-plus-addend relocation.
    pub(crate) fn gvar_initializer(&mut self, ty: &TypeRef) -> Result<Vec<InitValue>> {
        let mut out = Vec::new();
        self.gvar_init(&mut out, ty)?;
        Ok(out)
    }

    fn gvar_init(&mut self, out: &mut Vec<InitValue>, ty: &TypeRef) -> Result<()> {
        if is_char_array(ty) && matches!(self.peek().kind, TokenKind::Str(_)) {
            let (contents, _str_loc) = self.consume_str().expect("peeked a string literal");
            if ty.borrow().is_incomplete {
                complete_array(ty, contents.len() as i64);
            }
            let array_len = ty.borrow().array_len;
            let used = contents.len().min(array_len as usize);
            for &byte in &contents[..used] {
                out.push(InitValue::Val {
                    sz: 1,
                    val: i64::from(byte),
                });
            }
            push_zero_bytes(out, array_len - used as i64);
            return Ok(());
        }

        let kind = ty.borrow().kind;

        if kind == TypeKind::Array {
            self.expect("{")?;
            let base = {
                let t = ty.borrow();
                Rc::clone(t.base.as_ref().expect("array has element type"))
            };
            let limit = if ty.borrow().is_incomplete {
                i64::MAX
            } else {
                ty.borrow().array_len
            };

            let mut count: i64 = 0;
            if !self.consume("}") {
                loop {
                    if count < limit {
                        self.gvar_init(out, &base)?;
                    } else {
                        self.file
                            .warn_at(self.peek().loc, "excess elements in array initializer");
                        self.skip_excess_element()?;
                    }
                    count += 1;
                    if self.consume(",") {
                        if self.consume("}") {
                            break;
                        }
                        continue;
                    }
                    self.expect("}")?;
                    break;
                }
            }

            if ty.borrow().is_incomplete {
                complete_array(ty, count);
            }
            let array_len = ty.borrow().array_len;
            if count < array_len {
                push_zero_bytes(out, (array_len - count) * base.borrow().size);
            }
            return Ok(());
        }

        if kind == TypeKind::Struct {
            self.expect("{")?;
            let members = ty.borrow().members.clone();
            let struct_size = ty.borrow().size;

            let mut idx = 0;
            if !self.consume("}") {
                loop {
                    if idx < members.len() {
                        let member = &members[idx];
                        self.gvar_init(out, &member.ty)?;
                        // padding up to the next member (or the struct end)
                        let end = member.offset + member.ty.borrow().size;
                        let next = members.get(idx + 1).map_or(struct_size, |m| m.offset);
                        push_zero_bytes(out, next - end);
                    } else {
                        self.file
                            .warn_at(self.peek().loc, "excess elements in struct initializer");
                        self.skip_excess_element()?;
                    }
                    idx += 1;
                    if self.consume(",") {
                        if self.consume("}") {
                            break;
                        }
                        continue;
                    }
                    self.expect("}")?;
                    break;
                }
            }

            let from = members.get(idx).map_or(struct_size, |m| m.offset);
            push_zero_bytes(out, struct_size - from);
            return Ok(());
        }

        // Scalar.
        let open = self.consume("{");
        let expr = self.conditional()?;
        if open {
            self.expect("}")?;
        }

        let mut var = None;
        let addend = self.eval2(&expr, &mut var)?;
        match var {
            Some(var) => {
                let v = var.borrow();
                // `arr + n` folds to addend n; scale it to bytes here.
                let scale = {
                    let t = v.ty.borrow();
                    if t.kind == TypeKind::Array {
                        t.base.as_ref().map_or(1, |b| b.borrow().size)
                    } else {
                        1
                    }
                };
                out.push(InitValue::Label {
                    label: v.name.clone(),
                    addend: addend.wrapping_mul(scale),
                });
            }
            None => out.push(InitValue::Val {
                sz: ty.borrow().size,
                val: addend,
            }),
        }
        Ok(())
    }
}

fn push_zero_bytes(out: &mut Vec<InitValue>, n: i64) {
    for _ in 0..n {
        out.push(InitValue::Val { sz: 1, val: 0 });
    }
}
