use std::rc::Rc;

use anyhow::Result;

use super::Parser;
use crate::ast::{BinOp, Node, NodeKind, VarRef};
use crate::ty::TypeKind;

impl<'a> Parser<'a> {
    /// const-expr = conditional, folded to an integer.
    pub(crate) fn const_expr(&mut self) -> Result<i64> {
        let node = self.conditional()?;
        self.eval(&node)
    }

    /// Folds an integer constant expression. Address expressions are
    /// rejected.
    pub(crate) fn eval(&self, node: &Node) -> Result<i64> {
        self.eval_impl(node, None)
    }

    /// Like `eval`, but admits at most one address term: `&global`, or a
    /// global of array type, recorded into `var` with the integer remainder
    /// returned as the addend.
    pub(crate) fn eval2(&self, node: &Node, var: &mut Option<VarRef>) -> Result<i64> {
        self.eval_impl(node, Some(var))
    }

    fn eval_impl(&self, node: &Node, mut var: Option<&mut Option<VarRef>>) -> Result<i64> {
        match &node.kind {
            NodeKind::Num(val) => Ok(*val),
            NodeKind::Binary { op, lhs, rhs } => match op {
                BinOp::Add => Ok(self.eval(lhs)?.wrapping_add(self.eval(rhs)?)),
                BinOp::Sub => Ok(self.eval(lhs)?.wrapping_sub(self.eval(rhs)?)),
                // The address may only sit on the pointer side.
                BinOp::PtrAdd => {
                    Ok(self.eval_impl(lhs, var.as_deref_mut())?.wrapping_add(self.eval(rhs)?))
                }
                BinOp::PtrSub => {
                    Ok(self.eval_impl(lhs, var.as_deref_mut())?.wrapping_sub(self.eval(rhs)?))
                }
                BinOp::Mul => Ok(self.eval(lhs)?.wrapping_mul(self.eval(rhs)?)),
                BinOp::Div => {
                    let divisor = self.eval(rhs)?;
                    if divisor == 0 {
                        return Err(self.file.error_at(rhs.loc, "division by zero"));
                    }
                    Ok(self.eval(lhs)?.wrapping_div(divisor))
                }
                BinOp::BitAnd => Ok(self.eval(lhs)? & self.eval(rhs)?),
                BinOp::BitOr => Ok(self.eval(lhs)? | self.eval(rhs)?),
                BinOp::BitXor => Ok(self.eval(lhs)? ^ self.eval(rhs)?),
                BinOp::Shl => Ok(self.eval(lhs)?.wrapping_shl(self.eval(rhs)? as u32)),
                BinOp::Shr => Ok(self.eval(lhs)?.wrapping_shr(self.eval(rhs)? as u32)),
                BinOp::Eq => Ok(i64::from(self.eval(lhs)? == self.eval(rhs)?)),
                BinOp::Ne => Ok(i64::from(self.eval(lhs)? != self.eval(rhs)?)),
                BinOp::Lt => Ok(i64::from(self.eval(lhs)? < self.eval(rhs)?)),
                BinOp::Le => Ok(i64::from(self.eval(lhs)? <= self.eval(rhs)?)),
                BinOp::PtrDiff => Err(self.file.error_at(node.loc, "not a constant expression")),
            },
            NodeKind::Ternary { cond, then, els } => {
                if self.eval(cond)? != 0 {
                    self.eval_impl(then, var)
                } else {
                    self.eval_impl(els, var)
                }
            }
            NodeKind::Comma { rhs, .. } => self.eval_impl(rhs, var),
            NodeKind::Not(operand) => Ok(i64::from(self.eval(operand)? == 0)),
            NodeKind::BitNot(operand) => Ok(!self.eval(operand)?),
            NodeKind::LogAnd { lhs, rhs } => {
                Ok(i64::from(self.eval(lhs)? != 0 && self.eval(rhs)? != 0))
            }
            NodeKind::LogOr { lhs, rhs } => {
                Ok(i64::from(self.eval(lhs)? != 0 || self.eval(rhs)? != 0))
            }
            NodeKind::Addr(operand) => {
                let Some(slot) = var.as_deref_mut() else {
                    return Err(self.file.error_at(node.loc, "invalid initializer"));
                };
                let NodeKind::Var { var: target, .. } = &operand.kind else {
                    return Err(self.file.error_at(node.loc, "invalid initializer"));
                };
                if slot.is_some() || target.borrow().is_local {
                    return Err(self.file.error_at(node.loc, "invalid initializer"));
                }
                *slot = Some(Rc::clone(target));
                Ok(0)
            }
            NodeKind::Var { var: target, .. } => {
                let Some(slot) = var.as_deref_mut() else {
                    return Err(self.file.error_at(node.loc, "invalid initializer"));
                };
                if slot.is_some() || target.borrow().ty.borrow().kind != TypeKind::Array {
                    return Err(self.file.error_at(node.loc, "invalid initializer"));
                }
                *slot = Some(Rc::clone(target));
                Ok(0)
            }
            _ => Err(self.file.error_at(node.loc, "not a constant expression")),
        }
    }
}
