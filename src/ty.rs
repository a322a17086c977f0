use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::ast::{BinOp, Node, NodeKind};
use crate::token::SourceFile;

/// Shared, mutable handle to a type. Forward-declared structs and unsized
/// arrays are completed through this handle so that every earlier reference
/// observes the completion.
pub type TypeRef = Rc<RefCell<Type>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Void,
    Bool,
    Char,
    Short,
    Int,
    Long,
    Enum,
    Ptr,
    Array,
    Struct,
    Func,
}

#[derive(Clone, Debug)]
pub struct Type {
    pub kind: TypeKind,
    /// sizeof in bytes
    pub size: i64,
    pub align: i64,
    pub is_incomplete: bool,
    /// pointee for `Ptr`, element type for `Array`
    pub base: Option<TypeRef>,
    pub array_len: i64,
    pub members: Vec<Member>,
    pub return_ty: Option<TypeRef>,
}

/// One struct member with its byte offset inside the struct.
#[derive(Clone, Debug)]
pub struct Member {
    pub name: String,
    pub ty: TypeRef,
    pub offset: i64,
    pub loc: usize,
}

fn new_type(kind: TypeKind, size: i64, align: i64) -> TypeRef {
    Rc::new(RefCell::new(Type {
        kind,
        size,
        align,
        is_incomplete: false,
        base: None,
        array_len: 0,
        members: Vec::new(),
        return_ty: None,
    }))
}

pub fn void_type() -> TypeRef {
    new_type(TypeKind::Void, 1, 1)
}

pub fn bool_type() -> TypeRef {
    new_type(TypeKind::Bool, 1, 1)
}

pub fn char_type() -> TypeRef {
    new_type(TypeKind::Char, 1, 1)
}

pub fn short_type() -> TypeRef {
    new_type(TypeKind::Short, 2, 2)
}

pub fn int_type() -> TypeRef {
    new_type(TypeKind::Int, 4, 4)
}

pub fn long_type() -> TypeRef {
    new_type(TypeKind::Long, 8, 8)
}

/// Enums are int-sized.
pub fn enum_type() -> TypeRef {
    new_type(TypeKind::Enum, 4, 4)
}

pub fn pointer_to(base: &TypeRef) -> TypeRef {
    let ty = new_type(TypeKind::Ptr, 8, 8);
    ty.borrow_mut().base = Some(Rc::clone(base));
    ty
}

pub fn array_of(base: &TypeRef, len: i64) -> TypeRef {
    let (elem_size, elem_align) = {
        let b = base.borrow();
        (b.size, b.align)
    };
    let ty = new_type(TypeKind::Array, elem_size * len, elem_align);
    {
        let mut t = ty.borrow_mut();
        t.base = Some(Rc::clone(base));
        t.array_len = len;
    }
    ty
}

/// Size and alignment of a function type are unused; 1 keeps layout math
/// total.
pub fn func_type(return_ty: &TypeRef) -> TypeRef {
    let ty = new_type(TypeKind::Func, 1, 1);
    ty.borrow_mut().return_ty = Some(Rc::clone(return_ty));
    ty
}

pub fn struct_type() -> TypeRef {
    let ty = new_type(TypeKind::Struct, 0, 1);
    ty.borrow_mut().is_incomplete = true;
    ty
}

/// Stand-in for the inner type of a parenthesized declarator; overwritten in
/// place once the surrounding type suffix is known.
pub fn placeholder_type() -> TypeRef {
    new_type(TypeKind::Int, 4, 4)
}

pub fn is_integer(ty: &TypeRef) -> bool {
    matches!(
        ty.borrow().kind,
        TypeKind::Bool | TypeKind::Char | TypeKind::Short | TypeKind::Int | TypeKind::Long
    )
}

/// Does a value of this type have a pointee (pointer or decayed array)?
pub fn has_base(ty: &TypeRef) -> bool {
    ty.borrow().base.is_some()
}

pub fn align_to(n: i64, align: i64) -> i64 {
    (n + align - 1) & !(align - 1)
}

/// Decorates `node` and its subtree with result types. Idempotent: a subtree
/// whose type is already set is left untouched.
pub fn add_type(file: &SourceFile, node: &mut Node) -> Result<()> {
    if node.ty.is_some() {
        return Ok(());
    }

    match &mut node.kind {
        NodeKind::Binary { lhs, rhs, .. }
        | NodeKind::Assign { lhs, rhs }
        | NodeKind::AssignOp { lhs, rhs, .. }
        | NodeKind::Comma { lhs, rhs }
        | NodeKind::LogAnd { lhs, rhs }
        | NodeKind::LogOr { lhs, rhs } => {
            add_type(file, lhs)?;
            add_type(file, rhs)?;
        }
        NodeKind::Member { base, .. } => add_type(file, base)?,
        NodeKind::Addr(operand)
        | NodeKind::Deref(operand)
        | NodeKind::Not(operand)
        | NodeKind::BitNot(operand)
        | NodeKind::PreInc(operand)
        | NodeKind::PreDec(operand)
        | NodeKind::PostInc(operand)
        | NodeKind::PostDec(operand)
        | NodeKind::Cast(operand)
        | NodeKind::ExprStmt(operand) => add_type(file, operand)?,
        NodeKind::Ternary { cond, then, els } => {
            add_type(file, cond)?;
            add_type(file, then)?;
            add_type(file, els)?;
        }
        NodeKind::Var { init, .. } => {
            if let Some(init) = init {
                add_type(file, init)?;
            }
        }
        NodeKind::FunCall { args, .. } => {
            for arg in args {
                add_type(file, arg)?;
            }
        }
        NodeKind::StmtExpr(body) | NodeKind::Block(body) => {
            for stmt in body {
                add_type(file, stmt)?;
            }
        }
        NodeKind::Return(operand) => {
            if let Some(operand) = operand {
                add_type(file, operand)?;
            }
        }
        NodeKind::If { cond, then, els } => {
            add_type(file, cond)?;
            add_type(file, then)?;
            if let Some(els) = els {
                add_type(file, els)?;
            }
        }
        NodeKind::While { cond, body } => {
            add_type(file, cond)?;
            add_type(file, body)?;
        }
        NodeKind::Do { body, cond } => {
            add_type(file, body)?;
            add_type(file, cond)?;
        }
        NodeKind::For {
            init,
            cond,
            post,
            body,
        } => {
            if let Some(init) = init {
                add_type(file, init)?;
            }
            if let Some(cond) = cond {
                add_type(file, cond)?;
            }
            if let Some(post) = post {
                add_type(file, post)?;
            }
            add_type(file, body)?;
        }
        NodeKind::Switch { cond, body, .. } => {
            add_type(file, cond)?;
            add_type(file, body)?;
        }
        NodeKind::Case { body, .. } | NodeKind::Label { body, .. } => add_type(file, body)?,
        NodeKind::Num(_)
        | NodeKind::Break
        | NodeKind::Continue
        | NodeKind::Goto(_)
        | NodeKind::Null => {}
    }

    node.ty = match &node.kind {
        NodeKind::Num(_) | NodeKind::Not(_) | NodeKind::LogAnd { .. } | NodeKind::LogOr { .. } => {
            Some(long_type())
        }
        NodeKind::Binary { op, lhs, .. } => match op {
            BinOp::PtrAdd | BinOp::PtrSub | BinOp::Shl | BinOp::Shr => lhs.ty.clone(),
            _ => Some(long_type()),
        },
        NodeKind::Assign { lhs, .. } => {
            let lhs_ty = lhs.ty.clone().expect("typed above");
            if lhs_ty.borrow().kind == TypeKind::Array {
                return Err(file.error_at(lhs.loc, "not an lvalue"));
            }
            Some(lhs_ty)
        }
        NodeKind::AssignOp { lhs, .. }
        | NodeKind::BitNot(lhs)
        | NodeKind::PreInc(lhs)
        | NodeKind::PreDec(lhs)
        | NodeKind::PostInc(lhs)
        | NodeKind::PostDec(lhs) => lhs.ty.clone(),
        NodeKind::Var { var, .. } => Some(Rc::clone(&var.borrow().ty)),
        NodeKind::Comma { rhs, .. } => rhs.ty.clone(),
        NodeKind::Member { member, .. } => Some(Rc::clone(&member.ty)),
        NodeKind::Ternary { then, .. } => then.ty.clone(),
        NodeKind::Addr(operand) => {
            let operand_ty = operand.ty.clone().expect("typed above");
            let pointee = {
                let t = operand_ty.borrow();
                if t.kind == TypeKind::Array {
                    Rc::clone(t.base.as_ref().expect("array has element type"))
                } else {
                    Rc::clone(&operand_ty)
                }
            };
            Some(pointer_to(&pointee))
        }
        NodeKind::Deref(operand) => {
            let operand_ty = operand.ty.clone().expect("typed above");
            let base = operand_ty.borrow().base.clone();
            let Some(base) = base else {
                return Err(file.error_at(node.loc, "invalid pointer dereference"));
            };
            {
                let b = base.borrow();
                if b.kind == TypeKind::Void {
                    return Err(file.error_at(node.loc, "dereferencing a void pointer"));
                }
                if b.kind == TypeKind::Struct && b.is_incomplete {
                    return Err(file.error_at(node.loc, "incomplete struct type"));
                }
            }
            Some(base)
        }
        NodeKind::StmtExpr(body) => {
            let last = body
                .last()
                .expect("statement expression has at least one statement");
            last.ty.clone()
        }
        // Calls and casts are typed by the parser; statements carry no type.
        _ => None,
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_sizes() {
        assert_eq!(char_type().borrow().size, 1);
        assert_eq!(short_type().borrow().size, 2);
        assert_eq!(int_type().borrow().size, 4);
        assert_eq!(long_type().borrow().size, 8);
        assert_eq!(bool_type().borrow().size, 1);
        assert_eq!(enum_type().borrow().size, 4);
    }

    #[test]
    fn derived_sizes() {
        let p = pointer_to(&char_type());
        assert_eq!((p.borrow().size, p.borrow().align), (8, 8));
        let a = array_of(&int_type(), 10);
        assert_eq!((a.borrow().size, a.borrow().align), (40, 4));
    }

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(0, 8), 0);
        assert_eq!(align_to(1, 8), 8);
        assert_eq!(align_to(13, 8), 16);
        assert_eq!(align_to(5, 4), 8);
    }

    #[test]
    fn struct_completion_is_in_place() {
        let s = struct_type();
        let p = pointer_to(&s);
        {
            let mut t = s.borrow_mut();
            t.size = 8;
            t.align = 4;
            t.is_incomplete = false;
        }
        let pointee = p.borrow().base.clone().unwrap();
        assert!(!pointee.borrow().is_incomplete);
        assert_eq!(pointee.borrow().size, 8);
    }
}
