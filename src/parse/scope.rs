use std::rc::Rc;

use crate::ast::VarRef;
use crate::ty::TypeRef;

/// What an ordinary identifier resolves to.
#[derive(Clone, Debug)]
pub enum VarAttr {
    Var(VarRef),
    TypeDef(TypeRef),
    EnumConst { ty: TypeRef, val: i64 },
}

#[derive(Debug)]
pub struct VarScopeEntry {
    pub name: String,
    pub depth: i32,
    pub attr: VarAttr,
}

#[derive(Debug)]
pub struct TagScopeEntry {
    pub name: String,
    pub depth: i32,
    pub ty: TypeRef,
}

/// Snapshot of both scope stacks, restored on block exit.
#[derive(Clone, Copy, Debug)]
pub struct ScopeMark {
    vars: usize,
    tags: usize,
}

/// The two name spaces of the language: ordinary identifiers (variables,
/// typedefs, enum constants) and struct/enum tags. Innermost binding wins, so
/// lookups scan from the top of the stack.
#[derive(Default, Debug)]
pub struct Scopes {
    vars: Vec<VarScopeEntry>,
    tags: Vec<TagScopeEntry>,
    pub depth: i32,
}

impl Scopes {
    pub fn enter(&mut self) -> ScopeMark {
        self.depth += 1;
        ScopeMark {
            vars: self.vars.len(),
            tags: self.tags.len(),
        }
    }

    pub fn leave(&mut self, mark: ScopeMark) {
        self.vars.truncate(mark.vars);
        self.tags.truncate(mark.tags);
        self.depth -= 1;
    }

    pub fn push_var(&mut self, name: String, attr: VarAttr) {
        self.vars.push(VarScopeEntry {
            name,
            depth: self.depth,
            attr,
        });
    }

    pub fn push_tag(&mut self, name: String, ty: &TypeRef) {
        self.tags.push(TagScopeEntry {
            name,
            depth: self.depth,
            ty: Rc::clone(ty),
        });
    }

    pub fn find_var(&self, name: &str) -> Option<&VarScopeEntry> {
        self.vars.iter().rev().find(|e| e.name == name)
    }

    /// Is `name` already bound at the current depth? Used for redefinition
    /// diagnostics in block scopes.
    pub fn defined_here(&self, name: &str) -> bool {
        self.vars
            .iter()
            .rev()
            .take_while(|e| e.depth == self.depth)
            .any(|e| e.name == name)
    }

    pub fn find_tag(&self, name: &str) -> Option<&TagScopeEntry> {
        self.tags.iter().rev().find(|e| e.name == name)
    }
}
