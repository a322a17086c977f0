mod eval;
mod expr;
mod init;
mod scope;

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Result;

use crate::ast::{Function, Node, NodeKind, Program, SwitchCase, Var, VarRef};
use crate::token::{SourceFile, Token, TokenKind};
use crate::ty::{
    add_type, align_to, array_of, bool_type, char_type, enum_type, func_type, int_type, long_type,
    placeholder_type, pointer_to, short_type, struct_type, void_type, Member, TypeKind, TypeRef,
};

pub use scope::{ScopeMark, Scopes, TagScopeEntry, VarAttr, VarScopeEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StorageClass {
    None,
    Typedef,
    Static,
    Extern,
}

/// Collects the `case`/`default` arms of the switch currently being parsed.
#[derive(Default, Debug)]
struct SwitchScratch {
    cases: Vec<SwitchCase>,
    default_id: Option<u32>,
}

/// Recursive-descent parser over the token list. One instance per
/// compilation; holds the cursor, both scope stacks, the accumulating
/// local/global variable lists and the label counters.
pub struct Parser<'a> {
    file: &'a SourceFile,
    toks: Vec<Token>,
    pos: usize,
    scopes: Scopes,
    locals: Vec<VarRef>,
    globals: Vec<VarRef>,
    current_switch: Option<SwitchScratch>,
    case_count: u32,
    data_label_count: u32,
}

impl<'a> Parser<'a> {
    pub fn new(file: &'a SourceFile, toks: Vec<Token>) -> Self {
        Parser {
            file,
            toks,
            pos: 0,
            scopes: Scopes::default(),
            locals: Vec::new(),
            globals: Vec::new(),
            current_switch: None,
            case_count: 0,
            data_label_count: 0,
        }
    }

    // ---- token cursor -------------------------------------------------

    fn peek(&self) -> &Token {
        &self.toks[self.pos]
    }

    fn tok_text(&self, tok: &Token) -> &str {
        &self.file.src[tok.loc..tok.loc + tok.len]
    }

    /// True (without advancing) iff the current token is the punctuator or
    /// keyword `op`.
    fn peek_is(&self, op: &str) -> bool {
        let tok = self.peek();
        matches!(tok.kind, TokenKind::Reserved) && self.tok_text(tok) == op
    }

    /// Advances past `op` if it is the current token.
    fn consume(&mut self, op: &str) -> bool {
        if self.peek_is(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn consume_ident(&mut self) -> Option<(String, usize)> {
        let tok = self.peek();
        if matches!(tok.kind, TokenKind::Ident) {
            let name = self.tok_text(tok).to_string();
            let loc = tok.loc;
            self.pos += 1;
            Some((name, loc))
        } else {
            None
        }
    }

    fn consume_str(&mut self) -> Option<(Vec<u8>, usize)> {
        let tok = self.peek();
        if let TokenKind::Str(contents) = &tok.kind {
            let out = (contents.clone(), tok.loc);
            self.pos += 1;
            Some(out)
        } else {
            None
        }
    }

    fn consume_return(&mut self) -> bool {
        if matches!(self.peek().kind, TokenKind::Return) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, op: &str) -> Result<()> {
        if !self.consume(op) {
            return Err(self.file.error_at(self.peek().loc, format!("'{op}' expected")));
        }
        Ok(())
    }

    fn expect_number(&mut self) -> Result<i64> {
        let tok = self.peek();
        if let TokenKind::Num(val) = tok.kind {
            self.pos += 1;
            Ok(val)
        } else {
            Err(self.file.error_at(tok.loc, "expected a number"))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, usize)> {
        let loc = self.peek().loc;
        self.consume_ident()
            .ok_or_else(|| self.file.error_at(loc, "expected an identifier"))
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    // ---- variables and labels -----------------------------------------

    fn new_lvar(&mut self, name: String, ty: TypeRef) -> VarRef {
        let var = Rc::new(RefCell::new(Var {
            name: name.clone(),
            ty,
            is_local: true,
            is_static: false,
            offset: 0,
            initializer: Vec::new(),
        }));
        self.scopes.push_var(name, VarAttr::Var(Rc::clone(&var)));
        self.locals.push(Rc::clone(&var));
        var
    }

    /// `emit` distinguishes definitions that reach the data segment from
    /// prototype/extern registrations that only bind a name.
    fn new_gvar(&mut self, name: String, ty: TypeRef, is_static: bool, emit: bool) -> VarRef {
        let var = Rc::new(RefCell::new(Var {
            name: name.clone(),
            ty,
            is_local: false,
            is_static,
            offset: 0,
            initializer: Vec::new(),
        }));
        self.scopes.push_var(name, VarAttr::Var(Rc::clone(&var)));
        if emit {
            self.globals.push(Rc::clone(&var));
        }
        var
    }

    /// Label for string literals, static locals and compound literals.
    fn new_data_label(&mut self) -> String {
        let label = format!(".L.data.{}", self.data_label_count);
        self.data_label_count += 1;
        label
    }

    fn find_typedef(&self, tok: &Token) -> Option<TypeRef> {
        if matches!(tok.kind, TokenKind::Ident) {
            if let Some(entry) = self.scopes.find_var(self.tok_text(tok)) {
                if let VarAttr::TypeDef(ty) = &entry.attr {
                    return Some(Rc::clone(ty));
                }
            }
        }
        None
    }

    fn is_typename(&self) -> bool {
        const TYPE_WORDS: [&str; 11] = [
            "void", "_Bool", "char", "short", "int", "long", "struct", "enum", "typedef", "static",
            "extern",
        ];
        TYPE_WORDS.iter().any(|kw| self.peek_is(kw)) || self.find_typedef(self.peek()).is_some()
    }

    // ---- top level ----------------------------------------------------

    /// program = (function | global-var)*
    pub fn program(&mut self) -> Result<Program> {
        let mut funcs = Vec::new();
        while !self.at_eof() {
            if self.is_function()? {
                if let Some(func) = self.function()? {
                    funcs.push(func);
                }
            } else {
                self.global_var()?;
            }
        }
        Ok(Program {
            globals: std::mem::take(&mut self.globals),
            funcs,
        })
    }

    /// Speculatively parses a basetype and declarator to decide whether the
    /// next top-level entity is a function; the cursor is restored either way.
    fn is_function(&mut self) -> Result<bool> {
        let save = self.pos;
        let result = (|| -> Result<bool> {
            let (ty, _sclass) = self.basetype(true)?;
            if self.consume(";") {
                return Ok(false);
            }
            let (_ty, name, _loc) = self.declarator(ty)?;
            Ok(!name.is_empty() && self.consume("("))
        })();
        self.pos = save;
        result
    }

    /// function = basetype declarator "(" params? ")" ("{" stmt* "}" | ";")
    ///
    /// Returns `None` for a prototype-only declaration: the name is bound
    /// with its function type but no code is produced.
    fn function(&mut self) -> Result<Option<Function>> {
        self.locals.clear();
        let (ty, sclass) = self.basetype(true)?;
        let (ret_ty, name, name_loc) = self.declarator(ty)?;

        // Bind the function type before parsing the body so that recursive
        // calls resolve their return type.
        self.new_gvar(name.clone(), func_type(&ret_ty), false, false);

        self.expect("(")?;
        let mark = self.scopes.enter();
        let (params, has_varargs) = self.read_func_params()?;
        if params.len() > 6 {
            return Err(self
                .file
                .error_at(name_loc, "more than 6 parameters are not supported"));
        }

        if self.consume(";") {
            self.scopes.leave(mark);
            return Ok(None);
        }

        self.expect("{")?;
        let mut body = Vec::new();
        while !self.consume("}") {
            body.push(self.stmt()?);
        }
        self.scopes.leave(mark);

        // Frame layout. A variadic function keeps its register save area in
        // the first 56 bytes. The most recently declared local sits closest
        // to the frame pointer.
        let mut offset: i64 = if has_varargs { 56 } else { 0 };
        for var in self.locals.iter().rev() {
            let size = var.borrow().ty.borrow().size;
            offset += size;
            var.borrow_mut().offset = offset;
        }
        let stack_size = align_to(offset, 8);

        Ok(Some(Function {
            name,
            params,
            is_static: sclass == StorageClass::Static,
            has_varargs,
            body,
            locals: std::mem::take(&mut self.locals),
            stack_size,
        }))
    }

    fn read_func_params(&mut self) -> Result<(Vec<VarRef>, bool)> {
        let mut params = Vec::new();
        if self.consume(")") {
            return Ok((params, false));
        }

        // `void` alone means an empty parameter list.
        let save = self.pos;
        if self.consume("void") && self.consume(")") {
            return Ok((params, false));
        }
        self.pos = save;

        params.push(self.read_func_param()?);
        loop {
            if self.consume(")") {
                return Ok((params, false));
            }
            self.expect(",")?;
            // "..." arrives as three '.' punctuators
            if self.consume(".") {
                self.expect(".")?;
                self.expect(".")?;
                self.expect(")")?;
                return Ok((params, true));
            }
            params.push(self.read_func_param()?);
        }
    }

    fn read_func_param(&mut self) -> Result<VarRef> {
        let (ty, _sclass) = self.basetype(false)?;
        let (mut ty, name, _loc) = self.declarator(ty)?;
        // Array parameters decay to pointers to their element type.
        let elem = {
            let t = ty.borrow();
            if t.kind == TypeKind::Array {
                t.base.clone()
            } else {
                None
            }
        };
        if let Some(elem) = elem {
            ty = pointer_to(&elem);
        }
        Ok(self.new_lvar(name, ty))
    }

    /// global-var = basetype declarator ("=" gvar-initializer)? ";"
    fn global_var(&mut self) -> Result<()> {
        let (ty, sclass) = self.basetype(true)?;
        if self.consume(";") {
            return Ok(());
        }
        let (ty, name, name_loc) = self.declarator(ty)?;

        match sclass {
            StorageClass::Typedef => {
                self.expect(";")?;
                self.scopes.push_var(name, VarAttr::TypeDef(ty));
                Ok(())
            }
            StorageClass::Extern => {
                self.expect(";")?;
                self.new_gvar(name, ty, false, false);
                Ok(())
            }
            _ => {
                let var = self.new_gvar(name, Rc::clone(&ty), sclass == StorageClass::Static, true);
                if self.consume("=") {
                    let init = self.gvar_initializer(&ty)?;
                    var.borrow_mut().initializer = init;
                }
                if ty.borrow().is_incomplete {
                    return Err(self.file.error_at(name_loc, "incomplete type"));
                }
                self.expect(";")
            }
        }
    }

    // ---- type specifiers and declarators ------------------------------

    /// basetype = builtin-type+ | ("struct" | "enum" | typedef-name)
    ///
    /// Builtin specifiers may repeat and combine (`long long int`); a tagged
    /// or typedef'd type excludes them. At most one storage class is
    /// accepted, and only where the caller allows one.
    fn basetype(&mut self, allow_sclass: bool) -> Result<(TypeRef, StorageClass)> {
        const VOID: i32 = 1 << 0;
        const BOOL: i32 = 1 << 2;
        const CHAR: i32 = 1 << 4;
        const SHORT: i32 = 1 << 6;
        const INT: i32 = 1 << 8;
        const LONG: i32 = 1 << 10;
        const OTHER: i32 = 1 << 12;

        if !self.is_typename() {
            return Err(self.file.error_at(self.peek().loc, "typename expected"));
        }

        let mut ty = int_type();
        let mut counter = 0;
        let mut sclass = StorageClass::None;

        while self.is_typename() {
            let loc = self.peek().loc;

            if self.peek_is("typedef") || self.peek_is("static") || self.peek_is("extern") {
                if !allow_sclass {
                    return Err(self
                        .file
                        .error_at(loc, "storage class specifier is not allowed here"));
                }
                let new = if self.consume("typedef") {
                    StorageClass::Typedef
                } else if self.consume("static") {
                    StorageClass::Static
                } else {
                    self.expect("extern")?;
                    StorageClass::Extern
                };
                if sclass != StorageClass::None {
                    return Err(self
                        .file
                        .error_at(loc, "typedef, static and extern may not be used together"));
                }
                sclass = new;
                continue;
            }

            if !self.peek_is("void")
                && !self.peek_is("_Bool")
                && !self.peek_is("char")
                && !self.peek_is("short")
                && !self.peek_is("int")
                && !self.peek_is("long")
            {
                if counter > 0 {
                    break;
                }
                if self.peek_is("struct") {
                    ty = self.struct_decl()?;
                } else if self.peek_is("enum") {
                    ty = self.enum_specifier()?;
                } else {
                    let td = self
                        .find_typedef(self.peek())
                        .ok_or_else(|| self.file.error_at(loc, "typename expected"))?;
                    ty = td;
                    self.pos += 1;
                }
                counter |= OTHER;
                continue;
            }

            if self.consume("void") {
                counter += VOID;
            } else if self.consume("_Bool") {
                counter += BOOL;
            } else if self.consume("char") {
                counter += CHAR;
            } else if self.consume("short") {
                counter += SHORT;
            } else if self.consume("int") {
                counter += INT;
            } else if self.consume("long") {
                counter += LONG;
            }

            ty = match counter {
                c if c == VOID => void_type(),
                c if c == BOOL => bool_type(),
                c if c == CHAR => char_type(),
                c if c == SHORT || c == SHORT + INT => short_type(),
                c if c == INT => int_type(),
                c if c == LONG
                    || c == LONG + INT
                    || c == LONG + LONG
                    || c == LONG + LONG + INT =>
                {
                    long_type()
                }
                _ => return Err(self.file.error_at(loc, "invalid type")),
            };
        }

        Ok((ty, sclass))
    }

    /// declarator = "*"* ("(" declarator ")" | ident) type-suffix
    ///
    /// A parenthesized inner declarator is parsed against a placeholder type
    /// which is overwritten in place once the outer suffix is known, so the
    /// inner result points at the completed constructor chain.
    fn declarator(&mut self, mut ty: TypeRef) -> Result<(TypeRef, String, usize)> {
        while self.consume("*") {
            ty = pointer_to(&ty);
        }

        if self.consume("(") {
            let placeholder = placeholder_type();
            let (new_ty, name, name_loc) = self.declarator(Rc::clone(&placeholder))?;
            self.expect(")")?;
            let actual = self.read_type_suffix(ty)?;
            *placeholder.borrow_mut() = actual.borrow().clone();
            return Ok((new_ty, name, name_loc));
        }

        let (name, name_loc) = self.expect_ident()?;
        let ty = self.read_type_suffix(ty)?;
        Ok((ty, name, name_loc))
    }

    /// Like `declarator` but without a name; used by casts and `sizeof`.
    fn abstract_declarator(&mut self, mut ty: TypeRef) -> Result<TypeRef> {
        while self.consume("*") {
            ty = pointer_to(&ty);
        }

        if self.consume("(") {
            let placeholder = placeholder_type();
            let new_ty = self.abstract_declarator(Rc::clone(&placeholder))?;
            self.expect(")")?;
            let actual = self.read_type_suffix(ty)?;
            *placeholder.borrow_mut() = actual.borrow().clone();
            return Ok(new_ty);
        }

        self.read_type_suffix(ty)
    }

    /// type-name = basetype abstract-declarator
    pub(crate) fn type_name(&mut self) -> Result<TypeRef> {
        let (ty, _sclass) = self.basetype(false)?;
        self.abstract_declarator(ty)
    }

    /// type-suffix = ("[" const-expr? "]" type-suffix)?
    ///
    /// `[]` yields an incomplete array completed later by an initializer.
    fn read_type_suffix(&mut self, base: TypeRef) -> Result<TypeRef> {
        if !self.consume("[") {
            return Ok(base);
        }
        let loc = self.peek().loc;
        let mut len = 0;
        let mut is_incomplete = true;
        if !self.consume("]") {
            len = self.const_expr()?;
            is_incomplete = false;
            self.expect("]")?;
        }
        let base = self.read_type_suffix(base)?;
        if base.borrow().is_incomplete {
            return Err(self.file.error_at(loc, "incomplete element type"));
        }
        let ty = array_of(&base, len);
        ty.borrow_mut().is_incomplete = is_incomplete;
        Ok(ty)
    }

    // ---- struct and enum declarations ---------------------------------

    /// struct-decl = "struct" ident
    ///             | "struct" ident? "{" struct-member* "}"
    ///
    /// A lone tag either resolves or registers a new incomplete struct. A
    /// body completes a same-depth forward declaration in place, keeping the
    /// type's identity stable for earlier pointers to it.
    fn struct_decl(&mut self) -> Result<TypeRef> {
        self.expect("struct")?;
        let tag = self.consume_ident();

        if let Some((name, loc)) = &tag {
            if !self.peek_is("{") {
                return match self.scopes.find_tag(name) {
                    Some(entry) => {
                        let ty = Rc::clone(&entry.ty);
                        if ty.borrow().kind != TypeKind::Struct {
                            return Err(self.file.error_at(*loc, "not a struct tag"));
                        }
                        Ok(ty)
                    }
                    None => {
                        let ty = struct_type();
                        self.scopes.push_tag(name.clone(), &ty);
                        Ok(ty)
                    }
                };
            }
        }

        self.expect("{")?;

        let ty = match &tag {
            Some((name, loc)) => match self.scopes.find_tag(name) {
                Some(entry) if entry.depth == self.scopes.depth => {
                    let found = Rc::clone(&entry.ty);
                    if found.borrow().kind != TypeKind::Struct {
                        return Err(self.file.error_at(*loc, "not a struct tag"));
                    }
                    found
                }
                _ => {
                    let ty = struct_type();
                    self.scopes.push_tag(name.clone(), &ty);
                    ty
                }
            },
            None => struct_type(),
        };

        let mut members = Vec::new();
        while !self.consume("}") {
            members.push(self.struct_member()?);
        }

        // Lay the members out: each aligned to its own alignment, the struct
        // aligned to the strictest member.
        let mut offset: i64 = 0;
        let mut align: i64 = 1;
        for member in &mut members {
            let (msize, malign) = {
                let t = member.ty.borrow();
                (t.size, t.align)
            };
            offset = align_to(offset, malign);
            member.offset = offset;
            offset += msize;
            if align < malign {
                align = malign;
            }
        }

        {
            let mut t = ty.borrow_mut();
            t.members = members;
            t.align = align;
            t.size = align_to(offset, align);
            t.is_incomplete = false;
        }
        Ok(ty)
    }

    /// struct-member = basetype declarator ";"
    fn struct_member(&mut self) -> Result<Member> {
        let (ty, _sclass) = self.basetype(false)?;
        let (ty, name, loc) = self.declarator(ty)?;
        self.expect(";")?;
        Ok(Member {
            name,
            ty,
            offset: 0,
            loc,
        })
    }

    /// enum-specifier = "enum" ident
    ///                | "enum" ident? "{" ident ("=" const-expr)? ("," ...)? ","? "}"
    fn enum_specifier(&mut self) -> Result<TypeRef> {
        self.expect("enum")?;
        let ty = enum_type();
        let tag = self.consume_ident();

        if let Some((name, loc)) = &tag {
            if !self.peek_is("{") {
                let entry = self
                    .scopes
                    .find_tag(name)
                    .ok_or_else(|| self.file.error_at(*loc, "unknown enum type"))?;
                let found = Rc::clone(&entry.ty);
                if found.borrow().kind != TypeKind::Enum {
                    return Err(self.file.error_at(*loc, "not an enum tag"));
                }
                return Ok(found);
            }
        }

        self.expect("{")?;
        let mut count: i64 = 0;
        loop {
            let (name, _loc) = self.expect_ident()?;
            if self.consume("=") {
                count = self.const_expr()?;
            }
            self.scopes.push_var(
                name,
                VarAttr::EnumConst {
                    ty: Rc::clone(&ty),
                    val: count,
                },
            );
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

        if let Some((name, _)) = tag {
            self.scopes.push_tag(name, &ty);
        }
        Ok(ty)
    }

    // ---- declarations -------------------------------------------------

    /// declaration = basetype ";"
    ///             | basetype declarator ("=" lvar-initializer)? ";"
    ///
    /// Typedefs only bind a name. A `static` local becomes a synthetic
    /// global behind a generated label, locally bound under its source name.
    fn declaration(&mut self) -> Result<Node> {
        let loc = self.peek().loc;
        let (ty, sclass) = self.basetype(true)?;
        if self.consume(";") {
            return Ok(Node::new(NodeKind::Null, loc));
        }
        let (ty, name, name_loc) = self.declarator(ty)?;

        match sclass {
            StorageClass::Typedef => {
                self.expect(";")?;
                if self.scopes.defined_here(&name) {
                    return Err(self
                        .file
                        .error_at(name_loc, format!("redefinition of '{name}'")));
                }
                self.scopes.push_var(name, VarAttr::TypeDef(ty));
                return Ok(Node::new(NodeKind::Null, loc));
            }
            StorageClass::Static => {
                let label = self.new_data_label();
                let gvar = self.new_gvar(label, Rc::clone(&ty), true, true);
                if self.consume("=") {
                    let init = self.gvar_initializer(&ty)?;
                    gvar.borrow_mut().initializer = init;
                }
                if ty.borrow().is_incomplete {
                    return Err(self.file.error_at(name_loc, "incomplete type"));
                }
                self.expect(";")?;
                self.scopes.push_var(name, VarAttr::Var(gvar));
                return Ok(Node::new(NodeKind::Null, loc));
            }
            StorageClass::Extern => {
                self.expect(";")?;
                self.new_gvar(name, ty, false, false);
                return Ok(Node::new(NodeKind::Null, loc));
            }
            StorageClass::None => {}
        }

        if ty.borrow().kind == TypeKind::Void {
            return Err(self.file.error_at(name_loc, "variable declared void"));
        }
        if self.scopes.defined_here(&name) {
            return Err(self
                .file
                .error_at(name_loc, format!("redefinition of '{name}'")));
        }
        let var = self.new_lvar(name, Rc::clone(&ty));

        if self.consume(";") {
            if ty.borrow().is_incomplete {
                return Err(self.file.error_at(name_loc, "incomplete type"));
            }
            return Ok(Node::new(NodeKind::Null, loc));
        }

        self.expect("=")?;
        let mut stmts = Vec::new();
        let mut desg = Vec::new();
        self.lvar_initializer(&mut stmts, &var, &Rc::clone(&ty), &mut desg)?;
        self.expect(";")?;
        if ty.borrow().is_incomplete {
            return Err(self.file.error_at(name_loc, "incomplete type"));
        }
        Ok(Node::new(NodeKind::Block(stmts), loc))
    }

    // ---- statements ---------------------------------------------------

    fn read_expr_stmt(&mut self) -> Result<Node> {
        let loc = self.peek().loc;
        let expr = self.expr()?;
        Ok(Node::new(NodeKind::ExprStmt(Box::new(expr)), loc))
    }

    /// Parses one statement and decorates the whole subtree with types.
    pub(crate) fn stmt(&mut self) -> Result<Node> {
        let mut node = self.stmt2()?;
        add_type(self.file, &mut node)?;
        Ok(node)
    }

    fn stmt2(&mut self) -> Result<Node> {
        let loc = self.peek().loc;

        if self.consume_return() {
            if self.consume(";") {
                return Ok(Node::new(NodeKind::Return(None), loc));
            }
            let expr = self.expr()?;
            self.expect(";")?;
            return Ok(Node::new(NodeKind::Return(Some(Box::new(expr))), loc));
        }

        if self.consume("{") {
            let mark = self.scopes.enter();
            let mut body = Vec::new();
            while !self.consume("}") {
                body.push(self.stmt()?);
            }
            self.scopes.leave(mark);
            return Ok(Node::new(NodeKind::Block(body), loc));
        }

        if self.consume("if") {
            self.expect("(")?;
            let cond = self.expr()?;
            self.expect(")")?;
            let then = self.stmt()?;
            let els = if self.consume("else") {
                Some(Box::new(self.stmt()?))
            } else {
                None
            };
            return Ok(Node::new(
                NodeKind::If {
                    cond: Box::new(cond),
                    then: Box::new(then),
                    els,
                },
                loc,
            ));
        }

        if self.consume("switch") {
            self.expect("(")?;
            let cond = self.expr()?;
            self.expect(")")?;

            let saved = self.current_switch.replace(SwitchScratch::default());
            let body = self.stmt()?;
            let scratch = self
                .current_switch
                .take()
                .unwrap_or_default();
            self.current_switch = saved;

            return Ok(Node::new(
                NodeKind::Switch {
                    cond: Box::new(cond),
                    cases: scratch.cases,
                    default_id: scratch.default_id,
                    body: Box::new(body),
                },
                loc,
            ));
        }

        if self.consume("case") {
            let val = self.const_expr()?;
            self.expect(":")?;
            let id = self.case_count;
            self.case_count += 1;
            let scratch = self
                .current_switch
                .as_mut()
                .ok_or_else(|| self.file.error_at(loc, "stray case"))?;
            scratch.cases.push(SwitchCase { val, id });
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    id,
                    body: Box::new(body),
                },
                loc,
            ));
        }

        if self.consume("default") {
            self.expect(":")?;
            let id = self.case_count;
            self.case_count += 1;
            let scratch = self
                .current_switch
                .as_mut()
                .ok_or_else(|| self.file.error_at(loc, "stray default"))?;
            scratch.default_id = Some(id);
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::Case {
                    id,
                    body: Box::new(body),
                },
                loc,
            ));
        }

        if self.consume("while") {
            self.expect("(")?;
            let cond = self.expr()?;
            self.expect(")")?;
            let body = self.stmt()?;
            return Ok(Node::new(
                NodeKind::While {
                    cond: Box::new(cond),
                    body: Box::new(body),
                },
                loc,
            ));
        }

        if self.consume("for") {
            self.expect("(")?;
            let mark = self.scopes.enter();
            let mut init = None;
            let mut cond = None;
            let mut post = None;
            if !self.consume(";") {
                if self.is_typename() {
                    init = Some(Box::new(self.declaration()?));
                } else {
                    init = Some(Box::new(self.read_expr_stmt()?));
                    self.expect(";")?;
                }
            }
            if !self.consume(";") {
                cond = Some(Box::new(self.expr()?));
                self.expect(";")?;
            }
            if !self.consume(")") {
                post = Some(Box::new(self.read_expr_stmt()?));
                self.expect(")")?;
            }
            let body = self.stmt()?;
            self.scopes.leave(mark);
            return Ok(Node::new(
                NodeKind::For {
                    init,
                    cond,
                    post,
                    body: Box::new(body),
                },
                loc,
            ));
        }

        if self.consume("do") {
            let body = self.stmt()?;
            self.expect("while")?;
            self.expect("(")?;
            let cond = self.expr()?;
            self.expect(")")?;
            self.expect(";")?;
            return Ok(Node::new(
                NodeKind::Do {
                    body: Box::new(body),
                    cond: Box::new(cond),
                },
                loc,
            ));
        }

        if self.consume("break") {
            self.expect(";")?;
            return Ok(Node::new(NodeKind::Break, loc));
        }

        if self.consume("continue") {
            self.expect(";")?;
            return Ok(Node::new(NodeKind::Continue, loc));
        }

        if self.consume("goto") {
            let (name, _) = self.expect_ident()?;
            self.expect(";")?;
            return Ok(Node::new(NodeKind::Goto(name), loc));
        }

        if self.consume(";") {
            return Ok(Node::new(NodeKind::Null, loc));
        }

        // "ident :" introduces a label; anything else starting with an
        // identifier is an expression statement.
        if matches!(self.peek().kind, TokenKind::Ident) {
            let save = self.pos;
            let (name, _) = self.expect_ident()?;
            if self.consume(":") {
                let body = self.stmt()?;
                return Ok(Node::new(
                    NodeKind::Label {
                        name,
                        body: Box::new(body),
                    },
                    loc,
                ));
            }
            self.pos = save;
        }

        if self.is_typename() {
            return self.declaration();
        }

        let node = self.read_expr_stmt()?;
        self.expect(";")?;
        Ok(node)
    }
}
