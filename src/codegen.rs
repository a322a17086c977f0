//! Single-pass x86-64 code generator. Expressions evaluate on the machine
//! stack: every expression pushes exactly one 8-byte value and every
//! statement is balanced.

use std::fmt::Write as _;

use anyhow::Result;

use crate::ast::{BinOp, Function, InitValue, Node, NodeKind, Program, Var};
use crate::token::SourceFile;
use crate::ty::{TypeKind, TypeRef};

const ARG_REG8: [&str; 6] = ["rdi", "rsi", "rdx", "rcx", "r8", "r9"];
const ARG_REG4: [&str; 6] = ["edi", "esi", "edx", "ecx", "r8d", "r9d"];
const ARG_REG2: [&str; 6] = ["di", "si", "dx", "cx", "r8w", "r9w"];
const ARG_REG1: [&str; 6] = ["dil", "sil", "dl", "cl", "r8b", "r9b"];

macro_rules! emit {
    ($cg:expr, $($arg:tt)*) => {{
        let _ = writeln!($cg.out, $($arg)*);
    }};
}

struct Codegen<'a> {
    file: &'a SourceFile,
    out: String,
    labelseq: u32,
    brkseq: Option<u32>,
    contseq: Option<u32>,
    funcname: String,
}

/// Emits the whole program: `.intel_syntax`, data segments, then text.
pub fn codegen(file: &SourceFile, prog: &Program) -> Result<String> {
    let mut cg = Codegen {
        file,
        out: String::new(),
        labelseq: 0,
        brkseq: None,
        contseq: None,
        funcname: String::new(),
    };
    emit!(cg, ".intel_syntax noprefix");
    cg.gen_data_seg(prog);
    cg.gen_text_seg(prog)?;
    Ok(cg.out)
}

/// Increment step for `++`/`--`: the pointee size for pointers, else 1.
fn inc_step(ty: &TypeRef) -> i64 {
    ty.borrow().base.as_ref().map_or(1, |b| b.borrow().size)
}

fn elem_size(ty: &TypeRef) -> i64 {
    ty.borrow()
        .base
        .as_ref()
        .map_or(1, |b| b.borrow().size)
}

fn node_ty(node: &Node) -> &TypeRef {
    node.ty.as_ref().expect("expression was typed by the parser")
}

fn is_array(ty: &TypeRef) -> bool {
    ty.borrow().kind == TypeKind::Array
}

impl<'a> Codegen<'a> {
    fn next_label(&mut self) -> u32 {
        let seq = self.labelseq;
        self.labelseq += 1;
        seq
    }

    // ---- data segment -------------------------------------------------

    fn gen_data_seg(&mut self, prog: &Program) {
        for var in &prog.globals {
            let v = var.borrow();
            if !v.is_static {
                emit!(self, ".global {}", v.name);
            }
        }

        emit!(self, ".bss");
        for var in &prog.globals {
            let v = var.borrow();
            if !v.initializer.is_empty() {
                continue;
            }
            emit!(self, ".align {}", v.ty.borrow().align);
            emit!(self, "{}:", v.name);
            emit!(self, "  .zero {}", v.ty.borrow().size);
        }

        emit!(self, ".data");
        for var in &prog.globals {
            let v = var.borrow();
            if v.initializer.is_empty() {
                continue;
            }
            emit!(self, ".align {}", v.ty.borrow().align);
            emit!(self, "{}:", v.name);
            for record in &v.initializer {
                match record {
                    InitValue::Label { label, addend } => {
                        emit!(self, "  .quad {}{:+}", label, addend);
                    }
                    InitValue::Val { sz: 1, val } => emit!(self, "  .byte {}", val),
                    InitValue::Val { sz, val } => emit!(self, "  .{}byte {}", sz, val),
                }
            }
        }
    }

    // ---- text segment -------------------------------------------------

    fn gen_text_seg(&mut self, prog: &Program) -> Result<()> {
        emit!(self, ".text");
        for func in &prog.funcs {
            self.gen_func(func)?;
        }
        Ok(())
    }

    fn gen_func(&mut self, func: &Function) -> Result<()> {
        self.funcname = func.name.clone();

        if !func.is_static {
            emit!(self, ".global {}", func.name);
        }
        emit!(self, "{}:", func.name);
        emit!(self, "  push rbp");
        emit!(self, "  mov rbp, rsp");
        emit!(self, "  sub rsp, {}", func.stack_size);

        // A variadic callee saves the six integer argument registers under
        // the gp counter word so va_start can expose them uniformly.
        if func.has_varargs {
            emit!(self, "  mov dword ptr [rbp-8], {}", func.params.len() * 8);
            emit!(self, "  mov [rbp-16], r9");
            emit!(self, "  mov [rbp-24], r8");
            emit!(self, "  mov [rbp-32], rcx");
            emit!(self, "  mov [rbp-40], rdx");
            emit!(self, "  mov [rbp-48], rsi");
            emit!(self, "  mov [rbp-56], rdi");
        }

        for (idx, param) in func.params.iter().enumerate() {
            self.load_arg(&param.borrow(), idx);
        }

        for stmt in &func.body {
            self.gen(stmt)?;
        }

        emit!(self, ".L.return.{}:", func.name);
        emit!(self, "  mov rsp, rbp");
        emit!(self, "  pop rbp");
        emit!(self, "  ret");
        Ok(())
    }

    fn load_arg(&mut self, var: &Var, idx: usize) {
        let reg = match var.ty.borrow().size {
            1 => ARG_REG1[idx],
            2 => ARG_REG2[idx],
            4 => ARG_REG4[idx],
            _ => ARG_REG8[idx],
        };
        emit!(self, "  mov [rbp-{}], {}", var.offset, reg);
    }

    // ---- value primitives ---------------------------------------------

    /// Pops an address and pushes the sign-extended value read through it.
    fn load(&mut self, ty: &TypeRef) {
        emit!(self, "  pop rax");
        match ty.borrow().size {
            1 => emit!(self, "  movsx rax, byte ptr [rax]"),
            2 => emit!(self, "  movsx rax, word ptr [rax]"),
            4 => emit!(self, "  movsxd rax, dword ptr [rax]"),
            _ => emit!(self, "  mov rax, [rax]"),
        }
        emit!(self, "  push rax");
    }

    /// Pops a value then an address, writes through, and pushes the value
    /// back so an assignment yields what was stored. `_Bool` stores are
    /// normalized to 0/1.
    fn store(&mut self, ty: &TypeRef) {
        emit!(self, "  pop rdi");
        emit!(self, "  pop rax");

        let (kind, size) = {
            let t = ty.borrow();
            (t.kind, t.size)
        };
        if kind == TypeKind::Bool {
            emit!(self, "  cmp rdi, 0");
            emit!(self, "  setne dil");
            emit!(self, "  movzb rdi, dil");
        }
        match size {
            1 => emit!(self, "  mov [rax], dil"),
            2 => emit!(self, "  mov [rax], di"),
            4 => emit!(self, "  mov [rax], edi"),
            _ => emit!(self, "  mov [rax], rdi"),
        }
        emit!(self, "  push rdi");
    }

    /// Re-extends the top of the stack after a cast.
    fn truncate(&mut self, ty: &TypeRef) {
        emit!(self, "  pop rax");
        let (kind, size) = {
            let t = ty.borrow();
            (t.kind, t.size)
        };
        if kind == TypeKind::Bool {
            emit!(self, "  cmp rax, 0");
            emit!(self, "  setne al");
        }
        match size {
            1 => emit!(self, "  movsx rax, al"),
            2 => emit!(self, "  movsx rax, ax"),
            4 => emit!(self, "  movsxd rax, eax"),
            _ => {}
        }
        emit!(self, "  push rax");
    }

    fn inc(&mut self, ty: &TypeRef) {
        emit!(self, "  pop rax");
        emit!(self, "  add rax, {}", inc_step(ty));
        emit!(self, "  push rax");
    }

    fn dec(&mut self, ty: &TypeRef) {
        emit!(self, "  pop rax");
        emit!(self, "  sub rax, {}", inc_step(ty));
        emit!(self, "  push rax");
    }

    /// Pops both operands, applies `op`, pushes the result. Pointer forms
    /// scale by the pointee size of the result type (`lhs_ty` for the
    /// pointer difference).
    fn gen_binary(&mut self, op: BinOp, result_ty: &TypeRef, lhs_ty: &TypeRef) {
        emit!(self, "  pop rdi");
        emit!(self, "  pop rax");

        match op {
            BinOp::Add => emit!(self, "  add rax, rdi"),
            BinOp::PtrAdd => {
                emit!(self, "  imul rdi, {}", elem_size(result_ty));
                emit!(self, "  add rax, rdi");
            }
            BinOp::Sub => emit!(self, "  sub rax, rdi"),
            BinOp::PtrSub => {
                emit!(self, "  imul rdi, {}", elem_size(result_ty));
                emit!(self, "  sub rax, rdi");
            }
            BinOp::PtrDiff => {
                emit!(self, "  sub rax, rdi");
                emit!(self, "  cqo");
                emit!(self, "  mov rdi, {}", elem_size(lhs_ty));
                emit!(self, "  idiv rdi");
            }
            BinOp::Mul => emit!(self, "  imul rax, rdi"),
            BinOp::Div => {
                emit!(self, "  cqo");
                emit!(self, "  idiv rdi");
            }
            BinOp::BitAnd => emit!(self, "  and rax, rdi"),
            BinOp::BitOr => emit!(self, "  or rax, rdi"),
            BinOp::BitXor => emit!(self, "  xor rax, rdi"),
            BinOp::Shl => {
                emit!(self, "  mov cl, dil");
                emit!(self, "  shl rax, cl");
            }
            BinOp::Shr => {
                emit!(self, "  mov cl, dil");
                emit!(self, "  sar rax, cl");
            }
            BinOp::Eq => {
                emit!(self, "  cmp rax, rdi");
                emit!(self, "  sete al");
                emit!(self, "  movzb rax, al");
            }
            BinOp::Ne => {
                emit!(self, "  cmp rax, rdi");
                emit!(self, "  setne al");
                emit!(self, "  movzb rax, al");
            }
            BinOp::Lt => {
                emit!(self, "  cmp rax, rdi");
                emit!(self, "  setl al");
                emit!(self, "  movzb rax, al");
            }
            BinOp::Le => {
                emit!(self, "  cmp rax, rdi");
                emit!(self, "  setle al");
                emit!(self, "  movzb rax, al");
            }
        }
        emit!(self, "  push rax");
    }

    /// Pushes the address of `node`. Only variables, dereferences and member
    /// accesses denote storage.
    fn gen_lval(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Var { var, init } => {
                if let Some(init) = init {
                    self.gen(init)?;
                }
                let v = var.borrow();
                if v.is_local {
                    emit!(self, "  lea rax, [rbp-{}]", v.offset);
                    emit!(self, "  push rax");
                } else {
                    emit!(self, "  push offset {}", v.name);
                }
                Ok(())
            }
            NodeKind::Deref(operand) => self.gen(operand),
            NodeKind::Member { base, member } => {
                self.gen_lval(base)?;
                emit!(self, "  pop rax");
                emit!(self, "  add rax, {}", member.offset);
                emit!(self, "  push rax");
                Ok(())
            }
            _ => Err(self.file.error_at(node.loc, "not an lvalue")),
        }
    }

    fn gen(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Null => Ok(()),
            NodeKind::Num(val) => {
                if *val == i64::from(*val as i32) {
                    emit!(self, "  push {}", val);
                } else {
                    emit!(self, "  movabs rax, {}", val);
                    emit!(self, "  push rax");
                }
                Ok(())
            }
            NodeKind::ExprStmt(operand) => {
                self.gen(operand)?;
                emit!(self, "  add rsp, 8");
                Ok(())
            }
            NodeKind::Var { .. } | NodeKind::Member { .. } => {
                self.gen_lval(node)?;
                if !is_array(node_ty(node)) {
                    self.load(node_ty(node));
                }
                Ok(())
            }
            NodeKind::Assign { lhs, rhs } => {
                self.gen_lval(lhs)?;
                self.gen(rhs)?;
                self.store(node_ty(node));
                Ok(())
            }
            NodeKind::Ternary { cond, then, els } => {
                let seq = self.next_label();
                self.gen(cond)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  je  .Lelse{:03}", seq);
                self.gen(then)?;
                emit!(self, "  jmp .Lend{:03}", seq);
                emit!(self, ".Lelse{:03}:", seq);
                self.gen(els)?;
                emit!(self, ".Lend{:03}:", seq);
                Ok(())
            }
            NodeKind::PreInc(lhs) => {
                self.gen_lval(lhs)?;
                emit!(self, "  push [rsp]");
                self.load(node_ty(node));
                self.inc(node_ty(node));
                self.store(node_ty(node));
                Ok(())
            }
            NodeKind::PreDec(lhs) => {
                self.gen_lval(lhs)?;
                emit!(self, "  push [rsp]");
                self.load(node_ty(node));
                self.dec(node_ty(node));
                self.store(node_ty(node));
                Ok(())
            }
            NodeKind::PostInc(lhs) => {
                self.gen_lval(lhs)?;
                emit!(self, "  push [rsp]");
                self.load(node_ty(node));
                self.inc(node_ty(node));
                self.store(node_ty(node));
                // the expression's value is the one before the increment
                self.dec(node_ty(node));
                Ok(())
            }
            NodeKind::PostDec(lhs) => {
                self.gen_lval(lhs)?;
                emit!(self, "  push [rsp]");
                self.load(node_ty(node));
                self.dec(node_ty(node));
                self.store(node_ty(node));
                self.inc(node_ty(node));
                Ok(())
            }
            NodeKind::AssignOp { op, lhs, rhs } => {
                self.gen_lval(lhs)?;
                emit!(self, "  push [rsp]");
                self.load(node_ty(lhs));
                self.gen(rhs)?;
                self.gen_binary(*op, node_ty(node), node_ty(lhs));
                self.store(node_ty(node));
                Ok(())
            }
            NodeKind::Comma { lhs, rhs } => {
                self.gen(lhs)?;
                self.gen(rhs)
            }
            NodeKind::Addr(operand) => self.gen_lval(operand),
            NodeKind::Deref(operand) => {
                self.gen(operand)?;
                if !is_array(node_ty(node)) {
                    self.load(node_ty(node));
                }
                Ok(())
            }
            NodeKind::Not(operand) => {
                self.gen(operand)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  sete al");
                emit!(self, "  movzb rax, al");
                emit!(self, "  push rax");
                Ok(())
            }
            NodeKind::BitNot(operand) => {
                self.gen(operand)?;
                emit!(self, "  pop rax");
                emit!(self, "  not rax");
                emit!(self, "  push rax");
                Ok(())
            }
            NodeKind::LogAnd { lhs, rhs } => {
                let seq = self.next_label();
                self.gen(lhs)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  je  .L.false.{}", seq);
                self.gen(rhs)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  je  .L.false.{}", seq);
                emit!(self, "  push 1");
                emit!(self, "  jmp .L.end.{}", seq);
                emit!(self, ".L.false.{}:", seq);
                emit!(self, "  push 0");
                emit!(self, ".L.end.{}:", seq);
                Ok(())
            }
            NodeKind::LogOr { lhs, rhs } => {
                let seq = self.next_label();
                self.gen(lhs)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  jne .L.true.{}", seq);
                self.gen(rhs)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  jne .L.true.{}", seq);
                emit!(self, "  push 0");
                emit!(self, "  jmp .L.end.{}", seq);
                emit!(self, ".L.true.{}:", seq);
                emit!(self, "  push 1");
                emit!(self, ".L.end.{}:", seq);
                Ok(())
            }
            NodeKind::Return(operand) => {
                if let Some(operand) = operand {
                    self.gen(operand)?;
                    emit!(self, "  pop rax");
                }
                emit!(self, "  jmp .L.return.{}", self.funcname);
                Ok(())
            }
            NodeKind::If { cond, then, els } => {
                self.gen(cond)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                let seq = self.next_label();
                match els {
                    Some(els) => {
                        emit!(self, "  je  .Lelse{:03}", seq);
                        self.gen(then)?;
                        emit!(self, "  jmp .Lend{:03}", seq);
                        emit!(self, ".Lelse{:03}:", seq);
                        self.gen(els)?;
                        emit!(self, ".Lend{:03}:", seq);
                    }
                    None => {
                        emit!(self, "  je  .Lend{:03}", seq);
                        self.gen(then)?;
                        emit!(self, ".Lend{:03}:", seq);
                    }
                }
                Ok(())
            }
            NodeKind::While { cond, body } => {
                let seq = self.next_label();
                let brk = self.brkseq.replace(seq);
                let cont = self.contseq.replace(seq);

                emit!(self, ".Lcontinue{:03}:", seq);
                self.gen(cond)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  je  .Lbreak{:03}", seq);
                self.gen(body)?;
                emit!(self, "  jmp .Lcontinue{:03}", seq);
                emit!(self, ".Lbreak{:03}:", seq);

                self.brkseq = brk;
                self.contseq = cont;
                Ok(())
            }
            NodeKind::For {
                init,
                cond,
                post,
                body,
            } => {
                let seq = self.next_label();
                let brk = self.brkseq.replace(seq);
                let cont = self.contseq.replace(seq);

                if let Some(init) = init {
                    self.gen(init)?;
                }
                emit!(self, ".Lbegin{:03}:", seq);
                if let Some(cond) = cond {
                    // no condition means no exit test: an infinite loop
                    self.gen(cond)?;
                    emit!(self, "  pop rax");
                    emit!(self, "  cmp rax, 0");
                    emit!(self, "  je  .Lbreak{:03}", seq);
                }
                self.gen(body)?;
                emit!(self, ".Lcontinue{:03}:", seq);
                if let Some(post) = post {
                    self.gen(post)?;
                }
                emit!(self, "  jmp .Lbegin{:03}", seq);
                emit!(self, ".Lbreak{:03}:", seq);

                self.brkseq = brk;
                self.contseq = cont;
                Ok(())
            }
            NodeKind::Do { body, cond } => {
                let seq = self.next_label();
                let brk = self.brkseq.replace(seq);
                let cont = self.contseq.replace(seq);

                emit!(self, ".Lbegin{:03}:", seq);
                self.gen(body)?;
                emit!(self, ".Lcontinue{:03}:", seq);
                self.gen(cond)?;
                emit!(self, "  pop rax");
                emit!(self, "  cmp rax, 0");
                emit!(self, "  jne .Lbegin{:03}", seq);
                emit!(self, ".Lbreak{:03}:", seq);

                self.brkseq = brk;
                self.contseq = cont;
                Ok(())
            }
            NodeKind::Switch {
                cond,
                cases,
                default_id,
                body,
            } => {
                let seq = self.next_label();
                let brk = self.brkseq.replace(seq);

                self.gen(cond)?;
                emit!(self, "  pop rax");
                for case in cases {
                    emit!(self, "  cmp rax, {}", case.val);
                    emit!(self, "  je .Lcase{}", case.id);
                }
                if let Some(id) = default_id {
                    emit!(self, "  jmp .Lcase{}", id);
                }
                emit!(self, "  jmp .Lbreak{:03}", seq);
                self.gen(body)?;
                emit!(self, ".Lbreak{:03}:", seq);

                self.brkseq = brk;
                Ok(())
            }
            NodeKind::Case { id, body } => {
                emit!(self, ".Lcase{}:", id);
                self.gen(body)
            }
            NodeKind::Block(body) | NodeKind::StmtExpr(body) => {
                for stmt in body {
                    self.gen(stmt)?;
                }
                Ok(())
            }
            NodeKind::Break => {
                let seq = self
                    .brkseq
                    .ok_or_else(|| self.file.error_at(node.loc, "stray break"))?;
                emit!(self, "  jmp .Lbreak{:03}", seq);
                Ok(())
            }
            NodeKind::Continue => {
                let seq = self
                    .contseq
                    .ok_or_else(|| self.file.error_at(node.loc, "stray continue"))?;
                emit!(self, "  jmp .Lcontinue{:03}", seq);
                Ok(())
            }
            NodeKind::Goto(name) => {
                emit!(self, "  jmp .Llabel.{}.{}", self.funcname, name);
                Ok(())
            }
            NodeKind::Label { name, body } => {
                emit!(self, ".Llabel.{}.{}:", self.funcname, name);
                self.gen(body)
            }
            NodeKind::FunCall { name, args } => {
                if name == "__builtin_va_start" {
                    return self.gen_va_start(node, args);
                }

                if args.len() > 6 {
                    return Err(self.file.error_at(
                        node.loc,
                        format!("too many arguments to '{name}' (at most 6 are supported)"),
                    ));
                }
                for arg in args {
                    self.gen(arg)?;
                }
                for idx in (0..args.len()).rev() {
                    emit!(self, "  pop {}", ARG_REG8[idx]);
                }

                // The ABI wants rsp 16-byte aligned at the call; branch on
                // the current misalignment.
                let seq = self.next_label();
                emit!(self, "  mov rax, rsp");
                emit!(self, "  and rax, 15");
                emit!(self, "  jnz .L.call.{}", seq);
                emit!(self, "  mov rax, 0");
                emit!(self, "  call {}", name);
                emit!(self, "  jmp .L.end.{}", seq);
                emit!(self, ".L.call.{}:", seq);
                emit!(self, "  sub rsp, 8");
                emit!(self, "  mov rax, 0");
                emit!(self, "  call {}", name);
                emit!(self, "  add rsp, 8");
                emit!(self, ".L.end.{}:", seq);
                if node_ty(node).borrow().kind == TypeKind::Bool {
                    emit!(self, "  movzb rax, al");
                }
                emit!(self, "  push rax");
                Ok(())
            }
            NodeKind::Cast(operand) => {
                self.gen(operand)?;
                self.truncate(node_ty(node));
                Ok(())
            }
            NodeKind::Binary { op, lhs, rhs } => {
                self.gen(lhs)?;
                self.gen(rhs)?;
                self.gen_binary(*op, node_ty(node), node_ty(lhs));
                Ok(())
            }
        }
    }

    /// Writes the four-field System V va_list header through the pointer on
    /// the stack, using the save area laid down by the variadic prologue.
    fn gen_va_start(&mut self, node: &Node, args: &[Node]) -> Result<()> {
        if args.len() != 1 {
            return Err(self
                .file
                .error_at(node.loc, "__builtin_va_start takes exactly one argument"));
        }
        self.gen(&args[0])?;
        emit!(self, "  pop rax");
        emit!(self, "  mov edi, dword ptr [rbp-8]");
        emit!(self, "  mov dword ptr [rax], edi");
        emit!(self, "  mov dword ptr [rax+4], 0");
        emit!(self, "  lea rdi, [rbp+16]");
        emit!(self, "  mov qword ptr [rax+8], rdi");
        emit!(self, "  lea rdi, [rbp-56]");
        emit!(self, "  mov qword ptr [rax+16], rdi");
        emit!(self, "  push rax");
        Ok(())
    }
}
