use rstest::rstest;

use crate::parse::Parser;
use crate::token::{tokenize, TokenKind};
use crate::ty::TypeKind;
use crate::{compile, SourceFile};

fn src(text: &str) -> SourceFile {
    SourceFile::new("test.c", text)
}

fn compile_ok(text: &str) -> String {
    match compile(&src(text)) {
        Ok(asm) => asm,
        Err(err) => panic!("compilation failed:\n{err}"),
    }
}

/// The instructions between the `main` label and its return label.
fn main_body(asm: &str) -> &str {
    let start = asm.find("\nmain:").expect("main label");
    let end = asm.find(".L.return.main:").expect("return label");
    &asm[start..end]
}

// ---- lexer ------------------------------------------------------------

#[rstest]
#[case("42", 42)]
#[case("0x2A", 42)]
#[case("0X2a", 42)]
#[case("0b101", 5)]
#[case("0B1111", 15)]
#[case("052", 42)]
#[case("0", 0)]
#[case("'A'", 65)]
#[case("'\\n'", 10)]
#[case("'\\e'", 27)]
#[case("'\\0'", 0)]
#[case("'\\q'", 113)] // unknown escapes decode to the character itself
fn lex_numeric_literals(#[case] text: &str, #[case] expected: i64) {
    let toks = tokenize(&src(text)).unwrap();
    assert_eq!(toks[0].kind, TokenKind::Num(expected));
}

#[test]
fn lex_longest_punctuator_wins() {
    let toks = tokenize(&src("a <<= 1;")).unwrap();
    assert_eq!(toks.len(), 5); // a, <<=, 1, ;, eof
    assert_eq!(toks[1].len, 3);

    let toks = tokenize(&src("a << 1;")).unwrap();
    assert_eq!(toks[1].len, 2);
}

#[test]
fn lex_string_escapes() {
    let toks = tokenize(&src("\"a\\tb\"")).unwrap();
    assert_eq!(toks[0].kind, TokenKind::Str(vec![b'a', 9, b'b', 0]));
}

#[test]
fn lex_keywords_need_word_boundaries() {
    let toks = tokenize(&src("intx; int x;")).unwrap();
    assert_eq!(toks[0].kind, TokenKind::Ident);
    assert_eq!(toks[0].len, 4);
    assert_eq!(toks[2].kind, TokenKind::Reserved);
    assert_eq!(toks[2].len, 3);
}

#[test]
fn lex_skips_comments() {
    let toks = tokenize(&src("// line\n/* block\n still */ 7")).unwrap();
    assert_eq!(toks[0].kind, TokenKind::Num(7));
    assert_eq!(toks[1].kind, TokenKind::Eof);
}

#[rstest]
#[case::bad_digit("0x1g;")]
#[case::unclosed_string("\"unclosed")]
#[case::unclosed_comment("/* unclosed")]
#[case::long_char("'ab'")]
fn lex_rejects(#[case] text: &str) {
    assert!(tokenize(&src(text)).is_err());
}

// ---- parser invariants ------------------------------------------------

#[test]
fn struct_layout_offsets() {
    let file = src("struct S { char a; int b; char c; } g;");
    let toks = tokenize(&file).unwrap();
    let prog = Parser::new(&file, toks).program().unwrap();

    let g = prog.globals[0].borrow();
    let ty = g.ty.borrow();
    assert_eq!(ty.kind, TypeKind::Struct);
    assert_eq!(ty.align, 4);
    assert_eq!(ty.size, 12);

    let offsets: Vec<i64> = ty.members.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
    for member in &ty.members {
        assert_eq!(member.offset % member.ty.borrow().align, 0);
    }
}

#[test]
fn stack_size_is_summed_and_rounded() {
    let file = src("int main() { int a; long b; char c; return 0; }");
    let toks = tokenize(&file).unwrap();
    let prog = Parser::new(&file, toks).program().unwrap();

    let func = &prog.funcs[0];
    assert_eq!(func.stack_size, 16); // 4 + 8 + 1 rounded up to 8
    for var in &func.locals {
        let offset = var.borrow().offset;
        assert!(offset >= 1 && offset <= func.stack_size);
    }
}

#[test]
fn add_type_is_idempotent() {
    let file = src("int main() { int x = 2; return x + 40 * (x < 3); }");
    let toks = tokenize(&file).unwrap();
    let mut prog = Parser::new(&file, toks).program().unwrap();

    let before = format!("{:?}", prog.funcs[0].body);
    for stmt in &mut prog.funcs[0].body {
        crate::ty::add_type(&file, stmt).unwrap();
    }
    assert_eq!(before, format!("{:?}", prog.funcs[0].body));
}

#[test]
fn unsized_global_array_completed_by_initializer() {
    let file = src("int a[] = {1, 2, 3};");
    let toks = tokenize(&file).unwrap();
    let prog = Parser::new(&file, toks).program().unwrap();

    let a = prog.globals[0].borrow();
    let ty = a.ty.borrow();
    assert!(!ty.is_incomplete);
    assert_eq!(ty.array_len, 3);
    assert_eq!(ty.size, 12);
}

#[test]
fn forward_declared_struct_keeps_identity() {
    let file = src(
        "struct Node { struct Node *next; int val; }; \
         int main() { struct Node n; n.val = 3; n.next = &n; return n.next->val; }",
    );
    let toks = tokenize(&file).unwrap();
    assert!(Parser::new(&file, toks).program().is_ok());
}

// ---- sizeof, _Alignof, constants --------------------------------------

#[rstest]
#[case("int main() { return sizeof(char); }", 1)]
#[case("int main() { return sizeof(short); }", 2)]
#[case("int main() { return sizeof(int); }", 4)]
#[case("int main() { return sizeof(long); }", 8)]
#[case("int main() { return sizeof(long long); }", 8)]
#[case("int main() { return sizeof(int*); }", 8)]
#[case("int main() { return sizeof(int[10]); }", 40)]
#[case("struct S { char c; int i; }; int main() { return sizeof(struct S); }", 8)]
#[case("int main() { return sizeof(struct { char c; long l; }); }", 16)]
#[case("int main() { int x; return sizeof x; }", 4)]
#[case("int main() { int a[4]; return sizeof(a); }", 16)]
#[case("int main() { return _Alignof(struct { char c; int i; }); }", 4)]
#[case("enum E { A, B = 7, C }; int main() { return C; }", 8)]
#[case("int a[3 * 2 + 1]; int main() { return sizeof(a); }", 28)]
fn sizeof_and_constants(#[case] text: &str, #[case] expected: i64) {
    let asm = compile_ok(text);
    let needle = format!("  push {expected}\n");
    assert!(
        main_body(&asm).contains(&needle),
        "missing {needle:?} in:\n{asm}"
    );
}

// ---- global initializers ----------------------------------------------

#[test]
fn global_scalar_initializers() {
    let asm = compile_ok("int g = 3 ^ 5; char c = 'A'; long l = 1; short s = 2;");
    assert!(asm.contains("g:\n  .4byte 6\n"));
    assert!(asm.contains("c:\n  .byte 65\n"));
    assert!(asm.contains("l:\n  .8byte 1\n"));
    assert!(asm.contains("s:\n  .2byte 2\n"));
}

#[test]
fn global_pointer_initializer_scales_array_addend() {
    let asm = compile_ok("int a[3]; int *p = a + 2; int *q = &a;");
    assert!(asm.contains("p:\n  .quad a+8\n"));
    assert!(asm.contains("q:\n  .quad a+0\n"));
    assert!(asm.contains("a:\n  .zero 12\n"));
}

#[test]
fn string_literal_goes_to_data() {
    let asm = compile_ok("char *s = \"ok\";");
    assert!(asm.contains(".L.data.0:\n  .byte 111\n  .byte 107\n  .byte 0\n"));
    assert!(asm.contains("s:\n  .quad .L.data.0+0\n"));
    assert!(!asm.contains(".global .L.data.0"));
}

#[test]
fn global_array_initializer_zero_fills() {
    let asm = compile_ok("int a[4] = {1, 2};");
    assert!(asm.contains("a:\n  .4byte 1\n  .4byte 2\n  .byte 0\n"));
    assert_eq!(asm.matches("  .byte 0\n").count(), 8);
}

#[test]
fn global_struct_initializer_pads_holes() {
    let asm = compile_ok("struct S { char c; int i; }; struct S g = {1, 2};");
    assert!(asm.contains("g:\n  .byte 1\n  .byte 0\n  .byte 0\n  .byte 0\n  .4byte 2\n"));
}

#[test]
fn global_char_array_from_string() {
    let asm = compile_ok("char s[6] = \"ok\";");
    assert!(
        asm.contains("s:\n  .byte 111\n  .byte 107\n  .byte 0\n  .byte 0\n  .byte 0\n  .byte 0\n")
    );
}

#[test]
fn compound_literal_at_file_scope() {
    let asm = compile_ok("int *p = (int[]){10, 20};");
    assert!(asm.contains(".L.data.0:\n  .4byte 10\n  .4byte 20\n"));
    assert!(asm.contains("p:\n  .quad .L.data.0+0\n"));
}

// ---- local initializers -----------------------------------------------

#[test]
fn local_array_initializer_expands_to_assignments() {
    let asm = compile_ok("int main() { int a[3] = {1, 2}; return a[0]; }");
    // two elements plus one zero fill, all through int stores
    assert_eq!(main_body(&asm).matches("  mov [rax], edi\n").count(), 3);
}

#[test]
fn local_char_array_from_string_literal() {
    let asm = compile_ok("int main() { char s[] = \"hi\"; return s[0]; }");
    assert_eq!(main_body(&asm).matches("  mov [rax], dil\n").count(), 3);
}

#[test]
fn local_struct_initializer_zero_fills_members() {
    let asm = compile_ok(
        "struct S { int a; int b; int c; }; int main() { struct S s = {5}; return s.c; }",
    );
    assert_eq!(main_body(&asm).matches("  mov [rax], edi\n").count(), 3);
}

#[test]
fn excess_initializer_elements_are_skipped() {
    let asm = compile_ok("int main() { int a[2] = {1, 2, 3}; return a[1]; }");
    assert_eq!(main_body(&asm).matches("  mov [rax], edi\n").count(), 2);
}

// ---- statements and codegen -------------------------------------------

#[rstest]
#[case::product("int main(){ int a=3; int b=4; return a*b+2; }", "  imul rax, rdi\n")]
#[case::recursion(
    "int fib(int n){ if(n<2) return n; return fib(n-1)+fib(n-2); } \
     int main(){ return fib(10); }",
    "  call fib\n"
)]
#[case::pointer_arith(
    "int main(){ int a[3]; a[0]=1; a[1]=2; a[2]=4; int *p=a; return *(p+2) + p[1]; }",
    "  imul rdi, 4\n"
)]
#[case::member_access(
    "struct S{ char c; int i; }; int main(){ struct S s; s.c=1; s.i=41; return s.c + s.i; }",
    "  add rax, 4\n"
)]
#[case::for_loop("int main(){ int x=0; for(int i=0;i<5;i++) x+=i; return x; }", ".Lbegin000:\n")]
#[case::do_while("int main(){ int i=0; do i++; while(i<3); return i; }", "  jne .Lbegin000\n")]
#[case::goto_label("int main(){ int i=0; again: i++; if(i<3) goto again; return i; }",
    ".Llabel.main.again:\n")]
#[case::shortcircuit("int main(){ int x=1; return x || x/0; }", "  jne .L.true.0\n")]
#[case::ternary("int main(){ int x=5; return x>3 ? 1 : 2; }", ".Lelse000:\n")]
fn end_to_end_scenarios(#[case] text: &str, #[case] marker: &str) {
    let asm = compile_ok(text);
    assert!(asm.contains(marker), "missing {marker:?} in:\n{asm}");
}

#[test]
fn switch_emits_case_labels() {
    let asm = compile_ok(
        "int main() { int x = 2; switch (x) { \
           case 1: return 1; case 2: return 9; default: return 0; } }",
    );
    assert!(asm.contains("  cmp rax, 1\n  je .Lcase0\n"));
    assert!(asm.contains("  cmp rax, 2\n  je .Lcase1\n"));
    assert!(asm.contains("  jmp .Lcase2\n"));
    assert!(asm.contains(".Lcase0:\n"));
    assert!(asm.contains(".Lbreak000:\n"));
}

#[test]
fn static_local_becomes_synthetic_global() {
    let asm = compile_ok("int counter() { static int c = 5; c = c + 1; return c; }");
    assert!(asm.contains(".L.data.0:\n  .4byte 5\n"));
    assert!(!asm.contains(".global .L.data.0"));
    assert!(asm.contains("  push offset .L.data.0\n"));
}

#[test]
fn static_function_is_not_global() {
    let asm = compile_ok("static int helper() { return 1; } int main() { return helper(); }");
    assert!(!asm.contains(".global helper"));
    assert!(asm.contains("helper:\n"));
    assert!(asm.contains(".global main\n"));
}

#[test]
fn typedef_and_enum_constants() {
    let asm = compile_ok(
        "typedef int myint; enum E { A, B = 5, C }; int main() { myint x = C; return x; }",
    );
    assert!(main_body(&asm).contains("  push 6\n"));
}

#[test]
fn calls_align_the_stack() {
    let asm = compile_ok("int f(); int main() { return f(); }");
    assert!(asm.contains("  and rax, 15\n"));
    assert!(asm.contains(".L.call.0:\n"));
    assert!(asm.contains(".L.end.0:\n"));
}

#[test]
fn bool_call_result_is_normalized() {
    let asm = compile_ok("_Bool flag() { return 1; } int main() { _Bool b = flag(); return b; }");
    assert!(main_body(&asm).contains("  movzb rax, al\n"));
}

#[test]
fn variadic_prologue_saves_registers() {
    let asm = compile_ok("int f(int a, ...) { return a; }");
    assert!(asm.contains("  mov dword ptr [rbp-8], 8\n"));
    assert!(asm.contains("  mov [rbp-16], r9\n"));
    assert!(asm.contains("  mov [rbp-56], rdi\n"));
}

#[test]
fn va_start_writes_va_list_header() {
    let asm = compile_ok("int f(int n, ...) { long ap[3]; __builtin_va_start(ap); return n; }");
    assert!(asm.contains("  mov edi, dword ptr [rbp-8]\n"));
    assert!(asm.contains("  mov dword ptr [rax+4], 0\n"));
    assert!(asm.contains("  mov qword ptr [rax+16], rdi\n"));
}

#[test]
fn statement_expression_yields_last_value() {
    let asm = compile_ok("int main() { return ({ int x = 5; x + 1; }); }");
    assert!(main_body(&asm).contains("  add rax, rdi\n"));
}

#[test]
fn compound_literal_in_function() {
    let asm =
        compile_ok("struct S { int a; int b; }; int main() { return ((struct S){7, 8}).b; }");
    let body = main_body(&asm);
    assert!(body.contains("  push 7\n"));
    assert!(body.contains("  push 8\n"));
}

#[test]
fn stack_frame_size_in_prologue() {
    let asm = compile_ok("int main() { int a; long b; char c; return 0; }");
    assert!(asm.contains("  sub rsp, 16\n"));
}

// ---- diagnostics ------------------------------------------------------

#[rstest]
#[case::undefined_var("int main() { return y; }")]
#[case::void_deref("int main() { void *p; return *p; }")]
#[case::non_pointer_deref("int main() { int x; return *x; }")]
#[case::incomplete_sizeof("struct S; int main() { return sizeof(struct S); }")]
#[case::incomplete_deref("struct S; int main(struct S *p) { return (*p).x; }")]
#[case::stray_break("int main() { break; }")]
#[case::stray_continue("int main() { continue; }")]
#[case::stray_case("int main() { case 1: return 0; }")]
#[case::too_many_args("int f(); int main() { return f(1,2,3,4,5,6,7); }")]
#[case::bad_lvalue("int main() { 3 = 4; return 0; }")]
#[case::array_assign("int main() { int a[2]; int b[2]; a = b; return 0; }")]
#[case::void_variable("int main() { void x; return 0; }")]
#[case::redefined_local("int main() { int x; int x; return 0; }")]
#[case::unknown_member("struct S { int a; }; int main() { struct S s; return s.b; }")]
#[case::non_constant_global("int g; int h = g; ")]
#[case::mixed_type_specifiers("struct S { int a; }; struct S int x; int main() { return 0; }")]
fn rejected_programs(#[case] text: &str) {
    assert!(compile(&src(text)).is_err(), "accepted: {text}");
}

#[test]
fn diagnostics_point_at_the_source() {
    let err = compile(&src("int main() { return y; }")).unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("test.c:1: int main() { return y; }\n"), "{msg}");
    assert!(msg.contains("^ undefined variable 'y'"), "{msg}");
}

#[test]
fn diagnostics_carry_the_line_number() {
    let err = compile(&src("int g;\nint main() {\n  return *g;\n}")).unwrap_err();
    assert!(err.to_string().starts_with("test.c:3: "), "{err}");
}

// ---- whole-program snapshots ------------------------------------------

#[test]
fn snapshot_return_zero() {
    let asm = compile_ok("int main() { return 0; }");
    insta::assert_snapshot!("return_zero", asm);
}

#[test]
fn snapshot_global_int() {
    let asm = compile_ok("int x = 42; int main() { return x; }");
    insta::assert_snapshot!("global_int", asm);
}
