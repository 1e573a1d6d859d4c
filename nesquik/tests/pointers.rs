mod common;

use common::cpu;

#[test]
fn test_global_ptrs_to_global_vars() {
    let source = "\
var a = 5
var b = 4
var c = 3

var *p_a = &a
var *p_b = &b
var *p_c = &c

func main():
    return (*p_a + *p_b) - *p_c
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 6);
}

#[test]
fn test_deref_local_ptr_to_global_var() {
    let source = "\
var a = 10

func main():
    var *c = &a
    return *c
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 10);
}

#[test]
fn test_deref_ptr_in_loop_expr() {
    let source = "\
var a = 25

func main():
    var *ptr = &a
    var i = 0

    while *ptr > (4 - 4):        # this creates temps on stack
        *ptr = *ptr - (25 / 5)   # as well as this
        i = i + (2 - 1)          # and this

    return i
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 5);
    assert_eq!(cpu.memory[0x06], 0);
}

#[test]
fn test_deref_ptr_in_expressions() {
    let template = "\
var a = 5
var b = 4
var c = 3

func main():
    var *ptr_a = &a
    var *ptr_b = &b
    var *ptr_c = &c

    return {expr}
";
    let cases = [
        ("(*ptr_c + *ptr_b) - (*ptr_a)", 2),
        ("(*ptr_b + *ptr_c) - (*ptr_a)", 2),
        ("*ptr_b - *ptr_c + *ptr_a", 6),
        ("(*ptr_b + *ptr_a) / *ptr_c", 3),
        ("(*ptr_a * *ptr_b + 1) / *ptr_c", 7),
        ("*ptr_a > *ptr_b", 1),
        ("*ptr_a >= *ptr_b", 1),
        ("*ptr_b == *ptr_a", 0),
        ("*ptr_a == *ptr_b", 0),
        ("*ptr_c < *ptr_b", 1),
        ("*ptr_c <= *ptr_b", 1),
        ("*ptr_c != *ptr_b", 1),
        ("*ptr_b == *ptr_b", 1),
    ];
    for (expr, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{expr}", expr));
        assert_eq!(cpu.a, expected, "return {}", expr);
    }
}

#[test]
fn test_assign_to_global_via_ptr() {
    let source = "\
var a = 200

func main():
    var *ptr = &a
    *ptr = 123
    return a
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 123);
    assert_eq!(cpu.memory[0x06], 123);
}

#[test]
fn test_ptr_to_explicit_zero_page_address() {
    // The first global lands at $6, so a pointer to $6 aliases it.
    let source = "\
var a = 200

func main():
    var *ptr = $6
    *ptr = 123
    return a
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 123);
    assert_eq!(cpu.memory[0x06], 123);
}

#[test]
fn test_local_ptrs_to_local_vars() {
    let source = "\
func main():
    var a = 5
    var *ptr_a = &a
    var b
    var *ptr_b = &b
    *ptr_b = *ptr_a * 2
    return b
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 10);
}

#[test]
fn test_ptr_assignment() {
    let source = "\
var a = 10
var b = 20
var c = 30

func main():
    var *ptr1 = &a
    var *ptr2 = &b
    var *ptr3 = &c

    ptr2 = ptr3
    ptr3 = ptr1

    return *ptr2 + *ptr3  # c + a
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 40);
}

#[test]
fn test_ptr_to_absolute_address() {
    let source = "\
func main():
    var *ppu = $2000
    *ppu = 111
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.memory[0x2000], 111);
}

#[test]
fn test_global_ptr_to_absolute_address() {
    let source = "\
var *ppu = $2000

func main():
    *ppu = 99
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.memory[0x2000], 99);
}
