mod common;

use common::{cpu, try_compile};
use nesquik::compiler::ErrorKind;

fn kind_of(source: &str) -> ErrorKind {
    try_compile(source).unwrap_err().kind
}

#[test]
fn test_undefined_variable_in_expression() {
    let source = "\
func main():
    var a = 5
    return a + c
";
    assert_eq!(kind_of(source), ErrorKind::UndefinedVariable("c".to_string()));
}

#[test]
fn test_undefined_assignment_target() {
    let source = "\
func main():
    c = 4
";
    assert_eq!(kind_of(source), ErrorKind::UndefinedVariable("c".to_string()));
}

#[test]
fn test_redefined_variable() {
    let source = "\
func main():
    var a = 1
    var a = 2
";
    assert_eq!(kind_of(source), ErrorKind::RedefinedVariable("a".to_string()));
}

#[test]
fn test_shadowing_is_not_a_redefinition() {
    let source = "\
var a = 1

func main():
    var a = 2
    return a
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 2);
}

#[test]
fn test_missing_main() {
    let source = "\
func foo():
    return 1
";
    assert_eq!(
        kind_of(source),
        ErrorKind::UndefinedFunction("main".to_string())
    );
}

#[test]
fn test_undefined_function() {
    let source = "\
func main():
    return foo()
";
    assert_eq!(kind_of(source), ErrorKind::UndefinedFunction("foo".to_string()));
}

#[test]
fn test_call_arity_mismatch() {
    let source = "\
func foo(x):
    return x

func main():
    return foo(1, 2)
";
    assert_eq!(kind_of(source), ErrorKind::BadArgs("foo".to_string()));
}

#[test]
fn test_call_argument_size_mismatch() {
    let source = "\
var a = 1

func foo(x):
    return x

func main():
    return foo(&a)
";
    assert_eq!(kind_of(source), ErrorKind::BadArgs("foo".to_string()));
}

#[test]
fn test_literal_256_is_two_bytes() {
    // A 2-byte literal still fits a pointer variable.
    let source = "\
func main():
    var *p = 256
    return 0
";
    assert!(try_compile(source).is_ok());
}

#[test]
fn test_literal_65536_is_too_big() {
    let source = "\
func main():
    var *p = 65536
";
    assert!(matches!(kind_of(source), ErrorKind::SizeError(_)));
}

#[test]
fn test_narrowing_assignment() {
    let source = "\
func main():
    var a = 256
";
    assert!(matches!(kind_of(source), ErrorKind::SizeError(_)));
}

#[test]
fn test_two_byte_return_is_rejected() {
    let source = "\
func main():
    return $1234
";
    assert!(matches!(kind_of(source), ErrorKind::SizeError(_)));
}

#[test]
fn test_pointer_arithmetic_is_rejected() {
    let source = "\
var *a = 5
var *b = 4

func main():
    return a + b
";
    assert!(matches!(kind_of(source), ErrorKind::SizeError(_)));
}

#[test]
fn test_deref_of_non_pointer() {
    let source = "\
var a = 1

func main():
    return *a
";
    assert_eq!(
        kind_of(source),
        ErrorKind::InvalidDereference("a".to_string())
    );
}

#[test]
fn test_mem_assign_through_non_pointer() {
    let source = "\
var a = 1

func main():
    *a = 2
";
    assert_eq!(
        kind_of(source),
        ErrorKind::InvalidDereference("a".to_string())
    );
}

#[test]
fn test_index_of_non_array() {
    let source = "\
var a = 1

func main():
    return a[0]
";
    assert_eq!(
        kind_of(source),
        ErrorKind::InvalidDereference("a".to_string())
    );
}

#[test]
fn test_array_too_long() {
    let source = "\
func main():
    var arr[256]
";
    assert!(matches!(kind_of(source), ErrorKind::SizeError(_)));
}

#[test]
fn test_locals_totalling_256_bytes_overflow() {
    let source = "\
func main():
    var a[200]
    var b[56]
";
    assert_eq!(kind_of(source), ErrorKind::StackOverflow);
}

#[test]
fn test_locals_totalling_255_bytes_fit() {
    let source = "\
func main():
    var a[200]
    var b[55]
    a[0] = 7
    return a[0]
";
    let mut cpu = cpu();
    cpu.compile_and_run(source);
    assert_eq!(cpu.a, 7);
}
