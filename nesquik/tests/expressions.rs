mod common;

use common::cpu;

fn returns(body: &str, expected: u8) {
    let source = format!("func main():\n    return {}\n", body);
    let mut cpu = cpu();
    cpu.compile_and_run(&source);
    assert_eq!(cpu.a, expected, "return {}", body);
}

#[test]
fn test_hex_literal() {
    returns("$f0", 240);
}

#[test]
fn test_negative_literal_wraps() {
    returns("-5", 251);
}

#[test]
fn test_add_sub() {
    returns("5 + 2 - 1", 6);
    returns("5 - (2 + 2)", 1);
    returns("-5 + 20 + (-$a)", 5);
    returns("-2 - 3 - 5 - -20", 10);
    returns("(-2) + (-8)", 246);
}

#[test]
fn test_mul_precedence() {
    returns("2 + 2 * 2", 6);
}

#[test]
fn test_parenthesized_mul() {
    returns("(2 + 3) * (4 + 5)", 45);
}

#[test]
fn test_division_truncates() {
    returns("8 / 3", 2);
    returns("23 / 5", 4);
    returns("14 / 15", 0);
}

#[test]
fn test_mul_by_zero() {
    returns("0 * 9", 0);
    returns("9 * 0", 0);
}

#[test]
fn test_mixed_arithmetic() {
    returns("5 * (23 / 5) - -(5 / 5)", 21);
}

#[test]
fn test_comparisons_produce_flags() {
    returns("5 > 4", 1);
    returns("4 > 5", 0);
    returns("5 > 5", 0);
    returns("5 >= 5", 1);
    returns("4 >= 5", 0);
    returns("4 < 5", 1);
    returns("5 < 4", 0);
    returns("5 <= 5", 1);
    returns("5 <= 4", 0);
    returns("5 == 5", 1);
    returns("5 == 4", 0);
    returns("5 != 4", 1);
    returns("5 != 5", 0);
}
