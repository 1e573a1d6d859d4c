mod common;

use common::cpu;

#[test]
fn test_if_without_else() {
    let template = "\
var a = 10

func main():
    if {expr}:
        a = a + 2
    return a
";
    let cases = [
        ("a == 10", 12),
        ("a >= 10", 12),
        ("a <= 10", 12),
        ("a < 10", 10),
        ("10 == a", 12),
        ("10 <= a", 12),
        ("10 >= a", 12),
        ("10 > a", 10),
    ];
    for (expr, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{expr}", expr));
        assert_eq!(cpu.a, expected, "if {}", expr);
    }
}

#[test]
fn test_if_else() {
    let template = "\
var a = 10

func main():
    if {expr}:
        a = a + 2
    else:
        a = a - 2
    return a
";
    let cases = [
        ("a == 10", 12),
        ("a >= 10", 12),
        ("a <= 10", 12),
        ("a < 10", 8),
    ];
    for (expr, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{expr}", expr));
        assert_eq!(cpu.a, expected, "if {}", expr);
    }
}

#[test]
fn test_if_elif_else() {
    let template = "\
var a = 10
var b = {expr}

func main():
    var max = 0
    if a == b:
        max = a
    elif a > b:
        max = a
    else:
        max = b
    return max
";
    let cases = [("10", 10), ("15", 15), ("5", 10)];
    for (expr, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{expr}", expr));
        assert_eq!(cpu.a, expected, "b = {}", expr);
    }
}

#[test]
fn test_branch_bodies_with_temporaries() {
    let template = "\
var a = 5

func main():
    if {expr}:
        a = (5 + 4) - (3 + 2 + 1)
    else:
        a = (2 + 2) + 1
    return a
";
    let cases = [("a > 5", 5), ("a == 5", 3)];
    for (expr, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{expr}", expr));
        assert_eq!(cpu.a, expected, "if {}", expr);
    }
}

#[test]
fn test_nested_if_elif_else() {
    let template = "\
var a = {val}

func main():
    if a > 5:
        if a > (30 - 15):
            a = (5 + 4) - (3 + 2 + 1) + (6 * 2)
        elif a > 10:
            a = 20 + (-5 * 2)
        else:
            a = 2 + 3
    else:
        a = 3 - (4 / 2)
    return a
";
    let cases = [("20", 15), ("13", 10), ("6", 5), ("5", 1)];
    for (val, expected) in cases {
        let mut cpu = cpu();
        cpu.compile_and_run(&template.replace("{val}", val));
        assert_eq!(cpu.a, expected, "a = {}", val);
    }
}
