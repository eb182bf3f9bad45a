//! Constant-compare folding and the branch truth table.
//!
//! A compare between two resolved constants emits nothing; the
//! following branch either collapses to an unconditional jump, is
//! elided entirely, or (when no constant outcome is cached) emits the
//! conditional as written.

use bumpalo::Bump;
use kiln::testing::{NullClient, RecordingAssembler, TestArch};
use kiln::{BinaryOperation, Compiler, UnaryOperation, ValueId};

fn branch_by(c: &mut Compiler<'_, RecordingAssembler>, op: UnaryOperation, target: ValueId) {
    match op {
        UnaryOperation::Jump => c.jmp(target),
        UnaryOperation::JumpIfLess => c.jl(target),
        UnaryOperation::JumpIfGreater => c.jg(target),
        UnaryOperation::JumpIfLessOrEqual => c.jle(target),
        UnaryOperation::JumpIfGreaterOrEqual => c.jge(target),
        UnaryOperation::JumpIfEqual => c.je(target),
        UnaryOperation::JumpIfNotEqual => c.jne(target),
        _ => unreachable!(),
    }
}

/// Compile `cmp first, second; <op> L1` and report what was emitted.
fn fold(first: i64, second: i64, op: UnaryOperation) -> RecordingAssembler {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(2, 0, 0, 4);

    c.start_logical_ip(0);
    let a = c.constant(first);
    let b = c.constant(second);
    c.cmp(4, a, b);
    let ip = c.machine_ip(1);
    let target = c.promise_constant(ip);
    branch_by(&mut c, op, target);

    c.start_logical_ip(1);
    c.return_(8, None);

    c.compile();
    c.into_assembler()
}

#[test]
fn test_less_than_collapses_jl_to_an_unconditional_jump() {
    let asm = fold(3, 5, UnaryOperation::JumpIfLess);
    assert_eq!(asm.count_binary(BinaryOperation::Compare), 0);
    assert_eq!(asm.count_unary(UnaryOperation::Jump), 1);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 0);
}

#[test]
fn test_greater_than_elides_jl_entirely() {
    let asm = fold(7, 5, UnaryOperation::JumpIfLess);
    assert_eq!(asm.count_binary(BinaryOperation::Compare), 0);
    assert_eq!(asm.count_unary(UnaryOperation::Jump), 0);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 0);
}

#[test]
fn test_branch_truth_table() {
    use UnaryOperation::*;

    // (first, second) per constant outcome, then which conditionals
    // survive as jumps.
    let cases: &[(i64, i64, &[(UnaryOperation, bool)])] = &[
        (
            1,
            2, // Less
            &[
                (JumpIfLess, true),
                (JumpIfLessOrEqual, true),
                (JumpIfNotEqual, true),
                (JumpIfGreater, false),
                (JumpIfGreaterOrEqual, false),
                (JumpIfEqual, false),
                (Jump, true),
            ],
        ),
        (
            2,
            1, // Greater
            &[
                (JumpIfGreater, true),
                (JumpIfGreaterOrEqual, true),
                (JumpIfNotEqual, true),
                (JumpIfLess, false),
                (JumpIfLessOrEqual, false),
                (JumpIfEqual, false),
                (Jump, true),
            ],
        ),
        (
            2,
            2, // Equal
            &[
                (JumpIfEqual, true),
                (JumpIfLessOrEqual, true),
                (JumpIfGreaterOrEqual, true),
                (JumpIfLess, false),
                (JumpIfGreater, false),
                (JumpIfNotEqual, false),
                (Jump, true),
            ],
        ),
    ];

    for &(first, second, rows) in cases {
        for &(op, taken) in rows {
            let asm = fold(first, second, op);
            assert_eq!(
                asm.count_binary(BinaryOperation::Compare),
                0,
                "constant compare emitted for {op:?} on ({first}, {second})"
            );
            let jumps = asm.count_unary(UnaryOperation::Jump);
            assert_eq!(
                jumps,
                taken as usize,
                "wrong fold for {op:?} on ({first}, {second})"
            );
            // Folded branches never keep their conditional form.
            if op != Jump {
                assert_eq!(asm.count_unary(op), 0);
            }
        }
    }
}

#[test]
fn test_non_constant_compare_emits_the_conditional_as_written() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(2, 0, 1, 4);

    c.start_logical_ip(0);
    c.init_local(8, 0);
    let x = c.load_local(8, 0);
    let zero = c.constant(0);
    c.cmp(4, x, zero);
    let ip = c.machine_ip(1);
    let target = c.promise_constant(ip);
    c.jl(target);

    c.start_logical_ip(1);
    c.return_(8, None);

    c.compile();
    let asm = c.into_assembler();

    assert_eq!(asm.count_binary(BinaryOperation::Compare), 1);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 1);
    assert_eq!(asm.count_unary(UnaryOperation::Jump), 0);
}
