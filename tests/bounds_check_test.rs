//! Bounds-check lowering: constant indexes elide compares, negative
//! constants degenerate to an unconditional handler call.

use bumpalo::Bump;
use kiln::testing::{NullClient, RecordingAssembler, TestArch};
use kiln::{BinaryOperation, Compiler, Operand, PromiseResolver, UnaryOperation};

const HANDLER: i64 = 0x5555;

fn build(index: Index) -> RecordingAssembler {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 0, 8);

    c.start_logical_ip(0);
    let object = c.thread();
    let idx = match index {
        Index::Constant(v) => c.constant(v),
        Index::Computed => {
            let a = c.constant(1);
            let b = c.constant(2);
            c.add(8, a, b)
        }
    };
    c.check_bounds(object, 8, idx, HANDLER);
    c.return_(8, None);

    c.compile();
    c.into_assembler()
}

enum Index {
    Constant(i64),
    Computed,
}

#[test]
fn test_negative_constant_index_calls_the_handler_unconditionally() {
    let asm = build(Index::Constant(-1));

    assert_eq!(asm.count_binary(BinaryOperation::Compare), 0);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 0);
    assert_eq!(asm.count_unary(UnaryOperation::Call), 1);
}

#[test]
fn test_non_negative_constant_index_elides_the_lower_bound_check() {
    let asm = build(Index::Constant(3));

    // Only the length compare survives.
    assert_eq!(asm.count_binary(BinaryOperation::Compare), 1);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 1);
    assert_eq!(asm.count_unary(UnaryOperation::Call), 1);
}

#[test]
fn test_computed_index_checks_both_bounds() {
    let asm = build(Index::Computed);

    assert_eq!(asm.count_binary(BinaryOperation::Compare), 2);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 2);
    assert_eq!(asm.count_unary(UnaryOperation::Call), 1);
}

#[test]
fn test_handler_address_is_embedded_in_the_call() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 0, 8);

    c.start_logical_ip(0);
    let object = c.thread();
    let idx = c.constant(-7);
    c.check_bounds(object, 8, idx, HANDLER);
    c.return_(8, None);

    c.compile();

    let target = c
        .assembler()
        .emitted
        .iter()
        .find_map(|e| match e {
            kiln::testing::Emitted::Op1(UnaryOperation::Call, _, Operand::Constant(p)) => Some(*p),
            _ => None,
        })
        .expect("no handler call emitted");
    assert_eq!(c.resolver().promise_value(target), HANDLER);
}
