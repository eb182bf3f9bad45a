//! Junction reconciliation: after a conditional both paths must leave
//! the merged value in the same site.
//!
//! The program under test is the classic diamond
//!
//! ```text
//! ip0:  if (x < 0) goto ip2
//! ip1:  y = 7; goto ip3
//! ip2:  y = 9
//! ip3:  return y
//! ```
//!
//! built the way a bytecode walker drives the builder: the fall-through
//! path compiles first from a saved state, the branch target resumes
//! from the snapshot, and the rejoin is recorded with a visit edge.

use bumpalo::Bump;
use kiln::testing::{Emitted, NullClient, RecordingAssembler, TestArch};
use kiln::{AssemblerBlock, BinaryOperation, Compiler, Operand, UnaryOperation};

fn build_diamond() -> RecordingAssembler {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(4, 0, 1, 8);

    // ip0: compare a frame-resident local against zero and branch.
    c.start_logical_ip(0);
    c.init_local(8, 0);
    let x = c.load_local(8, 0);
    let zero = c.constant(0);
    c.cmp(4, x, zero);
    let ip2 = c.machine_ip(2);
    let target2 = c.promise_constant(ip2);
    c.jl(target2);
    let branch_state = c.save_state();

    // ip1: the fall-through assignment, then jump over the other arm.
    c.start_logical_ip(1);
    let seven = c.constant(7);
    c.store_local(8, seven, 0);
    let ip3 = c.machine_ip(3);
    let target3 = c.promise_constant(ip3);
    c.jmp(target3);
    let rejoin_state = c.save_state();

    // ip2: the branch-taken assignment, falling through to the merge.
    c.restore_state(branch_state);
    c.start_logical_ip(2);
    let nine = c.constant(9);
    c.store_local(8, nine, 0);

    // ip3: the merge point.
    c.start_logical_ip(3);
    let y = c.load_local(8, 0);
    c.return_(8, Some(y));

    // Record the rejoin edge from ip1's jump.
    c.restore_state(rejoin_state);
    c.visit_logical_ip(3);

    c.compile();
    c.into_assembler()
}

#[test]
fn test_both_paths_leave_the_merged_value_in_the_same_site() {
    let asm = build_diamond();

    // Each arm materializes its constant into the junction site; the
    // two destinations must be the same concrete register.
    let destinations = asm.constant_move_destinations();
    assert_eq!(
        destinations.len(),
        2,
        "expected one junction move per arm, got {destinations:?}"
    );
    assert_eq!(
        destinations[0], destinations[1],
        "the two arms disagree on the junction site"
    );
    assert!(
        matches!(destinations[0], Operand::Register { .. }),
        "junction site should be a register when one is free"
    );
}

#[test]
fn test_diamond_emits_one_conditional_one_jump_and_one_compare() {
    let asm = build_diamond();

    assert_eq!(asm.count_binary(BinaryOperation::Compare), 1);
    assert_eq!(asm.count_unary(UnaryOperation::JumpIfLess), 1);
    assert_eq!(asm.count_unary(UnaryOperation::Jump), 1);
}

#[test]
fn test_the_two_arms_emit_their_junction_moves_in_separate_blocks() {
    let asm = build_diamond();
    assert_eq!(asm.block_count(), 4);

    let block_of_constant_move = |asm: &RecordingAssembler| -> Vec<usize> {
        (0..asm.block_count())
            .filter(|&b| {
                asm.block_ops(AssemblerBlock(b as u32)).iter().any(|e| {
                    matches!(
                        e,
                        Emitted::Op2(BinaryOperation::Move, _, Operand::Constant(_), _, _)
                    )
                })
            })
            .collect()
    };

    let blocks = block_of_constant_move(&asm);
    assert_eq!(blocks.len(), 2, "one junction move per arm");
    assert_ne!(blocks[0], blocks[1], "arms share a block");
}

#[test]
fn test_at_most_one_cross_move_per_disagreeing_path() {
    let asm = build_diamond();

    // Beyond the two constant materializations, the only register
    // copy allowed is the final placement into the return register.
    let register_moves = asm
        .emitted
        .iter()
        .filter(|e| {
            matches!(
                e,
                Emitted::Op2(
                    BinaryOperation::Move,
                    _,
                    Operand::Register { .. },
                    _,
                    Operand::Register { .. },
                )
            )
        })
        .count();
    assert!(register_moves <= 1, "junction inserted redundant moves");
}
