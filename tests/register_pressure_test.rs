//! Register pressure: more live values than registers forces spills
//! to frame slots and reloads on use, without changing the computed
//! result.

use bumpalo::Bump;
use kiln::testing::{
    Emitted, Machine, NullClient, RecordingAssembler, TestArch, REG_RETURN_LOW, REG_STACK,
};
use kiln::{BinaryOperation, Compiler, Operand};

fn count_stack_moves(asm: &RecordingAssembler) -> (usize, usize) {
    let mut spills = 0;
    let mut reloads = 0;
    for e in &asm.emitted {
        match e {
            Emitted::Op2(
                BinaryOperation::Move,
                _,
                Operand::Register { .. },
                _,
                Operand::Memory { base, .. },
            ) if *base == REG_STACK => spills += 1,
            Emitted::Op2(
                BinaryOperation::Move,
                _,
                Operand::Memory { base, .. },
                _,
                Operand::Register { .. },
            ) if *base == REG_STACK => reloads += 1,
            _ => {}
        }
    }
    (spills, reloads)
}

#[test]
fn test_pressure_beyond_the_register_file_spills_and_reloads() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);

    // Six allocatable registers; seven simultaneously live sums.
    c.init(1, 0, 0, 16);
    c.start_logical_ip(0);

    let mut expected = 0i64;
    for i in 0..7 {
        let lhs = (i + 1) as i64;
        let rhs = 10 * (i + 1) as i64;
        expected += lhs + rhs;
        let a = c.constant(lhs);
        let b = c.constant(rhs);
        let sum = c.add(8, a, b);
        c.push(8, sum);
    }

    let mut total = c.pop(8);
    for _ in 0..6 {
        let v = c.pop(8);
        total = c.add(8, total, v);
    }
    c.return_(8, Some(total));

    c.compile();
    let asm = c.assembler();

    let (spills, reloads) = count_stack_moves(asm);
    assert!(spills >= 1, "no value was spilled under pressure");
    assert!(reloads >= 1, "spilled values were never reloaded");

    let mut m = Machine::new();
    m.run(&asm.emitted, c.resolver());
    assert_eq!(m.regs[REG_RETURN_LOW as usize], expected);
}

#[test]
fn test_values_within_register_capacity_never_touch_the_frame() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);

    c.init(1, 0, 0, 16);
    c.start_logical_ip(0);

    let mut expected = 0i64;
    for i in 0..3 {
        let lhs = (i + 1) as i64;
        let rhs = 100 * (i + 1) as i64;
        expected += lhs + rhs;
        let a = c.constant(lhs);
        let b = c.constant(rhs);
        let sum = c.add(8, a, b);
        c.push(8, sum);
    }

    let mut total = c.pop(8);
    for _ in 0..2 {
        let v = c.pop(8);
        total = c.add(8, total, v);
    }
    c.return_(8, Some(total));

    c.compile();
    let asm = c.assembler();

    let (spills, reloads) = count_stack_moves(asm);
    assert_eq!(spills, 0);
    assert_eq!(reloads, 0);

    let mut m = Machine::new();
    m.run(&asm.emitted, c.resolver());
    assert_eq!(m.regs[REG_RETURN_LOW as usize], expected);
}
