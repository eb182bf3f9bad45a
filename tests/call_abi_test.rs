//! Call ABI placement: argument registers fill first, overflow
//! arguments land in the outgoing frame area, the result arrives in
//! the return register, and trace handlers see the post-call address.

use std::cell::RefCell;

use bumpalo::Bump;
use kiln::testing::{
    Emitted, NullClient, RecordingAssembler, TestArch, REG_ARG0, REG_ARG1, REG_RETURN_LOW,
    REG_STACK,
};
use kiln::{
    BinaryOperation, Compiler, Operand, PromiseId, PromiseResolver, TraceHandler, UnaryOperation,
};

#[test]
fn test_three_arguments_with_two_argument_registers() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 0, 8);

    c.start_logical_ip(0);
    let addr = c.constant(0x1234);
    let a = c.constant(10);
    let b = c.constant(20);
    let d = c.constant(30);
    let r = c.call(addr, 0, None, 4, &[(a, 8), (b, 8), (d, 8)]);
    c.return_(4, Some(r));

    c.compile();
    let asm = c.assembler();

    assert_eq!(asm.count_unary(UnaryOperation::Call), 1);

    let destinations = asm.constant_move_destinations();
    assert!(
        destinations
            .iter()
            .any(|o| matches!(o, Operand::Register { low, .. } if *low == REG_ARG0)),
        "first argument did not reach the first argument register"
    );
    assert!(
        destinations
            .iter()
            .any(|o| matches!(o, Operand::Register { low, .. } if *low == REG_ARG1)),
        "second argument did not reach the second argument register"
    );
    // The third argument overflows to the top of the outgoing frame:
    // slot 7 of an 8-word frame, one word above the footer.
    assert!(
        destinations
            .iter()
            .any(|o| matches!(o, Operand::Memory { base, offset, .. }
                if *base == REG_STACK && *offset == 8)),
        "third argument did not reach the outgoing frame slot"
    );

    // The result is already in the return register; returning it
    // moves nothing.
    let moves_into_return = asm
        .emitted
        .iter()
        .filter(|e| {
            matches!(
                e,
                Emitted::Op2(BinaryOperation::Move, _, _, _, Operand::Register { low, .. })
                    if *low == REG_RETURN_LOW
            )
        })
        .count();
    assert_eq!(moves_into_return, 0);
}

#[test]
fn test_live_locals_are_pinned_to_their_frame_homes_across_a_call() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 1, 8);

    c.start_logical_ip(0);
    // A register-resident local must be stored to its frame slot
    // before the call can proceed.
    let v = c.constant(99);
    let w = c.constant(1);
    let x = c.add(8, v, w);
    c.store_local(8, x, 0);

    let addr = c.constant(0x4321);
    let r = c.call(addr, 0, None, 8, &[]);
    let y = c.load_local(8, 0);
    let total = c.add(8, r, y);
    c.return_(8, Some(total));

    c.compile();
    let asm = c.assembler();

    // Local slot 0 of an 8-word frame with a one-word footer sits at
    // word 8 from the stack register.
    let pinned = asm.emitted.iter().any(|e| {
        matches!(
            e,
            Emitted::Op2(BinaryOperation::Move, _, Operand::Register { .. }, _,
                Operand::Memory { base, offset, .. })
                if *base == REG_STACK && *offset == 64
        )
    });
    assert!(pinned, "local was not stored to its frame home for the call");
}

struct CollectingTrace {
    promises: RefCell<Vec<PromiseId>>,
}

impl TraceHandler for CollectingTrace {
    fn handle_trace(&self, promise: PromiseId) {
        self.promises.borrow_mut().push(promise);
    }
}

#[test]
fn test_trace_handler_receives_the_post_call_address() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let trace = CollectingTrace {
        promises: RefCell::new(Vec::new()),
    };
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 0, 8);

    c.start_logical_ip(0);
    let addr = c.constant(0x1234);
    let r = c.call(addr, 0, Some(&trace), 8, &[]);
    c.return_(8, Some(r));

    let size = c.compile();
    let mut out = vec![0u8; size as usize + 64];
    c.write_to(&mut out).unwrap();

    let promises = trace.promises.borrow();
    assert_eq!(promises.len(), 1, "trace handler fired once per call site");

    let address = c.resolver().promise_value(promises[0]);
    let base = out.as_ptr() as i64;
    assert!(address > base && address <= base + size as i64);
}

#[test]
fn test_stack_call_pins_outgoing_arguments_to_the_argument_area() {
    let arena = Bump::new();
    let arch = TestArch::new();
    let client = NullClient;
    let mut c = Compiler::new(&arena, &arch, RecordingAssembler::new(), &client);
    c.init(1, 0, 0, 8);

    c.start_logical_ip(0);
    let a = c.constant(5);
    c.push(8, a);
    let addr = c.constant(0x9999);
    let r = c.stack_call(addr, 0, None, 8, 1);
    c.popped();
    c.return_(8, Some(r));

    c.compile();
    let asm = c.assembler();

    assert_eq!(asm.count_unary(UnaryOperation::Call), 1);
    // The pushed word is pinned at the top of the outgoing area,
    // which for a one-word footprint is frame slot 7.
    let destinations = asm.constant_move_destinations();
    assert!(destinations
        .iter()
        .any(|o| matches!(o, Operand::Memory { base, offset, .. }
            if *base == REG_STACK && *offset == 8)));
}
