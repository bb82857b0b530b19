//! Memory-management scenarios driven through the runtime surface.

use lyra_vm::{Function, Instruction, Opcode, Runtime, Value, ValueKind};

#[test]
fn refcount_reclamation_and_slot_reuse() {
    let runtime = Runtime::new();
    let gc = runtime.gc();

    // a 20-byte string payload lands in one small size class
    let text = b"twenty byte payload!";
    let first = gc.alloc_string(text).unwrap();
    let header = first.object_ptr();
    let address = first.object_addr();
    unsafe { assert_eq!((*header).ref_count(), 1) };

    // MOVE-style copy: a second slot observes refcount 2
    let mut r0 = Value::nil();
    let mut r1 = Value::nil();
    gc.write_value(&mut r0, first);
    gc.write_value(&mut r1, r0);
    unsafe { assert_eq!((*header).ref_count(), 3) };
    gc.release_value(first); // drop the creation handle
    unsafe { assert_eq!((*header).ref_count(), 2) };

    // overwriting both registers with nil drives the count to zero and
    // recycles the block
    gc.write_value(&mut r1, Value::nil());
    gc.write_value(&mut r0, Value::nil());
    assert_eq!(runtime.gc_stats().refcount_freed, 1);

    // the next allocation of the same size class gets the block back
    let second = gc.alloc_string(text).unwrap();
    assert_eq!(second.object_addr(), address);
    runtime.release_value(second);
}

#[test]
fn cyclic_pair_needs_the_tracing_path() {
    let runtime = Runtime::new();
    let mut builder = Function::builder().name("knot").max_stack(3);
    let k0 = builder.constant(Value::small_int(0)) as i32;
    // A[0] = B, B[0] = A, then drop both registers on return
    let id = runtime.register_function(
        builder
            .instruction(Instruction::ab(Opcode::NewArray, 0, 1))
            .instruction(Instruction::ab(Opcode::NewArray, 1, 1))
            .instruction(Instruction::abx(Opcode::LoadK, 2, k0))
            .instruction(Instruction::abc(Opcode::ArraySet, 0, 2, 1))
            .instruction(Instruction::abc(Opcode::ArraySet, 1, 2, 0))
            .instruction(Instruction::abc(Opcode::Return, 2, 1, 0))
            .build(),
    );
    runtime.execute(id, vec![]).unwrap();

    // the refcount path alone never reclaims the pair
    let stats = runtime.gc_stats();
    assert_eq!(stats.tracked, 2);
    assert_eq!(stats.live_objects, 2);

    runtime.force_gc();
    let stats = runtime.gc_stats();
    assert_eq!(stats.tracked, 0);
    assert_eq!(stats.traced_freed, 2);
    assert_eq!(stats.live_objects, 0);
}

#[test]
fn live_registers_survive_collection_mid_program() {
    let runtime = Runtime::new();
    let mut builder = Function::builder().max_stack(4);
    let k0 = builder.constant(Value::small_int(0)) as i32;
    let k9 = builder.constant(Value::small_int(9)) as i32;
    let id = runtime.register_function(
        builder
            .instruction(Instruction::ab(Opcode::NewArray, 0, 4))
            .instruction(Instruction::abx(Opcode::LoadK, 1, k0))
            .instruction(Instruction::abx(Opcode::LoadK, 2, k9))
            .instruction(Instruction::abc(Opcode::ArraySet, 0, 1, 2))
            .instruction(Instruction::op(Opcode::GcCollect))
            .instruction(Instruction::abc(Opcode::ArrayGet, 3, 0, 1))
            .instruction(Instruction::abc(Opcode::Return, 3, 2, 0))
            .build(),
    );
    let results = runtime.execute(id, vec![]).unwrap();
    assert_eq!(results[0].as_small_int(), Some(9));
}

#[test]
fn globals_are_roots() {
    let runtime = Runtime::new();
    let array = runtime.array(&[Value::small_int(1)]).unwrap();
    runtime.set_global(0, array);
    runtime.release_value(array); // only the global slot holds it now

    runtime.force_gc();
    assert_eq!(runtime.gc_stats().tracked, 1);

    runtime.set_global(0, Value::nil());
    runtime.force_gc();
    assert_eq!(runtime.gc_stats().tracked, 0);
}

#[test]
fn heap_constants_are_rooted_by_registration() {
    let runtime = Runtime::new();
    let constant = runtime.string("a constant that outgrows the inline form").unwrap();
    assert!(constant.is_gc_managed());
    let mut builder = Function::builder().max_stack(2);
    let k = builder.constant(constant) as i32;
    let id = runtime.register_function(
        builder
            .instruction(Instruction::abx(Opcode::LoadK, 0, k))
            .instruction(Instruction::abc(Opcode::Return, 0, 2, 0))
            .build(),
    );
    runtime.force_gc();
    // the constant is still usable after a collection
    let results = runtime.execute(id, vec![]).unwrap();
    assert!(lyra_vm::object::value_eq(results[0], constant));
    runtime.release_value(results[0]);
}

#[test]
fn deep_copy_is_bounded_and_cycle_safe() {
    let runtime = Runtime::new();
    let inner = runtime.array(&[Value::small_int(7)]).unwrap();
    let outer = runtime.array(&[inner, Value::small_int(1)]).unwrap();
    runtime.release_value(inner);

    let copy = runtime.deep_copy(outer).unwrap();
    assert_ne!(copy.object_addr(), outer.object_addr());
    unsafe {
        let copied_inner = *lyra_vm::object::array_elements(copy.object_ptr());
        assert_eq!(copied_inner.kind(), ValueKind::Array);
        assert_ne!(copied_inner.object_addr(), inner.object_addr());
    }

    // tie a knot and copy it: the cycle edge becomes nil instead of
    // recursing forever
    unsafe {
        let slots = lyra_vm::object::array_elements(outer.object_ptr());
        runtime.retain_value(outer);
        let old = *slots.add(1);
        slots.add(1).write(outer);
        runtime.release_value(old);
    }
    let knotted = runtime.deep_copy(outer).unwrap();
    unsafe {
        let slots = lyra_vm::object::array_elements(knotted.object_ptr());
        assert!((*slots.add(1)).is_nil());
    }

    runtime.release_value(copy);
    runtime.release_value(knotted);
    runtime.release_value(outer);
    runtime.force_gc();
    assert_eq!(runtime.gc_stats().live_objects, 0);
}

#[test]
fn frame_pool_invariant_after_execution() {
    let runtime = Runtime::new();
    let mut builder = Function::builder().max_stack(4);
    let k = builder.constant(Value::small_int(5)) as i32;
    let id = runtime.register_function(
        builder
            .instruction(Instruction::abx(Opcode::LoadK, 0, k))
            .instruction(Instruction::abc(Opcode::Return, 0, 2, 0))
            .build(),
    );
    runtime.execute(id, vec![]).unwrap();
    assert!(runtime.frame_pool().pooled() > 0);

    // a frame handed back out starts from the pool invariant
    let function = runtime.function(id).unwrap();
    let frame = runtime.frame_pool().acquire(function, None, 0, 0, 1);
    assert!(frame.registers.iter().all(Value::is_nil));
    assert_eq!(frame.pc, 0);
    assert!(frame.caller.is_none());
    runtime.frame_pool().release(frame);
}

#[test]
fn compaction_returns_empty_pages() {
    let runtime = Runtime::new();
    let gc = runtime.gc();
    let mut strings = Vec::new();
    for _ in 0..256 {
        strings.push(gc.alloc_string(&[b'x'; 200]).unwrap());
    }
    for value in strings.drain(..) {
        runtime.release_value(value);
    }
    assert!(runtime.compact() > 0);
}

#[test]
fn allocation_stats_track_tiers() {
    let runtime = Runtime::new();
    let small = runtime.string("fits one of the small classes").unwrap();
    let medium = runtime.gc().alloc_string(&[b'm'; 1000]).unwrap();
    let large = runtime.gc().alloc_string(&[b'l'; 10_000]).unwrap();
    let stats = runtime.allocation_stats();
    assert!(stats.small.allocations >= 1);
    assert!(stats.medium.allocations >= 1);
    assert!(stats.large.allocations >= 1);
    assert!(stats.total_bytes_in_use() > 11_000);
    for value in [small, medium, large] {
        runtime.release_value(value);
    }
    assert_eq!(runtime.allocation_stats().total_bytes_in_use(), 0);
}

#[test]
fn adaptive_thresholds_move_after_cycles() {
    let runtime = Runtime::new();
    let before = runtime.gc_stats();
    runtime.force_gc();
    runtime.force_gc();
    let after = runtime.gc_stats();
    assert_eq!(after.cycles, before.cycles + 2);
}
