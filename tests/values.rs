//! Value representation round trips through the runtime constructors.

use lyra_vm::object::{array_payload, value_eq, value_string_bytes};
use lyra_vm::{Runtime, Value, ValueKind};

#[test]
fn every_kind_has_a_constructor() {
    let runtime = Runtime::new();
    assert_eq!(Value::nil().kind(), ValueKind::Nil);
    assert_eq!(Value::small_int(-7).kind(), ValueKind::SmallInt);
    assert_eq!(Value::double(2.5).kind(), ValueKind::Double);
    assert_eq!(Value::bool(true).kind(), ValueKind::Bool);
    assert_eq!(Value::function(3).kind(), ValueKind::Function);
    assert_eq!(runtime.string("hi").unwrap().kind(), ValueKind::String);
    let array = runtime.array(&[Value::nil()]).unwrap();
    assert_eq!(array.kind(), ValueKind::Array);
    let callable = runtime.callable(3, &[Value::small_int(1)]).unwrap();
    assert_eq!(callable.kind(), ValueKind::Callable);
    runtime.release_value(array);
    runtime.release_value(callable);
}

#[test]
fn short_strings_never_allocate() {
    let runtime = Runtime::new();
    let before = runtime.allocation_stats().total_allocations();
    let v = runtime.string("seven77").unwrap();
    assert!(v.is_inline());
    assert_eq!(runtime.allocation_stats().total_allocations(), before);
    // one byte longer and the heap gets involved
    let w = runtime.string("eight888").unwrap();
    assert!(w.is_gc_managed());
    assert_eq!(runtime.allocation_stats().total_allocations(), before + 1);
    runtime.release_value(w);
}

#[test]
fn string_content_equality_crosses_forms() {
    let runtime = Runtime::new();
    // same text, one inline and one forced onto the heap
    let inline = runtime.string("abc").unwrap();
    let heap = runtime.gc().alloc_string(b"abc").unwrap();
    assert!(value_eq(inline, heap));
    assert_eq!(value_string_bytes(&inline), b"abc");
    assert_eq!(value_string_bytes(&heap), b"abc");
    runtime.release_value(heap);
}

#[test]
fn array_round_trip() {
    let runtime = Runtime::new();
    let items = [
        Value::small_int(1),
        Value::double(2.5),
        Value::bool(false),
        Value::nil(),
    ];
    let array = runtime.array(&items).unwrap();
    let payload = unsafe { array_payload(array.object_ptr()) };
    assert_eq!(payload.length, items.len() as u32);
    assert!(payload.length <= payload.capacity);
    let live = unsafe { lyra_vm::object::array_live(array.object_ptr()) };
    for (slot, item) in live.iter().zip(items.iter()) {
        assert!(value_eq(*slot, *item));
    }
    runtime.release_value(array);
}

#[test]
fn refcounts_track_value_copies() {
    let runtime = Runtime::new();
    let gc = runtime.gc();
    let array = runtime.array(&[Value::small_int(1)]).unwrap();
    let header = array.object_ptr();
    unsafe { assert_eq!((*header).ref_count(), 1) };

    let mut slots = [Value::nil(); 4];
    for slot in slots.iter_mut() {
        gc.write_value(slot, array);
    }
    unsafe { assert_eq!((*header).ref_count(), 5) };
    for slot in slots.iter_mut() {
        gc.write_value(slot, Value::nil());
    }
    unsafe { assert_eq!((*header).ref_count(), 1) };
    runtime.release_value(array);
}

#[test]
fn values_are_sixteen_bytes() {
    assert_eq!(std::mem::size_of::<Value>(), 16);
    assert_eq!(std::mem::size_of::<Option<Value>>(), 24);
    assert_eq!(std::mem::size_of::<lyra_vm::header::GcHeader>(), 16);
}

#[test]
fn callable_owns_its_upvalues() {
    let runtime = Runtime::new();
    let captured = runtime.string("captured by the closure").unwrap();
    let callable = runtime.callable(1, &[captured]).unwrap();
    // the cell took a reference on top of ours
    unsafe { assert_eq!((*captured.object_ptr()).ref_count(), 2) };
    runtime.release_value(captured);
    unsafe { assert_eq!((*captured.object_ptr()).ref_count(), 1) };

    // killing the callable cascades through cell and string
    runtime.release_value(callable);
    runtime.force_gc();
    assert_eq!(runtime.gc_stats().live_objects, 0);
}
