//! Payload views over allocator-owned objects.
//!
//! The allocator and GC traffic in `*mut GcHeader`; everything above reads
//! and writes payloads through the helpers here. Payload shape depends on
//! the header's base type:
//!
//! - String:   `{ length: u32, pad: u32 }` followed by raw bytes
//! - Array:    `{ length: u32, capacity: u32 }` followed by `capacity` Values
//! - Callable: `{ function_id: u32, upvalue_count: u32 }` followed by
//!   `upvalue_count` upvalue cell pointers
//! - Upvalue:  `{ state: u32, register: u32, value: Value }`

use std::mem::size_of;

use crate::header::{BaseType, GcHeader, HEADER_SIZE};
use crate::value::{Value, ValueKind};

#[repr(C)]
pub struct StringPayload {
    pub length: u32,
    pub pad: u32,
}

#[repr(C)]
pub struct ArrayPayload {
    pub length: u32,
    pub capacity: u32,
}

#[repr(C)]
pub struct CallablePayload {
    pub function_id: u32,
    pub upvalue_count: u32,
}

pub const UPVALUE_OPEN: u32 = 0;
pub const UPVALUE_CLOSED: u32 = 1;

#[repr(C)]
pub struct UpvaluePayload {
    pub state: u32,
    /// Register index in the owning frame while open; unused once closed.
    pub register: u32,
    /// The owned value once closed.
    pub value: Value,
}

pub const fn string_allocation_size(len: usize) -> usize {
    HEADER_SIZE + size_of::<StringPayload>() + len
}

pub const fn array_allocation_size(capacity: usize) -> usize {
    HEADER_SIZE + size_of::<ArrayPayload>() + capacity * size_of::<Value>()
}

pub const fn callable_allocation_size(upvalues: usize) -> usize {
    HEADER_SIZE + size_of::<CallablePayload>() + upvalues * size_of::<*mut GcHeader>()
}

pub const fn upvalue_allocation_size() -> usize {
    HEADER_SIZE + size_of::<UpvaluePayload>()
}

/// # Safety
/// `h` must point at a live string object.
pub unsafe fn string_bytes<'a>(h: *const GcHeader) -> &'a [u8] {
    debug_assert!((*h).base_type() == BaseType::String);
    let payload = (*h).payload() as *const StringPayload;
    let data = payload.add(1) as *const u8;
    std::slice::from_raw_parts(data, (*payload).length as usize)
}

/// # Safety
/// `h` must point at a live, zero-initialized string object large enough
/// for `bytes`.
pub unsafe fn string_init(h: *mut GcHeader, bytes: &[u8]) {
    let payload = (*h).payload() as *mut StringPayload;
    (*payload).length = bytes.len() as u32;
    (*payload).pad = 0;
    let data = payload.add(1) as *mut u8;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), data, bytes.len());
}

/// # Safety
/// `h` must point at a live array object.
pub unsafe fn array_payload<'a>(h: *const GcHeader) -> &'a ArrayPayload {
    debug_assert!((*h).base_type() == BaseType::Array);
    &*((*h).payload() as *const ArrayPayload)
}

/// # Safety
/// `h` must point at a live array object.
pub unsafe fn array_payload_mut<'a>(h: *mut GcHeader) -> &'a mut ArrayPayload {
    debug_assert!((*h).base_type() == BaseType::Array);
    &mut *((*h).payload() as *mut ArrayPayload)
}

/// Pointer to the first element slot.
///
/// # Safety
/// `h` must point at a live array object.
pub unsafe fn array_elements(h: *mut GcHeader) -> *mut Value {
    ((*h).payload() as *mut ArrayPayload).add(1) as *mut Value
}

/// The live element slice (`0..length`).
///
/// # Safety
/// `h` must point at a live array object.
pub unsafe fn array_live<'a>(h: *mut GcHeader) -> &'a [Value] {
    let p = array_payload(h);
    std::slice::from_raw_parts(array_elements(h), p.length as usize)
}

/// # Safety
/// `h` must point at a live callable object.
pub unsafe fn callable_payload<'a>(h: *const GcHeader) -> &'a CallablePayload {
    debug_assert!((*h).base_type() == BaseType::Callable);
    &*((*h).payload() as *const CallablePayload)
}

/// The upvalue cell pointer slots of a callable.
///
/// # Safety
/// `h` must point at a live callable object.
pub unsafe fn callable_upvalues<'a>(h: *mut GcHeader) -> &'a mut [*mut GcHeader] {
    let p = (*h).payload() as *mut CallablePayload;
    let count = (*p).upvalue_count as usize;
    std::slice::from_raw_parts_mut(p.add(1) as *mut *mut GcHeader, count)
}

/// # Safety
/// `h` must point at a live upvalue cell.
pub unsafe fn upvalue_payload<'a>(h: *mut GcHeader) -> &'a mut UpvaluePayload {
    debug_assert!((*h).base_type() == BaseType::Upvalue);
    &mut *((*h).payload() as *mut UpvaluePayload)
}

// Growth policy for arrays: small arrays double, mid-size arrays grow by
// 1.5x, larger ones by 1.25x, and very large arrays by a fixed increment of
// at least an eighth (floor 1024 entries). The resulting byte total is then
// rounded up to a cache-line, 512-byte or page boundary by size.
pub fn grow_capacity(current: u32, needed: u32) -> u32 {
    let mut cap = current.max(1);
    while cap < needed {
        cap = if cap <= 16 {
            cap * 2
        } else if cap <= 512 {
            cap + cap / 2
        } else if cap <= 4096 {
            cap + cap / 4
        } else {
            cap + (cap / 8).max(1024)
        };
    }
    let bytes = array_allocation_size(cap as usize);
    let rounded = round_allocation_size(bytes);
    // convert the slack back into element capacity
    let extra = (rounded - bytes) / size_of::<Value>();
    cap + extra as u32
}

pub fn round_allocation_size(bytes: usize) -> usize {
    let boundary = if bytes <= 4096 {
        64
    } else if bytes <= 64 * 1024 {
        512
    } else {
        4096
    };
    (bytes + boundary - 1) & !(boundary - 1)
}

/// Content equality. Numbers compare numerically across small_int/double,
/// strings by bytes across inline/heap forms, arrays and callables by
/// identity.
pub fn value_eq(a: Value, b: Value) -> bool {
    use ValueKind::*;
    match (a.kind(), b.kind()) {
        (Nil, Nil) => true,
        (Bool, Bool) => a.as_bool() == b.as_bool(),
        (SmallInt, SmallInt) => a.as_small_int() == b.as_small_int(),
        (SmallInt, Double) | (Double, SmallInt) | (Double, Double) => {
            a.as_number() == b.as_number()
        }
        (String, String) => {
            let lhs = value_string_bytes(&a);
            let rhs = value_string_bytes(&b);
            lhs == rhs
        }
        (Function, Function) => a.as_function_id() == b.as_function_id(),
        (Array, Array) | (Callable, Callable) => a.object_addr() == b.object_addr(),
        _ => false,
    }
}

/// The bytes of a string value regardless of representation.
pub fn value_string_bytes(v: &Value) -> &[u8] {
    debug_assert!(v.kind() == ValueKind::String);
    if v.is_inline() {
        v.inline_str_bytes()
    } else {
        unsafe { string_bytes(v.object_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_tiers() {
        // doubling regime
        assert!(grow_capacity(3, 4) >= 6);
        assert!(grow_capacity(16, 17) >= 32);
        // 1.5x regime
        let g = grow_capacity(100, 101);
        assert!(g >= 150, "{g}");
        // 1.25x regime
        let g = grow_capacity(1000, 1001);
        assert!(g >= 1250, "{g}");
        // fixed increment regime
        let g = grow_capacity(10_000, 10_001);
        assert!(g >= 11_024, "{g}");
        // growth is strict
        for cap in [1u32, 3, 16, 100, 513, 5000] {
            assert!(grow_capacity(cap, cap + 1) > cap);
        }
    }

    #[test]
    fn rounding_boundaries() {
        assert_eq!(round_allocation_size(100), 128);
        assert_eq!(round_allocation_size(4096), 4096);
        assert_eq!(round_allocation_size(5000), 5120);
        assert_eq!(round_allocation_size(100_000), 102_400);
    }

    #[test]
    fn inline_string_equality() {
        let a = Value::small_string("abc").unwrap();
        let b = Value::small_string("abc").unwrap();
        let c = Value::small_string("abd").unwrap();
        assert!(value_eq(a, b));
        assert!(!value_eq(a, c));
    }

    #[test]
    fn numeric_equality_crosses_representations() {
        assert!(value_eq(Value::small_int(5), Value::double(5.0)));
        assert!(!value_eq(Value::small_int(5), Value::double(5.5)));
        assert!(!value_eq(Value::small_int(0), Value::nil()));
    }
}
