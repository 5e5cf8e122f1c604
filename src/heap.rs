// (C) 2020 Brandon Lewis
//
// The reference-counted heap.
//
// Objects live in a handle-indexed table. Handles are 1-based and
// monotonic: an id is never reissued, so a stale handle reliably fails
// lookup instead of aliasing a newer object. Freed slots are reclaimed
// by the table itself.
//
// Every `Value` of a heap kind holds exactly one reference to its
// object. Copying a value retains; dropping a value releases; releasing
// to zero frees the object and releases everything it contains. Release
// is iterative (a worklist, not recursion), which also makes re-entry
// into a handle being freed structurally impossible.
//
// Strings have three representations: flat bytes, a concat rope, and a
// slice over a base string. Ropes and slices retain their components;
// forcing a string flat gathers the bytes, releases the components, and
// memoizes the flat form in place.

use std::collections::HashMap;

use log::debug;
use num_bigint::{BigInt, BigUint};

use crate::error::{invalid_handle, out_of_bounds, Panic, PanicKind, Result};
use crate::types::TypeId;
use crate::value::{Handle, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum StrRepr {
    Flat(Vec<u8>),
    Concat {
        left: Handle,
        right: Handle,
        cp_len: usize,
        byte_len: usize,
    },
    Slice {
        base: Handle,
        cp_start: usize,
        cp_len: usize,
        byte_len: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RangeRepr {
    Bounds {
        start: Option<i64>,
        end: Option<i64>,
        inclusive: bool,
    },
    // A cursor over an array, used when a range is driven as an
    // iterator rather than reinterpreted as bounds.
    ArrayIter {
        base: Handle,
        cursor: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectKind {
    Str(StrRepr),
    Array(Vec<Value>),
    ArraySlice {
        base: Handle,
        start: usize,
        len: usize,
        cap: usize,
    },
    Map(Vec<(Value, Value)>),
    Struct(Vec<Value>),
    Tag {
        tag: String,
        fields: Vec<Value>,
    },
    Range(RangeRepr),
    BigInt(BigInt),
    BigUint(BigUint),
    BigFloat(f64),
}

#[derive(Debug)]
pub struct Object {
    pub kind: ObjectKind,
    pub ty: TypeId,
    pub refs: u32,
}

pub struct Heap {
    objects: HashMap<Handle, Object>,
    next: Handle,
    freed: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objects: HashMap::new(),
            next: 1,
            freed: 0,
        }
    }

    fn alloc(&mut self, kind: ObjectKind, ty: TypeId) -> Handle {
        let handle = self.next;
        self.next += 1;
        self.objects.insert(handle, Object { kind, ty, refs: 1 });
        handle
    }

    // ---- allocation ----

    pub fn alloc_string(&mut self, ty: TypeId, bytes: Vec<u8>) -> Handle {
        self.alloc(ObjectKind::Str(StrRepr::Flat(bytes)), ty)
    }

    // A rope node over two existing strings. Retains both children.
    pub fn alloc_string_concat(
        &mut self,
        ty: TypeId,
        left: Handle,
        right: Handle,
    ) -> Result<Handle> {
        let cp_len = self.str_cp_len(left)? + self.str_cp_len(right)?;
        let byte_len = self.str_byte_len(left)? + self.str_byte_len(right)?;
        self.retain(left)?;
        self.retain(right)?;
        Ok(self.alloc(
            ObjectKind::Str(StrRepr::Concat {
                left,
                right,
                cp_len,
                byte_len,
            }),
            ty,
        ))
    }

    // A code-point slice over an existing string. Retains the base.
    pub fn alloc_string_slice(
        &mut self,
        ty: TypeId,
        base: Handle,
        cp_start: usize,
        cp_len: usize,
        byte_len: usize,
    ) -> Result<Handle> {
        self.retain(base)?;
        Ok(self.alloc(
            ObjectKind::Str(StrRepr::Slice {
                base,
                cp_start,
                cp_len,
                byte_len,
            }),
            ty,
        ))
    }

    // The element values are moved into the array; their references
    // transfer with them.
    pub fn alloc_array(&mut self, ty: TypeId, elems: Vec<Value>) -> Handle {
        self.alloc(ObjectKind::Array(elems), ty)
    }

    pub fn alloc_array_slice(
        &mut self,
        ty: TypeId,
        base: Handle,
        start: usize,
        len: usize,
        cap: usize,
    ) -> Result<Handle> {
        self.retain(base)?;
        Ok(self.alloc(ObjectKind::ArraySlice { base, start, len, cap }, ty))
    }

    pub fn alloc_struct(&mut self, ty: TypeId, fields: Vec<Value>) -> Handle {
        self.alloc(ObjectKind::Struct(fields), ty)
    }

    pub fn alloc_tag(&mut self, ty: TypeId, tag: String, fields: Vec<Value>) -> Handle {
        self.alloc(ObjectKind::Tag { tag, fields }, ty)
    }

    pub fn alloc_map(&mut self, ty: TypeId, entries: Vec<(Value, Value)>) -> Handle {
        self.alloc(ObjectKind::Map(entries), ty)
    }

    pub fn alloc_range(&mut self, ty: TypeId, repr: RangeRepr) -> Result<Handle> {
        if let RangeRepr::ArrayIter { base, .. } = repr {
            self.retain(base)?;
        }
        Ok(self.alloc(ObjectKind::Range(repr), ty))
    }

    pub fn alloc_bigint(&mut self, ty: TypeId, v: BigInt) -> Handle {
        self.alloc(ObjectKind::BigInt(v), ty)
    }

    pub fn alloc_biguint(&mut self, ty: TypeId, v: BigUint) -> Handle {
        self.alloc(ObjectKind::BigUint(v), ty)
    }

    pub fn alloc_bigfloat(&mut self, ty: TypeId, v: f64) -> Handle {
        self.alloc(ObjectKind::BigFloat(v), ty)
    }

    // ---- refcounting ----

    pub fn retain(&mut self, handle: Handle) -> Result<()> {
        match self.objects.get_mut(&handle) {
            Some(obj) => {
                obj.refs += 1;
                Ok(())
            }
            None => Err(invalid_handle(handle)),
        }
    }

    // Decrement the refcount, freeing the object and releasing its
    // children when it hits zero. A release of an unknown handle is a
    // bug in the caller's accounting; it is logged rather than escalated
    // because release runs on cleanup paths that cannot fail.
    pub fn release(&mut self, handle: Handle) {
        let mut work = vec![handle];
        while let Some(h) = work.pop() {
            let free = match self.objects.get_mut(&h) {
                Some(obj) => {
                    debug_assert!(obj.refs > 0);
                    obj.refs -= 1;
                    obj.refs == 0
                }
                None => {
                    debug!("release of dead handle {}", h);
                    false
                }
            };
            if free {
                let obj = self.objects.remove(&h).unwrap();
                self.freed += 1;
                collect_children(&obj, &mut work);
            }
        }
    }

    // Retain-on-copy for heap kinds, identity for immediates. This is
    // the one sanctioned way to use a value a second time.
    pub fn clone_for_share(&mut self, v: &Value) -> Value {
        if let Some(h) = v.handle() {
            // The value already holds a reference, so the handle is
            // live and retain cannot fail.
            let _ = self.retain(h);
        }
        v.clone()
    }

    // The converse of clone_for_share.
    pub fn drop_value(&mut self, v: Value) {
        if let Some(h) = v.handle() {
            self.release(h);
        }
    }

    // ---- lookup ----

    pub fn lookup(&self, handle: Handle) -> Option<&Object> {
        self.objects.get(&handle)
    }

    pub fn get(&self, handle: Handle) -> Result<&Object> {
        self.objects.get(&handle).ok_or_else(|| invalid_handle(handle))
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Object> {
        self.objects
            .get_mut(&handle)
            .ok_or_else(|| invalid_handle(handle))
    }

    pub fn live_count(&self) -> usize {
        self.objects.len()
    }

    pub fn freed_count(&self) -> usize {
        self.freed
    }

    pub fn handles(&self) -> impl Iterator<Item = (&Handle, &Object)> {
        self.objects.iter()
    }

    // ---- strings ----

    pub fn str_byte_len(&self, handle: Handle) -> Result<usize> {
        match &self.get(handle)?.kind {
            ObjectKind::Str(StrRepr::Flat(bytes)) => Ok(bytes.len()),
            ObjectKind::Str(StrRepr::Concat { byte_len, .. }) => Ok(*byte_len),
            ObjectKind::Str(StrRepr::Slice { byte_len, .. }) => Ok(*byte_len),
            _ => Err(not_a(handle, "string")),
        }
    }

    pub fn str_cp_len(&self, handle: Handle) -> Result<usize> {
        match &self.get(handle)?.kind {
            ObjectKind::Str(StrRepr::Flat(bytes)) => Ok(cp_count(bytes)),
            ObjectKind::Str(StrRepr::Concat { cp_len, .. }) => Ok(*cp_len),
            ObjectKind::Str(StrRepr::Slice { cp_len, .. }) => Ok(*cp_len),
            _ => Err(not_a(handle, "string")),
        }
    }

    // Gather the logical byte content of a string, walking ropes and
    // slices without mutating them.
    pub fn str_bytes(&self, handle: Handle) -> Result<Vec<u8>> {
        match &self.get(handle)?.kind {
            ObjectKind::Str(StrRepr::Flat(bytes)) => Ok(bytes.clone()),
            ObjectKind::Str(StrRepr::Concat { left, right, .. }) => {
                let mut out = self.str_bytes(*left)?;
                out.extend(self.str_bytes(*right)?);
                Ok(out)
            }
            ObjectKind::Str(StrRepr::Slice {
                base,
                cp_start,
                cp_len,
                ..
            }) => {
                let bytes = self.str_bytes(*base)?;
                let lo = cp_to_byte(&bytes, *cp_start)
                    .ok_or_else(|| out_of_bounds(*cp_start, cp_count(&bytes)))?;
                let hi = cp_to_byte(&bytes, *cp_start + *cp_len)
                    .ok_or_else(|| out_of_bounds(*cp_start + *cp_len, cp_count(&bytes)))?;
                Ok(bytes[lo..hi].to_vec())
            }
            _ => Err(not_a(handle, "string")),
        }
    }

    // True once the flat byte form is directly available.
    pub fn str_is_flat(&self, handle: Handle) -> Result<bool> {
        match &self.get(handle)?.kind {
            ObjectKind::Str(StrRepr::Flat(_)) => Ok(true),
            ObjectKind::Str(_) => Ok(false),
            _ => Err(not_a(handle, "string")),
        }
    }

    // Convert a rope or slice into a flat string in place, releasing
    // the component strings. Idempotent.
    pub fn force_flatten(&mut self, handle: Handle) -> Result<()> {
        let repr = match &self.get(handle)?.kind {
            ObjectKind::Str(StrRepr::Flat(_)) => return Ok(()),
            ObjectKind::Str(repr) => repr.clone(),
            _ => return Err(not_a(handle, "string")),
        };
        let bytes = self.str_bytes(handle)?;
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Str(r) => *r = StrRepr::Flat(bytes),
            _ => unreachable!(),
        }
        match repr {
            StrRepr::Concat { left, right, .. } => {
                self.release(left);
                self.release(right);
            }
            StrRepr::Slice { base, .. } => self.release(base),
            StrRepr::Flat(_) => {}
        }
        Ok(())
    }

    // The code point at cp index `i`.
    pub fn str_cp_at(&self, handle: Handle, i: usize) -> Result<u32> {
        let bytes = self.str_bytes(handle)?;
        cp_at(&bytes, i).ok_or_else(|| out_of_bounds(i, cp_count(&bytes)))
    }

    // The byte at a raw byte offset, for pointer-based access.
    pub fn str_byte_at(&self, handle: Handle, offset: usize) -> Result<u8> {
        let bytes = self.str_bytes(handle)?;
        bytes
            .get(offset)
            .copied()
            .ok_or_else(|| out_of_bounds(offset, bytes.len()))
    }

    // Content equality; representation (rope, slice, flat) is not
    // observable.
    pub fn str_eq(&self, a: Handle, b: Handle) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        if self.str_byte_len(a)? != self.str_byte_len(b)? {
            return Ok(false);
        }
        Ok(self.str_bytes(a)? == self.str_bytes(b)?)
    }

    // ---- arrays ----

    pub fn array_len(&self, handle: Handle) -> Result<usize> {
        match &self.get(handle)?.kind {
            ObjectKind::Array(elems) => Ok(elems.len()),
            ObjectKind::ArraySlice { len, .. } => Ok(*len),
            _ => Err(not_a(handle, "array")),
        }
    }

    // Resolve an index through a possible slice to (base handle, base
    // index), bounds-checked against the logical length.
    pub fn array_resolve(&self, handle: Handle, index: usize) -> Result<(Handle, usize)> {
        match &self.get(handle)?.kind {
            ObjectKind::Array(elems) => {
                if index < elems.len() {
                    Ok((handle, index))
                } else {
                    Err(out_of_bounds(index, elems.len()))
                }
            }
            ObjectKind::ArraySlice { base, start, len, .. } => {
                if index < *len {
                    self.array_resolve(*base, start + index)
                } else {
                    Err(out_of_bounds(index, *len))
                }
            }
            _ => Err(not_a(handle, "array")),
        }
    }

    pub fn array_get(&self, handle: Handle, index: usize) -> Result<&Value> {
        let (base, idx) = self.array_resolve(handle, index)?;
        match &self.get(base)?.kind {
            ObjectKind::Array(elems) => Ok(&elems[idx]),
            _ => Err(not_a(base, "array")),
        }
    }

    // Replace an element, returning the previous value to the caller
    // (who owns it and must drop it).
    pub fn array_set(&mut self, handle: Handle, index: usize, v: Value) -> Result<Value> {
        let (base, idx) = self.array_resolve(handle, index)?;
        match &mut self.get_mut(base)?.kind {
            ObjectKind::Array(elems) => Ok(std::mem::replace(&mut elems[idx], v)),
            _ => Err(not_a(base, "array")),
        }
    }

    // ---- structs and tags ----

    pub fn struct_get(&self, handle: Handle, index: usize) -> Result<&Value> {
        match &self.get(handle)?.kind {
            ObjectKind::Struct(fields) => fields
                .get(index)
                .ok_or_else(|| out_of_bounds(index, fields.len())),
            _ => Err(not_a(handle, "struct")),
        }
    }

    pub fn struct_set(&mut self, handle: Handle, index: usize, v: Value) -> Result<Value> {
        match &mut self.get_mut(handle)?.kind {
            ObjectKind::Struct(fields) => {
                if index < fields.len() {
                    Ok(std::mem::replace(&mut fields[index], v))
                } else {
                    Err(out_of_bounds(index, fields.len()))
                }
            }
            _ => Err(not_a(handle, "struct")),
        }
    }

    pub fn tag_name(&self, handle: Handle) -> Result<&str> {
        match &self.get(handle)?.kind {
            ObjectKind::Tag { tag, .. } => Ok(tag),
            _ => Err(not_a(handle, "tagged union")),
        }
    }

    pub fn tag_field(&self, handle: Handle, index: usize) -> Result<&Value> {
        match &self.get(handle)?.kind {
            ObjectKind::Tag { fields, .. } => fields
                .get(index)
                .ok_or_else(|| out_of_bounds(index, fields.len())),
            _ => Err(not_a(handle, "tagged union")),
        }
    }

    // ---- bignums ----

    pub fn bigint(&self, handle: Handle) -> Result<&BigInt> {
        match &self.get(handle)?.kind {
            ObjectKind::BigInt(v) => Ok(v),
            _ => Err(not_a(handle, "bigint")),
        }
    }

    pub fn biguint(&self, handle: Handle) -> Result<&BigUint> {
        match &self.get(handle)?.kind {
            ObjectKind::BigUint(v) => Ok(v),
            _ => Err(not_a(handle, "biguint")),
        }
    }

    pub fn bigfloat(&self, handle: Handle) -> Result<f64> {
        match &self.get(handle)?.kind {
            ObjectKind::BigFloat(v) => Ok(*v),
            _ => Err(not_a(handle, "bigfloat")),
        }
    }
}

fn not_a(handle: Handle, what: &str) -> Panic {
    Panic::new(
        PanicKind::TypeMismatch,
        format!("handle {} is not a {}", handle, what),
    )
}

// Handles held inside a freed object, queued for release.
fn collect_children(obj: &Object, out: &mut Vec<Handle>) {
    match &obj.kind {
        ObjectKind::Str(StrRepr::Flat(_)) => {}
        ObjectKind::Str(StrRepr::Concat { left, right, .. }) => {
            out.push(*left);
            out.push(*right);
        }
        ObjectKind::Str(StrRepr::Slice { base, .. }) => out.push(*base),
        ObjectKind::Array(elems) => {
            for v in elems {
                if let Some(h) = v.handle() {
                    out.push(h);
                }
            }
        }
        ObjectKind::ArraySlice { base, .. } => out.push(*base),
        ObjectKind::Map(entries) => {
            for (k, v) in entries {
                if let Some(h) = k.handle() {
                    out.push(h);
                }
                if let Some(h) = v.handle() {
                    out.push(h);
                }
            }
        }
        ObjectKind::Struct(fields) | ObjectKind::Tag { fields, .. } => {
            for v in fields {
                if let Some(h) = v.handle() {
                    out.push(h);
                }
            }
        }
        ObjectKind::Range(RangeRepr::ArrayIter { base, .. }) => out.push(*base),
        ObjectKind::Range(RangeRepr::Bounds { .. }) => {}
        ObjectKind::BigInt(_) | ObjectKind::BigUint(_) | ObjectKind::BigFloat(_) => {}
    }
}

// ---- code point helpers over UTF-8 bytes ----

pub fn cp_count(bytes: &[u8]) -> usize {
    bytes.iter().filter(|b| (**b & 0xC0) != 0x80).count()
}

// Byte offset of code point index `i`; `i == count` maps to the end.
pub fn cp_to_byte(bytes: &[u8], i: usize) -> Option<usize> {
    let mut seen = 0;
    for (off, b) in bytes.iter().enumerate() {
        if (*b & 0xC0) != 0x80 {
            if seen == i {
                return Some(off);
            }
            seen += 1;
        }
    }
    if seen == i {
        Some(bytes.len())
    } else {
        None
    }
}

pub fn cp_at(bytes: &[u8], i: usize) -> Option<u32> {
    let s = std::str::from_utf8(bytes).ok()?;
    s.chars().nth(i).map(|c| c as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn heap() -> (Heap, TypeRegistry) {
        (Heap::new(), TypeRegistry::new())
    }

    #[test]
    fn test_refcount_basics() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let h = heap.alloc_string(st, b"abc".to_vec());
        assert_eq!(heap.get(h).unwrap().refs, 1);
        heap.retain(h).unwrap();
        assert_eq!(heap.get(h).unwrap().refs, 2);
        heap.release(h);
        assert!(heap.lookup(h).is_some());
        heap.release(h);
        assert!(heap.lookup(h).is_none());
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.freed_count(), 1);
    }

    #[test]
    fn test_handles_are_monotonic() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let a = heap.alloc_string(st, b"a".to_vec());
        heap.release(a);
        let b = heap.alloc_string(st, b"b".to_vec());
        assert!(b > a);
        assert!(heap.lookup(a).is_none());
        heap.release(b);
    }

    #[test]
    fn test_rope_lengths() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let l = heap.alloc_string(st, "hé".as_bytes().to_vec());
        let r = heap.alloc_string(st, b"llo".to_vec());
        let rope = heap.alloc_string_concat(st, l, r).unwrap();
        assert_eq!(heap.str_cp_len(rope).unwrap(), 5);
        assert_eq!(heap.str_byte_len(rope).unwrap(), 6);
        assert_eq!(heap.str_bytes(rope).unwrap(), "héllo".as_bytes());
        // The rope holds one reference to each child.
        assert_eq!(heap.get(l).unwrap().refs, 2);
        heap.release(l);
        heap.release(r);
        heap.release(rope);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_flatten_releases_children_and_is_idempotent() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let l = heap.alloc_string(st, b"abc".to_vec());
        let r = heap.alloc_string(st, b"def".to_vec());
        let rope = heap.alloc_string_concat(st, l, r).unwrap();
        heap.release(l);
        heap.release(r);

        assert!(!heap.str_is_flat(rope).unwrap());
        heap.force_flatten(rope).unwrap();
        assert!(heap.str_is_flat(rope).unwrap());
        assert_eq!(heap.str_bytes(rope).unwrap(), b"abcdef");
        // Children were only kept alive by the rope.
        assert_eq!(heap.live_count(), 1);

        // Second flatten is a no-op.
        heap.force_flatten(rope).unwrap();
        assert_eq!(heap.str_bytes(rope).unwrap(), b"abcdef");
        assert_eq!(heap.str_cp_len(rope).unwrap(), 6);
        heap.release(rope);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_string_slice_fidelity() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let base = heap.alloc_string(st, "héllo".as_bytes().to_vec());
        // s[1..4] over code points.
        let bytes = heap.str_bytes(base).unwrap();
        let lo = cp_to_byte(&bytes, 1).unwrap();
        let hi = cp_to_byte(&bytes, 4).unwrap();
        let slice = heap
            .alloc_string_slice(st, base, 1, 3, hi - lo)
            .unwrap();
        assert_eq!(heap.str_cp_len(slice).unwrap(), 3);
        assert_eq!(heap.str_bytes(slice).unwrap(), "éll".as_bytes());
        assert!(heap.str_eq(slice, slice).unwrap());
        heap.release(base);
        heap.release(slice);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_str_eq_by_content() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let a = heap.alloc_string(st, b"abcdef".to_vec());
        let l = heap.alloc_string(st, b"abc".to_vec());
        let r = heap.alloc_string(st, b"def".to_vec());
        let rope = heap.alloc_string_concat(st, l, r).unwrap();
        assert!(heap.str_eq(a, rope).unwrap());
        for h in [a, l, r, rope].iter() {
            heap.release(*h);
        }
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_array_slice_resolution() {
        let (mut heap, mut reg) = heap();
        let int = reg.builtins().int;
        let arr_ty = reg.intern(crate::types::TypeDef::Array(int));
        let elems = (0..5).map(|i| Value::Int(i, int)).collect();
        let arr = heap.alloc_array(arr_ty, elems);
        let slice = heap.alloc_array_slice(arr_ty, arr, 1, 3, 4).unwrap();
        assert_eq!(heap.array_len(slice).unwrap(), 3);
        assert_eq!(heap.array_get(slice, 0).unwrap(), &Value::Int(1, int));
        assert_eq!(heap.array_get(slice, 2).unwrap(), &Value::Int(3, int));
        assert!(heap.array_get(slice, 3).is_err());
        heap.release(arr);
        // The slice keeps the base alive.
        assert!(heap.lookup(arr).is_some());
        heap.release(slice);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_release_cascades_through_containers() {
        let (mut heap, mut reg) = heap();
        let st = reg.builtins().string;
        let arr_ty = reg.intern(crate::types::TypeDef::Array(st));
        let s1 = heap.alloc_string(st, b"one".to_vec());
        let s2 = heap.alloc_string(st, b"two".to_vec());
        let arr = heap.alloc_array(arr_ty, vec![Value::Str(s1, st), Value::Str(s2, st)]);
        // The array now owns the strings' only references.
        heap.release(arr);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.freed_count(), 3);
    }

    #[test]
    fn test_map_release() {
        let (mut heap, reg) = heap();
        let st = reg.builtins().string;
        let int = reg.builtins().int;
        let k = heap.alloc_string(st, b"key".to_vec());
        let m = heap.alloc_map(0, vec![(Value::Str(k, st), Value::Int(7, int))]);
        heap.release(m);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_range_iterator_retains_base() {
        let (mut heap, mut reg) = heap();
        let int = reg.builtins().int;
        let arr_ty = reg.intern(crate::types::TypeDef::Array(int));
        let arr = heap.alloc_array(arr_ty, vec![Value::Int(1, int)]);
        let it = heap
            .alloc_range(0, RangeRepr::ArrayIter { base: arr, cursor: 0 })
            .unwrap();
        heap.release(arr);
        assert!(heap.lookup(arr).is_some());
        heap.release(it);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cp_helpers() {
        let bytes = "héllo".as_bytes();
        assert_eq!(cp_count(bytes), 5);
        assert_eq!(cp_at(bytes, 0), Some('h' as u32));
        assert_eq!(cp_at(bytes, 1), Some(0xE9));
        assert_eq!(cp_at(bytes, 4), Some('o' as u32));
        assert_eq!(cp_at(bytes, 5), None);
        assert_eq!(cp_to_byte(bytes, 0), Some(0));
        assert_eq!(cp_to_byte(bytes, 2), Some(3));
        assert_eq!(cp_to_byte(bytes, 5), Some(6));
        assert_eq!(cp_to_byte(bytes, 6), None);
    }

    #[test]
    fn test_invalid_handle_lookups() {
        let (mut heap, _) = heap();
        assert!(heap.get(42).is_err());
        assert!(heap.retain(42).is_err());
        assert!(heap.lookup(0).is_none());
    }
}
