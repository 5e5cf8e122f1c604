// The immediate value domain.
//
// A `Value` is either a scalar carried inline, a handle into the heap,
// or a non-owning reference to a storage location. Every value carries
// the type id the frontend assigned to it; references carry none.
//
// Values of a heap kind contribute exactly one unit to their referent's
// refcount for as long as they logically exist. The plain Rust `Clone`
// on this type does NOT retain: sharing goes through
// `Heap::clone_for_share`, dropping through `Heap::drop_value`.

use enumflags2::BitFlags;

use crate::mir::{GlobalId, LocalId};
use crate::types::{TypeId, NO_TYPE};

// Handles are 1-based monotonic identifiers into the heap table.
// Handle 0 is the null handle and never names an object.
pub type Handle = u64;

// Discriminant of a Value, usable in sets for mismatch reporting.
#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u16)]
pub enum Kind {
    Invalid = 1 << 0,
    Nothing = 1 << 1,
    Bool = 1 << 2,
    Int = 1 << 3,
    BigInt = 1 << 4,
    BigUint = 1 << 5,
    BigFloat = 1 << 6,
    Str = 1 << 7,
    Array = 1 << 8,
    Struct = 1 << 9,
    Tag = 1 << 10,
    Range = 1 << 11,
    Ref = 1 << 12,
    RefMut = 1 << 13,
    Ptr = 1 << 14,
}

pub type KindSet = BitFlags<Kind>;

// A storage cell that can be named by a reference or pointer.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Location {
    // A local slot of a frame; `frame` is the absolute index into the
    // current frame stack.
    Local {
        frame: usize,
        id: LocalId,
        mutable: bool,
    },
    Global {
        id: GlobalId,
        mutable: bool,
    },
    // A field of a heap struct.
    Field {
        handle: Handle,
        index: usize,
        mutable: bool,
    },
    // An element of a heap array or array slice.
    ArrayElem {
        handle: Handle,
        index: usize,
        mutable: bool,
    },
    // A byte inside a heap string. Never mutable.
    StringBytes {
        handle: Handle,
        offset: usize,
    },
}

impl Location {
    pub fn is_mut(&self) -> bool {
        match self {
            Location::Local { mutable, .. } => *mutable,
            Location::Global { mutable, .. } => *mutable,
            Location::Field { mutable, .. } => *mutable,
            Location::ArrayElem { mutable, .. } => *mutable,
            Location::StringBytes { .. } => false,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Location::Field { handle, .. }
            | Location::ArrayElem { handle, .. }
            | Location::StringBytes { handle, .. } => Some(*handle),
            _ => None,
        }
    }

    // The same cell with its mutability capped, for deref through a
    // shared reference.
    pub fn with_mut(self, m: bool) -> Location {
        match self {
            Location::Local { frame, id, mutable } => Location::Local {
                frame,
                id,
                mutable: mutable && m,
            },
            Location::Global { id, mutable } => Location::Global {
                id,
                mutable: mutable && m,
            },
            Location::Field { handle, index, mutable } => Location::Field {
                handle,
                index,
                mutable: mutable && m,
            },
            Location::ArrayElem { handle, index, mutable } => Location::ArrayElem {
                handle,
                index,
                mutable: mutable && m,
            },
            Location::StringBytes { .. } => self,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Invalid,
    Nothing,
    Bool(bool, TypeId),
    Int(i64, TypeId),
    BigInt(Handle, TypeId),
    BigUint(Handle, TypeId),
    BigFloat(Handle, TypeId),
    Str(Handle, TypeId),
    Array(Handle, TypeId),
    Struct(Handle, TypeId),
    Tag(Handle, TypeId),
    Range(Handle, TypeId),
    Ref(Location),
    RefMut(Location),
    Ptr(Location),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Invalid => Kind::Invalid,
            Value::Nothing => Kind::Nothing,
            Value::Bool(..) => Kind::Bool,
            Value::Int(..) => Kind::Int,
            Value::BigInt(..) => Kind::BigInt,
            Value::BigUint(..) => Kind::BigUint,
            Value::BigFloat(..) => Kind::BigFloat,
            Value::Str(..) => Kind::Str,
            Value::Array(..) => Kind::Array,
            Value::Struct(..) => Kind::Struct,
            Value::Tag(..) => Kind::Tag,
            Value::Range(..) => Kind::Range,
            Value::Ref(_) => Kind::Ref,
            Value::RefMut(_) => Kind::RefMut,
            Value::Ptr(_) => Kind::Ptr,
        }
    }

    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Bool(_, ty)
            | Value::Int(_, ty)
            | Value::BigInt(_, ty)
            | Value::BigUint(_, ty)
            | Value::BigFloat(_, ty)
            | Value::Str(_, ty)
            | Value::Array(_, ty)
            | Value::Struct(_, ty)
            | Value::Tag(_, ty)
            | Value::Range(_, ty) => *ty,
            _ => NO_TYPE,
        }
    }

    // The heap handle this value owns, if it is of a heap kind.
    // References and pointers are non-owning and return None.
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::BigInt(h, _)
            | Value::BigUint(h, _)
            | Value::BigFloat(h, _)
            | Value::Str(h, _)
            | Value::Array(h, _)
            | Value::Struct(h, _)
            | Value::Tag(h, _)
            | Value::Range(h, _) => Some(*h),
            _ => None,
        }
    }

    pub fn is_heap(&self) -> bool {
        self.handle().is_some()
    }

    pub fn location(&self) -> Option<Location> {
        match self {
            Value::Ref(loc) | Value::RefMut(loc) | Value::Ptr(loc) => Some(*loc),
            _ => None,
        }
    }
}
