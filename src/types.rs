// Type table.
//
// The interpreter consumes types by id from a registry populated by the
// frontend. The registry answers classification, copyability, and the
// canonical builtin ids; it never changes during a run.

use serde::Deserialize;

pub type TypeId = u32;

// Id 0 is the absent type.
pub const NO_TYPE: TypeId = 0;

// Aliases resolve transitively up to this bound, which also breaks
// alias cycles the frontend failed to reject.
const ALIAS_BOUND: usize = 32;

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
    Any,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct UnionCase {
    pub tag: String,
    pub payload: Vec<TypeId>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub enum TypeDef {
    NoType,
    Bool,
    Int(Width),
    Uint(Width),
    Float(Width),
    Str,
    Array(TypeId),
    Struct {
        name: String,
        fields: Vec<(String, TypeId)>,
    },
    Union {
        name: String,
        cases: Vec<UnionCase>,
    },
    Pointer(TypeId),
    Alias(TypeId),
    Range,
    Task(TypeId),
    Scope,
    Channel(TypeId),
}

// Canonical ids for the types the runtime itself needs to mint values
// of (lengths, code points, literals, booleans).
#[derive(Deserialize, Debug, Copy, Clone)]
pub struct Builtins {
    pub int: TypeId,
    pub uint: TypeId,
    pub uint8: TypeId,
    pub uint32: TypeId,
    pub string: TypeId,
    pub boolean: TypeId,
}

#[derive(Deserialize, Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<TypeDef>,
    builtins: Builtins,
}

impl TypeRegistry {
    // A registry seeded with the builtin types. The frontend (or a
    // test) interns everything else on top.
    pub fn new() -> TypeRegistry {
        let mut reg = TypeRegistry {
            types: vec![TypeDef::NoType],
            builtins: Builtins {
                int: 0,
                uint: 0,
                uint8: 0,
                uint32: 0,
                string: 0,
                boolean: 0,
            },
        };
        reg.builtins.int = reg.intern(TypeDef::Int(Width::W64));
        reg.builtins.uint = reg.intern(TypeDef::Uint(Width::W64));
        reg.builtins.uint8 = reg.intern(TypeDef::Uint(Width::W8));
        reg.builtins.uint32 = reg.intern(TypeDef::Uint(Width::W32));
        reg.builtins.string = reg.intern(TypeDef::Str);
        reg.builtins.boolean = reg.intern(TypeDef::Bool);
        reg
    }

    pub fn intern(&mut self, def: TypeDef) -> TypeId {
        let id = self.types.len() as TypeId;
        self.types.push(def);
        id
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    // Chase aliases to the underlying type id.
    pub fn resolve(&self, id: TypeId) -> TypeId {
        let mut cur = id;
        for _ in 0..ALIAS_BOUND {
            match self.types.get(cur as usize) {
                Some(TypeDef::Alias(target)) => cur = *target,
                _ => return cur,
            }
        }
        cur
    }

    // The resolved definition for a type id. Unknown ids classify as
    // NoType rather than failing: the frontend owns id validity.
    pub fn def(&self, id: TypeId) -> &TypeDef {
        static NO: TypeDef = TypeDef::NoType;
        self.types
            .get(self.resolve(id) as usize)
            .unwrap_or(&NO)
    }

    pub fn is_copy(&self, id: TypeId) -> bool {
        match self.def(id) {
            TypeDef::Bool
            | TypeDef::Int(_)
            | TypeDef::Uint(_)
            | TypeDef::Float(_)
            | TypeDef::Pointer(_)
            | TypeDef::Range
            | TypeDef::NoType => true,
            TypeDef::Struct { fields, .. } => {
                fields.iter().all(|(_, ty)| self.is_copy(*ty))
            }
            _ => false,
        }
    }

    pub fn array_elem(&self, id: TypeId) -> Option<TypeId> {
        match self.def(id) {
            TypeDef::Array(elem) => Some(*elem),
            _ => None,
        }
    }

    pub fn task_result(&self, id: TypeId) -> Option<TypeId> {
        match self.def(id) {
            TypeDef::Task(result) => Some(*result),
            _ => None,
        }
    }

    pub fn chan_elem(&self, id: TypeId) -> Option<TypeId> {
        match self.def(id) {
            TypeDef::Channel(elem) => Some(*elem),
            _ => None,
        }
    }

    // Human-readable name for diagnostics.
    pub fn name(&self, id: TypeId) -> String {
        match self.def(id) {
            TypeDef::NoType => String::from("<none>"),
            TypeDef::Bool => String::from("bool"),
            TypeDef::Int(w) => format!("int{:?}", w),
            TypeDef::Uint(w) => format!("uint{:?}", w),
            TypeDef::Float(w) => format!("float{:?}", w),
            TypeDef::Str => String::from("string"),
            TypeDef::Array(elem) => format!("[{}]", self.name(*elem)),
            TypeDef::Struct { name, .. } => name.clone(),
            TypeDef::Union { name, .. } => name.clone(),
            TypeDef::Pointer(elem) => format!("*{}", self.name(*elem)),
            TypeDef::Alias(target) => self.name(*target),
            TypeDef::Range => String::from("range"),
            TypeDef::Task(result) => format!("task<{}>", self.name(*result)),
            TypeDef::Scope => String::from("scope"),
            TypeDef::Channel(elem) => format!("chan<{}>", self.name(*elem)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.def(reg.builtins().int), &TypeDef::Int(Width::W64));
        assert_eq!(reg.def(reg.builtins().uint8), &TypeDef::Uint(Width::W8));
        assert_eq!(reg.def(reg.builtins().string), &TypeDef::Str);
        assert!(reg.is_copy(reg.builtins().boolean));
        assert!(!reg.is_copy(reg.builtins().string));
    }

    #[test]
    fn test_alias_resolution() {
        let mut reg = TypeRegistry::new();
        let a = reg.intern(TypeDef::Alias(reg.builtins().int));
        let b = reg.intern(TypeDef::Alias(a));
        assert_eq!(reg.resolve(b), reg.builtins().int);
        assert_eq!(reg.def(b), &TypeDef::Int(Width::W64));
    }

    #[test]
    fn test_alias_cycle_bounded() {
        let mut reg = TypeRegistry::new();
        // A self-alias; resolution must terminate at the bound.
        let a = reg.intern(TypeDef::Alias(0));
        reg.types[a as usize] = TypeDef::Alias(a);
        assert_eq!(reg.resolve(a), a);
    }

    #[test]
    fn test_struct_copyability() {
        let mut reg = TypeRegistry::new();
        let ints = reg.intern(TypeDef::Struct {
            name: String::from("Pair"),
            fields: vec![
                (String::from("a"), reg.builtins().int),
                (String::from("b"), reg.builtins().int),
            ],
        });
        let holder = reg.intern(TypeDef::Struct {
            name: String::from("Holder"),
            fields: vec![(String::from("s"), reg.builtins().string)],
        });
        assert!(reg.is_copy(ints));
        assert!(!reg.is_copy(holder));
    }
}
