// Struct and tagged-union layouts.
//
// Layouts are computed on demand from the type registry and cached by
// resolved type id. A struct layout maps field names to dense indices;
// a union layout maps case tags to their payload types.

use std::collections::HashMap;

use crate::error::{Panic, PanicKind, Result};
use crate::types::{TypeDef, TypeId, TypeRegistry};

#[derive(Debug, Clone)]
pub struct Layout {
    pub fields: Vec<(String, TypeId)>,
    index: HashMap<String, usize>,
}

impl Layout {
    pub fn size(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field_type(&self, index: usize) -> Option<TypeId> {
        self.fields.get(index).map(|(_, ty)| *ty)
    }
}

#[derive(Debug, Clone)]
pub struct UnionLayout {
    pub cases: Vec<(String, Vec<TypeId>)>,
    index: HashMap<String, usize>,
}

impl UnionLayout {
    pub fn case(&self, tag: &str) -> Option<&(String, Vec<TypeId>)> {
        self.index.get(tag).map(|i| &self.cases[*i])
    }
}

pub struct LayoutCache {
    structs: HashMap<TypeId, Layout>,
    unions: HashMap<TypeId, UnionLayout>,
}

impl LayoutCache {
    pub fn new() -> LayoutCache {
        LayoutCache {
            structs: HashMap::new(),
            unions: HashMap::new(),
        }
    }

    pub fn struct_layout(&mut self, reg: &TypeRegistry, ty: TypeId) -> Result<&Layout> {
        let key = reg.resolve(ty);
        if !self.structs.contains_key(&key) {
            let fields = match reg.def(key) {
                TypeDef::Struct { fields, .. } => fields.clone(),
                _ => {
                    return Err(Panic::new(
                        PanicKind::TypeMismatch,
                        format!("type {} is not a struct", reg.name(ty)),
                    ))
                }
            };
            let index = fields
                .iter()
                .enumerate()
                .map(|(i, (name, _))| (name.clone(), i))
                .collect();
            self.structs.insert(key, Layout { fields, index });
        }
        Ok(self.structs.get(&key).unwrap())
    }

    pub fn union_layout(&mut self, reg: &TypeRegistry, ty: TypeId) -> Result<&UnionLayout> {
        let key = reg.resolve(ty);
        if !self.unions.contains_key(&key) {
            let cases: Vec<(String, Vec<TypeId>)> = match reg.def(key) {
                TypeDef::Union { cases, .. } => cases
                    .iter()
                    .map(|c| (c.tag.clone(), c.payload.clone()))
                    .collect(),
                _ => {
                    return Err(Panic::new(
                        PanicKind::TypeMismatch,
                        format!("type {} is not a tagged union", reg.name(ty)),
                    ))
                }
            };
            let index = cases
                .iter()
                .enumerate()
                .map(|(i, (tag, _))| (tag.clone(), i))
                .collect();
            self.unions.insert(key, UnionLayout { cases, index });
        }
        Ok(self.unions.get(&key).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UnionCase;

    #[test]
    fn test_struct_layout() {
        let mut reg = TypeRegistry::new();
        let ty = reg.intern(TypeDef::Struct {
            name: String::from("Pair"),
            fields: vec![
                (String::from("first"), reg.builtins().int),
                (String::from("second"), reg.builtins().string),
            ],
        });
        let mut cache = LayoutCache::new();
        let layout = cache.struct_layout(&reg, ty).unwrap();
        assert_eq!(layout.size(), 2);
        assert_eq!(layout.field_index("second"), Some(1));
        assert_eq!(layout.field_type(0), Some(reg.builtins().int));
        assert_eq!(layout.field_index("third"), None);
    }

    #[test]
    fn test_union_layout() {
        let mut reg = TypeRegistry::new();
        let ty = reg.intern(TypeDef::Union {
            name: String::from("Option"),
            cases: vec![
                UnionCase {
                    tag: String::from("Some"),
                    payload: vec![reg.builtins().int],
                },
                UnionCase {
                    tag: String::from("Nothing"),
                    payload: vec![],
                },
            ],
        });
        let mut cache = LayoutCache::new();
        let layout = cache.union_layout(&reg, ty).unwrap();
        assert_eq!(layout.cases.len(), 2);
        assert!(layout.case("Some").is_some());
        assert!(layout.case("None").is_none());
    }

    #[test]
    fn test_layout_of_non_struct_fails() {
        let reg = TypeRegistry::new();
        let mut cache = LayoutCache::new();
        assert!(cache.struct_layout(&reg, reg.builtins().int).is_err());
    }
}
