// Call frames and local slots.
//
// A local slot tracks the ownership state the borrow checker proved:
// init, moved, dropped. The dispatcher maintains these flags; the slot
// itself is dumb storage.

use crate::error::{invalid_location, Result};
use crate::mir::{BlockId, FuncId, Function, LocalId, Place, Span};
use crate::types::TypeId;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct LocalSlot {
    pub value: Value,
    pub ty: TypeId,
    pub name: String,
    pub init: bool,
    pub moved: bool,
    pub dropped: bool,
}

impl LocalSlot {
    pub fn new(name: String, ty: TypeId) -> LocalSlot {
        LocalSlot {
            value: Value::Invalid,
            ty,
            name,
            init: false,
            moved: false,
            dropped: false,
        }
    }

    // A slot owns its heap referent only while it is live.
    pub fn is_live(&self) -> bool {
        self.init && !self.moved
    }
}

#[derive(Debug)]
pub struct Frame {
    pub func: FuncId,
    pub bb: BlockId,
    pub ip: usize,
    pub locals: Vec<LocalSlot>,
    // Where the caller wants the return value, if anywhere.
    pub ret_dst: Option<Place>,
    pub span: Span,
}

impl Frame {
    pub fn new(func: FuncId, def: &Function, ret_dst: Option<Place>, span: Span) -> Frame {
        let locals = def
            .locals
            .iter()
            .map(|decl| LocalSlot::new(decl.name.clone(), decl.ty))
            .collect();
        Frame {
            func,
            bb: 0,
            ip: 0,
            locals,
            ret_dst,
            span,
        }
    }

    pub fn local(&self, id: LocalId) -> Result<&LocalSlot> {
        self.locals
            .get(id)
            .ok_or_else(|| invalid_location("local id out of range"))
    }

    pub fn local_mut(&mut self, id: LocalId) -> Result<&mut LocalSlot> {
        self.locals
            .get_mut(id)
            .ok_or_else(|| invalid_location("local id out of range"))
    }
}
