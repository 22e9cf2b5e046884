//! Arena heap with typed indices.
//!
//! Objects live in one slab per kind. Handles are plain `u32` indices
//! wrapped in a phantom-typed `GcIdx<T>` so a table index cannot be used
//! where a closure index is expected. Freed slots go on a per-slab free
//! list and are reused by the next allocation.

use crate::cancel::CancelToken;
use crate::string::StringInterner;
use crate::table::Table;
use crate::value::Value;
use std::marker::PhantomData;

/// A typed index into one of the heap's arenas.
#[derive(Debug)]
pub struct GcIdx<T>(pub u32, pub PhantomData<T>);

impl<T> GcIdx<T> {
    pub fn new(index: u32) -> Self {
        GcIdx(index, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// A Lua closure: prototype plus captured upvalue cells.
#[derive(Debug)]
pub struct LuaClosure {
    /// Index of the prototype in the VM's proto store.
    pub proto_idx: usize,
    pub upvalues: Vec<GcIdx<UpVal>>,
}

/// Error raised by a native function.
#[derive(Debug)]
pub enum NativeError {
    Message(String),
    /// An arbitrary Lua value, as thrown by `error(v)`.
    Value(Value),
}

impl From<String> for NativeError {
    fn from(msg: String) -> Self {
        NativeError::Message(msg)
    }
}

impl From<&str> for NativeError {
    fn from(msg: &str) -> Self {
        NativeError::Message(msg.to_string())
    }
}

/// Context passed to native functions. The VM itself is not exposed;
/// natives that need to call back into Lua (pcall, resume) are handled
/// directly by the dispatch loop instead.
pub struct NativeContext<'a> {
    pub args: &'a [Value],
    pub heap: &'a mut Heap,
    pub strings: &'a mut StringInterner,
    pub cancel: &'a CancelToken,
}

/// A host function callable from Lua.
pub struct NativeFunction {
    pub func: fn(&mut NativeContext) -> Result<Vec<Value>, NativeError>,
    pub name: &'static str,
}

impl std::fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// An upvalue cell.
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value currently lives.
#[derive(Debug)]
pub enum UpValLocation {
    /// A slot on the running thread's stack.
    Open(usize),
    /// A slot on a suspended coroutine's saved stack.
    OpenInThread { thread: u32, slot: usize },
    /// Captured; the enclosing scope has exited.
    Closed(Value),
}

/// Opaque host data with an optional metatable.
pub struct UserData {
    pub data: Box<dyn std::any::Any>,
    pub metatable: Option<GcIdx<Table>>,
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserData")
    }
}

macro_rules! arena_accessors {
    ($slab:ident, $free:ident, $alloc:ident, $get:ident, $get_mut:ident, $ty:ty, $what:literal) => {
        pub fn $alloc(&mut self, obj: $ty) -> GcIdx<$ty> {
            if let Some(idx) = self.$free.pop() {
                self.$slab[idx as usize] = Some(obj);
                GcIdx(idx, PhantomData)
            } else {
                let idx = self.$slab.len() as u32;
                self.$slab.push(Some(obj));
                GcIdx(idx, PhantomData)
            }
        }

        pub fn $get(&self, idx: GcIdx<$ty>) -> &$ty {
            self.$slab[idx.0 as usize]
                .as_ref()
                .expect(concat!($what, " was freed"))
        }

        pub fn $get_mut(&mut self, idx: GcIdx<$ty>) -> &mut $ty {
            self.$slab[idx.0 as usize]
                .as_mut()
                .expect(concat!($what, " was freed"))
        }
    };
}

/// The object heap. Strings live in the interner, not here.
#[derive(Default)]
pub struct Heap {
    pub tables: Vec<Option<Table>>,
    table_free: Vec<u32>,
    pub closures: Vec<Option<LuaClosure>>,
    closure_free: Vec<u32>,
    pub natives: Vec<Option<NativeFunction>>,
    native_free: Vec<u32>,
    pub upvals: Vec<Option<UpVal>>,
    upval_free: Vec<u32>,
    pub userdata: Vec<Option<UserData>>,
    userdata_free: Vec<u32>,
}

impl Heap {
    pub fn new() -> Self {
        Heap::default()
    }

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        self.alloc_table_obj(Table::new(array_hint, hash_hint))
    }

    pub fn alloc_closure(
        &mut self,
        proto_idx: usize,
        upvalues: Vec<GcIdx<UpVal>>,
    ) -> GcIdx<LuaClosure> {
        self.alloc_closure_obj(LuaClosure { proto_idx, upvalues })
    }

    pub fn alloc_native(
        &mut self,
        func: fn(&mut NativeContext) -> Result<Vec<Value>, NativeError>,
        name: &'static str,
    ) -> GcIdx<NativeFunction> {
        self.alloc_native_obj(NativeFunction { func, name })
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.alloc_upval_obj(UpVal { location })
    }

    arena_accessors!(tables, table_free, alloc_table_obj, get_table, get_table_mut, Table, "table");
    arena_accessors!(
        closures,
        closure_free,
        alloc_closure_obj,
        get_closure,
        get_closure_mut,
        LuaClosure,
        "closure"
    );
    arena_accessors!(
        natives,
        native_free,
        alloc_native_obj,
        get_native,
        get_native_mut,
        NativeFunction,
        "native fn"
    );
    arena_accessors!(upvals, upval_free, alloc_upval_obj, get_upval, get_upval_mut, UpVal, "upval");
    arena_accessors!(
        userdata,
        userdata_free,
        alloc_userdata,
        get_userdata,
        get_userdata_mut,
        UserData,
        "userdata"
    );
}
