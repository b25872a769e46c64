use super::heap::{GarbageCollector, GcKey, Heap, StringKey};
use super::instruction::ArithOp;

/// Interned event names, fixed so they're never collected
pub(crate) struct MetatableKeys {
    pub(crate) index: StringKey,
    pub(crate) newindex: StringKey,
    pub(crate) call: StringKey,
    pub(crate) arith: [StringKey; 12],
    pub(crate) unm: StringKey,
    pub(crate) bnot: StringKey,
    pub(crate) concat: StringKey,
    pub(crate) len: StringKey,
    pub(crate) eq: StringKey,
    pub(crate) lt: StringKey,
    pub(crate) le: StringKey,
    pub(crate) gc: StringKey,
    pub(crate) mode: StringKey,
}

impl MetatableKeys {
    pub(crate) fn new(gc: &mut GarbageCollector, heap: &mut Heap) -> Self {
        let mut intern = |name: &str| {
            let key = heap.intern_bytes(gc, name.as_bytes());
            gc.fix(GcKey::String(key));
            key
        };

        Self {
            index: intern("__index"),
            newindex: intern("__newindex"),
            call: intern("__call"),
            arith: [
                intern("__add"),
                intern("__sub"),
                intern("__mul"),
                intern("__mod"),
                intern("__pow"),
                intern("__div"),
                intern("__idiv"),
                intern("__band"),
                intern("__bor"),
                intern("__bxor"),
                intern("__shl"),
                intern("__shr"),
            ],
            unm: intern("__unm"),
            bnot: intern("__bnot"),
            concat: intern("__concat"),
            len: intern("__len"),
            eq: intern("__eq"),
            lt: intern("__lt"),
            le: intern("__le"),
            gc: intern("__gc"),
            mode: intern("__mode"),
        }
    }

    #[inline]
    pub(crate) fn arith(&self, op: ArithOp) -> StringKey {
        self.arith[op as usize]
    }
}
