use super::{GcKey, Heap, HeapKey, HeapValue, StringKey};
use crate::interpreter::execution::CallFunction;
use crate::interpreter::table::Table;
use crate::interpreter::thread::{RunningThread, Thread};
use crate::interpreter::up_value::UpValue;
use crate::interpreter::value_stack::StackValue;
use slotmap::SecondaryMap;
use std::collections::VecDeque;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Objects visited per sweep step
const SWEEP_MAX: usize = 100;
/// Work credited for each object visited by a sweep
const SWEEP_COST: usize = std::mem::size_of::<HeapValue>();

/// Tuning for the collector, percentages are relative to 100
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GarbageCollectorConfig {
    /// A new cycle starts once memory in use reaches `estimate * pause / 100`
    ///
    /// Default is 200
    pub pause: usize,
    /// Work performed per step relative to the allocation that triggered it
    ///
    /// Default is 100
    pub step_multiplier: usize,
    /// Bytes allocated between incremental steps
    ///
    /// Default is 2^13
    pub step_size: usize,
    /// Generational mode: a minor collection runs after memory grows by this percentage
    ///
    /// Default is 20
    pub minor_multiplier: usize,
    /// Generational mode: a major collection runs after memory grows by this percentage since the last one
    ///
    /// Default is 100
    pub major_multiplier: usize,
}

impl Default for GarbageCollectorConfig {
    fn default() -> Self {
        Self {
            pause: 200,
            step_multiplier: 100,
            step_size: 2usize.pow(13),
            minor_multiplier: 20,
            major_multiplier: 100,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GcMode {
    #[default]
    Incremental,
    Generational,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    #[default]
    Pause,
    Propagate,
    EnterAtomic,
    SweepRegular,
    SweepFinalizable,
    SweepToBeFinalized,
    SweepEnd,
    CallFinalizers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White0,
    White1,
    Gray,
    Black,
}

impl Color {
    #[inline]
    fn is_white(self) -> bool {
        matches!(self, Color::White0 | Color::White1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Age {
    New,
    Survival,
    /// marked old by a forward barrier during this cycle
    Old0,
    /// survived as old for one cycle
    Old1,
    Old,
    /// old object modified in this cycle
    Touched1,
    /// old object modified in the previous cycle
    Touched2,
}

impl Age {
    #[inline]
    fn is_old(self) -> bool {
        !matches!(self, Age::New | Age::Survival)
    }
}

#[derive(Debug, Clone, Copy)]
struct GcHeader {
    color: Color,
    age: Age,
    /// never collected
    fixed: bool,
    /// registered for finalization, swept with the finalizer lists
    separated: bool,
    /// bytes accounted for this object
    size: usize,
}

/// Roots owned outside of the heap
pub(crate) struct GcRoots<'a> {
    pub(crate) threads: &'a mut [RunningThread],
    pub(crate) registry: HeapKey,
    pub(crate) globals: HeapKey,
    /// `__mode`, used to detect weak tables
    pub(crate) mode_key: StringKey,
}

#[derive(Default)]
pub(crate) struct GarbageCollector {
    pub(crate) config: GarbageCollectorConfig,
    mode: GcMode,
    phase: GcPhase,
    current_white: Color,
    objects: SecondaryMap<HeapKey, GcHeader>,
    strings: SecondaryMap<StringKey, GcHeader>,
    used_memory: usize,
    /// bytes allocated past the point where the collector should run, negative while idle
    debt: isize,
    /// live memory after the last atomic phase
    estimate: usize,
    /// optional hard cap, checked by the vm
    pub(crate) memory_limit: Option<usize>,
    stopped: bool,
    running_finalizers: bool,
    emergency: bool,
    gray: Vec<HeapKey>,
    /// objects to traverse again in the atomic phase
    gray_again: Vec<HeapKey>,
    /// tables with weak values
    weak: Vec<HeapKey>,
    /// tables with weak keys and strong values
    ephemeron: Vec<HeapKey>,
    /// tables with weak keys and values, or ephemerons that still have entries to clear
    all_weak: Vec<HeapKey>,
    /// objects with a `__gc` metamethod, in registration order
    finalizable: Vec<HeapKey>,
    to_be_finalized: VecDeque<HeapKey>,
    sweep_queue: Vec<GcKey>,
    /// generational mode: objects younger than old
    young: Vec<GcKey>,
    /// generational mode: objects that became old in the last minor collection
    old1: Vec<GcKey>,
}

impl Default for Color {
    fn default() -> Self {
        Color::White0
    }
}

impl GarbageCollector {
    #[inline]
    pub(crate) fn used_memory(&self) -> usize {
        self.used_memory
    }

    #[inline]
    pub(crate) fn debt(&self) -> isize {
        self.debt
    }

    #[inline]
    pub(crate) fn set_debt(&mut self, debt: isize) {
        self.debt = debt;
    }

    #[inline]
    pub(crate) fn mode(&self) -> GcMode {
        self.mode
    }

    #[inline]
    pub(crate) fn phase(&self) -> GcPhase {
        self.phase
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        !self.stopped
    }

    pub(crate) fn stop(&mut self) {
        self.stopped = true;
    }

    pub(crate) fn restart(&mut self) {
        self.stopped = false;
        self.debt = 0;
    }

    #[inline]
    pub(crate) fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub(crate) fn set_emergency(&mut self, emergency: bool) {
        self.emergency = emergency;
    }

    pub(crate) fn set_running_finalizers(&mut self, running: bool) {
        self.running_finalizers = running;
    }

    #[inline]
    pub(crate) fn is_running_finalizers(&self) -> bool {
        self.running_finalizers
    }

    pub(crate) fn modify_used_memory(&mut self, change: isize) {
        self.used_memory = (self.used_memory as isize + change).max(0) as usize;
        self.debt += change;
    }

    #[inline]
    pub(crate) fn should_step(&self) -> bool {
        !self.stopped && !self.running_finalizers && self.debt > 0
    }

    #[inline]
    pub(crate) fn exceeds_memory_limit(&self) -> bool {
        self.memory_limit
            .is_some_and(|limit| self.used_memory > limit)
    }

    #[inline]
    fn other_white(&self) -> Color {
        match self.current_white {
            Color::White0 => Color::White1,
            _ => Color::White0,
        }
    }

    /// Only meaningful while sweeping
    #[inline]
    fn is_dead(&self, header: &GcHeader) -> bool {
        !header.fixed && header.color == self.other_white()
    }

    /// The tri-color invariant must hold while marking, sweeping may break it
    #[inline]
    fn keeps_invariant(&self) -> bool {
        matches!(self.phase, GcPhase::Propagate | GcPhase::EnterAtomic)
    }

    #[inline]
    fn header(&self, key: GcKey) -> Option<&GcHeader> {
        match key {
            GcKey::String(key) => self.strings.get(key),
            GcKey::Object(key) => self.objects.get(key),
        }
    }

    #[inline]
    fn header_mut(&mut self, key: GcKey) -> Option<&mut GcHeader> {
        match key {
            GcKey::String(key) => self.strings.get_mut(key),
            GcKey::Object(key) => self.objects.get_mut(key),
        }
    }

    #[inline]
    fn is_white(&self, key: GcKey) -> bool {
        self.header(key).is_some_and(|header| header.color.is_white())
    }

    #[inline]
    fn is_black(&self, key: GcKey) -> bool {
        self.header(key)
            .is_some_and(|header| header.color == Color::Black)
    }

    /// Tracks a new object with the current white
    pub(crate) fn register(&mut self, key: GcKey, size: usize) {
        let header = GcHeader {
            color: self.current_white,
            age: Age::New,
            fixed: false,
            separated: false,
            size,
        };

        match key {
            GcKey::String(key) => {
                self.strings.insert(key, header);
            }
            GcKey::Object(key) => {
                self.objects.insert(key, header);
            }
        }

        if self.mode == GcMode::Generational {
            self.young.push(key);
        }

        self.modify_used_memory(size as isize);
    }

    /// Updates the accounted size of an object that grew or shrank
    pub(crate) fn resize(&mut self, key: GcKey, size: usize) {
        let Some(header) = self.header_mut(key) else {
            return;
        };

        let change = size as isize - header.size as isize;
        header.size = size;

        if change != 0 {
            self.modify_used_memory(change);
        }
    }

    /// Excludes an object from collection
    pub(crate) fn fix(&mut self, key: GcKey) {
        if let Some(header) = self.header_mut(key) {
            header.fixed = true;
            header.color = Color::Gray;
            header.age = Age::Old;
        }
    }

    /// Objects found dead but not yet swept can be reached again through interning
    pub(crate) fn resurrect(&mut self, key: GcKey) {
        let other_white = self.other_white();
        let current_white = self.current_white;

        if let Some(header) = self.header_mut(key) {
            if header.color == other_white {
                header.color = current_white;
            }
        }
    }

    /// Registers an object for finalization once its metatable gains a `__gc` field
    pub(crate) fn check_finalizer(&mut self, key: HeapKey) {
        let Some(header) = self.objects.get_mut(key) else {
            return;
        };

        if header.separated || header.fixed {
            return;
        }

        header.separated = true;
        self.finalizable.push(key);

        // the object leaves the regular sweep, keep it alive for this cycle
        if matches!(
            self.phase,
            GcPhase::SweepRegular | GcPhase::SweepFinalizable | GcPhase::SweepToBeFinalized
        ) && header.color.is_white()
        {
            header.color = self.current_white;
        }
    }

    #[inline]
    pub(crate) fn has_pending_finalizers(&self) -> bool {
        !self.to_be_finalized.is_empty()
    }

    /// The next object whose finalizer should run, the object returns to the regular lists
    pub(crate) fn take_finalizable(&mut self) -> Option<HeapKey> {
        let key = self.to_be_finalized.pop_front()?;

        let sweeping = !self.keeps_invariant();
        let current_white = self.current_white;

        if let Some(header) = self.objects.get_mut(key) {
            header.separated = false;

            if sweeping && self.mode == GcMode::Incremental {
                header.color = current_white;
            }
        }

        Some(key)
    }

    /// Moves every finalizable object to the pending list, used before the vm is dropped
    pub(crate) fn separate_all_finalizable(&mut self) {
        while let Some(key) = self.finalizable.pop() {
            if self.objects.contains_key(key) {
                self.to_be_finalized.push_back(key);
            }
        }
    }

    /// A black table is being modified, it's gray again until the atomic phase
    pub(crate) fn barrier_back(&mut self, key: HeapKey) {
        let Some(header) = self.objects.get_mut(key) else {
            return;
        };

        if header.color != Color::Black {
            return;
        }

        header.color = Color::Gray;

        if header.age == Age::Touched2 {
            // still in the gray again list
            return;
        }

        if header.age.is_old() {
            header.age = Age::Touched1;
        }

        self.gray_again.push(key);
    }

    /// A black object is being made to point at `child`
    pub(crate) fn barrier_forward(&mut self, parent: HeapKey, child: StackValue) {
        let Some(child_key) = child.gc_key() else {
            return;
        };

        if !self.is_black(GcKey::Object(parent)) || !self.is_white(child_key) {
            return;
        }

        if self.keeps_invariant() {
            self.mark(child_key);

            let parent_is_old = self
                .objects
                .get(parent)
                .is_some_and(|header| header.age.is_old());

            if parent_is_old {
                if let Some(header) = self.header_mut(child_key) {
                    header.age = Age::Old0;
                }
            }
        } else if self.mode == GcMode::Incremental {
            // sweeping, avoid future barriers on the parent
            let current_white = self.current_white;

            if let Some(header) = self.objects.get_mut(parent) {
                header.color = current_white;
            }
        }
    }

    fn mark(&mut self, key: GcKey) {
        match key {
            GcKey::String(key) => {
                // strings have no children
                if let Some(header) = self.strings.get_mut(key) {
                    if header.color.is_white() {
                        header.color = Color::Black;
                    }
                }
            }
            GcKey::Object(key) => {
                let Some(header) = self.objects.get_mut(key) else {
                    return;
                };

                if !header.color.is_white() {
                    return;
                }

                header.color = Color::Gray;
                self.gray.push(key);
            }
        }
    }

    #[inline]
    fn mark_value(&mut self, value: StackValue) {
        if let Some(key) = value.gc_key() {
            self.mark(key);
        }
    }

    #[inline]
    fn mark_object(&mut self, key: HeapKey) {
        self.mark(GcKey::Object(key));
    }

    fn clear_gray_lists(&mut self) {
        self.gray.clear();
        self.gray_again.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.all_weak.clear();
    }

    fn mark_roots(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        self.mark_object(roots.registry);
        self.mark_object(roots.globals);

        for key in heap.type_metatables.iter().flatten() {
            self.mark(GcKey::Object(*key));
        }

        heap.ref_roots.retain(|&key, counter| {
            let keep = counter.count() > 0;

            if keep {
                self.mark(key);
            }

            keep
        });

        for i in 0..self.to_be_finalized.len() {
            let key = self.to_be_finalized[i];
            self.mark_object(key);
        }

        let atomic = self.phase == GcPhase::EnterAtomic;

        for running in roots.threads.iter_mut() {
            if let Some(header) = self.objects.get_mut(running.key) {
                header.color = Color::Black;
            }

            self.mark_thread(&mut running.thread, atomic);
        }
    }

    fn mark_thread(&mut self, thread: &mut Thread, atomic: bool) -> usize {
        if atomic {
            // slots past the live frames are garbage
            let extent = thread.live_extent();
            let len = thread.value_stack.len();
            thread.value_stack.clear_range(extent..len);
            thread.value_stack.truncate(extent);
        }

        for value in thread.value_stack.iter() {
            if let Some(key) = value.gc_key() {
                self.mark(key);
            }
        }

        for &(_, key) in &thread.open_up_values {
            self.mark_object(key);
        }

        for call in &thread.call_stack {
            match &call.function {
                CallFunction::Interpreted { up_values, .. } => {
                    for key in up_values.iter() {
                        self.mark_object(*key);
                    }
                }
                CallFunction::Native(key) => self.mark_object(*key),
                CallFunction::Host => {}
            }
        }

        thread.value_stack.len() * std::mem::size_of::<StackValue>()
    }

    /// Starts a cycle, every object is expected to be white
    fn restart_collection(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        self.clear_gray_lists();
        self.mark_roots(heap, roots);
        self.phase = GcPhase::Propagate;

        tracing::debug!(used = self.used_memory, "gc cycle started");
    }

    fn propagate_all(&mut self, heap: &mut Heap, mode_key: StringKey) -> usize {
        let mut work = 0;

        while let Some(key) = self.gray.pop() {
            work += self.propagate_mark(heap, key, mode_key);
        }

        work
    }

    /// Blackens a gray object and marks its children
    fn propagate_mark(&mut self, heap: &mut Heap, key: HeapKey, mode_key: StringKey) -> usize {
        let Some(header) = self.objects.get_mut(key) else {
            return 0;
        };

        header.color = Color::Black;

        if let Some(HeapValue::Thread(Some(thread))) = heap.storage.get_mut(key) {
            let atomic = self.phase == GcPhase::EnterAtomic;
            self.mark_thread(thread, atomic);

            let keep_gray = self.phase == GcPhase::Propagate
                || self
                    .objects
                    .get(key)
                    .is_some_and(|header| header.age.is_old());

            if keep_gray {
                // stacks aren't guarded by barriers
                self.link_gray(key, ListKind::GrayAgain);
            }

            let size = heap.storage.get(key).map(|value| value.gc_size()).unwrap_or_default();
            self.resize(GcKey::Object(key), size);
            return size;
        }

        let view = heap_view(&heap.storage, &heap.strings);

        let Some(value) = view.storage.get(key) else {
            return 0;
        };

        match value {
            HeapValue::Table(table) => self.traverse_table(view, key, table, mode_key),
            HeapValue::Closure(closure) => {
                self.mark_object(closure.prototype_key);

                for up_value in closure.up_values.iter() {
                    self.mark_object(*up_value);
                }
            }
            HeapValue::NativeFunction(native) => {
                for value in native.up_values.iter() {
                    self.mark_value(*value);
                }
            }
            HeapValue::UpValue(up_value) => {
                // open up values are kept alive through their thread
                if let UpValue::Closed(value) = up_value {
                    self.mark_value(*value);
                }
            }
            HeapValue::Prototype(prototype) => {
                for value in prototype.constants.iter() {
                    self.mark_value(*value);
                }

                for key in prototype.protos.iter() {
                    self.mark_object(*key);
                }
            }
            HeapValue::UserData(userdata) => {
                if let Some(metatable) = userdata.metatable {
                    self.mark_object(metatable);
                }

                self.mark_value(userdata.user_value);
                self.generational_link(key);
            }
            HeapValue::Thread(_) => {
                // running, marked as a root
                return 0;
            }
        }

        let size = value.gc_size();
        self.resize(GcKey::Object(key), size);

        size
    }

    fn generational_link(&mut self, key: HeapKey) {
        if self.mode != GcMode::Generational {
            return;
        }

        let Some(header) = self.objects.get_mut(key) else {
            return;
        };

        match header.age {
            Age::Touched1 => self.gray_again.push(key),
            Age::Touched2 => header.age = Age::Old,
            _ => {}
        }
    }

    fn traverse_table(&mut self, heap: HeapView, key: HeapKey, table: &Table, mode_key: StringKey) {
        let metatable = table.metatable();

        if let Some(metatable) = metatable {
            self.mark_object(metatable);
        }

        let (weak_keys, weak_values) = weak_mode(heap, metatable, mode_key);

        match (weak_keys, weak_values) {
            (false, false) => {
                for (entry_key, value) in table.iter() {
                    self.mark_value(entry_key);
                    self.mark_value(value);
                }

                self.generational_link(key);
            }
            (false, true) => self.traverse_weak_value(key, table),
            (true, false) => {
                self.traverse_ephemeron(key, table);
            }
            (true, true) => {
                self.link_gray(key, ListKind::AllWeak);
            }
        }
    }

    fn traverse_weak_value(&mut self, key: HeapKey, table: &Table) {
        let mut has_clears = false;

        for (entry_key, value) in table.iter() {
            self.mark_value(entry_key);

            if !has_clears && self.is_cleared(value) {
                has_clears = true;
            }
        }

        if self.phase == GcPhase::EnterAtomic && has_clears {
            self.link_gray(key, ListKind::Weak);
        } else {
            self.link_gray(key, ListKind::GrayAgain);
        }
    }

    /// Marks values of entries with marked keys, returns true if anything was marked
    fn traverse_ephemeron(&mut self, key: HeapKey, table: &Table) -> bool {
        let mut marked = false;
        let mut has_clears = false;
        let mut has_white_white = false;

        for (entry_key, value) in table.iter() {
            let value_is_white = value.gc_key().is_some_and(|key| self.is_white(key));

            if self.is_cleared(entry_key) {
                has_clears = true;

                if value_is_white {
                    has_white_white = true;
                }
            } else if value_is_white {
                marked = true;
                self.mark_value(value);
            }
        }

        if self.phase == GcPhase::Propagate {
            self.link_gray(key, ListKind::GrayAgain);
        } else if has_white_white {
            self.link_gray(key, ListKind::Ephemeron);
        } else if has_clears {
            self.link_gray(key, ListKind::AllWeak);
        } else {
            self.generational_link(key);
        }

        marked
    }

    fn link_gray(&mut self, key: HeapKey, list: ListKind) {
        if let Some(header) = self.objects.get_mut(key) {
            header.color = Color::Gray;
        }

        match list {
            ListKind::GrayAgain => self.gray_again.push(key),
            ListKind::Weak => self.weak.push(key),
            ListKind::Ephemeron => self.ephemeron.push(key),
            ListKind::AllWeak => self.all_weak.push(key),
        }
    }

    /// Whether a weak reference to this value should be removed. Strings are values, never weak.
    fn is_cleared(&mut self, value: StackValue) -> bool {
        match value.gc_key() {
            None => false,
            Some(key @ GcKey::String(_)) => {
                self.mark(key);
                false
            }
            Some(key) => self.is_white(key),
        }
    }

    /// Open up values of threads that weren't marked still need their values marked
    fn remark_up_values(&mut self, heap: &Heap) {
        let threads: Vec<HeapKey> = heap
            .threads
            .iter()
            .copied()
            .filter(|&key| self.is_white(GcKey::Object(key)))
            .collect();

        for thread_key in threads {
            let Some(HeapValue::Thread(Some(thread))) = heap.storage.get(thread_key) else {
                continue;
            };

            for &(index, up_value_key) in &thread.open_up_values {
                if !self.is_white(GcKey::Object(up_value_key)) {
                    self.mark_value(thread.value_stack.get(index));
                }
            }
        }
    }

    fn converge_ephemerons(&mut self, heap: &mut Heap, mode_key: StringKey) {
        loop {
            let mut changed = false;
            let list = std::mem::take(&mut self.ephemeron);

            for key in list {
                if let Some(header) = self.objects.get_mut(key) {
                    header.color = Color::Black;
                }

                let marked = match heap.storage.get(key) {
                    Some(HeapValue::Table(table)) => self.traverse_ephemeron(key, table),
                    _ => continue,
                };

                if marked {
                    self.propagate_all(heap, mode_key);
                    changed = true;
                }
            }

            if !changed {
                break;
            }
        }
    }

    fn clear_by_values(&mut self, heap: &mut Heap, list: &[HeapKey]) {
        for &key in list {
            if let Some(HeapValue::Table(table)) = heap.storage.get_mut(key) {
                table.clear_entries(|_, value| self.is_cleared(value));
            }
        }
    }

    fn clear_by_keys(&mut self, heap: &mut Heap, list: &[HeapKey]) {
        for &key in list {
            if let Some(HeapValue::Table(table)) = heap.storage.get_mut(key) {
                table.clear_entries(|entry_key, _| self.is_cleared(entry_key));
            }
        }
    }

    /// Moves unreachable finalizable objects to the pending list, newest first
    fn separate_to_be_finalized(&mut self) {
        let mut kept = Vec::with_capacity(self.finalizable.len());

        for key in std::mem::take(&mut self.finalizable).into_iter().rev() {
            let Some(header) = self.objects.get(key) else {
                continue;
            };

            if header.color.is_white() {
                self.to_be_finalized.push_back(key);
            } else {
                kept.push(key);
            }
        }

        kept.reverse();
        self.finalizable = kept;
    }

    fn atomic(&mut self, heap: &mut Heap, roots: &mut GcRoots) -> usize {
        let mode_key = roots.mode_key;
        self.phase = GcPhase::EnterAtomic;

        let gray_again = std::mem::take(&mut self.gray_again);

        let mut work = 0;
        self.mark_roots(heap, roots);
        work += self.propagate_all(heap, mode_key);

        self.remark_up_values(heap);
        work += self.propagate_all(heap, mode_key);

        for key in gray_again {
            if self
                .objects
                .get(key)
                .is_some_and(|header| !header.color.is_white())
            {
                self.gray.push(key);
            }
        }

        work += self.propagate_all(heap, mode_key);
        self.converge_ephemerons(heap, mode_key);

        // resurrected objects must not be removed from weak values yet
        let weak = std::mem::take(&mut self.weak);
        let all_weak = std::mem::take(&mut self.all_weak);
        self.clear_by_values(heap, &weak);
        self.clear_by_values(heap, &all_weak);
        self.weak = weak;
        self.all_weak = all_weak;

        let original_weak = self.weak.len();
        let original_all_weak = self.all_weak.len();

        self.separate_to_be_finalized();

        for i in 0..self.to_be_finalized.len() {
            let key = self.to_be_finalized[i];
            self.mark_object(key);
        }

        work += self.propagate_all(heap, mode_key);
        self.converge_ephemerons(heap, mode_key);

        let ephemeron = std::mem::take(&mut self.ephemeron);
        let all_weak = std::mem::take(&mut self.all_weak);
        self.clear_by_keys(heap, &ephemeron);
        self.clear_by_keys(heap, &all_weak);

        let weak = std::mem::take(&mut self.weak);
        self.clear_by_values(heap, &weak[original_weak..]);
        self.clear_by_values(heap, &all_weak[original_all_weak..]);
        self.ephemeron = ephemeron;
        self.all_weak = all_weak;
        self.weak = weak;

        // the closure cache doesn't keep closures alive
        for cached in heap.closure_cache.values_mut() {
            if cached
                .closure
                .is_some_and(|key| self.is_white(GcKey::Object(key)))
            {
                cached.closure = None;
            }
        }

        self.current_white = self.other_white();
        self.estimate = self.used_memory;

        work
    }

    fn enter_sweep(&mut self, heap: &Heap) {
        self.sweep_queue.clear();
        self.sweep_queue.extend(
            heap.strings
                .keys()
                .map(GcKey::String)
                .chain(
                    heap.storage
                        .keys()
                        .filter(|&key| !self.objects.get(key).is_some_and(|h| h.separated))
                        .map(GcKey::Object),
                ),
        );
        self.phase = GcPhase::SweepRegular;
    }

    fn free_object(&mut self, heap: &mut Heap, key: GcKey) {
        let size = match key {
            GcKey::String(key) => {
                heap.strings.remove(key);
                self.strings.remove(key).map(|header| header.size)
            }
            GcKey::Object(key) => {
                match heap.storage.remove(key) {
                    Some(HeapValue::Table(table)) => heap.recycle_table(table),
                    Some(HeapValue::Thread(thread)) => {
                        heap.threads.remove(&key);

                        if let Some(thread) = thread {
                            // up values outliving the thread keep the last values
                            for &(index, up_value_key) in &thread.open_up_values {
                                if let Some(HeapValue::UpValue(up_value)) =
                                    heap.storage.get_mut(up_value_key)
                                {
                                    *up_value = UpValue::Closed(thread.value_stack.get(index));
                                }
                            }
                        }
                    }
                    Some(HeapValue::Prototype(_)) => {
                        heap.closure_cache.remove(&key);
                    }
                    _ => {}
                }

                self.objects.remove(key).map(|header| header.size)
            }
        };

        if let Some(size) = size {
            self.used_memory = self.used_memory.saturating_sub(size);
        }
    }

    /// Frees dead objects and whitens survivors, returns the number of objects visited
    fn sweep_batch(&mut self, heap: &mut Heap) -> usize {
        let start = self.sweep_queue.len().saturating_sub(SWEEP_MAX);
        let batch: Vec<GcKey> = self.sweep_queue.drain(start..).collect();
        let count = batch.len();

        for key in batch {
            self.sweep_object(heap, key);
        }

        count
    }

    fn sweep_object(&mut self, heap: &mut Heap, key: GcKey) {
        let Some(header) = self.header(key) else {
            return;
        };

        if header.fixed {
            return;
        }

        if self.is_dead(header) {
            self.free_object(heap, key);
        } else {
            let current_white = self.current_white;

            if let Some(header) = self.header_mut(key) {
                header.color = current_white;
            }
        }
    }

    /// Performs a bounded amount of incremental work, returns the work done
    pub(crate) fn single_step(&mut self, heap: &mut Heap, roots: &mut GcRoots) -> usize {
        match self.phase {
            GcPhase::Pause => {
                self.restart_collection(heap, roots);
                1
            }
            GcPhase::Propagate => match self.gray.pop() {
                Some(key) => self.propagate_mark(heap, key, roots.mode_key),
                None => {
                    self.phase = GcPhase::EnterAtomic;
                    0
                }
            },
            GcPhase::EnterAtomic => {
                let work = self.atomic(heap, roots);
                self.enter_sweep(heap);
                work
            }
            GcPhase::SweepRegular => {
                let count = self.sweep_batch(heap);

                if self.sweep_queue.is_empty() {
                    self.sweep_queue.extend(self.finalizable.iter().map(|&key| GcKey::Object(key)));
                    self.phase = GcPhase::SweepFinalizable;
                }

                count * SWEEP_COST
            }
            GcPhase::SweepFinalizable => {
                let count = self.sweep_batch(heap);

                if self.sweep_queue.is_empty() {
                    self.sweep_queue
                        .extend(self.to_be_finalized.iter().map(|&key| GcKey::Object(key)));
                    self.phase = GcPhase::SweepToBeFinalized;
                }

                count * SWEEP_COST
            }
            GcPhase::SweepToBeFinalized => {
                let count = self.sweep_batch(heap);

                if self.sweep_queue.is_empty() {
                    self.phase = GcPhase::SweepEnd;
                }

                count * SWEEP_COST
            }
            GcPhase::SweepEnd => {
                heap.strings.shrink_if_sparse();
                self.phase = GcPhase::CallFinalizers;
                0
            }
            GcPhase::CallFinalizers => {
                // the vm runs pending finalizers before stepping here
                if self.to_be_finalized.is_empty() || self.emergency {
                    self.phase = GcPhase::Pause;

                    tracing::debug!(
                        used = self.used_memory,
                        estimate = self.estimate,
                        "gc cycle finished"
                    );
                }

                0
            }
        }
    }

    /// Steps until the collector reaches `phase`, finalizers are left pending
    pub(crate) fn run_until(&mut self, phase: GcPhase, heap: &mut Heap, roots: &mut GcRoots) {
        while self.phase != phase {
            if self.phase == GcPhase::CallFinalizers {
                // pending finalizers wait for the vm
                self.phase = GcPhase::Pause;
                continue;
            }

            self.single_step(heap, roots);
        }
    }

    /// Drops the marks of a cycle in progress so a full collection can start from scratch
    pub(crate) fn abandon_marking(&mut self) {
        if !self.keeps_invariant() {
            return;
        }

        self.whiten_all();
        self.clear_gray_lists();
        self.sweep_queue.clear();
        self.phase = GcPhase::Pause;
    }

    fn whiten_all(&mut self) {
        let current_white = self.current_white;

        for header in self.objects.values_mut() {
            if !header.fixed {
                header.color = current_white;
            }
        }

        for header in self.strings.values_mut() {
            if !header.fixed {
                header.color = current_white;
            }
        }
    }

    /// Uses current memory as the live estimate, delaying the next cycle
    pub(crate) fn settle(&mut self) {
        self.estimate = self.used_memory;
        self.set_pause();
    }

    /// Sets the debt so the next cycle starts after memory grows by `pause` percent
    pub(crate) fn set_pause(&mut self) {
        let threshold = (self.estimate / 100).saturating_mul(self.config.pause);
        let debt = self.used_memory as isize - threshold as isize;
        self.debt = debt.min(0);
    }

    fn set_minor_debt(&mut self) {
        let debt = (self.used_memory / 100) * self.config.minor_multiplier;
        self.debt = -(debt as isize);
    }

    // generational mode

    /// Re-traverses objects that became old in the last minor collection
    fn mark_old(&mut self) {
        for key in std::mem::take(&mut self.old1) {
            let Some(header) = self.header_mut(key) else {
                continue;
            };

            if header.age != Age::Old1 {
                continue;
            }

            header.age = Age::Old;

            if header.color == Color::Black {
                if let GcKey::Object(key) = key {
                    header.color = Color::Gray;
                    self.gray.push(key);
                }
            }
        }
    }

    fn sweep_young(&mut self, heap: &mut Heap) {
        let current_white = self.current_white;
        let mut young = Vec::with_capacity(self.young.len());
        let mut old1 = Vec::new();

        for key in std::mem::take(&mut self.young) {
            let Some(header) = self.header(key) else {
                continue;
            };

            if header.fixed {
                continue;
            }

            if self.is_dead(header) {
                self.free_object(heap, key);
                continue;
            }

            let Some(header) = self.header_mut(key) else {
                continue;
            };

            match header.age {
                Age::New => {
                    header.age = Age::Survival;
                    header.color = current_white;
                    young.push(key);
                }
                Age::Survival | Age::Old0 => {
                    header.age = Age::Old1;
                    old1.push(key);
                }
                _ => {}
            }
        }

        self.young = young;
        self.old1 = old1;
    }

    /// Keeps touched objects and threads around for the next minor collection
    fn correct_gray_lists(&mut self, heap: &Heap) {
        let mut lists = std::mem::take(&mut self.gray_again);
        lists.append(&mut self.weak);
        lists.append(&mut self.all_weak);
        lists.append(&mut self.ephemeron);

        for key in lists {
            let Some(header) = self.objects.get(key).copied() else {
                continue;
            };

            if header.color.is_white() {
                continue;
            }

            if header.age == Age::Touched1 {
                if let Some(header) = self.objects.get_mut(key) {
                    header.color = Color::Black;
                    header.age = Age::Touched2;
                }

                self.gray_again.push(key);
            } else if heap.threads.contains(&key) {
                self.gray_again.push(key);
            } else if let Some(header) = self.objects.get_mut(key) {
                if header.age == Age::Touched2 {
                    header.age = Age::Old;
                }

                header.color = Color::Black;
            }
        }

        self.gray_again.sort_unstable();
        self.gray_again.dedup();
    }

    fn young_collection(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        self.mark_old();
        self.atomic(heap, roots);
        self.phase = GcPhase::SweepRegular;
        self.sweep_young(heap);
        self.correct_gray_lists(heap);
        self.phase = GcPhase::Propagate;
    }

    /// Frees dead objects and makes every survivor old
    fn sweep_to_old(&mut self, heap: &mut Heap) {
        let keys: Vec<GcKey> = heap
            .strings
            .keys()
            .map(GcKey::String)
            .chain(heap.storage.keys().map(GcKey::Object))
            .collect();

        for key in keys {
            let Some(header) = self.header(key) else {
                continue;
            };

            if header.fixed {
                continue;
            }

            if self.is_dead(header) {
                self.free_object(heap, key);
                continue;
            }

            let is_thread = matches!(key, GcKey::Object(key) if heap.threads.contains(&key));

            let Some(header) = self.header_mut(key) else {
                continue;
            };

            header.age = Age::Old;

            if is_thread {
                header.color = Color::Gray;

                if let GcKey::Object(key) = key {
                    self.gray_again.push(key);
                }
            } else {
                header.color = Color::Black;
            }
        }
    }

    fn atomic_to_generational(&mut self, heap: &mut Heap) {
        self.clear_gray_lists();
        self.phase = GcPhase::SweepRegular;
        self.sweep_to_old(heap);
        self.young.clear();
        self.old1.clear();
        self.mode = GcMode::Generational;
        self.estimate = self.used_memory;
        self.correct_gray_lists(heap);
        self.phase = GcPhase::Propagate;
    }

    /// Runs a full cycle and switches to generational mode
    pub(crate) fn enter_generational(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        self.run_until(GcPhase::Pause, heap, roots);
        self.restart_collection(heap, roots);
        self.atomic(heap, roots);
        self.atomic_to_generational(heap);
        self.set_minor_debt();

        tracing::debug!(used = self.used_memory, "gc entered generational mode");
    }

    /// Leaves generational mode, every object becomes white
    pub(crate) fn enter_incremental(&mut self) {
        self.whiten_all();
        self.clear_gray_lists();
        self.young.clear();
        self.old1.clear();
        self.sweep_queue.clear();
        self.mode = GcMode::Incremental;
        self.phase = GcPhase::Pause;

        tracing::debug!(used = self.used_memory, "gc entered incremental mode");
    }

    /// A major collection in generational mode
    pub(crate) fn full_generational(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        self.enter_incremental();
        self.enter_generational(heap, roots);
    }

    /// One generational step, minor unless memory grew past the major threshold
    pub(crate) fn generational_step(&mut self, heap: &mut Heap, roots: &mut GcRoots) {
        let major_base = self.estimate;
        let major_increment = (major_base / 100) * self.config.major_multiplier;

        if self.debt > 0 && self.used_memory > major_base + major_increment {
            tracing::debug!(used = self.used_memory, "gc major collection");
            self.full_generational(heap, roots);
        } else {
            self.young_collection(heap, roots);
            self.set_minor_debt();
            self.estimate = major_base;
        }
    }

    /// Checks that no black object refers to a white object through a strong reference
    pub(crate) fn validate(&self, heap: &Heap, mode_key: StringKey) -> Result<(), String> {
        if !self.keeps_invariant() {
            return Ok(());
        }

        for (key, header) in self.objects.iter() {
            if header.color != Color::Black {
                continue;
            }

            let Some(value) = heap.storage.get(key) else {
                return Err(format!("{key:?} has a header but no object"));
            };

            let mut children = Vec::new();

            match value {
                HeapValue::Table(table) => {
                    children.extend(table.metatable().map(StackValue::Table));

                    let view = heap_view(&heap.storage, &heap.strings);
                    let (weak_keys, weak_values) = weak_mode(view, table.metatable(), mode_key);

                    for (entry_key, value) in table.iter() {
                        if !weak_keys {
                            children.push(entry_key);
                        }

                        if !weak_values && !weak_keys {
                            children.push(value);
                        }
                    }
                }
                HeapValue::Closure(closure) => {
                    children.push(StackValue::Function(closure.prototype_key));
                    children.extend(closure.up_values.iter().map(|key| StackValue::Function(*key)));
                }
                HeapValue::UpValue(UpValue::Closed(value)) => children.push(*value),
                HeapValue::UserData(userdata) => {
                    children.extend(userdata.metatable.map(StackValue::Table));
                    children.push(userdata.user_value);
                }
                _ => {}
            }

            for child in children {
                if let Some(child_key) = child.gc_key() {
                    if self.is_white(child_key) {
                        return Err(format!("black {key:?} refers to white {child_key:?}"));
                    }
                }
            }
        }

        Ok(())
    }

    /// Number of objects tracked, for tests
    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.objects.len() + self.strings.len()
    }
}

enum ListKind {
    GrayAgain,
    Weak,
    Ephemeron,
    AllWeak,
}

#[derive(Clone, Copy)]
struct HeapView<'a> {
    storage: &'a slotmap::SlotMap<HeapKey, HeapValue>,
    strings: &'a super::StringTable,
}

#[inline]
fn heap_view<'a>(
    storage: &'a slotmap::SlotMap<HeapKey, HeapValue>,
    strings: &'a super::StringTable,
) -> HeapView<'a> {
    HeapView { storage, strings }
}

/// Reads `__mode` from the metatable, returns (weak keys, weak values)
fn weak_mode(heap: HeapView, metatable: Option<HeapKey>, mode_key: StringKey) -> (bool, bool) {
    let Some(metatable) = metatable else {
        return (false, false);
    };

    let Some(HeapValue::Table(metatable)) = heap.storage.get(metatable) else {
        return (false, false);
    };

    let StackValue::String(mode) = metatable.get(StackValue::String(mode_key), heap.strings) else {
        return (false, false);
    };

    let Some(mode) = heap.strings.get(mode) else {
        return (false, false);
    };

    let bytes = mode.bytes.as_bytes();

    (bytes.contains(&b'k'), bytes.contains(&b'v'))
}
