use super::execution::current_thread;
use super::heap::{GarbageCollector, GcMode, GcPhase, GcRoots, Heap, HeapKey, HeapValue};
use super::value_stack::StackValue;
use super::Vm;
use crate::errors::RuntimeErrorData;

/// Work credited for running one finalizer
const FINALIZER_COST: isize = 50;
/// Finalizers run per incremental step
const FINALIZERS_PER_STEP: usize = 10;

/// Requests for [`Vm::collect_garbage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOption {
    /// Runs a full cycle
    Collect,
    Stop,
    Restart,
    /// Memory in use, in bytes
    Count,
    /// Adds this many bytes of debt and steps, zero performs a single basic step
    Step(usize),
    IsRunning,
    /// Switches to incremental mode, zero keeps the current value of a parameter
    Incremental {
        pause: usize,
        step_multiplier: usize,
        step_size: usize,
    },
    /// Switches to generational mode, zero keeps the current value of a parameter
    Generational {
        minor_multiplier: usize,
        major_multiplier: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcResponse {
    Done,
    Count(usize),
    /// `true` when the step finished a cycle
    Step(bool),
    IsRunning(bool),
    PreviousMode(GcMode),
}

impl Vm {
    fn split_gc(&mut self) -> (&mut GarbageCollector, &mut Heap, GcRoots<'_>) {
        let data = &mut self.execution_data;

        let roots = GcRoots {
            threads: &mut self.threads,
            registry: self.registry,
            globals: self.globals,
            mode_key: data.metatable_keys.mode,
        };

        (&mut data.gc, &mut data.heap, roots)
    }

    /// Runs collector work owed by recent allocations, and enforces the memory limit
    pub(crate) fn check_gc(&mut self) -> Result<(), RuntimeErrorData> {
        self.step_gc_if_needed();

        let gc = &self.execution_data.gc;

        if gc.exceeds_memory_limit() && !gc.is_running_finalizers() {
            self.emergency_collect();

            if self.execution_data.gc.exceeds_memory_limit() {
                return Err(RuntimeErrorData::OutOfMemory);
            }
        }

        Ok(())
    }

    pub(crate) fn step_gc_if_needed(&mut self) {
        if self.execution_data.gc.should_step() {
            self.gc_step_internal();
        }
    }

    fn gc_step_internal(&mut self) {
        match self.execution_data.gc.mode() {
            GcMode::Incremental => self.incremental_step(),
            GcMode::Generational => {
                let (gc, heap, mut roots) = self.split_gc();
                gc.generational_step(heap, &mut roots);
                self.call_pending_finalizers(usize::MAX);
            }
        }
    }

    fn incremental_step(&mut self) {
        let config = &self.execution_data.gc.config;
        let step_multiplier = config.step_multiplier.max(1) as isize;
        let step_size = (config.step_size as isize / 100).max(1) * step_multiplier;
        let mut debt = (self.execution_data.gc.debt() / 100) * step_multiplier;

        loop {
            let gc = &self.execution_data.gc;

            if gc.phase() == GcPhase::CallFinalizers
                && gc.has_pending_finalizers()
                && !gc.is_emergency()
            {
                let count = self.call_pending_finalizers(FINALIZERS_PER_STEP);
                debt -= count as isize * FINALIZER_COST;
            } else {
                let (gc, heap, mut roots) = self.split_gc();
                debt -= gc.single_step(heap, &mut roots) as isize;
            }

            if debt <= -step_size || self.execution_data.gc.phase() == GcPhase::Pause {
                break;
            }
        }

        let gc = &mut self.execution_data.gc;

        if gc.phase() == GcPhase::Pause {
            gc.set_pause();
        } else {
            gc.set_debt((debt / step_multiplier) * 100);
        }
    }

    fn full_collect(&mut self) {
        let (gc, heap, mut roots) = self.split_gc();

        match gc.mode() {
            GcMode::Generational => gc.full_generational(heap, &mut roots),
            GcMode::Incremental => {
                gc.abandon_marking();
                // finish a sweep in progress before starting over
                gc.run_until(GcPhase::Pause, heap, &mut roots);
                gc.run_until(GcPhase::CallFinalizers, heap, &mut roots);
                gc.run_until(GcPhase::Pause, heap, &mut roots);
                gc.set_pause();
            }
        }

        if !self.execution_data.gc.is_emergency() {
            self.call_pending_finalizers(usize::MAX);
        }
    }

    /// A full collection that leaves finalizers pending
    pub(crate) fn emergency_collect(&mut self) {
        tracing::debug!(
            used = self.execution_data.gc.used_memory(),
            "emergency collection"
        );

        self.execution_data.gc.set_emergency(true);
        self.full_collect();
        self.execution_data.gc.set_emergency(false);
    }

    fn call_pending_finalizers(&mut self, limit: usize) -> usize {
        let mut count = 0;

        while count < limit {
            let Some(key) = self.execution_data.gc.take_finalizable() else {
                break;
            };

            self.run_finalizer(key);
            count += 1;
        }

        count
    }

    /// Calls `__gc` with the object, errors are reported as warnings
    fn run_finalizer(&mut self, key: HeapKey) {
        let data = &self.execution_data;

        let object = match data.heap.get(key) {
            Some(HeapValue::Table(_)) => StackValue::Table(key),
            Some(HeapValue::UserData(_)) => StackValue::UserData(key),
            _ => return,
        };

        let metamethod = data.heap.get_metavalue(object, data.metatable_keys.gc);

        if metamethod.is_nil() {
            return;
        }

        let Ok(thread) = current_thread(self) else {
            return;
        };

        let old_top = thread.value_stack.top();
        let start = thread.live_extent();
        thread.value_stack.set_top(start);
        thread.value_stack.push(metamethod);
        thread.value_stack.push(object);

        let gc = &mut self.execution_data.gc;
        let was_running_finalizers = gc.is_running_finalizers();
        gc.set_running_finalizers(true);

        let result = self.call_at(start, 1, Some(0));

        self.execution_data
            .gc
            .set_running_finalizers(was_running_finalizers);

        if let Ok(thread) = current_thread(self) {
            thread.value_stack.clear_range(start..start + 2);
            thread.value_stack.set_top(old_top);
        }

        if let Err(err) = result {
            self.warn(&format!("error in __gc ({})", err.message()));
        }
    }

    /// Finalizes every object with a pending `__gc`, reachable or not
    pub(crate) fn run_all_finalizers(&mut self) {
        self.execution_data.gc.separate_all_finalizable();
        self.call_pending_finalizers(usize::MAX);
    }

    pub fn collect_garbage(&mut self, option: GcOption) -> GcResponse {
        match option {
            GcOption::Collect => {
                self.gc_collect();
                GcResponse::Done
            }
            GcOption::Stop => {
                self.gc_stop();
                GcResponse::Done
            }
            GcOption::Restart => {
                self.gc_restart();
                GcResponse::Done
            }
            GcOption::Count => GcResponse::Count(self.gc_used_memory()),
            GcOption::Step(bytes) => GcResponse::Step(self.gc_step(bytes)),
            GcOption::IsRunning => GcResponse::IsRunning(self.gc_is_running()),
            GcOption::Incremental {
                pause,
                step_multiplier,
                step_size,
            } => {
                let config = &mut self.execution_data.gc.config;

                if pause != 0 {
                    config.pause = pause;
                }

                if step_multiplier != 0 {
                    config.step_multiplier = step_multiplier;
                }

                if step_size != 0 {
                    config.step_size = step_size;
                }

                let previous = self.gc_mode();

                if previous == GcMode::Generational {
                    self.execution_data.gc.enter_incremental();
                }

                GcResponse::PreviousMode(previous)
            }
            GcOption::Generational {
                minor_multiplier,
                major_multiplier,
            } => {
                let config = &mut self.execution_data.gc.config;

                if minor_multiplier != 0 {
                    config.minor_multiplier = minor_multiplier;
                }

                if major_multiplier != 0 {
                    config.major_multiplier = major_multiplier;
                }

                let previous = self.gc_mode();

                if previous == GcMode::Incremental {
                    let (gc, heap, mut roots) = self.split_gc();
                    gc.enter_generational(heap, &mut roots);
                }

                GcResponse::PreviousMode(previous)
            }
        }
    }

    /// Runs a full collection cycle, then pending finalizers
    pub fn gc_collect(&mut self) {
        self.full_collect();
    }

    /// Adds `bytes` of debt and performs the owed work, returns `true` if a cycle finished
    pub fn gc_step(&mut self, bytes: usize) -> bool {
        let gc = &mut self.execution_data.gc;

        if bytes == 0 {
            gc.set_debt(0);
        } else {
            gc.set_debt(gc.debt().saturating_add(bytes as isize));
        }

        // runs even while stopped
        if self.execution_data.gc.debt() >= 0 {
            self.gc_step_internal();
        }

        let gc = &self.execution_data.gc;
        gc.mode() == GcMode::Incremental && gc.phase() == GcPhase::Pause
    }

    /// Checks the collector's tri-color invariant, for tests and debugging
    #[doc(hidden)]
    pub fn gc_validate(&self) -> Result<(), String> {
        let data = &self.execution_data;
        data.gc.validate(&data.heap, data.metatable_keys.mode)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::interpreter::{TypeName, Value};
    use pretty_assertions::assert_eq;

    #[test]
    fn unreferenced_tables_are_collected() {
        let mut vm = Vm::with_seed(0);
        vm.gc_collect();
        let baseline = vm.gc_used_memory();

        for _ in 0..100 {
            let _ = vm.create_table_with_capacity(16, 16);
        }

        assert!(vm.gc_used_memory() > baseline);

        vm.gc_collect();
        assert_eq!(vm.gc_used_memory(), baseline);
    }

    #[test]
    fn handles_keep_objects_alive() {
        let mut vm = Vm::with_seed(0);
        let table = vm.create_table();

        vm.gc_collect();

        let value = Value::Table(table);
        assert_eq!(value.test_validity(&vm.execution_data.heap), Ok(()));
        assert_eq!(value.type_name(), TypeName::Table);
    }

    #[test]
    fn stop_and_restart() {
        let mut vm = Vm::with_seed(0);

        assert_eq!(
            vm.collect_garbage(GcOption::IsRunning),
            GcResponse::IsRunning(true)
        );
        vm.collect_garbage(GcOption::Stop);
        assert_eq!(
            vm.collect_garbage(GcOption::IsRunning),
            GcResponse::IsRunning(false)
        );
        vm.collect_garbage(GcOption::Restart);
        assert_eq!(
            vm.collect_garbage(GcOption::IsRunning),
            GcResponse::IsRunning(true)
        );
    }

    #[test]
    fn switching_modes_reports_the_previous_mode() {
        let mut vm = Vm::with_seed(0);

        let response = vm.collect_garbage(GcOption::Generational {
            minor_multiplier: 0,
            major_multiplier: 0,
        });
        assert_eq!(response, GcResponse::PreviousMode(GcMode::Incremental));
        assert_eq!(vm.gc_mode(), GcMode::Generational);

        let response = vm.collect_garbage(GcOption::Incremental {
            pause: 0,
            step_multiplier: 0,
            step_size: 0,
        });
        assert_eq!(response, GcResponse::PreviousMode(GcMode::Generational));
        assert_eq!(vm.gc_mode(), GcMode::Incremental);
    }

    #[test]
    fn stepping_eventually_finishes_a_cycle() {
        let mut vm = Vm::with_seed(0);

        let finished = (0..10_000).any(|_| vm.gc_step(0));
        assert!(finished);
        assert_eq!(vm.gc_validate(), Ok(()));
    }
}
