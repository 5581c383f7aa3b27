use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{HeapwatchError, Result};
use crate::symbols::SymbolTable;

/// Initial capacity of the site table.
const SYMBOL_TABLE_SIZE: usize = 1024;

static SYMBOL_TABLE: Mutex<Option<SymbolTable>> = Mutex::new(None);

/// Set once [`init_symbol_table`] has run, so untraced programs never touch the mutex.
static TRACING_ENABLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Set while the current thread is inside the tracer or holds the symbol table.
    static IN_TRACER: Cell<bool> = const { Cell::new(false) };
}

/// A counting allocator ([`GlobalAlloc`]) that wraps the [`System`] allocator and keeps the live heap counters
/// used by the monitor. When [`init_symbol_table`] has been called, every allocation is also attributed to the
/// calling site of the traced crates.
///
/// ## Example
///
/// ```rust
/// use heapwatch::HeapwatchAllocator;
///
/// #[global_allocator]
/// static ALLOCATOR: HeapwatchAllocator = HeapwatchAllocator::init();
/// ```
pub struct HeapwatchAllocator {
    allocated: AtomicUsize,
    peak: AtomicUsize,
    allocations: AtomicUsize,
    deallocations: AtomicUsize,
}

impl HeapwatchAllocator {
    /// Creates a new instance of the [`HeapwatchAllocator`].
    pub const fn init() -> Self {
        HeapwatchAllocator {
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            deallocations: AtomicUsize::new(0),
        }
    }

    /// Returns the number of live bytes allocated through the allocator.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the highest number of live bytes observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Returns a point-in-time copy of all counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocated: self.allocated(),
            peak: self.peak(),
            allocations: self.allocations.load(Ordering::Relaxed),
            deallocations: self.deallocations.load(Ordering::Relaxed),
        }
    }
}

unsafe impl GlobalAlloc for HeapwatchAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            let live = self
                .allocated
                .fetch_add(layout.size(), Ordering::Relaxed)
                .wrapping_add(layout.size());
            self.peak.fetch_max(live, Ordering::Relaxed);
            self.allocations.fetch_add(1, Ordering::Relaxed);
            trace(|table| table.alloc(layout.size()));
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if !ptr.is_null() {
            self.allocated.fetch_sub(layout.size(), Ordering::Relaxed);
            self.deallocations.fetch_add(1, Ordering::Relaxed);
            trace(|table| table.dealloc(layout.size()));
        }
        unsafe { System.dealloc(ptr, layout) };
    }
}

/// Counters of a [`HeapwatchAllocator`] at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorStats {
    /// Live bytes.
    pub allocated: usize,
    /// High-water mark of live bytes.
    pub peak: usize,
    /// Total number of allocations.
    pub allocations: usize,
    /// Total number of deallocations.
    pub deallocations: usize,
}

/// Initializes the symbol table and turns on per-site tracing.
///
/// `modules` are the crate (or module path) prefixes allocations are attributed to, e.g. `&["my_crate"]`.
/// Calling it again replaces the table and drops all collected sites.
///
/// Tracing captures a backtrace on every allocation, so it is meant for debugging sessions only.
pub fn init_symbol_table(modules: &'static [&'static str]) {
    let _untraced = Untraced::enter();
    let table = SymbolTable::new(SYMBOL_TABLE_SIZE, modules);
    let previous = lock_symbol_table().replace(table);
    TRACING_ENABLED.store(true, Ordering::Relaxed);
    drop(previous);
}

/// Runs `f` with shared access to the symbol table.
///
/// Allocations made by `f` are not traced.
///
/// # Errors
///
/// Returns [`HeapwatchError::SymbolTableUninitialized`] if [`init_symbol_table`] was never called.
pub fn with_symbol_table<F, T>(f: F) -> Result<T>
where
    F: FnOnce(&SymbolTable) -> T,
{
    let _untraced = Untraced::enter();
    let guard = lock_symbol_table();
    guard
        .as_ref()
        .map(f)
        .ok_or(HeapwatchError::SymbolTableUninitialized)
}

/// Returns whether [`init_symbol_table`] has been called.
pub fn is_tracing_enabled() -> bool {
    TRACING_ENABLED.load(Ordering::Relaxed)
}

fn lock_symbol_table() -> MutexGuard<'static, Option<SymbolTable>> {
    SYMBOL_TABLE
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Applies `f` to the symbol table unless tracing is off or the current thread is already tracing.
fn trace<F>(f: F)
where
    F: FnOnce(&mut SymbolTable),
{
    if !is_tracing_enabled() {
        return;
    }
    let Some(_untraced) = Untraced::try_enter() else {
        return;
    };
    if let Some(table) = lock_symbol_table().as_mut() {
        f(table);
    }
}

/// Marks the current thread as tracing until dropped.
struct Untraced {
    previous: bool,
}

impl Untraced {
    fn enter() -> Self {
        let previous = IN_TRACER.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self { previous }
    }

    /// Like [`Untraced::enter`], but `None` if the thread is already tracing (or tearing down).
    fn try_enter() -> Option<Self> {
        let previous = IN_TRACER.try_with(|flag| flag.replace(true)).ok()?;
        (!previous).then_some(Self { previous })
    }
}

impl Drop for Untraced {
    fn drop(&mut self) {
        let _ = IN_TRACER.try_with(|flag| flag.set(self.previous));
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_count_allocations() {
        let allocator = HeapwatchAllocator::init();
        let layout = Layout::from_size_align(256, 8).expect("valid layout");

        let ptr = unsafe { allocator.alloc(layout) };
        assert!(!ptr.is_null());
        assert_eq!(allocator.allocated(), 256);
        assert_eq!(allocator.peak(), 256);

        let second = unsafe { allocator.alloc(layout) };
        assert_eq!(allocator.allocated(), 512);

        unsafe { allocator.dealloc(ptr, layout) };
        unsafe { allocator.dealloc(second, layout) };

        let stats = allocator.stats();
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.peak, 512);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 2);
    }

    #[test]
    fn test_should_keep_peak_after_release() {
        let allocator = HeapwatchAllocator::init();
        let big = Layout::from_size_align(4096, 8).expect("valid layout");
        let small = Layout::from_size_align(16, 8).expect("valid layout");

        let ptr = unsafe { allocator.alloc(big) };
        unsafe { allocator.dealloc(ptr, big) };
        let ptr = unsafe { allocator.alloc(small) };

        assert_eq!(allocator.allocated(), 16);
        assert_eq!(allocator.peak(), 4096);

        unsafe { allocator.dealloc(ptr, small) };
    }

    #[test]
    fn test_should_read_symbol_table_after_init() {
        init_symbol_table(&["heapwatch"]);
        assert!(is_tracing_enabled());

        let allocator = HeapwatchAllocator::init();
        let layout = Layout::from_size_align(64, 8).expect("valid layout");
        let ptr = unsafe { allocator.alloc(layout) };

        let traced = with_symbol_table(|table| table.iter().count()).expect("table initialized");
        assert!(traced >= 1);

        unsafe { allocator.dealloc(ptr, layout) };
    }

    #[test]
    fn test_should_nest_untraced_guards() {
        let outer = Untraced::enter();
        assert!(Untraced::try_enter().is_none());
        {
            let _inner = Untraced::enter();
        }
        assert!(IN_TRACER.with(Cell::get));
        drop(outer);
        assert!(!IN_TRACER.with(Cell::get));
    }
}
