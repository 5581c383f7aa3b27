mod demangle;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// A [`Symbol`] table.
///
/// Each [`Symbol`] is identified by the allocating function path (e.g. `my_crate::cache::Cache::insert`).
#[derive(Debug)]
pub struct SymbolTable {
    /// The modules that are being traced.
    modules: &'static [&'static str],
    symbols: HashMap<&'static str, Symbol>,
}

impl SymbolTable {
    /// Creates a new [`SymbolTable`] with the given size and modules.
    pub(crate) fn new(size: usize, modules: &'static [&'static str]) -> Self {
        Self {
            modules,
            symbols: HashMap::with_capacity(size),
        }
    }

    /// Iterates over the [`Symbol`]s in the table, with their names.
    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Symbol)> {
        self.symbols.iter()
    }

    /// Gets a [`Symbol`] by its name.
    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Returns the traced sites, largest live size first.
    pub fn sites(&self) -> Vec<SiteStats> {
        let mut sites: Vec<SiteStats> = self
            .iter()
            .map(|(name, symbol)| SiteStats {
                name: (*name).to_string(),
                allocated: symbol.allocated(),
                count: symbol.count(),
            })
            .collect();
        sites.sort_by(|a, b| b.allocated.cmp(&a.allocated).then_with(|| a.name.cmp(&b.name)));
        sites
    }

    /// Increments the allocated bytes for the calling [`Symbol`].
    pub(crate) fn alloc(&mut self, bytes: usize) {
        let name = demangle::get_demangled_symbol(self.modules);

        // a name is leaked once, when its site is first seen
        let key: &'static str = match self.symbols.get_key_value(name.as_str()) {
            Some((key, _)) => *key,
            None => Box::leak(name.into_boxed_str()),
        };
        let symbol = self.symbols.entry(key).or_default();

        symbol.allocated.fetch_add(bytes, Ordering::Relaxed);
        symbol.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrements the allocated bytes for the calling [`Symbol`].
    pub(crate) fn dealloc(&mut self, bytes: usize) {
        let name = demangle::get_demangled_symbol(self.modules);

        if let Some(symbol) = self.symbols.get(name.as_str()) {
            saturating_sub(&symbol.allocated, bytes);
            saturating_sub(&symbol.count, 1);
        }
    }

    #[cfg(test)]
    fn insert(&mut self, name: &'static str) {
        self.symbols.insert(name, Symbol::default());
    }
}

fn saturating_sub(counter: &AtomicUsize, value: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

/// A slot in the symbol table.
#[derive(Debug, Default)]
pub struct Symbol {
    /// Allocated bytes for this symbol.
    allocated: AtomicUsize,
    /// Allocation count for this symbol.
    count: AtomicUsize,
}

impl Symbol {
    /// Returns the number of bytes allocated for this symbol.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the number of allocations for this symbol.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Owned copy of a [`Symbol`], as written into heap snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub name: String,
    pub allocated: usize,
    pub count: usize,
}
