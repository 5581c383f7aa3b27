use backtrace::BacktraceSymbol;

const UNKNOWN: &str = "<unknown>";

/// Frames of the tracer itself, which always sit above the real caller.
const IGNORE_LIST: &[&str] = &[
    "heapwatch::symbols::demangle::get_demangled_symbol",
    "heapwatch::symbols::SymbolTable::alloc",
    "heapwatch::symbols::SymbolTable::dealloc",
    "heapwatch::alloc::trace",
    "heapwatch::alloc::HeapwatchAllocator::alloc",
    "heapwatch::alloc::HeapwatchAllocator::dealloc",
];

/// Get the name of the first caller that belongs to one of `modules`.
pub fn get_demangled_symbol(modules: &[&str]) -> String {
    let bt = backtrace::Backtrace::new();
    get_symbol_from_backtrace(&bt, modules)
        .and_then(symbol_name)
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Get the symbol of the innermost frame that belongs to one of `modules`.
fn get_symbol_from_backtrace<'a>(
    backtrace: &'a backtrace::Backtrace,
    modules: &[&str],
) -> Option<&'a BacktraceSymbol> {
    backtrace.frames().iter().find_map(|frame| {
        let symbol = frame.symbols().first()?;
        let name = symbol.name().map(|name| format!("{name}"))?;

        if IGNORE_LIST.iter().any(|ignore| name.starts_with(*ignore)) {
            return None;
        }

        modules
            .iter()
            .any(|module| name.starts_with(*module))
            .then_some(symbol)
    })
}

/// Get the name of a symbol from a [`BacktraceSymbol`], without the trailing hash.
fn symbol_name(symbol: &BacktraceSymbol) -> Option<String> {
    // strip the last part, e.g. `my_crate::b::h3777baf656cd0c35` -> `my_crate::b`
    let mut name = symbol.name().map(|name| format!("{name}"))?;

    if let Some(pos) = name.rfind("::") {
        name.truncate(pos);
    }
    Some(name)
}
