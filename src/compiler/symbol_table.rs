use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolScope {
    Global,
    Local,
    Free,
    Builtin,
    /// The name of the function currently being compiled, seen from inside its body.
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub scope: SymbolScope,
    pub index: usize,
    pub mutable: bool,
}

#[derive(Debug, Default, Clone)]
struct Scope {
    store: HashMap<String, Symbol>,
    num_definitions: usize,
    /// Outer symbols captured by this scope, in capture order.
    free_symbols: Vec<Symbol>,
}

/// Lexical scopes as a stack. Index 0 is the global scope; every other
/// entry is a function body whose enclosing scope is the one below it.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable { scopes: vec![Scope::default()] }
    }

    pub fn is_global(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    /// Leave the innermost function scope, returning the symbols it captured.
    /// The global scope is never popped.
    pub fn pop_scope(&mut self) -> Vec<Symbol> {
        if self.scopes.len() == 1 {
            return Vec::new();
        }
        self.scopes.pop().map(|s| s.free_symbols).unwrap_or_default()
    }

    /// Number of slots defined in the innermost scope.
    pub fn num_definitions(&self) -> usize {
        self.current().num_definitions
    }

    pub fn free_symbols(&self) -> &[Symbol] {
        &self.current().free_symbols
    }

    fn current(&self) -> &Scope {
        &self.scopes[self.scopes.len() - 1]
    }

    fn current_mut(&mut self) -> &mut Scope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Bind `name` at the next slot. A redefinition in the same scope replaces
    /// the previous symbol.
    pub fn define(&mut self, name: &str, mutable: bool) -> Symbol {
        let scope = if self.is_global() { SymbolScope::Global } else { SymbolScope::Local };
        let current = self.current_mut();
        let symbol = Symbol {
            name: name.to_string(),
            scope,
            index: current.num_definitions,
            mutable,
        };
        current.num_definitions += 1;
        current.store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn define_builtin(&mut self, index: usize, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Builtin,
            index,
            mutable: false,
        };
        self.scopes[0].store.insert(name.to_string(), symbol.clone());
        symbol
    }

    /// Register the enclosing function's own name inside its body.
    pub fn define_function_name(&mut self, name: &str) -> Symbol {
        let symbol = Symbol {
            name: name.to_string(),
            scope: SymbolScope::Function,
            index: 0,
            mutable: false,
        };
        self.current_mut().store.insert(name.to_string(), symbol.clone());
        symbol
    }

    pub fn resolve(&mut self, name: &str) -> Option<Symbol> {
        let level = self.scopes.len() - 1;
        self.resolve_at(level, name)
    }

    fn resolve_at(&mut self, level: usize, name: &str) -> Option<Symbol> {
        if let Some(symbol) = self.scopes[level].store.get(name) {
            return Some(symbol.clone());
        }
        if level == 0 {
            return None;
        }
        let outer = self.resolve_at(level - 1, name)?;
        match outer.scope {
            SymbolScope::Global | SymbolScope::Builtin => Some(outer),
            // Locals, captures and function names of an enclosing function
            // become captures of this one.
            SymbolScope::Local | SymbolScope::Free | SymbolScope::Function => {
                Some(self.define_free(level, outer))
            }
        }
    }

    fn define_free(&mut self, level: usize, original: Symbol) -> Symbol {
        let scope = &mut self.scopes[level];
        let symbol = Symbol {
            name: original.name.clone(),
            scope: SymbolScope::Free,
            index: scope.free_symbols.len(),
            mutable: false,
        };
        scope.free_symbols.push(original);
        scope.store.insert(symbol.name.clone(), symbol.clone());
        symbol
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str, scope: SymbolScope, index: usize, mutable: bool) -> Symbol {
        Symbol { name: name.to_string(), scope, index, mutable }
    }

    #[test]
    fn define_global_and_local() {
        let mut table = SymbolTable::new();
        assert_eq!(table.define("a", true), sym("a", SymbolScope::Global, 0, true));
        assert_eq!(table.define("b", false), sym("b", SymbolScope::Global, 1, false));
        table.push_scope();
        assert_eq!(table.define("c", true), sym("c", SymbolScope::Local, 0, true));
        table.push_scope();
        assert_eq!(table.define("d", true), sym("d", SymbolScope::Local, 0, true));
    }

    #[test]
    fn resolve_global_from_nested_scope_is_not_promoted() {
        let mut table = SymbolTable::new();
        table.define("a", true);
        table.push_scope();
        table.push_scope();
        assert_eq!(table.resolve("a"), Some(sym("a", SymbolScope::Global, 0, true)));
        assert!(table.free_symbols().is_empty());
    }

    #[test]
    fn resolve_free_promotes_at_each_level() {
        let mut table = SymbolTable::new();
        table.define("g", true);
        table.push_scope();
        table.define("a", true);
        table.push_scope();
        table.define("b", true);
        table.push_scope();
        table.define("c", true);

        assert_eq!(table.resolve("a"), Some(sym("a", SymbolScope::Free, 0, false)));
        assert_eq!(table.resolve("b"), Some(sym("b", SymbolScope::Free, 1, false)));
        assert_eq!(table.resolve("c"), Some(sym("c", SymbolScope::Local, 0, true)));
        assert_eq!(table.resolve("g"), Some(sym("g", SymbolScope::Global, 0, true)));
        assert_eq!(
            table.free_symbols(),
            &[sym("a", SymbolScope::Free, 0, false), sym("b", SymbolScope::Local, 0, true)]
        );

        // The middle scope captured `a` from the outermost function.
        let innermost_free = table.pop_scope();
        assert_eq!(innermost_free.len(), 2);
        assert_eq!(table.free_symbols(), &[sym("a", SymbolScope::Local, 0, true)]);
        assert_eq!(table.resolve("a"), Some(sym("a", SymbolScope::Free, 0, false)));
    }

    #[test]
    fn resolving_twice_reuses_the_free_slot() {
        let mut table = SymbolTable::new();
        table.push_scope();
        table.define("a", true);
        table.push_scope();
        let first = table.resolve("a");
        let second = table.resolve("a");
        assert_eq!(first, second);
        assert_eq!(table.free_symbols().len(), 1);
    }

    #[test]
    fn unresolvable_at_every_depth() {
        let mut table = SymbolTable::new();
        table.define("a", true);
        assert_eq!(table.resolve("x"), None);
        table.push_scope();
        assert_eq!(table.resolve("x"), None);
        table.push_scope();
        assert_eq!(table.resolve("x"), None);
    }

    #[test]
    fn builtins_resolve_from_any_depth() {
        let mut table = SymbolTable::new();
        table.define_builtin(0, "len");
        table.define_builtin(1, "print");
        table.push_scope();
        table.push_scope();
        assert_eq!(table.resolve("print"), Some(sym("print", SymbolScope::Builtin, 1, false)));
        assert!(table.free_symbols().is_empty());
    }

    #[test]
    fn function_name_resolves_in_its_own_body() {
        let mut table = SymbolTable::new();
        table.push_scope();
        table.define_function_name("fib");
        assert_eq!(table.resolve("fib"), Some(sym("fib", SymbolScope::Function, 0, false)));
    }

    #[test]
    fn later_define_shadows_function_name() {
        let mut table = SymbolTable::new();
        table.push_scope();
        table.define_function_name("a");
        table.define("a", true);
        assert_eq!(table.resolve("a"), Some(sym("a", SymbolScope::Local, 0, true)));
    }

    #[test]
    fn function_name_is_captured_by_nested_function() {
        let mut table = SymbolTable::new();
        table.push_scope();
        table.define_function_name("outer");
        table.push_scope();
        assert_eq!(table.resolve("outer"), Some(sym("outer", SymbolScope::Free, 0, false)));
        assert_eq!(table.free_symbols(), &[sym("outer", SymbolScope::Function, 0, false)]);
    }

    #[test]
    fn redefine_in_same_scope_takes_next_slot() {
        let mut table = SymbolTable::new();
        table.define("a", true);
        let again = table.define("a", false);
        assert_eq!(again, sym("a", SymbolScope::Global, 1, false));
        assert_eq!(table.num_definitions(), 2);
    }
}
