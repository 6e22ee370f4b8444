// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

//! Symbols, local scopes and the module tree.
//!
//! Every module owns its symbols, macro and struct definitions, its nested
//! modules and a stack of local scopes. Modules live in a [`ModuleTree`]
//! arena and refer to each other through [`ModuleId`]s.
//!
//! Simple names resolve from the innermost local scope of the current module
//! outwards, then through the module symbols, then through the parent
//! modules. Compound names (`outer.inner.label`) walk nested modules, and the
//! segment before the last may name a struct to reach a field offset.

use std::collections::HashSet;
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use serde::Serialize;

use crate::core::assembler::error::ErrorCode;
use crate::core::ast::AssemblyLine;
use crate::core::expr::ExpressionValue;

pub type ModuleId = usize;

pub const ROOT_MODULE: ModuleId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SymbolKind {
    None,
    Label,
    Var,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub value: ExpressionValue,
    #[serde(skip)]
    pub is_used: bool,
}

impl SymbolInfo {
    pub fn label(name: &str, value: ExpressionValue) -> Self {
        Self {
            name: name.to_string(),
            kind: SymbolKind::Label,
            value,
            is_used: false,
        }
    }

    pub fn var(name: &str, value: ExpressionValue) -> Self {
        Self {
            name: name.to_string(),
            kind: SymbolKind::Var,
            value,
            is_used: false,
        }
    }
}

/// What opened a local scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Opened by a regular label for the backtick labels that follow it.
    Temporary,
    /// Wraps all iterations of a loop.
    Loop,
    /// A single loop iteration.
    Iteration,
    Proc,
    Macro,
}

#[derive(Debug, Clone)]
pub struct SymbolScope {
    pub kind: ScopeKind,
    pub symbols: IndexMap<String, SymbolInfo>,
    /// Fixups recorded while this scope was active.
    pub fixups: Vec<usize>,
    pub loop_counter: i64,
    pub break_reached: bool,
    pub continue_reached: bool,
    pub macro_arguments: IndexMap<String, String>,
    /// Names declared with `.local`.
    pub local_bookings: IndexSet<String>,
    reported_errors: HashSet<ErrorCode>,
}

impl SymbolScope {
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            symbols: IndexMap::new(),
            fixups: Vec::new(),
            loop_counter: 0,
            break_reached: false,
            continue_reached: false,
            macro_arguments: IndexMap::new(),
            local_bookings: IndexSet::new(),
            reported_errors: HashSet::new(),
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.kind == ScopeKind::Temporary
    }

    pub fn is_macro_context(&self) -> bool {
        self.kind == ScopeKind::Macro
    }

    /// Returns true the first time `code` is seen in this scope.
    pub fn mark_reported(&mut self, code: ErrorCode) -> bool {
        self.reported_errors.insert(code)
    }
}

/// A field of a struct definition.
#[derive(Debug, Clone, Serialize)]
pub struct StructField {
    pub offset: usize,
    #[serde(skip)]
    pub is_used: bool,
}

#[derive(Debug, Clone)]
pub struct MacroDefinition {
    pub name: String,
    pub arg_names: Vec<String>,
    pub end_label: Option<String>,
    /// Line arena holding the body.
    pub lines: Rc<[AssemblyLine]>,
    /// Index of the `.macro` line.
    pub first_line: usize,
    /// Index of the `.endm` line.
    pub last_line: usize,
}

#[derive(Debug, Clone)]
pub struct StructDefinition {
    pub name: String,
    pub lines: Rc<[AssemblyLine]>,
    pub first_line: usize,
    pub last_line: usize,
    pub fields: IndexMap<String, StructField>,
    pub size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct AssemblyModule {
    pub name: String,
    pub parent: Option<ModuleId>,
    pub symbols: IndexMap<String, SymbolInfo>,
    pub macros: IndexMap<String, MacroDefinition>,
    pub structs: IndexMap<String, StructDefinition>,
    pub nested: IndexMap<String, ModuleId>,
    pub local_scopes: Vec<SymbolScope>,
    pub fixups: Vec<usize>,
}

impl AssemblyModule {
    /// True if a macro, symbol, nested module or struct already uses `name`.
    pub fn name_in_use(&self, name: &str) -> bool {
        self.macros.contains_key(name)
            || self.symbols.contains_key(name)
            || self.nested.contains_key(name)
            || self.structs.contains_key(name)
    }
}

/// Where a symbol was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolLocation {
    Scope(ModuleId, usize),
    Module(ModuleId),
    Field(ModuleId),
}

/// Arena of modules; index 0 is the root.
#[derive(Debug, Clone)]
pub struct ModuleTree {
    pub modules: Vec<AssemblyModule>,
    pub case_sensitive: bool,
}

impl ModuleTree {
    pub fn new(case_sensitive: bool) -> Self {
        Self {
            modules: vec![AssemblyModule::default()],
            case_sensitive,
        }
    }

    /// Case-normalized form of a name.
    pub fn normalize(&self, name: &str) -> String {
        if self.case_sensitive {
            name.to_string()
        } else {
            name.to_ascii_lowercase()
        }
    }

    pub fn module(&self, id: ModuleId) -> &AssemblyModule {
        &self.modules[id]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut AssemblyModule {
        &mut self.modules[id]
    }

    /// Create `name` as a nested module of `parent`.
    pub fn add_module(&mut self, parent: ModuleId, name: &str) -> ModuleId {
        let id = self.modules.len();
        self.modules.push(AssemblyModule {
            name: name.to_string(),
            parent: Some(parent),
            ..AssemblyModule::default()
        });
        self.modules[parent].nested.insert(name.to_string(), id);
        id
    }

    /// Current module followed by its ancestors.
    pub fn ancestors(&self, id: ModuleId) -> impl Iterator<Item = ModuleId> + '_ {
        std::iter::successors(Some(id), move |&m| self.modules[m].parent)
    }

    pub fn top_scope(&self, module: ModuleId) -> Option<&SymbolScope> {
        self.modules[module].local_scopes.last()
    }

    pub fn top_scope_mut(&mut self, module: ModuleId) -> Option<&mut SymbolScope> {
        self.modules[module].local_scopes.last_mut()
    }

    /// Index of the innermost iteration scope that is visible, looking
    /// through temporary scopes only.
    pub fn iteration_scope(&self, module: ModuleId) -> Option<usize> {
        let scopes = &self.modules[module].local_scopes;
        let idx = scopes.iter().rposition(|scope| !scope.is_temporary())?;
        (scopes[idx].kind == ScopeKind::Iteration).then_some(idx)
    }

    pub fn loop_counter(&self, module: ModuleId) -> Option<i64> {
        self.iteration_scope(module)
            .map(|idx| self.modules[module].local_scopes[idx].loop_counter)
    }

    /// Locate a symbol; `name` must already be normalized.
    pub fn find(&self, module: ModuleId, name: &str, from_global: bool) -> Option<SymbolLocation> {
        if from_global {
            return self.find_compound(ROOT_MODULE, name, true);
        }
        if name.contains('.') {
            if let Some(found) = self.find_compound(module, name, false) {
                return Some(found);
            }
        }
        self.find_simple(module, name)
    }

    fn find_simple(&self, module: ModuleId, name: &str) -> Option<SymbolLocation> {
        for id in self.ancestors(module) {
            let m = &self.modules[id];
            for (idx, scope) in m.local_scopes.iter().enumerate().rev() {
                if scope.symbols.contains_key(name) {
                    return Some(SymbolLocation::Scope(id, idx));
                }
                if scope.local_bookings.contains(name) {
                    return None;
                }
            }
            if m.symbols.contains_key(name) {
                return Some(SymbolLocation::Module(id));
            }
        }
        None
    }

    fn find_compound(&self, module: ModuleId, name: &str, from_global: bool) -> Option<SymbolLocation> {
        let segments: Vec<&str> = name.split('.').collect();
        let (last, path) = segments.split_last()?;
        if path.is_empty() {
            return self.modules[module]
                .symbols
                .contains_key(*last)
                .then_some(SymbolLocation::Module(module));
        }
        let first = path[0];
        let starts_here = |id: ModuleId| {
            let m = &self.modules[id];
            m.nested.contains_key(first) || (path.len() == 1 && m.structs.contains_key(first))
        };
        let mut current = if from_global {
            module
        } else {
            self.ancestors(module).find(|&id| starts_here(id))?
        };
        for (idx, segment) in path.iter().enumerate() {
            if idx > 0 && segment.starts_with('@') {
                return None;
            }
            let m = &self.modules[current];
            if idx == path.len() - 1 {
                if let Some(def) = m.structs.get(*segment) {
                    return def
                        .fields
                        .contains_key(*last)
                        .then_some(SymbolLocation::Field(current));
                }
            }
            current = *m.nested.get(*segment)?;
        }
        if last.starts_with('@') {
            return None;
        }
        self.modules[current]
            .symbols
            .contains_key(*last)
            .then_some(SymbolLocation::Module(current))
    }

    /// Resolve `name` and mark it used.
    pub fn resolve(&mut self, module: ModuleId, name: &str, from_global: bool) -> Option<ExpressionValue> {
        let name = self.normalize(name);
        let location = self.find(module, &name, from_global)?;
        match location {
            SymbolLocation::Field(id) => {
                let (struct_name, field_name) = split_field(&name)?;
                let field = self.modules[id]
                    .structs
                    .get_mut(struct_name)?
                    .fields
                    .get_mut(field_name)?;
                field.is_used = true;
                Some(ExpressionValue::Integer(field.offset as i64))
            }
            _ => {
                let key = last_segment(&name);
                let symbol = self.symbol_at_mut(location, key)?;
                symbol.is_used = true;
                Some(symbol.value.clone())
            }
        }
    }

    /// True if `name` resolves to a value that is ready to use.
    pub fn is_resolved(&self, module: ModuleId, name: &str, from_global: bool) -> bool {
        let name = self.normalize(name);
        match self.find(module, &name, from_global) {
            Some(SymbolLocation::Field(_)) => true,
            Some(location) => self
                .symbol_at(location, last_segment(&name))
                .is_some_and(|symbol| symbol.value.is_valid()),
            None => false,
        }
    }

    /// Usage flag of a symbol, for `.ifused`.
    pub fn is_used(&self, module: ModuleId, name: &str, from_global: bool) -> bool {
        let name = self.normalize(name);
        match self.find(module, &name, from_global) {
            Some(SymbolLocation::Field(id)) => split_field(&name)
                .and_then(|(s, f)| self.modules[id].structs.get(s)?.fields.get(f))
                .is_some_and(|field| field.is_used),
            Some(location) => self
                .symbol_at(location, last_segment(&name))
                .is_some_and(|symbol| symbol.is_used),
            None => false,
        }
    }

    pub fn symbol_at(&self, location: SymbolLocation, key: &str) -> Option<&SymbolInfo> {
        match location {
            SymbolLocation::Scope(id, idx) => self.modules[id].local_scopes[idx].symbols.get(key),
            SymbolLocation::Module(id) => self.modules[id].symbols.get(key),
            SymbolLocation::Field(_) => None,
        }
    }

    fn symbol_at_mut(&mut self, location: SymbolLocation, key: &str) -> Option<&mut SymbolInfo> {
        match location {
            SymbolLocation::Scope(id, idx) => {
                self.modules[id].local_scopes[idx].symbols.get_mut(key)
            }
            SymbolLocation::Module(id) => self.modules[id].symbols.get_mut(key),
            SymbolLocation::Field(_) => None,
        }
    }

    /// Find a variable by walking the local scopes of `module`, then its
    /// symbols. `name` must be normalized.
    pub fn find_variable(&self, module: ModuleId, name: &str) -> Option<SymbolLocation> {
        let m = &self.modules[module];
        for (idx, scope) in m.local_scopes.iter().enumerate().rev() {
            if scope.symbols.get(name).is_some_and(|s| s.kind == SymbolKind::Var) {
                return Some(SymbolLocation::Scope(module, idx));
            }
        }
        m.symbols
            .get(name)
            .is_some_and(|s| s.kind == SymbolKind::Var)
            .then_some(SymbolLocation::Module(module))
    }

    /// Assign a variable, creating it in the innermost scope when it does
    /// not exist yet.
    pub fn set_variable(&mut self, module: ModuleId, name: &str, value: ExpressionValue) {
        let name = self.normalize(name);
        if let Some(location) = self.find_variable(module, &name) {
            if let Some(symbol) = self.symbol_at_mut(location, &name) {
                symbol.value = value;
            }
            return;
        }
        let info = SymbolInfo::var(&name, value);
        let m = &mut self.modules[module];
        match m.local_scopes.last_mut() {
            Some(scope) => scope.symbols.insert(name, info),
            None => m.symbols.insert(name, info),
        };
    }

    /// Every variable visible from `module`, innermost binding first.
    pub fn visible_variables(&self, module: ModuleId) -> IndexMap<String, ExpressionValue> {
        let mut vars = IndexMap::new();
        for id in self.ancestors(module) {
            let m = &self.modules[id];
            let tables = m
                .local_scopes
                .iter()
                .rev()
                .map(|scope| &scope.symbols)
                .chain(std::iter::once(&m.symbols));
            for table in tables {
                for (name, symbol) in table {
                    if symbol.kind == SymbolKind::Var && !vars.contains_key(name) {
                        vars.insert(name.clone(), symbol.value.clone());
                    }
                }
            }
        }
        vars
    }

    /// Find a macro definition visible from `module`.
    pub fn find_macro(&self, module: ModuleId, name: &str) -> Option<&MacroDefinition> {
        let name = self.normalize(name);
        self.ancestors(module)
            .find_map(|id| self.modules[id].macros.get(&name))
    }

    /// Find a struct definition visible from `module`.
    pub fn find_struct(&self, module: ModuleId, name: &str) -> Option<&StructDefinition> {
        let name = self.normalize(name);
        self.ancestors(module)
            .find_map(|id| self.modules[id].structs.get(&name))
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn split_field(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.rsplitn(3, '.');
    let field = parts.next()?;
    let structure = parts.next()?;
    Some((structure, field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(value: i64) -> ExpressionValue {
        ExpressionValue::Integer(value)
    }

    fn tree_with_nested() -> (ModuleTree, ModuleId) {
        let mut tree = ModuleTree::new(false);
        tree.modules[ROOT_MODULE]
            .symbols
            .insert("main".into(), SymbolInfo::label("main", int(0x8000)));
        let inner = tree.add_module(ROOT_MODULE, "gfx");
        tree.modules[inner]
            .symbols
            .insert("draw".into(), SymbolInfo::label("draw", int(0x9000)));
        tree.modules[inner]
            .symbols
            .insert("@hidden".into(), SymbolInfo::label("@hidden", int(1)));
        (tree, inner)
    }

    #[test]
    fn resolves_through_scopes_and_parents() {
        let (mut tree, inner) = tree_with_nested();
        let mut scope = SymbolScope::new(ScopeKind::Proc);
        scope.symbols.insert("main".into(), SymbolInfo::label("main", int(7)));
        tree.modules[inner].local_scopes.push(scope);
        assert_eq!(tree.resolve(inner, "MAIN", false), Some(int(7)));
        tree.modules[inner].local_scopes.clear();
        assert_eq!(tree.resolve(inner, "main", false), Some(int(0x8000)));
        assert!(tree.is_used(ROOT_MODULE, "main", false));
    }

    #[test]
    fn resolves_compound_and_global_names() {
        let (mut tree, inner) = tree_with_nested();
        assert_eq!(tree.resolve(ROOT_MODULE, "gfx.draw", false), Some(int(0x9000)));
        assert_eq!(tree.resolve(inner, "gfx.draw", true), Some(int(0x9000)));
        assert_eq!(tree.resolve(inner, "main", true), Some(int(0x8000)));
        assert_eq!(tree.resolve(ROOT_MODULE, "gfx.@hidden", false), None);
        assert_eq!(tree.resolve(inner, "@hidden", false), Some(int(1)));
    }

    #[test]
    fn local_booking_hides_outer_symbols() {
        let (mut tree, _) = tree_with_nested();
        let mut scope = SymbolScope::new(ScopeKind::Proc);
        scope.local_bookings.insert("main".into());
        tree.modules[ROOT_MODULE].local_scopes.push(scope);
        assert_eq!(tree.resolve(ROOT_MODULE, "main", false), None);
    }

    #[test]
    fn resolves_struct_fields() {
        let mut tree = ModuleTree::new(false);
        let mut fields = IndexMap::new();
        fields.insert("y".to_string(), StructField { offset: 1, is_used: false });
        tree.modules[ROOT_MODULE].structs.insert(
            "point".into(),
            StructDefinition {
                name: "point".into(),
                lines: Rc::from(Vec::new()),
                first_line: 0,
                last_line: 0,
                fields,
                size: 2,
            },
        );
        assert_eq!(tree.resolve(ROOT_MODULE, "Point.y", false), Some(int(1)));
        assert!(tree.is_used(ROOT_MODULE, "point.y", false));
    }

    #[test]
    fn variables_are_created_in_innermost_scope() {
        let mut tree = ModuleTree::new(false);
        tree.set_variable(ROOT_MODULE, "count", int(1));
        tree.modules[ROOT_MODULE]
            .local_scopes
            .push(SymbolScope::new(ScopeKind::Iteration));
        tree.set_variable(ROOT_MODULE, "count", int(2));
        tree.set_variable(ROOT_MODULE, "step", int(3));
        assert_eq!(tree.modules[ROOT_MODULE].symbols["count"].value, int(2));
        assert!(tree.modules[ROOT_MODULE].local_scopes[0].symbols.contains_key("step"));
        let vars = tree.visible_variables(ROOT_MODULE);
        assert_eq!(vars.get("step"), Some(&int(3)));
    }

    #[test]
    fn loop_counter_looks_through_temporary_scopes() {
        let mut tree = ModuleTree::new(false);
        let mut iteration = SymbolScope::new(ScopeKind::Iteration);
        iteration.loop_counter = 3;
        tree.modules[ROOT_MODULE].local_scopes.push(iteration);
        tree.modules[ROOT_MODULE]
            .local_scopes
            .push(SymbolScope::new(ScopeKind::Temporary));
        assert_eq!(tree.loop_counter(ROOT_MODULE), Some(3));
        tree.modules[ROOT_MODULE]
            .local_scopes
            .push(SymbolScope::new(ScopeKind::Proc));
        assert_eq!(tree.loop_counter(ROOT_MODULE), None);
    }
}
