//! Interned identifier and metadata string tables.
//!
//! All identifiers (types, methods, globals, fields) share one table with
//! cross-kind uniqueness: a name carries the kind of entity it is bound to,
//! and rebinding it to a different kind is an error at the call sites that
//! check [`NameTable::lookup`].

use std::collections::HashMap;

use kiln_types::{MetaId, MethodId, NameId, RawIndex, TypeId};

/// What an interned identifier is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Bound to a type.
    Type(TypeId),
    /// Bound to a method.
    Method(MethodId),
    /// Bound to entry `n` of the global data table.
    Global(RawIndex),
    /// Bound to entry `n` of the constant data table.
    Constant(RawIndex),
    /// Interned but not bound to anything yet.
    Identifier,
}

/// Interning table of identifiers with their bindings.
#[derive(Debug, Default, Clone)]
pub struct NameTable {
    names: Vec<String>,
    lookups: Vec<Lookup>,
    index: HashMap<String, NameId>,
}

impl NameTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Interns `name`, binding it as a plain identifier when new.
    pub fn intern(&mut self, name: &str) -> NameId {
        self.intern_with(name, Lookup::Identifier)
    }

    /// Interns `name` with an initial binding. An existing entry keeps its
    /// current binding.
    pub fn intern_with(&mut self, name: &str, lookup: Lookup) -> NameId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = NameId::new(self.names.len() as RawIndex);
        self.names.push(name.to_owned());
        self.lookups.push(lookup);
        self.index.insert(name.to_owned(), id);
        id
    }

    /// Id of `name` if it has been interned.
    pub fn find(&self, name: &str) -> Option<NameId> {
        self.index.get(name).copied()
    }

    /// The interned string.
    pub fn name(&self, id: NameId) -> &str {
        &self.names[id.index()]
    }

    /// The interned string, or a placeholder for the invalid id.
    pub fn name_or(&self, id: NameId, fallback: &'static str) -> &str {
        if id.is_valid() && id.index() < self.names.len() {
            self.name(id)
        } else {
            fallback
        }
    }

    /// Current binding of an interned name.
    pub fn lookup(&self, id: NameId) -> Lookup {
        self.lookups[id.index()]
    }

    /// Rebinds an interned name.
    pub fn bind(&mut self, id: NameId, lookup: Lookup) {
        self.lookups[id.index()] = lookup;
    }

    /// Whether `id` is inside the table.
    pub fn is_valid(&self, id: NameId) -> bool {
        id.index() < self.names.len()
    }

    /// Iterates names in intern order.
    pub fn iter(&self) -> impl Iterator<Item = (NameId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (NameId::new(i as RawIndex), name.as_str()))
    }
}

/// Interning table of metadata strings (source file names).
#[derive(Debug, Default, Clone)]
pub struct MetaTable {
    entries: Vec<String>,
    index: HashMap<String, MetaId>,
}

impl MetaTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Interns a metadata string.
    pub fn intern(&mut self, value: &str) -> MetaId {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = MetaId::new(self.entries.len() as RawIndex);
        self.entries.push(value.to_owned());
        self.index.insert(value.to_owned(), id);
        id
    }

    /// Id of `value` if it has been interned.
    pub fn find(&self, value: &str) -> Option<MetaId> {
        self.index.get(value).copied()
    }

    /// The interned string, if `id` is valid.
    pub fn get(&self, id: MetaId) -> Option<&str> {
        if id.is_valid() {
            self.entries.get(id.index()).map(String::as_str)
        } else {
            None
        }
    }

    /// Iterates strings in intern order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut table = NameTable::new();
        let a = table.intern("Vector");
        let b = table.intern("Vector");
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
        assert_eq!(table.name(a), "Vector");
    }

    #[test]
    fn bindings_are_per_name() {
        let mut table = NameTable::new();
        let ty = table.intern_with("Vector", Lookup::Type(TypeId::new(12)));
        let id = table.intern("main");
        assert_eq!(table.lookup(ty), Lookup::Type(TypeId::new(12)));
        assert_eq!(table.lookup(id), Lookup::Identifier);
        table.bind(id, Lookup::Method(MethodId::new(0)));
        assert_eq!(table.lookup(id), Lookup::Method(MethodId::new(0)));
    }

    #[test]
    fn meta_table_round_trip() {
        let mut table = MetaTable::new();
        let id = table.intern("lib.kln");
        assert_eq!(table.intern("lib.kln"), id);
        assert_eq!(table.get(id), Some("lib.kln"));
        assert_eq!(table.get(MetaId::INVALID), None);
    }
}
