//! Process-wide table of code units, their execution records, and linked binary modules.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::dispatch::ModuleContext;
use crate::value::Exports;
use crate::wasm::ExportTable;

/// Body of a code unit. It runs at most once, on first `require`.
pub type LoaderBody = Rc<dyn Fn(&mut ModuleContext<'_>) -> anyhow::Result<()>>;

pub fn loader<F>(body: F) -> LoaderBody
where
    F: Fn(&mut ModuleContext<'_>) -> anyhow::Result<()> + 'static,
{
    Rc::new(body)
}

#[derive(Debug, Clone)]
pub(crate) struct ModuleRecord {
    pub(crate) initialized: bool,
    pub(crate) exports: Exports,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) units: HashMap<String, LoaderBody>,
    pub(crate) records: HashMap<String, ModuleRecord>,
    pub(crate) binaries: BTreeMap<String, Rc<ExportTable>>,
}

/// Handle to the registry. Clones share one set of tables.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    pub(crate) tables: Rc<RefCell<Tables>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id` unless it is already present. The first writer wins; returns whether the
    /// body was stored.
    pub fn register(&self, id: &str, body: LoaderBody) -> bool {
        let mut tables = self.tables.borrow_mut();
        if tables.units.contains_key(id) {
            tracing::trace!(unit = id, "duplicate registration ignored");
            return false;
        }
        tables.units.insert(id.to_owned(), body);
        true
    }

    /// Exports of a unit whose dispatch has started. Units that were only registered are
    /// reported as absent.
    pub fn get(&self, id: &str) -> Option<Exports> {
        self.tables
            .borrow()
            .records
            .get(id)
            .map(|record| record.exports.clone())
    }

    pub fn mark_initialized(&self, id: &str, exports: Exports) {
        self.tables.borrow_mut().records.insert(
            id.to_owned(),
            ModuleRecord {
                initialized: true,
                exports,
            },
        );
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.tables.borrow().units.contains_key(id)
    }

    pub fn is_initialized(&self, id: &str) -> bool {
        self.tables
            .borrow()
            .records
            .get(id)
            .is_some_and(|record| record.initialized)
    }

    pub fn unit_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tables.borrow().units.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn binary_exports(&self, module_id: &str) -> Option<Rc<ExportTable>> {
        self.tables.borrow().binaries.get(module_id).cloned()
    }

    pub fn binary_module_ids(&self) -> Vec<String> {
        self.tables.borrow().binaries.keys().cloned().collect()
    }

    pub(crate) fn set_binary_exports(&self, module_id: &str, table: Rc<ExportTable>) {
        self.tables
            .borrow_mut()
            .binaries
            .insert(module_id.to_owned(), table);
    }

    /// Handle for anything stored inside the registry that must reach back into it, such as
    /// instantiated binary modules and host functions.
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Rc::downgrade(&self.tables))
    }
}

#[derive(Clone)]
pub struct WeakRegistry(Weak<RefCell<Tables>>);

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakRegistry")
            .field(&(self.0.strong_count() > 0))
            .finish()
    }
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<ModuleRegistry> {
        self.0.upgrade().map(|tables| ModuleRegistry { tables })
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.borrow();
        f.debug_struct("ModuleRegistry")
            .field("units", &tables.units.len())
            .field("records", &tables.records.len())
            .field("binaries", &tables.binaries.keys().collect::<Vec<_>>())
            .finish()
    }
}
