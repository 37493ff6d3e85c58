use std::rc::Rc;

use crate::error::LoadError;
use crate::registry::{ModuleRecord, ModuleRegistry};
use crate::value::Exports;
use crate::wasm::ExportTable;

/// What a running loader body sees.
pub struct ModuleContext<'a> {
    registry: &'a ModuleRegistry,
    id: &'a str,
    exports: Exports,
}

impl<'a> ModuleContext<'a> {
    pub fn id(&self) -> &str {
        self.id
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Replaces the exports object. Units that already required this one during a cycle keep
    /// the object they were handed.
    pub fn replace_exports(&mut self, exports: Exports) {
        self.registry.publish_partial(self.id, &exports);
        self.exports = exports;
    }

    pub fn require(&self, id: &str) -> Result<Exports, LoadError> {
        self.registry.require(id)
    }

    pub fn binary_exports(&self, module_id: &str) -> Option<Rc<ExportTable>> {
        self.registry.binary_exports(module_id)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        self.registry
    }
}

impl ModuleRegistry {
    /// Returns the exports of `id`, running its loader body on first use.
    ///
    /// A unit whose body is still running (a cyclic require) yields its partial exports.
    pub fn require(&self, id: &str) -> Result<Exports, LoadError> {
        let body = {
            let tables = self.tables.borrow();
            if let Some(record) = tables.records.get(id) {
                return Ok(record.exports.clone());
            }
            match tables.units.get(id) {
                Some(body) => body.clone(),
                None => return Err(LoadError::unregistered(id)),
            }
        };

        let exports = Exports::new();
        self.tables.borrow_mut().records.insert(
            id.to_owned(),
            ModuleRecord {
                initialized: false,
                exports: exports.clone(),
            },
        );

        tracing::trace!(unit = id, "executing code unit");
        let mut ctx = ModuleContext {
            registry: self,
            id,
            exports,
        };
        if let Err(err) = body(&mut ctx) {
            let detail = format!("{err:#}");
            tracing::debug!(unit = id, error = %detail, "code unit failed");
            return Err(LoadError::execution(id, &err));
        }

        let exports = ctx.exports;
        self.mark_initialized(id, exports.clone());
        Ok(exports)
    }

    fn publish_partial(&self, id: &str, exports: &Exports) {
        if let Some(record) = self.tables.borrow_mut().records.get_mut(id) {
            record.exports = exports.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::LoadErrorKind;
    use crate::registry::loader;
    use crate::value::Value;

    #[test]
    fn body_runs_once_and_exports_are_cached() {
        let registry = ModuleRegistry::new();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        registry.register(
            "./a.js",
            loader(move |ctx| {
                counter.set(counter.get() + 1);
                ctx.exports().set("n", Value::I32(1));
                Ok(())
            }),
        );

        let first = registry.require("./a.js").unwrap();
        let second = registry.require("./a.js").unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(runs.get(), 1);
        assert!(registry.is_initialized("./a.js"));
    }

    #[test]
    fn missing_loader_is_an_unregistered_dependency() {
        let registry = ModuleRegistry::new();
        let err = registry.require("./nope.js").unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::UnregisteredDependency);
        assert_eq!(err.resource(), "./nope.js");
        assert!(registry.get("./nope.js").is_none());
    }

    #[test]
    fn cyclic_require_sees_partial_exports() {
        let registry = ModuleRegistry::new();
        registry.register(
            "a",
            loader(|ctx| {
                ctx.exports().set("before", Value::I32(1));
                let b = ctx.require("b")?;
                ctx.exports().set("after", Value::I32(2));
                ctx.exports().set("b", Value::Object(b));
                Ok(())
            }),
        );
        registry.register(
            "b",
            loader(|ctx| {
                let a = ctx.require("a")?;
                ctx.exports().set("saw_before", Value::Bool(a.contains("before")));
                ctx.exports().set("saw_after", Value::Bool(a.contains("after")));
                ctx.exports().set("a", Value::Object(a));
                Ok(())
            }),
        );

        let a = registry.require("a").unwrap();
        let b = registry.require("b").unwrap();
        assert_eq!(b.get("saw_before"), Some(Value::Bool(true)));
        assert_eq!(b.get("saw_after"), Some(Value::Bool(false)));
        // b kept a reference to the object that a went on to finish populating.
        let seen = b.get("a").and_then(|v| v.as_object().cloned()).unwrap();
        assert!(seen.ptr_eq(&a));
        assert!(seen.contains("after"));
    }

    #[test]
    fn failing_body_is_not_rerun() {
        let registry = ModuleRegistry::new();
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        registry.register(
            "bad",
            loader(move |ctx| {
                counter.set(counter.get() + 1);
                ctx.exports().set("partial", Value::Bool(true));
                anyhow::bail!("boom")
            }),
        );

        let err = registry.require("bad").unwrap_err();
        assert_eq!(err.kind(), LoadErrorKind::ExecutionError);
        assert!(err.message().contains("boom"));

        let partial = registry.require("bad").unwrap();
        assert_eq!(partial.get("partial"), Some(Value::Bool(true)));
        assert_eq!(runs.get(), 1);
        assert!(!registry.is_initialized("bad"));
    }

    #[test]
    fn replaced_exports_become_the_cached_object() {
        let registry = ModuleRegistry::new();
        let replacement = Exports::new();
        replacement.set("kind", Value::str("replaced"));
        let handle = replacement.clone();
        registry.register(
            "r",
            loader(move |ctx| {
                ctx.replace_exports(handle.clone());
                Ok(())
            }),
        );
        let got = registry.require("r").unwrap();
        assert!(got.ptr_eq(&replacement));
        assert!(registry.require("r").unwrap().ptr_eq(&replacement));
    }
}
