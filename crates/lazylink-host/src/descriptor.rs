//! Chunk descriptors: the on-disk form of a chunk script.
//!
//! ```json
//! { "chunk_ids": ["0"],
//!   "units": [
//!     { "id": "../pkg/app_bg.js", "kind": "host_interface" },
//!     { "id": "../pkg/app_bg.wasm", "kind": "binary_exports", "module": "../pkg/app_bg.wasm" },
//!     { "id": "./index.js", "kind": "invoke", "requires": ["../pkg/app_bg.js"],
//!       "target": "../pkg/app_bg.wasm", "function": "run" } ] }
//! ```

use std::rc::Rc;

use anyhow::{Context, Result};
use lazylink_runtime::{loader, ChunkDelivery, LoaderBody, Value};
use serde::{Deserialize, Serialize};

use crate::surface::HostSurface;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChunkDescriptor {
    pub chunk_ids: Vec<String>,
    #[serde(default)]
    pub units: Vec<UnitDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UnitDescriptor {
    pub id: String,
    #[serde(flatten)]
    pub kind: UnitKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    /// Exports the host surface functions.
    HostInterface,
    /// Re-exports every function of a linked binary module.
    BinaryExports { module: String },
    /// Requires `requires` in order, then calls `function` of `target` and stores the first
    /// result under `result`.
    Invoke {
        #[serde(default)]
        requires: Vec<String>,
        target: String,
        function: String,
        #[serde(default)]
        args: Vec<serde_json::Value>,
    },
}

impl ChunkDescriptor {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let descriptor: ChunkDescriptor =
            serde_json::from_slice(bytes).context("parse chunk descriptor JSON")?;
        if descriptor.chunk_ids.is_empty() {
            anyhow::bail!("chunk descriptor lists no chunk ids");
        }
        Ok(descriptor)
    }

    pub fn into_delivery(self, surface: &Rc<HostSurface>) -> Result<ChunkDelivery> {
        let mut delivery = ChunkDelivery::new(self.chunk_ids);
        for unit in self.units {
            let body = unit
                .kind
                .into_body(surface)
                .with_context(|| format!("unit {:?}", unit.id))?;
            delivery = delivery.unit(&unit.id, body);
        }
        Ok(delivery)
    }
}

impl UnitKind {
    fn into_body(self, surface: &Rc<HostSurface>) -> Result<LoaderBody> {
        Ok(match self {
            UnitKind::HostInterface => {
                let surface = Rc::clone(surface);
                loader(move |ctx| {
                    surface.install(ctx);
                    Ok(())
                })
            }
            UnitKind::BinaryExports { module } => loader(move |ctx| {
                let table = ctx
                    .binary_exports(&module)
                    .with_context(|| format!("binary module {module:?} is not linked"))?;
                for name in table.names() {
                    if let Some(f) = table.host_fn(&name) {
                        ctx.exports().set(&name, Value::Function(f));
                    }
                }
                ctx.exports().mark_es_module();
                Ok(())
            }),
            UnitKind::Invoke {
                requires,
                target,
                function,
                args,
            } => {
                let args = args
                    .iter()
                    .map(json_to_value)
                    .collect::<Result<Vec<_>>>()
                    .context("invoke arguments")?;
                loader(move |ctx| {
                    for dep in &requires {
                        ctx.require(dep)?;
                    }
                    let exports = ctx.require(&target)?;
                    let out = exports
                        .call(&function, &args)
                        .with_context(|| format!("call {target}::{function}"))?;
                    ctx.exports()
                        .set("result", out.into_iter().next().unwrap_or_default());
                    Ok(())
                })
            }
        })
    }
}

fn json_to_value(json: &serde_json::Value) -> Result<Value> {
    Ok(match json {
        serde_json::Value::Null => Value::Undefined,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64().map(i32::try_from) {
            Some(Ok(v)) => Value::I32(v),
            Some(Err(_)) => Value::I64(n.as_i64().unwrap_or_default()),
            None => Value::F64(n.as_f64().context("number out of range")?),
        },
        serde_json::Value::String(s) => Value::str(s),
        other => anyhow::bail!("unsupported argument {other}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_parses_every_unit_kind() {
        let d = ChunkDescriptor::from_json(
            br#"{ "chunk_ids": ["0"], "units": [
                { "id": "host", "kind": "host_interface" },
                { "id": "bin", "kind": "binary_exports", "module": "a.wasm" },
                { "id": "main", "kind": "invoke", "target": "bin", "function": "run", "args": [1, 2.5, "x"] }
            ] }"#,
        )
        .unwrap();
        assert_eq!(d.units.len(), 3);
        assert_eq!(d.units[0].kind, UnitKind::HostInterface);
        assert_eq!(
            d.units[1].kind,
            UnitKind::BinaryExports {
                module: "a.wasm".to_string()
            }
        );
        let UnitKind::Invoke { requires, args, .. } = &d.units[2].kind else {
            panic!("expected invoke, got {:?}", d.units[2].kind);
        };
        assert!(requires.is_empty());
        assert_eq!(args.len(), 3);
    }

    #[test]
    fn unknown_kind_and_empty_chunk_ids_are_rejected() {
        assert!(ChunkDescriptor::from_json(br#"{ "chunk_ids": ["0"], "units": [{ "id": "x", "kind": "eval" }] }"#).is_err());
        assert!(ChunkDescriptor::from_json(br#"{ "chunk_ids": [] }"#).is_err());
    }

    #[test]
    fn json_arguments_map_to_values() {
        assert_eq!(json_to_value(&serde_json::json!(7)).unwrap(), Value::I32(7));
        assert_eq!(
            json_to_value(&serde_json::json!(1u64 << 40)).unwrap(),
            Value::I64(1 << 40)
        );
        assert_eq!(json_to_value(&serde_json::json!(0.5)).unwrap(), Value::F64(0.5));
        assert_eq!(json_to_value(&serde_json::json!("s")).unwrap(), Value::str("s"));
        assert!(json_to_value(&serde_json::json!([1])).is_err());
    }
}
