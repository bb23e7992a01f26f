//! Structural and template fingerprints for invocation handles
//!
//! Both hashes are SHA-256 over the same ordered component list. They differ
//! only in how literals are written: the structural hash serializes the exact
//! value, the template hash writes a constant placeholder. Nested handles are
//! written as `LAZY(<their own hash>)`, never re-expanded, so a literal edit
//! deep in a tree changes structural hashes along the path to the root but
//! leaves every template hash untouched.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::call::{Amount, Arg, CallId, CallKind, LazyCall};
use crate::error::{EngineError, Result};

const LITERAL_PLACEHOLDER: &str = "LIT";

/// The two fingerprints of one invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHashes {
    /// Literal-sensitive identity (the node id)
    pub structural: String,
    /// Literal-insensitive shape identity
    pub template: String,
}

/// Feeds both hashers in lockstep
struct Fingerprint<'a> {
    structural: Sha256,
    template: Sha256,
    deps: &'a HashMap<CallId, NodeHashes>,
}

impl<'a> Fingerprint<'a> {
    fn new(deps: &'a HashMap<CallId, NodeHashes>) -> Self {
        Self {
            structural: Sha256::new(),
            template: Sha256::new(),
            deps,
        }
    }

    fn write(hasher: &mut Sha256, component: &str) {
        hasher.update((component.len() as u64).to_le_bytes());
        hasher.update(component.as_bytes());
    }

    /// A component identical in both hashes
    fn tag(&mut self, component: &str) {
        Self::write(&mut self.structural, component);
        Self::write(&mut self.template, component);
    }

    fn literal(&mut self, value: &Value) {
        let mut canonical = String::new();
        write_canonical(value, &mut canonical);
        Self::write(&mut self.structural, &canonical);
        Self::write(&mut self.template, LITERAL_PLACEHOLDER);
    }

    fn lazy(&mut self, call: &LazyCall) -> Result<()> {
        let hashes = self.deps.get(&call.id()).ok_or_else(|| {
            EngineError::InvalidGraph(format!(
                "dependency {:?} was not hashed before its consumer",
                call
            ))
        })?;
        Self::write(&mut self.structural, &format!("LAZY({})", hashes.structural));
        Self::write(&mut self.template, &format!("LAZY({})", hashes.template));
        Ok(())
    }

    fn arg(&mut self, arg: &Arg) -> Result<()> {
        match arg {
            Arg::Literal(v) => self.literal(v),
            Arg::Unserializable(type_name) => {
                self.tag(&format!("UNSERIALIZABLE({})", type_name));
            }
            Arg::Opaque(o) => self.tag(&format!("UNSERIALIZABLE({})", o.type_name())),
            Arg::Call(c) => self.lazy(c)?,
            Arg::List(items) => {
                self.tag("[");
                for item in items {
                    self.arg(item)?;
                }
                self.tag("]");
            }
            Arg::Map(entries) => self.arg_map(entries)?,
            Arg::Router(router) => {
                self.tag("ROUTER(");
                self.lazy(&router.selector)?;
                for (key, call) in &router.routes {
                    self.tag(&format!("route:{}", key));
                    self.lazy(call)?;
                }
                if let Some(default) = &router.default {
                    self.tag("default");
                    self.lazy(default)?;
                }
                self.tag(")");
            }
            Arg::Inject(name) => self.tag(&format!("INJECT({})", name)),
        }
        Ok(())
    }

    fn arg_map(&mut self, entries: &BTreeMap<String, Arg>) -> Result<()> {
        self.tag("{");
        for (key, arg) in entries {
            self.tag(&format!("key:{}", key));
            self.arg(arg)?;
        }
        self.tag("}");
        Ok(())
    }

    fn finish(self) -> NodeHashes {
        NodeHashes {
            structural: format!("{:x}", self.structural.finalize()),
            template: format!("{:x}", self.template.finalize()),
        }
    }
}

/// Hash an invocation whose dependencies are already hashed in `deps`
pub fn hash_call(call: &LazyCall, deps: &HashMap<CallId, NodeHashes>) -> Result<NodeHashes> {
    let mut fp = Fingerprint::new(deps);

    match call.kind() {
        CallKind::Task { task, args, kwargs } => {
            fp.tag("kind:task");
            fp.tag(&format!("task:{}", task.name()));
            fp.tag("args[");
            for arg in args {
                fp.arg(arg)?;
            }
            fp.tag("]");
            fp.tag("kwargs");
            fp.arg_map(kwargs)?;
        }
        CallKind::Map {
            task,
            mapped,
            fixed,
        } => {
            fp.tag("kind:map");
            fp.tag(&format!("task:{}", task.name()));
            fp.tag("mapped");
            fp.arg_map(mapped)?;
            fp.tag("fixed");
            fp.arg_map(fixed)?;
        }
        CallKind::Parameter { name, default } => {
            fp.tag("kind:param");
            fp.tag(&format!("param:{}", name));
            match default {
                Some(v) => fp.literal(v),
                None => fp.tag("nodefault"),
            }
        }
    }

    let policy = call.policy();
    fp.tag(&match &policy.retry {
        Some(r) => r.summary(),
        None => "retry:-".to_string(),
    });
    fp.tag(&match &policy.cache {
        Some(c) => format!("cache:{}", c.name()),
        None => "cache:-".to_string(),
    });
    // Static amounts are literals: exact in the structural hash, placeholder in the template.
    for (name, amount) in &policy.resources {
        fp.tag(&format!("res:{}", name));
        match amount {
            Amount::Static(n) => fp.literal(&Value::from(*n)),
            Amount::Dynamic(c) => fp.lazy(c)?,
        }
    }
    if let Some(c) = &policy.condition {
        fp.tag("cond");
        fp.lazy(c)?;
    }
    if !policy.after.is_empty() {
        fp.tag("after[");
        for c in &policy.after {
            fp.lazy(c)?;
        }
        fp.tag("]");
    }
    if let Some(c) = &policy.jump {
        fp.tag("jump");
        fp.lazy(c)?;
    }

    Ok(fp.finish())
}

/// Hex SHA-256 of a value's canonical JSON form
pub fn hash_value(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// JSON text with object keys sorted, independent of map ordering features
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
