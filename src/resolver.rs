use std::sync::Arc;

use crate::classfile::{FlatTypeDescriptor, TypeDescriptor};
use crate::config::{SandboxConfiguration, Whitelist};

/// Bidirectional mapping between original internal names and their sandboxed
/// counterparts. Resolution is total: names that must not move (whitelisted,
/// pinned, JVM-internal, the sandbox runtime itself and anything already
/// inside the sandbox namespace) map to themselves, everything else gains
/// the reserved prefix. Arrays are resolved element-wise.
#[derive(Debug, Clone)]
pub struct ClassNameResolver {
    prefix: Arc<str>,
    whitelist: Arc<Whitelist>,
    pinned: Arc<Vec<String>>
}

const JVM_INTERNAL_PREFIXES: [&str; 5] = ["java/", "javax/", "jdk/", "sun/", "com/sun/"];

pub fn is_jvm_internal(name: &str) -> bool {
    JVM_INTERNAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

impl ClassNameResolver {
    pub fn new(config: &SandboxConfiguration) -> ClassNameResolver {
        ClassNameResolver {
            prefix: Arc::from(config.sandbox_prefix.as_str()),
            whitelist: Arc::clone(&config.whitelist),
            pinned: Arc::new(config.pinned_classes.iter().cloned().collect())
        }
    }

    pub fn is_array(&self, name: &str) -> bool {
        name.starts_with('[')
    }

    pub fn is_descriptor(&self, name: &str) -> bool {
        name.starts_with('(') || TypeDescriptor::parse(name)
            .map(|d| d.array_dims > 0 || matches!(d.flat, FlatTypeDescriptor::Reference(_)))
            .unwrap_or(false)
    }

    fn is_passthrough(&self, name: &str) -> bool {
        name.starts_with(self.prefix.as_ref())
            || is_jvm_internal(name)
            || self.whitelist.matches(name)
            || self.pinned.iter().any(|p| p == name)
    }

    /// Maps an original internal name into the sandbox namespace. Stable
    /// within a session and idempotent.
    pub fn resolve(&self, name: &str) -> String {
        if self.is_array(name) {
            let dims = name.bytes().take_while(|&b| b == b'[').count();
            let elem = &name[dims..];

            if let Some(stripped) = strip_reference_descriptor(elem) {
                format!("{}L{};", &name[..dims], self.resolve(stripped))
            } else {
                name.to_owned()
            }
        } else if self.is_passthrough(name) {
            name.to_owned()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    /// Inverse of `resolve`; idempotent on names that are already original.
    pub fn reverse(&self, name: &str) -> String {
        if self.is_array(name) {
            let dims = name.bytes().take_while(|&b| b == b'[').count();
            let elem = &name[dims..];

            if let Some(stripped) = strip_reference_descriptor(elem) {
                format!("{}L{};", &name[..dims], self.reverse(stripped))
            } else {
                name.to_owned()
            }
        } else if let Some(stripped) = name.strip_prefix(self.prefix.as_ref()) {
            stripped.to_owned()
        } else {
            name.to_owned()
        }
    }

    /// Like `reverse`, but also accepts dotted binary names.
    pub fn reverse_normalized(&self, name: &str) -> String {
        self.reverse(&name.replace('.', "/"))
    }
}

fn strip_reference_descriptor(elem: &str) -> Option<&str> {
    if elem.starts_with('L') && elem.ends_with(';') {
        Some(&elem[1..(elem.len() - 1)])
    } else {
        None
    }
}
