use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::classfile::MethodFlags;
use crate::emitters::{self, Emitter};
use crate::providers::{self, DefinitionProvider};
use crate::rules::{self, Ruleset};

/// Reserved namespace prefix for rewritten classes.
pub const SANDBOX_PREFIX: &str = "sandbox/";

/// Stable fully-qualified contract of the injected instrumentation runtime.
pub const RUNTIME_COST_ACCOUNTER: &str = "sandbox/runtime/RuntimeCostAccounter";
pub const RULE_VIOLATION_EXCEPTION: &str = "sandbox/runtime/RuleViolationException";
pub const THRESHOLD_VIOLATION_EXCEPTION: &str = "sandbox/runtime/ThresholdViolationException";
pub const THREAD_DEATH: &str = "java/lang/ThreadDeath";

pub const DETERMINISTIC_ANNOTATION: &str = "Lsandbox/annotations/Deterministic;";
pub const NONDETERMINISTIC_ANNOTATION: &str = "Lsandbox/annotations/NonDeterministic;";

/// Class names that are passed through untouched and assumed deterministic.
/// Exact entries name single classes; prefix entries end with `/`. The
/// namespaces are broader zones whose members are only acceptable when they
/// carry the deterministic marker annotation.
#[derive(Debug, Clone)]
pub struct Whitelist {
    exacts: HashSet<String>,
    prefixes: Vec<String>,
    namespaces: Vec<String>
}

impl Whitelist {
    pub fn empty() -> Whitelist {
        Whitelist {
            exacts: HashSet::new(),
            prefixes: vec![],
            namespaces: vec![]
        }
    }

    /// Matches every name; nothing is rewritten or rejected.
    pub fn everything() -> Whitelist {
        let mut whitelist = Whitelist::empty();
        whitelist.prefixes.push(String::new());
        whitelist
    }

    /// The minimal deterministic core of the platform library.
    pub fn minimal() -> Whitelist {
        let mut whitelist = Whitelist::empty();

        for entry in [
            "java/lang/Object",
            "java/lang/String",
            "java/lang/StringBuilder",
            "java/lang/CharSequence",
            "java/lang/Comparable",
            "java/lang/Iterable",
            "java/lang/Math",
            "java/lang/Number",
            "java/lang/Boolean",
            "java/lang/Byte",
            "java/lang/Character",
            "java/lang/Short",
            "java/lang/Integer",
            "java/lang/Long",
            "java/lang/Float",
            "java/lang/Double",
            "java/lang/Throwable",
            "java/lang/Exception",
            "java/lang/RuntimeException",
            "java/lang/IllegalArgumentException",
            "java/lang/IllegalStateException",
            "java/lang/IndexOutOfBoundsException",
            "java/lang/NullPointerException",
            "java/lang/ArithmeticException",
            "java/lang/ClassCastException",
            "java/lang/UnsupportedOperationException",
            "java/lang/Error",
            "java/lang/StackOverflowError",
            "java/lang/OutOfMemoryError",
            "sandbox/runtime/",
            "sandbox/annotations/"
        ].iter() {
            whitelist.add(entry);
        };

        whitelist.add_namespace("java/");
        whitelist
    }

    /// Adds an exact entry, or a prefix entry when the name ends with `/`.
    pub fn add(&mut self, entry: &str) {
        if entry.ends_with('/') {
            self.prefixes.push(entry.to_owned());
        } else {
            self.exacts.insert(entry.to_owned());
        };
    }

    pub fn add_namespace(&mut self, namespace: &str) {
        self.namespaces.push(namespace.to_owned());
    }

    pub fn matches(&self, name: &str) -> bool {
        self.exacts.contains(name) || self.prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }

    pub fn in_namespace(&self, name: &str) -> bool {
        self.namespaces.iter().any(|p| name.starts_with(p.as_str()))
    }
}

/// Per-category cost weights and the execution threshold the injected
/// runtime enforces. A category with cost 0 is not instrumented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub allocation_cost: u64,
    pub invocation_cost: u64,
    pub jump_cost: u64,
    pub throw_cost: u64,
    pub threshold_per_category: u64
}

impl Default for ExecutionProfile {
    fn default() -> ExecutionProfile {
        ExecutionProfile {
            allocation_cost: 1,
            invocation_cost: 1,
            jump_cost: 1,
            throw_cost: 1,
            threshold_per_category: 1_000_000
        }
    }
}

impl ExecutionProfile {
    /// A profile that disables all instrumentation; useful for tests that
    /// only exercise remapping.
    pub fn unmetered() -> ExecutionProfile {
        ExecutionProfile {
            allocation_cost: 0,
            invocation_cost: 0,
            jump_cost: 0,
            throw_cost: 0,
            threshold_per_category: 0
        }
    }
}

/// Immutable policy for one sandbox session: where classes come from, what
/// is passed through, and the ordered rule, provider and emitter chains.
pub struct SandboxConfiguration {
    pub classpath: Vec<PathBuf>,
    pub whitelist: Arc<Whitelist>,
    pub pinned_classes: HashSet<String>,
    pub rules: Ruleset,
    pub definition_providers: Vec<Box<dyn DefinitionProvider>>,
    pub emitters: Vec<Box<dyn Emitter>>,
    pub profile: ExecutionProfile,
    pub sandbox_prefix: String,
    pub deterministic_annotation: String,
    pub nondeterministic_annotation: String,
    pub access_mask: MethodFlags
}

impl Default for SandboxConfiguration {
    fn default() -> SandboxConfiguration {
        SandboxConfiguration {
            classpath: vec![],
            whitelist: Arc::new(Whitelist::minimal()),
            pinned_classes: HashSet::new(),
            rules: rules::mandatory_ruleset(),
            definition_providers: providers::default_providers(),
            emitters: emitters::default_emitters(),
            profile: ExecutionProfile::default(),
            sandbox_prefix: String::from(SANDBOX_PREFIX),
            deterministic_annotation: String::from(DETERMINISTIC_ANNOTATION),
            nondeterministic_annotation: String::from(NONDETERMINISTIC_ANNOTATION),
            access_mask: MethodFlags::SYNCHRONIZED
        }
    }
}

impl SandboxConfiguration {
    pub fn with_classpath(classpath: Vec<PathBuf>) -> SandboxConfiguration {
        SandboxConfiguration {
            classpath,
            ..SandboxConfiguration::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whitelist_exact_and_prefix() {
        let mut whitelist = Whitelist::empty();

        whitelist.add("java/lang/Object");
        whitelist.add("sandbox/runtime/");

        assert!(whitelist.matches("java/lang/Object"));
        assert!(whitelist.matches("sandbox/runtime/RuntimeCostAccounter"));
        assert!(!whitelist.matches("java/lang/Objection"));
        assert!(!whitelist.matches("java/util/List"));
    }

    #[test]
    fn test_whitelist_everything_matches_all() {
        assert!(Whitelist::everything().matches("com/example/Anything"));
        assert!(Whitelist::everything().matches("java/util/Random"));
    }

    #[test]
    fn test_whitelist_namespace_is_not_a_match() {
        let whitelist = Whitelist::minimal();

        assert!(whitelist.in_namespace("java/util/Random"));
        assert!(!whitelist.matches("java/util/Random"));
    }

    #[test]
    fn test_default_profile_meters_everything() {
        let profile = ExecutionProfile::default();

        assert!(profile.allocation_cost > 0);
        assert!(profile.invocation_cost > 0);
        assert!(profile.jump_cost > 0);
        assert!(profile.throw_cost > 0);
    }
}
