use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::classfile::{parse_class_file, ClassImage};
use crate::config::SandboxConfiguration;
use crate::context::{AnalysisContext, Message, Severity, SourceLocation};
use crate::log::{Log, Phase};
use crate::log_writeln;
use crate::resolver::ClassNameResolver;
use crate::rewrite;
use crate::rules::{Analyzer, Ruleset};
use crate::source::ClassSource;
use crate::visit::{self, VisitOptions};

/// One materialized sandbox artifact. Cached by original name; never
/// evicted or mutated after insertion.
#[derive(Debug)]
pub struct LoadedClass {
    pub image: Arc<ClassImage>,
    pub bytes: Vec<u8>,
    pub is_modified: bool
}

#[derive(Debug)]
pub enum SandboxError {
    /// Analysis or fetching failed; carries the session's aggregate report.
    ClassLoading {
        class_name: String,
        messages: Vec<Message>
    },
    /// A rewritten class resolved onto a name that is already defined by a
    /// different original class.
    DefinitionCollision {
        resolved_name: String,
        original_name: String
    },
    /// Invariant breach inside the pipeline; the session is unusable.
    Internal(String)
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SandboxError::ClassLoading { ref class_name, ref messages } => {
                writeln!(f, "failed to load class {}:", class_name)?;
                for message in messages.iter() {
                    match message.location {
                        Some(ref location) => writeln!(f, "  [{}] {}: {}", message.severity, location, message.text)?,
                        None => writeln!(f, "  [{}] {}", message.severity, message.text)?
                    };
                };
                Result::Ok(())
            },
            SandboxError::DefinitionCollision { ref resolved_name, ref original_name } => {
                write!(f, "cannot define {} for {}: name is already taken", resolved_name, original_name)
            },
            SandboxError::Internal(ref text) => write!(f, "internal sandbox error: {}", text)
        }
    }
}

/// The sandbox class loader: one per session, owning the session's analysis
/// context and the artifact cache. Lookups use the original class name; a
/// cache hit short-circuits fetching, analysis and rewriting.
pub struct SandboxClassLoader {
    config: Arc<SandboxConfiguration>,
    resolver: ClassNameResolver,
    source: ClassSource,
    context: AnalysisContext,
    cache: HashMap<String, Arc<LoadedClass>>,
    defined: HashMap<String, String>,
    reference_ruleset: Ruleset
}

impl SandboxClassLoader {
    pub fn new(config: Arc<SandboxConfiguration>) -> SandboxClassLoader {
        let resolver = ClassNameResolver::new(&config);
        let source = ClassSource::from_classpath(&config.classpath);

        SandboxClassLoader {
            config,
            resolver,
            source,
            context: AnalysisContext::new(),
            cache: HashMap::new(),
            defined: HashMap::new(),
            reference_ruleset: Ruleset::empty()
        }
    }

    pub fn context(&self) -> &AnalysisContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut AnalysisContext {
        &mut self.context
    }

    pub fn config(&self) -> &SandboxConfiguration {
        &self.config
    }

    pub fn config_handle(&self) -> Arc<SandboxConfiguration> {
        Arc::clone(&self.config)
    }

    fn loading_failure(&self, class_name: &str) -> SandboxError {
        SandboxError::ClassLoading {
            class_name: class_name.to_owned(),
            messages: self.context.sorted_messages()
        }
    }

    fn fetch_bytes(&mut self, original: &str) -> Result<Vec<u8>, SandboxError> {
        match self.source.class_bytes(original) {
            Result::Ok(bytes) => Result::Ok(bytes),
            Result::Err(err) => {
                self.context.error(err.to_string(), SourceLocation::class(original));
                Result::Err(self.loading_failure(original))
            }
        }
    }

    fn parse_bytes(&mut self, original: &str, bytes: &[u8]) -> Result<(ClassImage, Vec<crate::classfile::ConstantPoolEntry>), SandboxError> {
        match parse_class_file(&mut &bytes[..]) {
            Result::Ok(parsed) => Result::Ok(parsed),
            Result::Err(err) => {
                self.context.error(
                    format!("cannot parse class file: {}", err),
                    SourceLocation::class(original)
                );
                Result::Err(self.loading_failure(original))
            }
        }
    }

    /// Loads one class through the sandbox pipeline, producing (and caching)
    /// its artifact. The same artifact is returned on every subsequent call
    /// within this session.
    pub fn load(&mut self, name: &str, log: &Log) -> Result<Arc<LoadedClass>, SandboxError> {
        let original = self.resolver.reverse_normalized(name);
        let resolved = self.resolver.resolve(&original);

        if self.resolver.reverse(&resolved) != original {
            return Result::Err(SandboxError::Internal(format!(
                "resolver asymmetry: {} resolves to {} which reverses to {}",
                original, resolved, self.resolver.reverse(&resolved)
            )));
        };

        if let Some(loaded) = self.cache.get(&original) {
            return Result::Ok(Arc::clone(loaded));
        };

        let bytes = self.fetch_bytes(&original)?;
        let (image, constant_pool) = self.parse_bytes(&original, &bytes)?;
        let image = Arc::new(image);
        self.context.register_class(Arc::clone(&image));

        if self.config.pinned_classes.contains(&original) {
            // Pinned classes are materialized through the host loader; the
            // cache contract for them is an empty byte array.
            log_writeln!(log, Phase::Load, "pinned {}", original);

            let loaded = Arc::new(LoadedClass {
                image,
                bytes: vec![],
                is_modified: false
            });
            self.cache.insert(original.clone(), Arc::clone(&loaded));
            self.defined.insert(original.clone(), original);
            return Result::Ok(loaded);
        };

        if self.config.whitelist.matches(&original) {
            log_writeln!(log, Phase::Load, "whitelisted {}", original);

            let loaded = Arc::new(LoadedClass {
                image,
                bytes,
                is_modified: false
            });
            self.cache.insert(original.clone(), Arc::clone(&loaded));
            self.defined.insert(original.clone(), original);
            return Result::Ok(loaded);
        };

        {
            let mut analyzer = Analyzer::new(&mut self.context, &self.config.rules);
            if let Result::Err(err) = visit::visit_class(&image, &constant_pool, &VisitOptions::analysis(), &mut analyzer) {
                self.context.error(err.to_string(), SourceLocation::class(&original));
                return Result::Err(self.loading_failure(&original));
            };
        };

        if self.context.error_count() > 0 {
            return Result::Err(self.loading_failure(&original));
        };

        let result = match rewrite::rewrite_class(&image, &constant_pool, &mut self.context, &self.config, &self.resolver) {
            Result::Ok(result) => result,
            Result::Err(err) => {
                return Result::Err(SandboxError::Internal(format!("rewrite of {} failed: {}", original, err)));
            }
        };

        if let Some(other) = self.defined.get(&resolved) {
            if *other != original {
                return Result::Err(SandboxError::DefinitionCollision {
                    resolved_name: resolved,
                    original_name: original
                });
            };
        };

        // The defineClass analogue: the produced bytes must themselves be a
        // parseable image.
        let materialized = match parse_class_file(&mut &result.bytes[..]) {
            Result::Ok((materialized, _)) => materialized,
            Result::Err(err) => {
                return Result::Err(SandboxError::Internal(format!(
                    "rewritten class {} does not parse: {}", resolved, err
                )));
            }
        };

        log_writeln!(log, Phase::Load, "rewrote {} as {}", original, resolved);
        self.context.info(format!("rewrote as {}", resolved), SourceLocation::class(&original));

        let loaded = Arc::new(LoadedClass {
            image: Arc::new(materialized),
            bytes: result.bytes,
            is_modified: result.modified
        });
        self.cache.insert(original.clone(), Arc::clone(&loaded));
        self.defined.insert(resolved, original);
        Result::Ok(loaded)
    }

    /// Materializes a class image for reference validation, loading it on
    /// demand and recording its outbound references. Returns `None` when the
    /// class cannot be resolved.
    pub fn resolve_image(&mut self, name: &str, origin: Option<&str>) -> Option<Arc<ClassImage>> {
        if let Some(image) = self.context.classes.get(name) {
            return Some(Arc::clone(image));
        };

        let bytes = self.source.class_bytes(name).ok()?;
        let (image, constant_pool) = parse_class_file(&mut &bytes[..]).ok()?;
        let image = Arc::new(image);

        self.context.register_class(Arc::clone(&image));
        self.context.record(
            Severity::Trace,
            format!("materialized {} for reference validation", name),
            Some(SourceLocation::class(name))
        );
        if let Some(origin) = origin {
            self.context.record_origin(name, origin);
        };

        let mut analyzer = Analyzer::new(&mut self.context, &self.reference_ruleset);
        if visit::visit_class(&image, &constant_pool, &VisitOptions::analysis(), &mut analyzer).is_err() {
            return None;
        };

        Some(image)
    }
}
