use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::classfile::ClassImage;
use crate::context::{EntityReference, Message, SourceLocation};
use crate::loader::SandboxClassLoader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    NonExistentClass,
    NonExistentMember,
    NotWhitelisted,
    Annotated,
    InvalidClass
}

/// Why a referenced entity was judged non-deterministic.
#[derive(Debug, Clone)]
pub struct Reason {
    pub code: ReasonCode,
    pub detail: String
}

impl Reason {
    fn new(code: ReasonCode, detail: String) -> Reason {
        Reason { code, detail }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.code {
            ReasonCode::NonExistentClass => write!(f, "class {} does not exist", self.detail),
            ReasonCode::NonExistentMember => write!(f, "member {} does not exist", self.detail),
            ReasonCode::NotWhitelisted => write!(f, "{} is inside the whitelisted namespace but is not whitelisted", self.detail),
            ReasonCode::Annotated => write!(f, "{} is annotated as non-deterministic", self.detail),
            ReasonCode::InvalidClass => write!(f, "depends on non-deterministic classes: {}", self.detail)
        }
    }
}

/// The aggregate outcome of a validation run.
pub struct ReferenceValidationSummary {
    pub classes: Vec<String>,
    pub messages: Vec<Message>,
    pub class_origins: HashMap<String, String>
}

#[derive(Clone)]
enum Mark {
    Pending,
    Ok,
    Bad(Reason)
}

/// Transitive fixed point over the reference set recorded during analysis.
/// Classes are loaded on demand; ancestors are always walked; marks are
/// computed post-order so cyclic references terminate. Validation keeps
/// going after a failure so that every offender is enumerated.
pub struct ReferenceValidator<'a> {
    loader: &'a mut SandboxClassLoader,
    marks: HashMap<String, Mark>
}

impl <'a> ReferenceValidator<'a> {
    pub fn new(loader: &'a mut SandboxClassLoader) -> ReferenceValidator<'a> {
        ReferenceValidator {
            loader,
            marks: HashMap::new()
        }
    }

    pub fn validate(&mut self) -> ReferenceValidationSummary {
        let mut queue: VecDeque<(EntityReference, SourceLocation)> =
            self.loader.context().references.iter().cloned().collect();

        while let Some((reference, location)) = queue.pop_front() {
            if let Result::Err(reason) = self.check_reference(&reference, &location) {
                self.loader.context_mut().error(
                    format!("Non-deterministic reference to {}: {}", reference, reason),
                    location
                );
            };
        };

        let context = self.loader.context();

        ReferenceValidationSummary {
            classes: context.classes.keys().cloned().sorted().collect(),
            messages: context.sorted_messages(),
            class_origins: context.class_origins.clone()
        }
    }

    fn whitelist_accepts(&self, name: &str) -> bool {
        self.loader.config().whitelist.matches(name)
    }

    fn check_reference(&mut self, reference: &EntityReference, location: &SourceLocation) -> Result<(), Reason> {
        if self.whitelist_accepts(reference.class_name()) {
            return Result::Ok(());
        };

        match *reference {
            EntityReference::Class { ref class_name } => {
                self.check_class(class_name, &location.class_name)
            },
            EntityReference::Member { ref class_name, ref member_name, ref descriptor } => {
                self.check_member(class_name, member_name, descriptor, &location.class_name)
            }
        }
    }

    fn check_class(&mut self, name: &str, origin: &str) -> Result<(), Reason> {
        if self.whitelist_accepts(name) {
            return Result::Ok(());
        };

        match self.marks.get(name) {
            Some(&Mark::Ok) => return Result::Ok(()),
            Some(&Mark::Bad(ref reason)) => return Result::Err(reason.clone()),
            // A cycle back into a class currently being evaluated; the
            // post-order mark settles it.
            Some(&Mark::Pending) => return Result::Ok(()),
            None => {}
        };
        self.marks.insert(name.to_owned(), Mark::Pending);

        let result = self.evaluate_class(name, origin);

        let mark = match result {
            Result::Ok(()) => Mark::Ok,
            Result::Err(ref reason) => Mark::Bad(reason.clone())
        };
        self.marks.insert(name.to_owned(), mark);

        result
    }

    fn evaluate_class(&mut self, name: &str, origin: &str) -> Result<(), Reason> {
        let image = match self.loader.resolve_image(name, Some(origin)) {
            Some(image) => image,
            None => {
                return Result::Err(Reason::new(ReasonCode::NonExistentClass, name.to_owned()));
            }
        };

        let config = self.loader.config_handle();
        if image.has_annotation(&config.nondeterministic_annotation) {
            return Result::Err(Reason::new(ReasonCode::Annotated, format!("class {}", name)));
        };

        if config.whitelist.in_namespace(name)
            && !config.whitelist.matches(name)
            && !image.has_annotation(&config.deterministic_annotation) {
            return Result::Err(Reason::new(ReasonCode::NotWhitelisted, format!("class {}", name)));
        };

        let mut offenders = vec![];

        if let Some(ref super_name) = image.super_name {
            if self.check_class(super_name, name).is_err() {
                offenders.push(super_name.to_string());
            };
        };
        for iface in image.interfaces.iter() {
            if self.check_class(iface, name).is_err() {
                offenders.push(iface.to_string());
            };
        };

        for referenced in self.outbound_class_names(name, None) {
            if self.check_class(&referenced, name).is_err() && !offenders.contains(&referenced) {
                offenders.push(referenced);
            };
        };

        if offenders.is_empty() {
            Result::Ok(())
        } else {
            Result::Err(Reason::new(ReasonCode::InvalidClass, offenders.join(", ")))
        }
    }

    fn check_member(&mut self, class_name: &str, member_name: &str, descriptor: &str, origin: &str) -> Result<(), Reason> {
        let dotted = format!("{}.{}{}", class_name.replace('/', "."), member_name, descriptor);

        if self.loader.resolve_image(class_name, Some(origin)).is_none() {
            return Result::Err(Reason::new(ReasonCode::NonExistentClass, class_name.to_owned()));
        };

        let (declaring, annotations) = match self.find_member(class_name, member_name, descriptor) {
            Some(found) => found,
            None => {
                return Result::Err(Reason::new(ReasonCode::NonExistentMember, dotted));
            }
        };

        let config = self.loader.config_handle();
        if annotations.iter().any(|a| a.as_ref() == config.nondeterministic_annotation) {
            return Result::Err(Reason::new(ReasonCode::Annotated, dotted));
        };

        if config.whitelist.in_namespace(&declaring)
            && !config.whitelist.matches(&declaring)
            && !annotations.iter().any(|a| a.as_ref() == config.deterministic_annotation) {
            return Result::Err(Reason::new(ReasonCode::NotWhitelisted, dotted));
        };

        let mut offenders = vec![];
        for referenced in self.outbound_class_names(&declaring, Some(member_name)) {
            if self.check_class(&referenced, &declaring).is_err() && !offenders.contains(&referenced) {
                offenders.push(referenced);
            };
        };

        if offenders.is_empty() {
            Result::Ok(())
        } else {
            Result::Err(Reason::new(ReasonCode::InvalidClass, offenders.join(", ")))
        }
    }

    /// Locates a member by name and signature in the class or its ancestors.
    /// Returns the declaring class and the member's annotations.
    fn find_member(&mut self, class_name: &str, member_name: &str, descriptor: &str) -> Option<(String, Vec<Arc<str>>)> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(class_name.to_owned());

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            };

            let image: Arc<ClassImage> = match self.loader.resolve_image(&current, Some(class_name)) {
                Some(image) => image,
                None => continue
            };

            if let Some(method) = image.find_method(member_name, descriptor) {
                return Some((current, method.annotations.clone()));
            };
            if let Some(field) = image.find_field(member_name, descriptor) {
                return Some((current, field.annotations.clone()));
            };

            if let Some(ref super_name) = image.super_name {
                queue.push_back(super_name.to_string());
            };
            for iface in image.interfaces.iter() {
                queue.push_back(iface.to_string());
            };
        };

        None
    }

    /// Class names referenced from the given class, optionally narrowed to
    /// one member's outbound references.
    fn outbound_class_names(&self, class_name: &str, member_name: Option<&str>) -> Vec<String> {
        let mut names = vec![];

        for &(ref reference, ref location) in self.loader.context().references.iter() {
            if location.class_name != class_name {
                continue;
            };
            if let Some(member_name) = member_name {
                if location.member_name.as_deref() != Some(member_name) {
                    continue;
                };
            };

            let name = reference.class_name().to_owned();
            if !names.contains(&name) {
                names.push(name);
            };
        };

        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{
        SandboxConfiguration, DETERMINISTIC_ANNOTATION, NONDETERMINISTIC_ANNOTATION
    };
    use crate::test_util::{annotated_image, mock_image, mock_method};

    fn loader_with(config: SandboxConfiguration, images: Vec<ClassImage>) -> SandboxClassLoader {
        let mut loader = SandboxClassLoader::new(Arc::new(config));

        for image in images {
            loader.context_mut().register_class(Arc::new(image));
        };

        loader
    }

    fn class_ref(class_name: &str, from: &str) -> (EntityReference, SourceLocation) {
        (
            EntityReference::Class { class_name: class_name.to_owned() },
            SourceLocation::class(from)
        )
    }

    #[test]
    fn test_whitelisted_reference_is_accepted() {
        let mut loader = loader_with(SandboxConfiguration::default(), vec![]);
        let reference = class_ref("java/lang/StringBuilder", "com/example/A");
        loader.context_mut().references.push(reference);

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert_eq!(0, summary.messages.iter().filter(|m| m.severity == crate::context::Severity::Error).count());
    }

    #[test]
    fn test_unresolvable_class_is_reported() {
        let mut loader = loader_with(SandboxConfiguration::default(), vec![]);
        let reference = class_ref("com/example/Ghost", "com/example/A");
        loader.context_mut().references.push(reference);

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| {
            m.text.contains("com/example/Ghost") && m.text.contains("does not exist")
        }));
    }

    #[test]
    fn test_namespace_class_without_marker_is_rejected() {
        let images = vec![mock_image("java/util/Random", vec![])];
        let mut loader = loader_with(SandboxConfiguration::default(), images);
        loader.context_mut().references.push(class_ref("java/util/Random", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| {
            m.text.contains("java/util/Random") && m.text.contains("not whitelisted")
        }));
    }

    #[test]
    fn test_namespace_class_with_marker_is_accepted() {
        let images = vec![annotated_image("java/util/Objects", vec![DETERMINISTIC_ANNOTATION])];
        let mut loader = loader_with(SandboxConfiguration::default(), images);
        loader.context_mut().references.push(class_ref("java/util/Objects", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert_eq!(0, summary.messages.iter().filter(|m| m.severity == crate::context::Severity::Error).count());
    }

    #[test]
    fn test_annotated_class_is_rejected() {
        let images = vec![annotated_image("com/example/Clock", vec![NONDETERMINISTIC_ANNOTATION])];
        let mut loader = loader_with(SandboxConfiguration::default(), images);
        loader.context_mut().references.push(class_ref("com/example/Clock", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| m.text.contains("annotated as non-deterministic")));
    }

    #[test]
    fn test_missing_member_is_reported() {
        let images = vec![mock_image("com/example/Util", vec![mock_method("exists", "()V", vec![])])];
        let mut loader = loader_with(SandboxConfiguration::default(), images);
        loader.context_mut().references.push((
            EntityReference::Member {
                class_name: String::from("com/example/Util"),
                member_name: String::from("missing"),
                descriptor: String::from("()V")
            },
            SourceLocation::member("com/example/A", "run")
        ));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| {
            m.text.contains("does not exist") && m.text.contains("com.example.Util.missing()V")
        }));
    }

    #[test]
    fn test_transitive_offender_is_enumerated() {
        let images = vec![
            mock_image("com/example/Outer", vec![]),
            annotated_image("com/example/Inner", vec![NONDETERMINISTIC_ANNOTATION])
        ];
        let mut loader = loader_with(SandboxConfiguration::default(), images);

        // Outer itself references Inner.
        loader.context_mut().references.push(class_ref("com/example/Inner", "com/example/Outer"));
        loader.context_mut().references.push(class_ref("com/example/Outer", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        let outer_error = summary.messages.iter().find(|m| {
            m.text.contains("com/example/Outer") && m.text.contains("depends on non-deterministic classes")
        });
        assert!(outer_error.is_some());
        assert!(outer_error.unwrap().text.contains("com/example/Inner"));
    }

    #[test]
    fn test_cyclic_references_terminate() {
        let images = vec![
            mock_image("com/example/Ping", vec![]),
            mock_image("com/example/Pong", vec![])
        ];
        let mut loader = loader_with(SandboxConfiguration::default(), images);

        loader.context_mut().references.push(class_ref("com/example/Pong", "com/example/Ping"));
        loader.context_mut().references.push(class_ref("com/example/Ping", "com/example/Pong"));
        loader.context_mut().references.push(class_ref("com/example/Ping", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert_eq!(0, summary.messages.iter().filter(|m| m.severity == crate::context::Severity::Error).count());
        assert!(summary.classes.contains(&String::from("com/example/Ping")));
    }

    #[test]
    fn test_end_to_end_transitive_rejection() {
        use std::fs;
        use crate::bytecode::{CodeAssembler, MethodRef, Op};
        use crate::log::Log;
        use crate::test_util::{build_class_file, TestMethod};

        let dir = std::env::temp_dir().join(format!("glassbox-validate-e2e-{}", std::process::id()));

        let classes: Vec<(&str, Vec<u8>)> = vec![
            ("com/example/Entry", build_class_file("com/example/Entry", vec![
                TestMethod::assembled("run", "()V", |asm: &mut CodeAssembler| {
                    asm.emit(Op::InvokeStatic(MethodRef::parse("com/example/Helper", "make", "()V")));
                    asm.emit(Op::Return);
                    vec![]
                })
            ])),
            ("com/example/Helper", build_class_file("com/example/Helper", vec![
                TestMethod::assembled("make", "()V", |asm: &mut CodeAssembler| {
                    asm.emit(Op::New(std::sync::Arc::from("java/util/Random")));
                    asm.emit(Op::Pop);
                    asm.emit(Op::Return);
                    vec![]
                })
            ])),
            ("java/util/Random", build_class_file("java/util/Random", vec![]))
        ];
        for &(name, ref bytes) in classes.iter() {
            let path = dir.join(format!("{}.class", name));
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, bytes).unwrap();
        };

        let config = SandboxConfiguration::with_classpath(vec![dir.clone()]);
        let mut loader = SandboxClassLoader::new(Arc::new(config));

        loader.load("com/example/Entry", &Log::disabled()).unwrap();
        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| {
            m.severity == crate::context::Severity::Error
                && m.text.contains("com/example/Helper.make()V")
                && m.text.contains("java/util/Random")
        }));
        assert_eq!(Some(&String::from("com/example/Entry")), summary.class_origins.get("com/example/Helper"));
        assert_eq!(Some(&String::from("com/example/Helper")), summary.class_origins.get("java/util/Random"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_validation_enumerates_every_offender() {
        let mut loader = loader_with(SandboxConfiguration::default(), vec![]);

        loader.context_mut().references.push(class_ref("com/example/GhostA", "com/example/A"));
        loader.context_mut().references.push(class_ref("com/example/GhostB", "com/example/A"));

        let summary = ReferenceValidator::new(&mut loader).validate();

        assert!(summary.messages.iter().any(|m| m.text.contains("GhostA")));
        assert!(summary.messages.iter().any(|m| m.text.contains("GhostB")));
    }
}
