use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use crate::classfile::ClassImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Trace,
    Warning,
    Error
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Severity::Info => write!(f, "INFO"),
            Severity::Trace => write!(f, "TRACE"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceLocation {
    pub class_name: String,
    pub member_name: Option<String>,
    pub offset: Option<usize>
}

impl SourceLocation {
    pub fn class(class_name: &str) -> SourceLocation {
        SourceLocation {
            class_name: class_name.to_owned(),
            member_name: None,
            offset: None
        }
    }

    pub fn member(class_name: &str, member_name: &str) -> SourceLocation {
        SourceLocation {
            class_name: class_name.to_owned(),
            member_name: Some(member_name.to_owned()),
            offset: None
        }
    }

    pub fn instruction(class_name: &str, member_name: &str, offset: usize) -> SourceLocation {
        SourceLocation {
            class_name: class_name.to_owned(),
            member_name: Some(member_name.to_owned()),
            offset: Some(offset)
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.class_name)?;
        if let Some(ref member) = self.member_name {
            write!(f, ".{}", member)?;
            if let Some(offset) = self.offset {
                write!(f, "@{}", offset)?;
            };
        };
        Result::Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub text: String,
    pub severity: Severity,
    pub location: Option<SourceLocation>
}

/// A reference from analyzed code to some other entity. Array class names
/// are normalized to their element type before being recorded; primitive
/// arrays collapse to `java/lang/Object`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityReference {
    Class {
        class_name: String
    },
    Member {
        class_name: String,
        member_name: String,
        descriptor: String
    }
}

impl EntityReference {
    pub fn class_name(&self) -> &str {
        match *self {
            EntityReference::Class { ref class_name } => class_name,
            EntityReference::Member { ref class_name, .. } => class_name
        }
    }
}

impl fmt::Display for EntityReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            EntityReference::Class { ref class_name } => write!(f, "{}", class_name),
            EntityReference::Member { ref class_name, ref member_name, ref descriptor } => {
                write!(f, "{}.{}{}", class_name, member_name, descriptor)
            }
        }
    }
}

/// Normalizes a possibly-array internal name to the class a reference to it
/// actually resolves against.
pub fn referenced_class_name(name: &str) -> String {
    if !name.starts_with('[') {
        return name.to_owned();
    };

    let elem = name.trim_start_matches('[');

    if elem.starts_with('L') && elem.ends_with(';') {
        elem[1..(elem.len() - 1)].to_owned()
    } else {
        String::from("java/lang/Object")
    }
}

/// Per-session accumulator for diagnostics, materialized class images, the
/// observed reference multiset and class origin tracking. Never shared
/// across sessions.
pub struct AnalysisContext {
    messages: Vec<Message>,
    pub classes: HashMap<String, Arc<ClassImage>>,
    pub references: Vec<(EntityReference, SourceLocation)>,
    pub class_origins: HashMap<String, String>,
    error_count: usize
}

impl AnalysisContext {
    pub fn new() -> AnalysisContext {
        AnalysisContext {
            messages: vec![],
            classes: HashMap::new(),
            references: vec![],
            class_origins: HashMap::new(),
            error_count: 0
        }
    }

    pub fn record(&mut self, severity: Severity, text: String, location: Option<SourceLocation>) {
        if severity == Severity::Error {
            self.error_count += 1;
        };

        self.messages.push(Message { text, severity, location });
    }

    pub fn error(&mut self, text: String, location: SourceLocation) {
        self.record(Severity::Error, text, Some(location));
    }

    pub fn warning(&mut self, text: String, location: SourceLocation) {
        self.record(Severity::Warning, text, Some(location));
    }

    pub fn info(&mut self, text: String, location: SourceLocation) {
        self.record(Severity::Info, text, Some(location));
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Diagnostics ordered by source location, so that messages for a class
    /// come out grouped regardless of discovery order.
    pub fn sorted_messages(&self) -> Vec<Message> {
        self.messages.iter()
            .cloned()
            .sorted_by(|a, b| {
                let key = |m: &Message| (
                    m.location.as_ref().map(|l| l.class_name.clone()).unwrap_or_default(),
                    m.location.as_ref().and_then(|l| l.member_name.clone()).unwrap_or_default(),
                    m.location.as_ref().and_then(|l| l.offset),
                    m.severity
                );

                key(a).cmp(&key(b))
            })
            .collect()
    }

    pub fn register_class(&mut self, image: Arc<ClassImage>) {
        self.classes.entry(image.name.to_string()).or_insert(image);
    }

    pub fn record_reference(&mut self, reference: EntityReference, location: SourceLocation) {
        let reference = match reference {
            EntityReference::Class { class_name } => EntityReference::Class {
                class_name: referenced_class_name(&class_name)
            },
            EntityReference::Member { class_name, member_name, descriptor } => EntityReference::Member {
                class_name: referenced_class_name(&class_name),
                member_name,
                descriptor
            }
        };

        self.record_origin(reference.class_name(), &location.class_name);
        self.references.push((reference, location));
    }

    /// Remembers which user class first pulled the given dependency in.
    pub fn record_origin(&mut self, class_name: &str, origin: &str) {
        if class_name != origin {
            self.class_origins.entry(class_name.to_owned()).or_insert_with(|| origin.to_owned());
        };
    }
}
