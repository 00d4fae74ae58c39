use std::sync::Arc;

use crate::bytecode::{CodeAssembler, Target};
use crate::classfile::{ClassFlags, ClassImage, Method, MethodDescriptor, MethodFlags};
use crate::config::{SandboxConfiguration, Whitelist};
use crate::remap::Remapper;
use crate::resolver::ClassNameResolver;
use crate::writer::{ClassFileBuilder, CodeData, MethodEntry};

/// A configuration whose whitelist matches every name, so that building
/// fixture class files through the assembler leaves names untouched.
pub fn identity_config() -> SandboxConfiguration {
    SandboxConfiguration {
        whitelist: Arc::new(Whitelist::everything()),
        ..SandboxConfiguration::default()
    }
}

/// Exception entries produced alongside an assembled fixture body:
/// `(start, end, handler, catch type)`.
pub type TestExceptions = Vec<(Target, Target, Target, Option<String>)>;

pub enum TestBody {
    Raw(&'static [u8]),
    Assembled(Box<dyn Fn(&mut CodeAssembler) -> TestExceptions>)
}

pub struct TestMethod {
    pub name: String,
    pub descriptor: String,
    pub flags: u16,
    pub max_stack: u16,
    pub max_locals: u16,
    pub body: Option<TestBody>
}

impl TestMethod {
    pub fn raw(name: &str, descriptor: &str, code: &'static [u8]) -> TestMethod {
        TestMethod {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            flags: 0x0001,
            max_stack: 4,
            max_locals: 4,
            body: Some(TestBody::Raw(code))
        }
    }

    pub fn assembled<F>(name: &str, descriptor: &str, body: F) -> TestMethod
    where F: Fn(&mut CodeAssembler) -> TestExceptions + 'static {
        TestMethod {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            flags: 0x0001,
            max_stack: 4,
            max_locals: 4,
            body: Some(TestBody::Assembled(Box::new(body)))
        }
    }

    pub fn abstract_native(name: &str, descriptor: &str, flags: u16) -> TestMethod {
        TestMethod {
            name: name.to_owned(),
            descriptor: descriptor.to_owned(),
            flags,
            max_stack: 0,
            max_locals: 0,
            body: None
        }
    }
}

/// Builds a parseable class file for fixtures: version 52, public class,
/// `java/lang/Object` superclass.
pub fn build_class_file(name: &str, methods: Vec<TestMethod>) -> Vec<u8> {
    let config = identity_config();
    let resolver = ClassNameResolver::new(&config);
    let remapper = Remapper::new(&resolver);

    let mut builder = ClassFileBuilder::new((52, 0));
    let this_class = builder.pool.class(name).unwrap();
    let super_class = builder.pool.class("java/lang/Object").unwrap();

    builder.set_header(0x0021, this_class, super_class, vec![]);

    for method in methods {
        let name_index = builder.pool.utf8(&method.name).unwrap();
        let descriptor_index = builder.pool.utf8(&method.descriptor).unwrap();

        let code = match method.body {
            Some(TestBody::Raw(code)) => Some(CodeData {
                max_stack: method.max_stack,
                max_locals: method.max_locals,
                code: code.to_vec(),
                exception_table: vec![],
                line_numbers: vec![]
            }),
            Some(TestBody::Assembled(ref body)) => {
                let mut asm = CodeAssembler::new();
                let exceptions = body(&mut asm);
                let assembled = asm.assemble(&mut builder.pool, &remapper).unwrap();

                let exception_table = exceptions.iter().map(|&(start, end, handler, ref catch_type)| {
                    let catch_index = match *catch_type {
                        Some(ref catch_type) => builder.pool.class(catch_type).unwrap(),
                        None => 0
                    };

                    (
                        assembled.offset_of(start).unwrap(),
                        assembled.offset_of(end).unwrap(),
                        assembled.offset_of(handler).unwrap(),
                        catch_index
                    )
                }).collect();

                Some(CodeData {
                    max_stack: method.max_stack,
                    max_locals: method.max_locals,
                    code: assembled.code,
                    exception_table,
                    line_numbers: vec![]
                })
            },
            None => None
        };

        builder.add_method(MethodEntry {
            flags: method.flags,
            name: name_index,
            descriptor: descriptor_index,
            code
        });
    };

    builder.finish().unwrap()
}

pub fn empty_class_file(name: &str) -> Vec<u8> {
    build_class_file(name, vec![])
}

/// An in-memory image for tests that seed the analysis context directly
/// instead of going through the classpath.
pub fn mock_image(name: &str, methods: Vec<Method>) -> ClassImage {
    ClassImage {
        version: (52, 0),
        flags: ClassFlags::PUBLIC | ClassFlags::SUPER,
        name: Arc::from(name),
        super_name: Some(Arc::from("java/lang/Object")),
        interfaces: vec![],
        fields: vec![],
        methods,
        annotations: vec![]
    }
}

pub fn annotated_image(name: &str, annotations: Vec<&str>) -> ClassImage {
    let mut image = mock_image(name, vec![]);
    image.annotations = annotations.into_iter().map(Arc::from).collect();
    image
}

pub fn mock_method(name: &str, descriptor: &str, annotations: Vec<&str>) -> Method {
    Method {
        flags: MethodFlags::PUBLIC,
        name: Arc::from(name),
        descriptor: MethodDescriptor::parse(descriptor).unwrap(),
        code: None,
        annotations: annotations.into_iter().map(Arc::from).collect()
    }
}

pub fn class_file_with_method(name: &str, method_name: &str, descriptor: &str, code: &'static [u8]) -> Vec<u8> {
    build_class_file(name, vec![TestMethod::raw(method_name, descriptor, code)])
}
