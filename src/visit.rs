use std::fmt;
use std::sync::Arc;

use crate::bytecode::{self, BytecodeError, Op};
use crate::classfile::{
    ClassImage, ConstantPoolEntry, Field, FlatTypeDescriptor, Method, MethodFlags, TypeDescriptor
};
use crate::context::{EntityReference, SourceLocation};

/// Traversal options. Reference recording is wanted during analysis but is
/// wasted work during the rewrite pass.
#[derive(Debug, Clone, Copy)]
pub struct VisitOptions {
    pub record_references: bool
}

impl VisitOptions {
    pub fn analysis() -> VisitOptions {
        VisitOptions { record_references: true }
    }

    pub fn rewrite() -> VisitOptions {
        VisitOptions { record_references: false }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MemberView<'a> {
    Field(&'a Field),
    Method(&'a Method)
}

/// One member of the class being traversed, with its raw descriptor string.
pub struct MemberInfo<'a> {
    pub class_name: &'a str,
    pub member: MemberView<'a>,
    pub descriptor: String
}

impl <'a> MemberInfo<'a> {
    pub fn name(&self) -> &str {
        match self.member {
            MemberView::Field(f) => &f.name,
            MemberView::Method(m) => &m.name
        }
    }

    pub fn is_native_method(&self) -> bool {
        match self.member {
            MemberView::Method(m) => m.flags.contains(MethodFlags::NATIVE),
            MemberView::Field(_) => false
        }
    }

    pub fn location(&self) -> SourceLocation {
        SourceLocation::member(self.class_name, self.name())
    }
}

/// A try-catch region of the method currently being traversed, with the
/// catch type resolved to a name (`None` is a catch-all handler).
#[derive(Debug, Clone)]
pub struct TryCatchBlock {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<Arc<str>>
}

/// Streaming callbacks over a class image, delivered in class-file order.
/// Both the analysis pass and the rewrite pass implement this.
pub trait ClassVisitor {
    fn class_entry(&mut self, _image: &ClassImage) {}
    fn class_exit(&mut self, _image: &ClassImage) {}
    fn member_entry(&mut self, _member: &MemberInfo) {}
    fn member_exit(&mut self, _member: &MemberInfo) {}
    fn try_catch(&mut self, _member: &MemberInfo, _block: &TryCatchBlock) {}
    fn line_number(&mut self, _member: &MemberInfo, _offset: usize, _line: u16) {}
    fn instruction(&mut self, _member: &MemberInfo, _offset: usize, _op: &Op) {}
    fn reference(&mut self, _reference: &EntityReference, _location: &SourceLocation) {}
}

#[derive(Debug)]
pub enum VisitError {
    Bytecode {
        class_name: String,
        member_name: String,
        error: BytecodeError
    }
}

impl fmt::Display for VisitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            VisitError::Bytecode { ref class_name, ref member_name, ref error } => {
                write!(f, "invalid bytecode in {}.{}: {}", class_name, member_name, error)
            }
        }
    }
}

fn descriptor_reference(descriptor: &TypeDescriptor) -> Option<EntityReference> {
    match descriptor.flat {
        FlatTypeDescriptor::Reference(ref name) => Some(EntityReference::Class {
            class_name: name.to_string()
        }),
        FlatTypeDescriptor::Primitive(_) => None
    }
}

fn instruction_references(op: &Op) -> Vec<EntityReference> {
    match *op {
        Op::GetField(ref fr) | Op::GetStatic(ref fr) | Op::PutField(ref fr) | Op::PutStatic(ref fr) => {
            vec![EntityReference::Member {
                class_name: fr.owner.to_string(),
                member_name: fr.name.to_string(),
                descriptor: fr.descriptor.to_string()
            }]
        },
        Op::InvokeInterface(ref mr, _) | Op::InvokeSpecial(ref mr) | Op::InvokeStatic(ref mr) | Op::InvokeVirtual(ref mr) => {
            vec![EntityReference::Member {
                class_name: mr.owner.to_string(),
                member_name: mr.name.to_string(),
                descriptor: mr.descriptor.to_string()
            }]
        },
        Op::New(ref name) | Op::ANewArray(ref name) | Op::CheckCast(ref name)
        | Op::InstanceOf(ref name) | Op::MultiANewArray(ref name, _) => {
            vec![EntityReference::Class { class_name: name.to_string() }]
        },
        Op::Ldc(bytecode::Constant::Class(ref name)) => {
            vec![EntityReference::Class { class_name: name.to_string() }]
        },
        _ => vec![]
    }
}

/// Streams one class image through the given visitor: class entry, members
/// in class-file order (fields before methods), try-catch blocks, line
/// numbers and instructions per method, plus observed references when the
/// options ask for them.
pub fn visit_class(
    image: &ClassImage,
    constant_pool: &[ConstantPoolEntry],
    options: &VisitOptions,
    visitor: &mut dyn ClassVisitor
) -> Result<(), VisitError> {
    visitor.class_entry(image);

    if options.record_references {
        if let Some(ref super_name) = image.super_name {
            visitor.reference(
                &EntityReference::Class { class_name: super_name.to_string() },
                &SourceLocation::class(&image.name)
            );
        };

        for iface in image.interfaces.iter() {
            visitor.reference(
                &EntityReference::Class { class_name: iface.to_string() },
                &SourceLocation::class(&image.name)
            );
        };
    };

    for field in image.fields.iter() {
        let info = MemberInfo {
            class_name: &image.name,
            member: MemberView::Field(field),
            descriptor: field.descriptor.to_string()
        };

        visitor.member_entry(&info);
        if options.record_references {
            if let Some(reference) = descriptor_reference(&field.descriptor) {
                visitor.reference(&reference, &info.location());
            };
        };
        visitor.member_exit(&info);
    };

    for method in image.methods.iter() {
        let info = MemberInfo {
            class_name: &image.name,
            member: MemberView::Method(method),
            descriptor: method.descriptor.to_string()
        };

        visitor.member_entry(&info);

        if options.record_references {
            for param in method.descriptor.param_types.iter() {
                if let Some(reference) = descriptor_reference(param) {
                    visitor.reference(&reference, &info.location());
                };
            };
            if let Some(ref return_type) = method.descriptor.return_type {
                if let Some(reference) = descriptor_reference(return_type) {
                    visitor.reference(&reference, &info.location());
                };
            };
        };

        if let Some(ref code) = method.code {
            for entry in code.exception_table.iter() {
                let block = TryCatchBlock {
                    start_pc: entry.start_pc,
                    end_pc: entry.end_pc,
                    handler_pc: entry.handler_pc,
                    catch_type: entry.catch_type.clone()
                };

                visitor.try_catch(&info, &block);
                if options.record_references {
                    if let Some(ref catch_type) = block.catch_type {
                        visitor.reference(
                            &EntityReference::Class { class_name: catch_type.to_string() },
                            &SourceLocation::instruction(&image.name, info.name(), entry.handler_pc as usize)
                        );
                    };
                };
            };

            let mut lines = code.line_numbers.iter().peekable();
            let mut off = 0_usize;

            while off < code.code.len() {
                let (op, len) = match bytecode::read_op(&code.code, off, constant_pool) {
                    Result::Ok(decoded) => decoded,
                    Result::Err(error) => {
                        return Result::Err(VisitError::Bytecode {
                            class_name: image.name.to_string(),
                            member_name: info.name().to_owned(),
                            error
                        });
                    }
                };

                while let Some(entry) = lines.peek() {
                    if (entry.start_pc as usize) <= off {
                        visitor.line_number(&info, off, entry.line);
                        lines.next();
                    } else {
                        break;
                    };
                };

                visitor.instruction(&info, off, &op);

                if options.record_references {
                    let location = SourceLocation::instruction(&image.name, info.name(), off);
                    for reference in instruction_references(&op) {
                        visitor.reference(&reference, &location);
                    };
                };

                off += len;
            };
        };

        visitor.member_exit(&info);
    };

    visitor.class_exit(image);
    Result::Ok(())
}
