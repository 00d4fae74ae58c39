use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bytecode::{AssembleError, CodeAssembler, Op, Target};
use crate::classfile::{ClassImage, ConstantPoolEntry, ConstantValue, MethodFlags};
use crate::config::SandboxConfiguration;
use crate::context::AnalysisContext;
use crate::emitters::{EmitSink, EmitterContext};
use crate::providers::MemberDefinition;
use crate::remap::Remapper;
use crate::resolver::ClassNameResolver;
use crate::visit::{self, ClassVisitor, MemberInfo, MemberView, TryCatchBlock, VisitError, VisitOptions};
use crate::writer::{ClassFileBuilder, ClassWriteError, CodeData, FieldEntry, MethodEntry};

#[derive(Debug)]
pub struct RewriteResult {
    pub bytes: Vec<u8>,
    pub modified: bool
}

#[derive(Debug)]
pub enum RewriteError {
    Visit(VisitError),
    Assemble {
        class_name: String,
        member_name: String,
        error: AssembleError
    },
    Write(ClassWriteError)
}

impl From<VisitError> for RewriteError {
    fn from(err: VisitError) -> RewriteError {
        RewriteError::Visit(err)
    }
}

impl From<ClassWriteError> for RewriteError {
    fn from(err: ClassWriteError) -> RewriteError {
        RewriteError::Write(err)
    }
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RewriteError::Visit(ref err) => write!(f, "{}", err),
            RewriteError::Assemble { ref class_name, ref member_name, ref error } => {
                write!(f, "cannot reassemble {}.{}: {}", class_name, member_name, error)
            },
            RewriteError::Write(ref err) => write!(f, "{}", err)
        }
    }
}

// Injected handler guards and accounting calls never hold more than two
// extra operand slots beyond what the original frame needed.
const INJECTED_STACK_MARGIN: u16 = 2;

struct MethodState {
    def: MemberDefinition,
    asm: CodeAssembler,
    injected: bool,
    exception_table: Vec<(usize, usize, usize, Option<Arc<str>>)>,
    guards: HashMap<usize, Vec<String>>,
    line_numbers: Vec<(usize, u16)>,
    max_stack: u16,
    max_locals: u16,
    has_code: bool
}

struct RewritingVisitor<'a> {
    builder: ClassFileBuilder,
    remapper: Remapper<'a>,
    config: &'a SandboxConfiguration,
    context: &'a mut AnalysisContext,
    resolver: &'a ClassNameResolver,
    modified: bool,
    error: Option<RewriteError>,
    current: Option<MethodState>
}

impl <'a> RewritingVisitor<'a> {
    fn class_entry_inner(&mut self, image: &ClassImage) -> Result<(), RewriteError> {
        let resolved = self.resolver.resolve(&image.name);
        if resolved != image.name.as_ref() {
            self.modified = true;
        };

        let this_class = self.builder.pool.class(&resolved)?;
        let super_class = match image.super_name {
            Some(ref super_name) => {
                let mapped = self.remapper.map_class(super_name);
                if mapped != super_name.as_ref() {
                    self.modified = true;
                };
                self.builder.pool.class(&mapped)?
            },
            None => 0
        };

        let mut interfaces = Vec::with_capacity(image.interfaces.len());
        for iface in image.interfaces.iter() {
            let mapped = self.remapper.map_class(iface);
            if mapped != iface.as_ref() {
                self.modified = true;
            };
            interfaces.push(self.builder.pool.class(&mapped)?);
        };

        self.builder.set_header(image.flags.bits(), this_class, super_class, interfaces);
        Result::Ok(())
    }

    fn member_entry_inner(&mut self, member: &MemberInfo) -> Result<(), RewriteError> {
        let config = self.config;

        match member.member {
            MemberView::Field(field) => {
                let descriptor = self.remapper.map_type_descriptor(&field.descriptor);
                if descriptor != member.descriptor {
                    self.modified = true;
                };

                let name = self.builder.pool.utf8(&field.name)?;
                let descriptor = self.builder.pool.utf8(&descriptor)?;
                let constant_value = match field.constant_value {
                    Some(ConstantValue::Integer(val)) => Some(self.builder.pool.integer(val)?),
                    Some(ConstantValue::Float(val)) => Some(self.builder.pool.float_bits(val)?),
                    Some(ConstantValue::Long(val)) => Some(self.builder.pool.long(val)?),
                    Some(ConstantValue::Double(val)) => Some(self.builder.pool.double_bits(val)?),
                    Some(ConstantValue::String(ref val)) => Some(self.builder.pool.string(val)?),
                    None => None
                };

                self.builder.add_field(FieldEntry {
                    flags: field.flags.bits(),
                    name,
                    descriptor,
                    constant_value
                });
            },
            MemberView::Method(method) => {
                let mut def = MemberDefinition {
                    class_name: Arc::from(member.class_name),
                    name: method.name.clone(),
                    descriptor: member.descriptor.clone(),
                    flags: method.flags,
                    body: vec![],
                    body_max_stack: 0
                };

                for provider in config.definition_providers.iter() {
                    def = provider.transform(self.context, def);
                };

                if def.flags != method.flags || def.has_synthetic_body() {
                    self.modified = true;
                };

                let mut state = MethodState {
                    asm: CodeAssembler::new(),
                    injected: false,
                    exception_table: vec![],
                    guards: HashMap::new(),
                    line_numbers: vec![],
                    max_stack: method.code.as_ref().map(|c| c.max_stack).unwrap_or(0),
                    max_locals: method.code.as_ref().map(|c| c.max_locals).unwrap_or(0),
                    has_code: method.code.is_some(),
                    def
                };

                if state.has_code && !state.def.has_synthetic_body() {
                    let context = EmitterContext {
                        profile: &config.profile,
                        remapper: &self.remapper,
                        class_name: member.class_name,
                        member_name: member.name(),
                        offset: 0
                    };
                    let mut sink = EmitSink::new(&mut state.asm);

                    for emitter in config.emitters.iter() {
                        emitter.method_entry(&context, &mut sink);
                    };
                    state.injected |= sink.flush(None);
                };

                self.current = Some(state);
            }
        };

        Result::Ok(())
    }

    fn instruction_inner(&mut self, member: &MemberInfo, offset: usize, op: &Op) -> Result<(), RewriteError> {
        let config = self.config;
        let remapper = &self.remapper;
        let state = match self.current {
            Some(ref mut state) => state,
            None => return Result::Ok(())
        };

        if state.def.has_synthetic_body() {
            return Result::Ok(());
        };

        state.asm.bind(Target::Off(offset));

        if let Some(guard_types) = state.guards.get(&offset).cloned() {
            for catch_type in guard_types {
                let context = EmitterContext {
                    profile: &config.profile,
                    remapper,
                    class_name: member.class_name,
                    member_name: member.name(),
                    offset
                };
                let mut sink = EmitSink::new(&mut state.asm);

                for emitter in config.emitters.iter() {
                    emitter.handler_entry(&context, &catch_type, &mut sink);
                };
                state.injected |= sink.flush(None);
            };
        };

        let context = EmitterContext {
            profile: &config.profile,
            remapper,
            class_name: member.class_name,
            member_name: member.name(),
            offset
        };
        let mut sink = EmitSink::new(&mut state.asm);

        for emitter in config.emitters.iter() {
            emitter.instruction(&context, op, &mut sink);
        };
        state.injected |= sink.flush(Some(op));

        Result::Ok(())
    }

    fn member_exit_inner(&mut self, member: &MemberInfo) -> Result<(), RewriteError> {
        let mut state = match self.current.take() {
            Some(state) => state,
            None => return Result::Ok(())
        };
        let method = match member.member {
            MemberView::Method(method) => method,
            MemberView::Field(_) => return Result::Ok(())
        };

        let assemble_failed = |error: AssembleError| RewriteError::Assemble {
            class_name: member.class_name.to_owned(),
            member_name: member.name().to_owned(),
            error
        };

        let code = if state.def.has_synthetic_body() {
            let mut asm = CodeAssembler::new();
            for writer in state.def.body.iter() {
                writer(&mut asm);
            };

            let assembled = asm.assemble(&mut self.builder.pool, &self.remapper).map_err(assemble_failed)?;
            let receiver = if state.def.flags.contains(MethodFlags::STATIC) { 0 } else { 1 };

            Some(CodeData {
                max_stack: state.def.body_max_stack,
                max_locals: receiver + method.descriptor.param_slots(),
                code: assembled.code,
                exception_table: vec![],
                line_numbers: vec![]
            })
        } else if state.has_code {
            let code_len = method.code.as_ref().map(|c| c.code.len()).unwrap_or(0);
            state.asm.bind(Target::Off(code_len));

            let assembled = state.asm.assemble(&mut self.builder.pool, &self.remapper).map_err(assemble_failed)?;

            let mut exception_table = Vec::with_capacity(state.exception_table.len());
            for &(start, end, handler, ref catch_type) in state.exception_table.iter() {
                let map = |off: usize| {
                    assembled.offset_of(Target::Off(off)).ok_or(AssembleError::UnboundTarget)
                };
                let catch_index = match *catch_type {
                    Some(ref catch_type) => self.builder.pool.class(&self.remapper.map_class(catch_type))?,
                    None => 0
                };

                exception_table.push((
                    map(start).map_err(assemble_failed)?,
                    map(end).map_err(assemble_failed)?,
                    map(handler).map_err(assemble_failed)?,
                    catch_index
                ));
            };

            let line_numbers = state.line_numbers.iter()
                .filter_map(|&(off, line)| assembled.offset_of(Target::Off(off)).map(|new_off| (new_off, line)))
                .collect();

            Some(CodeData {
                max_stack: state.max_stack + if state.injected { INJECTED_STACK_MARGIN } else { 0 },
                max_locals: state.max_locals,
                code: assembled.code,
                exception_table,
                line_numbers
            })
        } else {
            None
        };

        let descriptor = self.remapper.map_method_descriptor(&method.descriptor);
        if descriptor != member.descriptor {
            self.modified = true;
        };
        self.modified |= state.injected;

        let name = self.builder.pool.utf8(&state.def.name)?;
        let descriptor = self.builder.pool.utf8(&descriptor)?;

        self.builder.add_method(MethodEntry {
            flags: state.def.flags.bits(),
            name,
            descriptor,
            code
        });

        Result::Ok(())
    }

    fn fail_on_error<F>(&mut self, f: F)
    where F: FnOnce(&mut Self) -> Result<(), RewriteError> {
        if self.error.is_some() {
            return;
        };

        if let Result::Err(err) = f(self) {
            self.error = Some(err);
        };
    }
}

impl <'a> ClassVisitor for RewritingVisitor<'a> {
    fn class_entry(&mut self, image: &ClassImage) {
        self.fail_on_error(|v| v.class_entry_inner(image));
    }

    fn member_entry(&mut self, member: &MemberInfo) {
        self.fail_on_error(|v| v.member_entry_inner(member));
    }

    fn try_catch(&mut self, _member: &MemberInfo, block: &TryCatchBlock) {
        if self.error.is_some() {
            return;
        };

        if let Some(ref mut state) = self.current {
            state.exception_table.push((
                block.start_pc as usize,
                block.end_pc as usize,
                block.handler_pc as usize,
                block.catch_type.clone()
            ));

            if let Some(ref catch_type) = block.catch_type {
                let guards = state.guards.entry(block.handler_pc as usize).or_insert_with(Vec::new);
                if !guards.iter().any(|g| g == catch_type.as_ref()) {
                    guards.push(catch_type.to_string());
                };
            };
        };
    }

    fn line_number(&mut self, _member: &MemberInfo, offset: usize, line: u16) {
        if let Some(ref mut state) = self.current {
            state.line_numbers.push((offset, line));
        };
    }

    fn instruction(&mut self, member: &MemberInfo, offset: usize, op: &Op) {
        self.fail_on_error(|v| v.instruction_inner(member, offset, op));
    }

    fn member_exit(&mut self, member: &MemberInfo) {
        self.fail_on_error(|v| v.member_exit_inner(member));
    }
}

/// Rewrites one analyzed class image into sandboxed bytes: definition
/// providers per member, emitters per instruction, every reference remapped
/// while the new constant pool is built. Single-threaded, one pass over the
/// image.
pub fn rewrite_class(
    image: &ClassImage,
    constant_pool: &[ConstantPoolEntry],
    context: &mut AnalysisContext,
    config: &SandboxConfiguration,
    resolver: &ClassNameResolver
) -> Result<RewriteResult, RewriteError> {
    let mut visitor = RewritingVisitor {
        builder: ClassFileBuilder::new(image.version),
        remapper: Remapper::new(resolver),
        config,
        context,
        resolver,
        modified: false,
        error: None,
        current: None
    };

    visit::visit_class(image, constant_pool, &VisitOptions::rewrite(), &mut visitor)?;

    if let Some(err) = visitor.error {
        return Result::Err(err);
    };

    let modified = visitor.modified;
    let bytes = visitor.builder.finish()?;

    Result::Ok(RewriteResult { bytes, modified })
}
