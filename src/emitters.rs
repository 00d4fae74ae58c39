use std::sync::Arc;

use crate::bytecode::{BytecodeCondition, CodeAssembler, Constant, MethodRef, Op, Target};
use crate::config::{ExecutionProfile, RUNTIME_COST_ACCOUNTER, THREAD_DEATH, THRESHOLD_VIOLATION_EXCEPTION};
use crate::remap::Remapper;

pub struct EmitterContext<'a> {
    pub profile: &'a ExecutionProfile,
    pub remapper: &'a Remapper<'a>,
    pub class_name: &'a str,
    pub member_name: &'a str,
    pub offset: usize
}

enum EmitItem {
    Op(Op),
    Bind(Target)
}

/// Collects the synthetic instructions one emitter chain run produces
/// around (or instead of) a single original instruction.
pub struct EmitSink<'a> {
    asm: &'a mut CodeAssembler,
    before: Vec<EmitItem>,
    replacement: Option<Vec<Op>>,
    after: Vec<EmitItem>,
    modified: bool
}

impl <'a> EmitSink<'a> {
    pub fn new(asm: &'a mut CodeAssembler) -> EmitSink<'a> {
        EmitSink {
            asm,
            before: vec![],
            replacement: None,
            after: vec![],
            modified: false
        }
    }

    pub fn new_target(&mut self) -> Target {
        self.asm.new_target()
    }

    pub fn before(&mut self, op: Op) {
        self.before.push(EmitItem::Op(op));
        self.modified = true;
    }

    pub fn bind_before(&mut self, target: Target) {
        self.before.push(EmitItem::Bind(target));
    }

    pub fn replace(&mut self, ops: Vec<Op>) {
        self.replacement = Some(ops);
        self.modified = true;
    }

    pub fn after(&mut self, op: Op) {
        self.after.push(EmitItem::Op(op));
        self.modified = true;
    }

    pub fn note_modified(&mut self) {
        self.modified = true;
    }

    /// Writes the collected items into the assembler: before-items, then the
    /// replacement or the original instruction, then after-items. Returns
    /// whether any emitter changed something.
    pub fn flush(self, original: Option<&Op>) -> bool {
        for item in self.before {
            match item {
                EmitItem::Op(op) => self.asm.emit(op),
                EmitItem::Bind(target) => self.asm.bind(target)
            };
        };

        match self.replacement {
            Some(ops) => {
                for op in ops {
                    self.asm.emit(op);
                };
            },
            None => {
                if let Some(op) = original {
                    self.asm.emit(op.clone());
                };
            }
        };

        for item in self.after {
            match item {
                EmitItem::Op(op) => self.asm.emit(op),
                EmitItem::Bind(target) => self.asm.bind(target)
            };
        };

        self.modified
    }
}

/// Transforms one instruction callback during rewriting: pass it through,
/// replace it, or surround it with synthetic instructions. Emitters run in
/// registration order over the same sink.
pub trait Emitter {
    fn method_entry(&self, _context: &EmitterContext, _sink: &mut EmitSink) {}
    fn instruction(&self, _context: &EmitterContext, _op: &Op, _sink: &mut EmitSink) {}
    fn handler_entry(&self, _context: &EmitterContext, _catch_type: &str, _sink: &mut EmitSink) {}
}

pub fn default_emitters() -> Vec<Box<dyn Emitter>> {
    vec![
        Box::new(CostAccountingEmitter),
        Box::new(AllocationAccountingEmitter),
        Box::new(ThrowAccountingEmitter),
        Box::new(RemapSensitiveEmitter),
        Box::new(CatchGuardEmitter)
    ]
}

fn cost_call(method: &'static str) -> Op {
    Op::InvokeStatic(MethodRef::parse(RUNTIME_COST_ACCOUNTER, method, "()V"))
}

fn has_backward_target(op: &Op, offset: usize) -> bool {
    op.branch_targets().iter().any(|t| match *t {
        Target::Off(target_off) => target_off <= offset,
        Target::Synth(_) => false
    })
}

/// Meters method entries and backward branches against the thread-local
/// cost accounter.
pub struct CostAccountingEmitter;

impl Emitter for CostAccountingEmitter {
    fn method_entry(&self, context: &EmitterContext, sink: &mut EmitSink) {
        if context.profile.invocation_cost > 0 {
            sink.before(cost_call("recordInvocation"));
        };
    }

    fn instruction(&self, context: &EmitterContext, op: &Op, sink: &mut EmitSink) {
        if context.profile.jump_cost > 0 && has_backward_target(op, context.offset) {
            sink.before(cost_call("recordJump"));
        };
    }
}

/// Meters heap allocations, including the hidden allocation of string
/// constants surfaced by `ldc`.
pub struct AllocationAccountingEmitter;

impl Emitter for AllocationAccountingEmitter {
    fn instruction(&self, context: &EmitterContext, op: &Op, sink: &mut EmitSink) {
        if context.profile.allocation_cost == 0 {
            return;
        };

        match *op {
            Op::New(_) | Op::NewArray(_) | Op::ANewArray(_) | Op::MultiANewArray(_, _)
            | Op::Ldc(Constant::String(_)) => {
                sink.before(cost_call("recordAllocation"));
            },
            _ => {}
        };
    }
}

pub struct ThrowAccountingEmitter;

impl Emitter for ThrowAccountingEmitter {
    fn instruction(&self, context: &EmitterContext, op: &Op, sink: &mut EmitSink) {
        if context.profile.throw_cost > 0 && matches!(*op, Op::AThrow) {
            sink.before(cost_call("recordThrow"));
        };
    }
}

/// Marks the rewrite as modified whenever an instruction references an
/// owner that the remapper will move into the sandbox namespace. The actual
/// rewrite happens when the reference is interned into the new pool.
pub struct RemapSensitiveEmitter;

impl Emitter for RemapSensitiveEmitter {
    fn instruction(&self, context: &EmitterContext, op: &Op, sink: &mut EmitSink) {
        let owner = match *op {
            Op::GetField(ref fr) | Op::GetStatic(ref fr) | Op::PutField(ref fr) | Op::PutStatic(ref fr) => Some(&fr.owner),
            Op::InvokeInterface(ref mr, _) | Op::InvokeSpecial(ref mr)
            | Op::InvokeStatic(ref mr) | Op::InvokeVirtual(ref mr) => Some(&mr.owner),
            Op::New(ref name) | Op::ANewArray(ref name) | Op::CheckCast(ref name)
            | Op::InstanceOf(ref name) | Op::MultiANewArray(ref name, _) => Some(name),
            _ => None
        };

        if let Some(owner) = owner {
            if context.remapper.moves(owner) {
                sink.note_modified();
            };
        };
    }
}

/// Splits catch-all handlers so that thread death and threshold violations
/// escape the sandboxed code instead of being swallowed.
pub struct CatchGuardEmitter;

impl CatchGuardEmitter {
    fn rethrow(sink: &mut EmitSink, exception: &str) {
        let fall_through = sink.new_target();

        sink.before(Op::Dup);
        sink.before(Op::InstanceOf(Arc::from(exception)));
        sink.before(Op::If(BytecodeCondition::Eq, fall_through));
        sink.before(Op::AThrow);
        sink.bind_before(fall_through);
    }
}

impl Emitter for CatchGuardEmitter {
    fn handler_entry(&self, _context: &EmitterContext, catch_type: &str, sink: &mut EmitSink) {
        if catch_type == "java/lang/Throwable" || catch_type == "java/lang/Error" {
            CatchGuardEmitter::rethrow(sink, THREAD_DEATH);
            CatchGuardEmitter::rethrow(sink, THRESHOLD_VIOLATION_EXCEPTION);
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;
    use crate::resolver::ClassNameResolver;
    use crate::writer::ConstantPoolBuilder;

    struct Fixture {
        config: SandboxConfiguration,
        resolver: ClassNameResolver
    }

    impl Fixture {
        fn new() -> Fixture {
            let config = SandboxConfiguration::default();
            let resolver = ClassNameResolver::new(&config);
            Fixture { config, resolver }
        }

        fn run_instruction(&self, emitter: &dyn Emitter, op: &Op, offset: usize) -> (Vec<u8>, bool) {
            let remapper = Remapper::new(&self.resolver);
            let context = EmitterContext {
                profile: &self.config.profile,
                remapper: &remapper,
                class_name: "com/example/A",
                member_name: "run",
                offset
            };

            let mut asm = CodeAssembler::new();
            asm.bind(Target::Off(0));

            let mut sink = EmitSink::new(&mut asm);
            emitter.instruction(&context, op, &mut sink);
            let modified = sink.flush(Some(op));

            let mut pool = ConstantPoolBuilder::new();
            let assembled = asm.assemble(&mut pool, &remapper).unwrap();
            (assembled.code, modified)
        }
    }

    #[test]
    fn test_allocation_accounting_precedes_new() {
        let fixture = Fixture::new();
        let op = Op::New(Arc::from("com/example/Box"));

        let (code, modified) = fixture.run_instruction(&AllocationAccountingEmitter, &op, 0);

        assert!(modified);
        // invokestatic recordAllocation, then new
        assert_eq!(0xb8, code[0]);
        assert_eq!(0xbb, code[3]);
    }

    #[test]
    fn test_throw_accounting_precedes_athrow() {
        let fixture = Fixture::new();

        let (code, modified) = fixture.run_instruction(&ThrowAccountingEmitter, &Op::AThrow, 0);

        assert!(modified);
        assert_eq!(0xb8, code[0]);
        assert_eq!(Some(&0xbf), code.last());
    }

    #[test]
    fn test_backward_branch_is_metered() {
        let fixture = Fixture::new();
        let op = Op::Goto(Target::Off(0));

        let (code, modified) = fixture.run_instruction(&CostAccountingEmitter, &op, 8);

        assert!(modified);
        assert_eq!(0xb8, code[0]);
    }

    #[test]
    fn test_forward_branch_is_not_metered() {
        let fixture = Fixture::new();
        let mut asm = CodeAssembler::new();
        let remapper = Remapper::new(&fixture.resolver);
        let context = EmitterContext {
            profile: &fixture.config.profile,
            remapper: &remapper,
            class_name: "com/example/A",
            member_name: "run",
            offset: 0
        };

        let mut sink = EmitSink::new(&mut asm);
        CostAccountingEmitter.instruction(&context, &Op::Goto(Target::Off(10)), &mut sink);

        assert!(!sink.flush(None));
    }

    #[test]
    fn test_disabled_category_is_not_metered() {
        let mut fixture = Fixture::new();
        fixture.config.profile = ExecutionProfile::unmetered();

        let (code, modified) = fixture.run_instruction(&ThrowAccountingEmitter, &Op::AThrow, 0);

        assert!(!modified);
        assert_eq!(vec![0xbf], code);
    }

    #[test]
    fn test_remap_sensitive_marks_moved_owner() {
        let fixture = Fixture::new();
        let op = Op::InvokeVirtual(MethodRef::parse("com/example/Helper", "run", "()V"));

        let (_, modified) = fixture.run_instruction(&RemapSensitiveEmitter, &op, 0);
        assert!(modified);

        let op = Op::InvokeVirtual(MethodRef::parse("java/lang/StringBuilder", "length", "()I"));
        let (_, modified) = fixture.run_instruction(&RemapSensitiveEmitter, &op, 0);
        assert!(!modified);
    }

    #[test]
    fn test_catch_guard_rethrows_thread_death_and_threshold_violations() {
        let fixture = Fixture::new();
        let remapper = Remapper::new(&fixture.resolver);
        let context = EmitterContext {
            profile: &fixture.config.profile,
            remapper: &remapper,
            class_name: "com/example/A",
            member_name: "run",
            offset: 0
        };

        let mut asm = CodeAssembler::new();
        let mut sink = EmitSink::new(&mut asm);
        CatchGuardEmitter.handler_entry(&context, "java/lang/Throwable", &mut sink);
        assert!(sink.flush(None));

        let mut pool = ConstantPoolBuilder::new();
        let assembled = asm.assemble(&mut pool, &remapper).unwrap();

        // dup; instanceof; ifeq; athrow -- twice.
        assert_eq!(0x59, assembled.code[0]);
        assert_eq!(0xc1, assembled.code[1]);
        assert_eq!(0x99, assembled.code[4]);
        assert_eq!(0xbf, assembled.code[7]);
        assert_eq!(2, assembled.code.iter().filter(|&&b| b == 0xbf).count());
    }

    #[test]
    fn test_custom_emitter_can_replace_and_append() {
        struct MonitorStripper;

        impl Emitter for MonitorStripper {
            fn instruction(&self, _context: &EmitterContext, op: &Op, sink: &mut EmitSink) {
                if matches!(*op, Op::MonitorEnter) {
                    sink.replace(vec![Op::Pop]);
                    sink.after(Op::Nop);
                };
            }
        }

        let fixture = Fixture::new();
        let (code, modified) = fixture.run_instruction(&MonitorStripper, &Op::MonitorEnter, 0);

        assert!(modified);
        assert_eq!(vec![0x57, 0x00], code);
    }

    #[test]
    fn test_plain_catch_type_is_not_guarded() {
        let fixture = Fixture::new();
        let remapper = Remapper::new(&fixture.resolver);
        let context = EmitterContext {
            profile: &fixture.config.profile,
            remapper: &remapper,
            class_name: "com/example/A",
            member_name: "run",
            offset: 0
        };

        let mut asm = CodeAssembler::new();
        let mut sink = EmitSink::new(&mut asm);
        CatchGuardEmitter.handler_entry(&context, "java/lang/Exception", &mut sink);

        assert!(!sink.flush(None));
    }
}
