use std::sync::Arc;

use crate::bytecode::{CodeAssembler, Constant, MethodRef, Op};
use crate::classfile::MethodFlags;
use crate::config::RULE_VIOLATION_EXCEPTION;
use crate::context::AnalysisContext;
use crate::resolver::is_jvm_internal;

/// Replays or replaces a method body against a code assembler. Writers run
/// in order; a member whose writer list is non-empty after the provider
/// chain has its original body discarded.
pub type BodyWriter = Box<dyn Fn(&mut CodeAssembler)>;

/// A method definition in flight through the provider chain.
pub struct MemberDefinition {
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: String,
    pub flags: MethodFlags,
    pub body: Vec<BodyWriter>,
    /// Operand stack depth the synthetic body needs; the maximum over all
    /// contributing writers.
    pub body_max_stack: u16
}

impl MemberDefinition {
    pub fn has_synthetic_body(&self) -> bool {
        !self.body.is_empty()
    }
}

/// Rewrites a member definition (access flags, synthetic body) during the
/// mutation pass. Providers are applied in registration order.
pub trait DefinitionProvider {
    fn transform(&self, context: &mut AnalysisContext, member: MemberDefinition) -> MemberDefinition;
}

pub fn default_providers() -> Vec<Box<dyn DefinitionProvider>> {
    vec![
        Box::new(NativeStubProvider),
        Box::new(FinalizerStubProvider),
        Box::new(AccessMaskProvider::new(MethodFlags::SYNCHRONIZED))
    ]
}

fn throw_stub(exception: &'static str, message: &'static str) -> BodyWriter {
    Box::new(move |asm: &mut CodeAssembler| {
        asm.emit(Op::New(Arc::from(exception)));
        asm.emit(Op::Dup);
        asm.emit(Op::Ldc(Constant::String(Arc::from(message))));
        asm.emit(Op::InvokeSpecial(MethodRef::parse(exception, "<init>", "(Ljava/lang/String;)V")));
        asm.emit(Op::AThrow);
    })
}

/// Deletes native method bodies: the native flag is cleared and the method
/// throws on entry instead of crossing into native code.
pub struct NativeStubProvider;

impl DefinitionProvider for NativeStubProvider {
    fn transform(&self, _context: &mut AnalysisContext, mut member: MemberDefinition) -> MemberDefinition {
        if member.flags.contains(MethodFlags::NATIVE) && !is_jvm_internal(&member.class_name) {
            member.flags.remove(MethodFlags::NATIVE);
            member.body.push(throw_stub(RULE_VIOLATION_EXCEPTION, "Native method has been deleted"));
            member.body_max_stack = member.body_max_stack.max(3);
        };

        member
    }
}

/// Replaces finalizers outside `java/lang/` with a bare return.
pub struct FinalizerStubProvider;

impl DefinitionProvider for FinalizerStubProvider {
    fn transform(&self, _context: &mut AnalysisContext, mut member: MemberDefinition) -> MemberDefinition {
        if member.name.as_ref() == "finalize" && member.descriptor == "()V" && !member.class_name.starts_with("java/lang/") {
            member.body.clear();
            member.body.push(Box::new(|asm: &mut CodeAssembler| {
                asm.emit(Op::Return);
            }));
        };

        member
    }
}

/// Policy-driven access tightening; by default strips `synchronized` so
/// sandboxed code cannot block on monitors.
pub struct AccessMaskProvider {
    mask: MethodFlags
}

impl AccessMaskProvider {
    pub fn new(mask: MethodFlags) -> AccessMaskProvider {
        AccessMaskProvider { mask }
    }
}

impl DefinitionProvider for AccessMaskProvider {
    fn transform(&self, _context: &mut AnalysisContext, mut member: MemberDefinition) -> MemberDefinition {
        member.flags.remove(self.mask);
        member
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;
    use crate::remap::Remapper;
    use crate::resolver::ClassNameResolver;
    use crate::writer::ConstantPoolBuilder;

    fn member(class_name: &str, name: &str, descriptor: &str, flags: MethodFlags) -> MemberDefinition {
        MemberDefinition {
            class_name: Arc::from(class_name),
            name: Arc::from(name),
            descriptor: descriptor.to_owned(),
            flags,
            body: vec![],
            body_max_stack: 0
        }
    }

    fn assemble_body(member: &MemberDefinition) -> Vec<u8> {
        let config = SandboxConfiguration::default();
        let resolver = ClassNameResolver::new(&config);
        let remapper = Remapper::new(&resolver);
        let mut pool = ConstantPoolBuilder::new();
        let mut asm = CodeAssembler::new();

        for writer in member.body.iter() {
            writer(&mut asm);
        };

        asm.assemble(&mut pool, &remapper).unwrap().code
    }

    #[test]
    fn test_native_method_is_stubbed() {
        let mut context = AnalysisContext::new();
        let before = member("com/example/Dice", "nextInt", "()I", MethodFlags::PUBLIC | MethodFlags::NATIVE);

        let after = NativeStubProvider.transform(&mut context, before);

        assert!(!after.flags.contains(MethodFlags::NATIVE));
        assert!(after.has_synthetic_body());
        assert_eq!(3, after.body_max_stack);

        let code = assemble_body(&after);
        assert_eq!(0xbb, code[0]);
        assert_eq!(Some(&0xbf), code.last());
    }

    #[test]
    fn test_jvm_internal_native_method_is_untouched() {
        let mut context = AnalysisContext::new();
        let before = member("java/lang/StrictMath", "sin", "(D)D", MethodFlags::PUBLIC | MethodFlags::NATIVE);

        let after = NativeStubProvider.transform(&mut context, before);

        assert!(after.flags.contains(MethodFlags::NATIVE));
        assert!(!after.has_synthetic_body());
    }

    #[test]
    fn test_finalizer_body_is_a_bare_return() {
        let mut context = AnalysisContext::new();
        let before = member("com/example/Holder", "finalize", "()V", MethodFlags::PROTECTED);

        let after = FinalizerStubProvider.transform(&mut context, before);

        assert!(after.has_synthetic_body());
        assert_eq!(vec![0xb1], assemble_body(&after));
    }

    #[test]
    fn test_non_finalizer_is_untouched() {
        let mut context = AnalysisContext::new();
        let before = member("com/example/Holder", "finalize", "(I)V", MethodFlags::PUBLIC);

        let after = FinalizerStubProvider.transform(&mut context, before);

        assert!(!after.has_synthetic_body());
    }

    #[test]
    fn test_access_mask_strips_synchronized() {
        let mut context = AnalysisContext::new();
        let before = member("com/example/A", "run", "()V", MethodFlags::PUBLIC | MethodFlags::SYNCHRONIZED);

        let after = AccessMaskProvider::new(MethodFlags::SYNCHRONIZED).transform(&mut context, before);

        assert_eq!(MethodFlags::PUBLIC, after.flags);
    }
}
