use lazy_static::lazy_static;

use crate::bytecode::Op;
use crate::classfile::ClassImage;
use crate::config::THRESHOLD_VIOLATION_EXCEPTION;
use crate::context::{AnalysisContext, EntityReference, SourceLocation};
use crate::resolver::is_jvm_internal;
use crate::visit::{ClassVisitor, MemberInfo, MemberView, TryCatchBlock};

/// An instruction-scoped rule sees both decoded instructions and try-catch
/// blocks of the surrounding method.
pub enum InstructionEvent<'a> {
    Op(&'a Op),
    TryCatch(&'a TryCatchBlock)
}

/// Rules never fail; they accumulate diagnostics into the context. An ERROR
/// diagnostic rejects the class once analysis has run to completion.
pub trait ClassRule {
    fn validate(&self, context: &mut AnalysisContext, image: &ClassImage);
}

pub trait MemberRule {
    fn validate(&self, context: &mut AnalysisContext, member: &MemberInfo);
}

pub trait InstructionRule {
    fn validate(&self, context: &mut AnalysisContext, location: &SourceLocation, event: &InstructionEvent);
}

pub struct Ruleset {
    pub class_rules: Vec<Box<dyn ClassRule>>,
    pub member_rules: Vec<Box<dyn MemberRule>>,
    pub instruction_rules: Vec<Box<dyn InstructionRule>>
}

impl Ruleset {
    pub fn empty() -> Ruleset {
        Ruleset {
            class_rules: vec![],
            member_rules: vec![],
            instruction_rules: vec![]
        }
    }
}

/// The rules every session carries.
pub fn mandatory_ruleset() -> Ruleset {
    Ruleset {
        class_rules: vec![],
        member_rules: vec![
            Box::new(StubNativeMethod),
            Box::new(StubFinalizer)
        ],
        instruction_rules: vec![
            Box::new(DisallowDynamicInvocation),
            Box::new(DisallowReflection),
            Box::new(DisallowProtectedCatch),
            Box::new(DisallowSubroutines)
        ]
    }
}

lazy_static! {
    static ref REFLECTION_PREFIXES: Vec<&'static str> = vec![
        "java/lang/reflect/",
        "java/lang/invoke/",
        "sun/reflect/"
    ];
    static ref REFLECTION_OWNERS: Vec<&'static str> = vec![
        "sun/misc/Unsafe",
        "sun/misc/VM"
    ];
}

fn is_reflective(owner: &str) -> bool {
    REFLECTION_PREFIXES.iter().any(|p| owner.starts_with(p))
        || REFLECTION_OWNERS.iter().any(|&o| owner == o)
}

fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

pub struct DisallowDynamicInvocation;

impl InstructionRule for DisallowDynamicInvocation {
    fn validate(&self, context: &mut AnalysisContext, location: &SourceLocation, event: &InstructionEvent) {
        // Platform classes use invokedynamic for string concatenation and
        // lambda metafactories.
        if is_jvm_internal(&location.class_name) {
            return;
        };

        if let InstructionEvent::Op(&Op::InvokeDynamic { ref name, .. }) = *event {
            context.error(
                format!("Disallowed dynamic invocation of method {}", name),
                location.clone()
            );
        };
    }
}

pub struct DisallowReflection;

impl DisallowReflection {
    fn check_owner(&self, context: &mut AnalysisContext, location: &SourceLocation, owner: &str, member: Option<&str>) {
        if !is_reflective(owner) {
            return;
        };

        let text = match member {
            Some(member) => format!("Disallowed reference to reflection API: {}.{}", dotted(owner), member),
            None => format!("Disallowed reference to reflection API: {}", dotted(owner))
        };

        context.error(text, location.clone());
    }
}

impl InstructionRule for DisallowReflection {
    fn validate(&self, context: &mut AnalysisContext, location: &SourceLocation, event: &InstructionEvent) {
        match *event {
            InstructionEvent::Op(op) => match *op {
                Op::GetField(ref fr) | Op::GetStatic(ref fr) | Op::PutField(ref fr) | Op::PutStatic(ref fr) => {
                    self.check_owner(context, location, &fr.owner, Some(&fr.name));
                },
                Op::InvokeInterface(ref mr, _) | Op::InvokeSpecial(ref mr) | Op::InvokeStatic(ref mr) | Op::InvokeVirtual(ref mr) => {
                    self.check_owner(context, location, &mr.owner, Some(&mr.name));
                },
                Op::New(ref name) | Op::ANewArray(ref name) | Op::CheckCast(ref name)
                | Op::InstanceOf(ref name) | Op::MultiANewArray(ref name, _) => {
                    self.check_owner(context, location, name, None);
                },
                _ => {}
            },
            InstructionEvent::TryCatch(_) => {}
        };
    }
}

pub struct DisallowProtectedCatch;

impl InstructionRule for DisallowProtectedCatch {
    fn validate(&self, context: &mut AnalysisContext, location: &SourceLocation, event: &InstructionEvent) {
        if let InstructionEvent::TryCatch(block) = *event {
            match block.catch_type.as_deref() {
                Some("java/lang/ThreadDeath") => {
                    context.error(String::from("Disallowed catch of ThreadDeath exception"), location.clone());
                },
                Some(name) if name == THRESHOLD_VIOLATION_EXCEPTION => {
                    context.error(String::from("Disallowed catch of ThresholdViolationException"), location.clone());
                },
                _ => {}
            };
        };
    }
}

pub struct DisallowSubroutines;

impl InstructionRule for DisallowSubroutines {
    fn validate(&self, context: &mut AnalysisContext, location: &SourceLocation, event: &InstructionEvent) {
        if let InstructionEvent::Op(op) = *event {
            match *op {
                Op::JSR(_) | Op::Ret(_) => {
                    context.error(String::from("Disallowed legacy subroutine instruction"), location.clone());
                },
                _ => {}
            };
        };
    }
}

pub struct StubNativeMethod;

impl MemberRule for StubNativeMethod {
    fn validate(&self, context: &mut AnalysisContext, member: &MemberInfo) {
        if member.is_native_method() && !is_jvm_internal(member.class_name) {
            context.warning(
                format!("Native method {}{} will be deleted", member.name(), member.descriptor),
                member.location()
            );
        };
    }
}

pub struct StubFinalizer;

impl MemberRule for StubFinalizer {
    fn validate(&self, context: &mut AnalysisContext, member: &MemberInfo) {
        if let MemberView::Method(_) = member.member {
            if member.name() == "finalize" && member.descriptor == "()V" && !member.class_name.starts_with("java/lang/") {
                context.warning(
                    format!("Finalizer {}.finalize will be stubbed out", member.class_name),
                    member.location()
                );
            };
        };
    }
}

/// Drives the rule engine from visitor callbacks and records observed
/// references into the context. One analyzer instance per analyzed class.
pub struct Analyzer<'a> {
    context: &'a mut AnalysisContext,
    rules: &'a Ruleset
}

impl <'a> Analyzer<'a> {
    pub fn new(context: &'a mut AnalysisContext, rules: &'a Ruleset) -> Analyzer<'a> {
        Analyzer { context, rules }
    }
}

impl <'a> ClassVisitor for Analyzer<'a> {
    fn class_entry(&mut self, image: &ClassImage) {
        for rule in self.rules.class_rules.iter() {
            rule.validate(self.context, image);
        };
    }

    fn member_entry(&mut self, member: &MemberInfo) {
        for rule in self.rules.member_rules.iter() {
            rule.validate(self.context, member);
        };
    }

    fn try_catch(&mut self, member: &MemberInfo, block: &TryCatchBlock) {
        let location = SourceLocation::instruction(member.class_name, member.name(), block.handler_pc as usize);

        for rule in self.rules.instruction_rules.iter() {
            rule.validate(self.context, &location, &InstructionEvent::TryCatch(block));
        };
    }

    fn instruction(&mut self, member: &MemberInfo, offset: usize, op: &Op) {
        let location = SourceLocation::instruction(member.class_name, member.name(), offset);

        for rule in self.rules.instruction_rules.iter() {
            rule.validate(self.context, &location, &InstructionEvent::Op(op));
        };
    }

    fn reference(&mut self, reference: &EntityReference, location: &SourceLocation) {
        self.context.record_reference(reference.clone(), location.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MethodRef;
    use crate::context::Severity;

    fn run_instruction_rule(rule: &dyn InstructionRule, event: InstructionEvent) -> AnalysisContext {
        let mut context = AnalysisContext::new();
        let location = SourceLocation::instruction("com/example/A", "run", 0);

        rule.validate(&mut context, &location, &event);
        context
    }

    #[test]
    fn test_reflection_call_is_rejected_with_dotted_name() {
        let op = Op::InvokeVirtual(MethodRef::parse(
            "java/lang/reflect/Method",
            "invoke",
            "(Ljava/lang/Object;[Ljava/lang/Object;)Ljava/lang/Object;"
        ));
        let context = run_instruction_rule(&DisallowReflection, InstructionEvent::Op(&op));

        assert_eq!(1, context.error_count());
        let message = &context.messages()[0];
        assert!(message.text.contains("Disallowed reference to reflection API"));
        assert!(message.text.contains("java.lang.reflect.Method.invoke"));
    }

    #[test]
    fn test_unsafe_access_is_rejected() {
        let op = Op::InvokeStatic(MethodRef::parse("sun/misc/Unsafe", "getUnsafe", "()Lsun/misc/Unsafe;"));
        let context = run_instruction_rule(&DisallowReflection, InstructionEvent::Op(&op));

        assert_eq!(1, context.error_count());
        assert!(context.messages()[0].text.contains("sun.misc.Unsafe.getUnsafe"));
    }

    #[test]
    fn test_ordinary_call_is_accepted() {
        let op = Op::InvokeVirtual(MethodRef::parse("java/lang/StringBuilder", "length", "()I"));
        let context = run_instruction_rule(&DisallowReflection, InstructionEvent::Op(&op));

        assert_eq!(0, context.error_count());
    }

    #[test]
    fn test_thread_death_catch_is_rejected() {
        let block = TryCatchBlock {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 5,
            catch_type: Some(std::sync::Arc::from("java/lang/ThreadDeath"))
        };
        let context = run_instruction_rule(&DisallowProtectedCatch, InstructionEvent::TryCatch(&block));

        assert_eq!(1, context.error_count());
        assert!(context.messages()[0].text.contains("Disallowed catch of ThreadDeath exception"));
    }

    #[test]
    fn test_catch_all_handler_is_accepted() {
        let block = TryCatchBlock {
            start_pc: 0,
            end_pc: 4,
            handler_pc: 5,
            catch_type: None
        };
        let context = run_instruction_rule(&DisallowProtectedCatch, InstructionEvent::TryCatch(&block));

        assert_eq!(0, context.error_count());
    }

    #[test]
    fn test_dynamic_invocation_is_rejected() {
        let op = Op::InvokeDynamic {
            name: std::sync::Arc::from("apply"),
            descriptor: std::sync::Arc::from("()Ljava/lang/Runnable;")
        };
        let context = run_instruction_rule(&DisallowDynamicInvocation, InstructionEvent::Op(&op));

        assert_eq!(1, context.error_count());
        assert!(context.messages()[0].text.contains("Disallowed dynamic invocation"));
    }

    #[test]
    fn test_dynamic_invocation_in_platform_class_is_accepted() {
        let op = Op::InvokeDynamic {
            name: std::sync::Arc::from("makeConcatWithConstants"),
            descriptor: std::sync::Arc::from("(I)Ljava/lang/String;")
        };
        let mut context = AnalysisContext::new();
        let location = SourceLocation::instruction("java/util/Random", "toString", 0);

        DisallowDynamicInvocation.validate(&mut context, &location, &InstructionEvent::Op(&op));

        assert_eq!(0, context.error_count());
    }

    #[test]
    fn test_native_method_is_flagged_as_warning() {
        use crate::classfile::{Method, MethodDescriptor, MethodFlags};

        let method = Method {
            flags: MethodFlags::PUBLIC | MethodFlags::NATIVE,
            name: std::sync::Arc::from("nextInt"),
            descriptor: MethodDescriptor::parse("()I").unwrap(),
            code: None,
            annotations: vec![]
        };
        let info = MemberInfo {
            class_name: "com/example/Dice",
            member: MemberView::Method(&method),
            descriptor: String::from("()I")
        };

        let mut context = AnalysisContext::new();
        StubNativeMethod.validate(&mut context, &info);

        assert_eq!(0, context.error_count());
        assert_eq!(1, context.messages().len());
        assert_eq!(Severity::Warning, context.messages()[0].severity);
    }
}
