use crate::classfile::{FlatTypeDescriptor, MethodDescriptor, TypeDescriptor};
use crate::resolver::ClassNameResolver;

/// Rewrites type and descriptor references element-wise through the class
/// resolver. Sits between instruction emission and constant-pool interning
/// so that substituted call sites keep internally consistent descriptors.
pub struct Remapper<'a> {
    resolver: &'a ClassNameResolver
}

impl <'a> Remapper<'a> {
    pub fn new(resolver: &'a ClassNameResolver) -> Remapper<'a> {
        Remapper { resolver }
    }

    pub fn map_class(&self, name: &str) -> String {
        self.resolver.resolve(name)
    }

    pub fn map_type_descriptor(&self, descriptor: &TypeDescriptor) -> String {
        let mut out = String::new();

        for _ in 0..descriptor.array_dims {
            out.push('[');
        };

        match descriptor.flat {
            FlatTypeDescriptor::Primitive(t) => out.push(char::from(t.as_char())),
            FlatTypeDescriptor::Reference(ref name) => {
                out.push('L');
                out.push_str(&self.resolver.resolve(name));
                out.push(';');
            }
        };

        out
    }

    pub fn map_method_descriptor(&self, descriptor: &MethodDescriptor) -> String {
        let mut out = String::from("(");

        for p in descriptor.param_types.iter() {
            out.push_str(&self.map_type_descriptor(p));
        };

        out.push(')');
        match descriptor.return_type {
            Some(ref t) => out.push_str(&self.map_type_descriptor(t)),
            None => out.push('V')
        };

        out
    }

    /// True when remapping would change anything about the given owner.
    pub fn moves(&self, name: &str) -> bool {
        self.resolver.resolve(name) != name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfiguration;

    #[test]
    fn test_method_descriptor_remaps_reference_params() {
        let config = SandboxConfiguration::default();
        let resolver = ClassNameResolver::new(&config);
        let remapper = Remapper::new(&resolver);

        let d = MethodDescriptor::parse("(ILcom/example/Task;[J)Lcom/example/Result;").unwrap();
        assert_eq!(
            "(ILsandbox/com/example/Task;[J)Lsandbox/com/example/Result;",
            remapper.map_method_descriptor(&d)
        );

        let d = MethodDescriptor::parse("(Ljava/lang/String;)V").unwrap();
        assert_eq!("(Ljava/lang/String;)V", remapper.map_method_descriptor(&d));
    }

    #[test]
    fn test_moves() {
        let config = SandboxConfiguration::default();
        let resolver = ClassNameResolver::new(&config);
        let remapper = Remapper::new(&resolver);

        assert!(remapper.moves("com/example/Task"));
        assert!(!remapper.moves("java/lang/Object"));
    }
}
