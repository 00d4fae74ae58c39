use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

#[derive(Debug)]
pub enum ClassWriteError {
    Io(io::Error),
    TooManyConstants,
    Utf8TooLong,
    CodeTooLarge
}

impl From<io::Error> for ClassWriteError {
    fn from(err: io::Error) -> ClassWriteError {
        ClassWriteError::Io(err)
    }
}

impl fmt::Display for ClassWriteError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ClassWriteError::Io(ref err) => write!(f, "i/o error: {}", err),
            ClassWriteError::TooManyConstants => write!(f, "constant pool overflow"),
            ClassWriteError::Utf8TooLong => write!(f, "utf8 constant exceeds 65535 bytes"),
            ClassWriteError::CodeTooLarge => write!(f, "method body exceeds 65535 bytes")
        }
    }
}

#[derive(Debug)]
enum PoolItem {
    Utf8(Vec<u8>),
    Class(u16),
    NameAndType(u16, u16),
    Fieldref(u16, u16),
    Methodref(u16, u16),
    InterfaceMethodref(u16, u16),
    String(u16),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Phantom
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PoolKey {
    Utf8(String),
    Class(String),
    NameAndType(String, String),
    Fieldref(String, String, String),
    Methodref(String, String, String),
    InterfaceMethodref(String, String, String),
    Str(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64)
}

/// Interning constant-pool builder. Identical entries share one slot; long
/// and double entries occupy two slots as the class-file format demands.
#[derive(Debug)]
pub struct ConstantPoolBuilder {
    items: Vec<PoolItem>,
    lookup: HashMap<PoolKey, u16>
}

impl ConstantPoolBuilder {
    pub fn new() -> ConstantPoolBuilder {
        ConstantPoolBuilder {
            items: vec![PoolItem::Phantom],
            lookup: HashMap::new()
        }
    }

    fn add(&mut self, key: PoolKey, item: PoolItem) -> Result<u16, ClassWriteError> {
        if let Some(&index) = self.lookup.get(&key) {
            return Result::Ok(index);
        };

        let dual = matches!(item, PoolItem::Long(_) | PoolItem::Double(_));
        let needed = if dual { 2 } else { 1 };

        if self.items.len() + needed > u16::max_value() as usize {
            return Result::Err(ClassWriteError::TooManyConstants);
        };

        let index = self.items.len() as u16;
        self.items.push(item);
        if dual {
            self.items.push(PoolItem::Phantom);
        };

        self.lookup.insert(key, index);
        Result::Ok(index)
    }

    pub fn utf8(&mut self, s: &str) -> Result<u16, ClassWriteError> {
        let encoded = cesu8::to_java_cesu8(s).into_owned();

        if encoded.len() > u16::max_value() as usize {
            return Result::Err(ClassWriteError::Utf8TooLong);
        };

        self.add(PoolKey::Utf8(s.to_owned()), PoolItem::Utf8(encoded))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, ClassWriteError> {
        let name_index = self.utf8(name)?;
        self.add(PoolKey::Class(name.to_owned()), PoolItem::Class(name_index))
    }

    pub fn string(&mut self, contents: &str) -> Result<u16, ClassWriteError> {
        let string_index = self.utf8(contents)?;
        self.add(PoolKey::Str(contents.to_owned()), PoolItem::String(string_index))
    }

    pub fn integer(&mut self, val: i32) -> Result<u16, ClassWriteError> {
        self.add(PoolKey::Integer(val), PoolItem::Integer(val))
    }

    pub fn float_bits(&mut self, val: u32) -> Result<u16, ClassWriteError> {
        self.add(PoolKey::Float(val), PoolItem::Float(val))
    }

    pub fn long(&mut self, val: i64) -> Result<u16, ClassWriteError> {
        self.add(PoolKey::Long(val), PoolItem::Long(val))
    }

    pub fn double_bits(&mut self, val: u64) -> Result<u16, ClassWriteError> {
        self.add(PoolKey::Double(val), PoolItem::Double(val))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassWriteError> {
        let name_index = self.utf8(name)?;
        let type_index = self.utf8(descriptor)?;

        self.add(
            PoolKey::NameAndType(name.to_owned(), descriptor.to_owned()),
            PoolItem::NameAndType(name_index, type_index)
        )
    }

    pub fn fieldref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassWriteError> {
        let class_index = self.class(owner)?;
        let nt_index = self.name_and_type(name, descriptor)?;

        self.add(
            PoolKey::Fieldref(owner.to_owned(), name.to_owned(), descriptor.to_owned()),
            PoolItem::Fieldref(class_index, nt_index)
        )
    }

    pub fn methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassWriteError> {
        let class_index = self.class(owner)?;
        let nt_index = self.name_and_type(name, descriptor)?;

        self.add(
            PoolKey::Methodref(owner.to_owned(), name.to_owned(), descriptor.to_owned()),
            PoolItem::Methodref(class_index, nt_index)
        )
    }

    pub fn interface_methodref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassWriteError> {
        let class_index = self.class(owner)?;
        let nt_index = self.name_and_type(name, descriptor)?;

        self.add(
            PoolKey::InterfaceMethodref(owner.to_owned(), name.to_owned(), descriptor.to_owned()),
            PoolItem::InterfaceMethodref(class_index, nt_index)
        )
    }

    pub fn count(&self) -> u16 {
        self.items.len() as u16
    }

    fn write_to<W: Write>(&self, w: &mut W) -> Result<(), ClassWriteError> {
        w.write_u16::<BigEndian>(self.items.len() as u16)?;

        for item in self.items[1..].iter() {
            match *item {
                PoolItem::Utf8(ref encoded) => {
                    w.write_u8(1)?;
                    w.write_u16::<BigEndian>(encoded.len() as u16)?;
                    w.write_all(encoded)?;
                },
                PoolItem::Class(name_index) => {
                    w.write_u8(7)?;
                    w.write_u16::<BigEndian>(name_index)?;
                },
                PoolItem::NameAndType(name_index, type_index) => {
                    w.write_u8(12)?;
                    w.write_u16::<BigEndian>(name_index)?;
                    w.write_u16::<BigEndian>(type_index)?;
                },
                PoolItem::Fieldref(class_index, nt_index) => {
                    w.write_u8(9)?;
                    w.write_u16::<BigEndian>(class_index)?;
                    w.write_u16::<BigEndian>(nt_index)?;
                },
                PoolItem::Methodref(class_index, nt_index) => {
                    w.write_u8(10)?;
                    w.write_u16::<BigEndian>(class_index)?;
                    w.write_u16::<BigEndian>(nt_index)?;
                },
                PoolItem::InterfaceMethodref(class_index, nt_index) => {
                    w.write_u8(11)?;
                    w.write_u16::<BigEndian>(class_index)?;
                    w.write_u16::<BigEndian>(nt_index)?;
                },
                PoolItem::String(string_index) => {
                    w.write_u8(8)?;
                    w.write_u16::<BigEndian>(string_index)?;
                },
                PoolItem::Integer(val) => {
                    w.write_u8(3)?;
                    w.write_i32::<BigEndian>(val)?;
                },
                PoolItem::Float(val) => {
                    w.write_u8(4)?;
                    w.write_u32::<BigEndian>(val)?;
                },
                PoolItem::Long(val) => {
                    w.write_u8(5)?;
                    w.write_i64::<BigEndian>(val)?;
                },
                PoolItem::Double(val) => {
                    w.write_u8(6)?;
                    w.write_u64::<BigEndian>(val)?;
                },
                PoolItem::Phantom => {}
            };
        };

        Result::Ok(())
    }
}

#[derive(Debug)]
pub struct CodeData {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<(u16, u16, u16, u16)>,
    pub line_numbers: Vec<(u16, u16)>
}

#[derive(Debug)]
pub struct FieldEntry {
    pub flags: u16,
    pub name: u16,
    pub descriptor: u16,
    pub constant_value: Option<u16>
}

#[derive(Debug)]
pub struct MethodEntry {
    pub flags: u16,
    pub name: u16,
    pub descriptor: u16,
    pub code: Option<CodeData>
}

/// Serializes one transformed class. The pool is exposed so that code
/// assembly can intern references before the member entries are recorded.
#[derive(Debug)]
pub struct ClassFileBuilder {
    pub pool: ConstantPoolBuilder,
    version: (u16, u16),
    flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldEntry>,
    methods: Vec<MethodEntry>
}

impl ClassFileBuilder {
    pub fn new(version: (u16, u16)) -> ClassFileBuilder {
        ClassFileBuilder {
            pool: ConstantPoolBuilder::new(),
            version,
            flags: 0,
            this_class: 0,
            super_class: 0,
            interfaces: vec![],
            fields: vec![],
            methods: vec![]
        }
    }

    pub fn set_header(&mut self, flags: u16, this_class: u16, super_class: u16, interfaces: Vec<u16>) {
        self.flags = flags;
        self.this_class = this_class;
        self.super_class = super_class;
        self.interfaces = interfaces;
    }

    pub fn add_field(&mut self, field: FieldEntry) {
        self.fields.push(field);
    }

    pub fn add_method(&mut self, method: MethodEntry) {
        self.methods.push(method);
    }

    pub fn finish(mut self) -> Result<Vec<u8>, ClassWriteError> {
        let code_attr = if self.methods.iter().any(|m| m.code.is_some()) {
            self.pool.utf8("Code")?
        } else {
            0
        };
        let line_attr = if self.methods.iter().any(|m| m.code.as_ref().map(|c| !c.line_numbers.is_empty()).unwrap_or(false)) {
            self.pool.utf8("LineNumberTable")?
        } else {
            0
        };
        let constant_value_attr = if self.fields.iter().any(|f| f.constant_value.is_some()) {
            self.pool.utf8("ConstantValue")?
        } else {
            0
        };

        let mut out = vec![];

        out.write_u32::<BigEndian>(0xcafebabe)?;
        out.write_u16::<BigEndian>(self.version.1)?;
        out.write_u16::<BigEndian>(self.version.0)?;

        self.pool.write_to(&mut out)?;

        out.write_u16::<BigEndian>(self.flags)?;
        out.write_u16::<BigEndian>(self.this_class)?;
        out.write_u16::<BigEndian>(self.super_class)?;

        out.write_u16::<BigEndian>(self.interfaces.len() as u16)?;
        for &iface in self.interfaces.iter() {
            out.write_u16::<BigEndian>(iface)?;
        };

        out.write_u16::<BigEndian>(self.fields.len() as u16)?;
        for field in self.fields.iter() {
            out.write_u16::<BigEndian>(field.flags)?;
            out.write_u16::<BigEndian>(field.name)?;
            out.write_u16::<BigEndian>(field.descriptor)?;

            if let Some(cv) = field.constant_value {
                out.write_u16::<BigEndian>(1)?;
                out.write_u16::<BigEndian>(constant_value_attr)?;
                out.write_u32::<BigEndian>(2)?;
                out.write_u16::<BigEndian>(cv)?;
            } else {
                out.write_u16::<BigEndian>(0)?;
            };
        };

        out.write_u16::<BigEndian>(self.methods.len() as u16)?;
        for method in self.methods.iter() {
            out.write_u16::<BigEndian>(method.flags)?;
            out.write_u16::<BigEndian>(method.name)?;
            out.write_u16::<BigEndian>(method.descriptor)?;

            if let Some(ref code) = method.code {
                if code.code.len() > u16::max_value() as usize {
                    return Result::Err(ClassWriteError::CodeTooLarge);
                };

                out.write_u16::<BigEndian>(1)?;
                out.write_u16::<BigEndian>(code_attr)?;

                let line_payload = if code.line_numbers.is_empty() {
                    0
                } else {
                    6 + 2 + 4 * code.line_numbers.len()
                };
                let payload = 2 + 2 + 4 + code.code.len() + 2 + 8 * code.exception_table.len() + 2 + line_payload;

                out.write_u32::<BigEndian>(payload as u32)?;
                out.write_u16::<BigEndian>(code.max_stack)?;
                out.write_u16::<BigEndian>(code.max_locals)?;
                out.write_u32::<BigEndian>(code.code.len() as u32)?;
                out.write_all(&code.code)?;

                out.write_u16::<BigEndian>(code.exception_table.len() as u16)?;
                for &(start, end, handler, catch_type) in code.exception_table.iter() {
                    out.write_u16::<BigEndian>(start)?;
                    out.write_u16::<BigEndian>(end)?;
                    out.write_u16::<BigEndian>(handler)?;
                    out.write_u16::<BigEndian>(catch_type)?;
                };

                if code.line_numbers.is_empty() {
                    out.write_u16::<BigEndian>(0)?;
                } else {
                    out.write_u16::<BigEndian>(1)?;
                    out.write_u16::<BigEndian>(line_attr)?;
                    out.write_u32::<BigEndian>((2 + 4 * code.line_numbers.len()) as u32)?;
                    out.write_u16::<BigEndian>(code.line_numbers.len() as u16)?;
                    for &(start_pc, line) in code.line_numbers.iter() {
                        out.write_u16::<BigEndian>(start_pc)?;
                        out.write_u16::<BigEndian>(line)?;
                    };
                };
            } else {
                out.write_u16::<BigEndian>(0)?;
            };
        };

        // No class-level attributes survive the rewrite.
        out.write_u16::<BigEndian>(0)?;

        Result::Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_interns_identical_entries() {
        let mut pool = ConstantPoolBuilder::new();

        let a = pool.class("java/lang/Object").unwrap();
        let b = pool.class("java/lang/Object").unwrap();
        let c = pool.class("java/lang/String").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_pool_longs_take_two_slots() {
        let mut pool = ConstantPoolBuilder::new();

        let before = pool.count();
        pool.long(42).unwrap();
        assert_eq!(before + 2, pool.count());

        let i = pool.integer(7).unwrap();
        assert_eq!(before + 2, i);
    }

    #[test]
    fn test_distinct_ref_kinds_do_not_collide() {
        let mut pool = ConstantPoolBuilder::new();

        let m = pool.methodref("com/example/A", "run", "()V").unwrap();
        let i = pool.interface_methodref("com/example/A", "run", "()V").unwrap();

        assert_ne!(m, i);
    }

    #[test]
    fn test_finished_class_round_trips_through_parser() {
        let mut builder = ClassFileBuilder::new((52, 0));
        let this_class = builder.pool.class("com/example/A").unwrap();
        let super_class = builder.pool.class("java/lang/Object").unwrap();
        let name = builder.pool.utf8("run").unwrap();
        let descriptor = builder.pool.utf8("()V").unwrap();

        builder.set_header(0x0021, this_class, super_class, vec![]);
        builder.add_method(MethodEntry {
            flags: 0x0001,
            name,
            descriptor,
            code: Some(CodeData {
                max_stack: 0,
                max_locals: 1,
                code: vec![0xb1],
                exception_table: vec![],
                line_numbers: vec![(0, 10)]
            })
        });

        let bytes = builder.finish().unwrap();
        let (image, _) = crate::classfile::parse_class_file(&mut &bytes[..]).unwrap();

        assert_eq!("com/example/A", image.name.as_ref());
        let method = image.find_method("run", "()V").unwrap();
        let code = method.code.as_ref().unwrap();
        assert_eq!(&[0xb1], code.code.as_ref());
        assert_eq!(1, code.line_numbers.len());
        assert_eq!(10, code.line_numbers[0].line);
    }
}
