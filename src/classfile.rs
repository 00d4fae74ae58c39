use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt};

bitflags! {
    pub struct ClassFlags: u16 {
        const PUBLIC = 0x0001;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    pub struct FieldFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const VOLATILE = 0x0040;
        const TRANSIENT = 0x0080;
        const SYNTHETIC = 0x1000;
        const ENUM = 0x4000;
    }
}

bitflags! {
    pub struct MethodFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SYNCHRONIZED = 0x0020;
        const BRIDGE = 0x0040;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Byte,
    Char,
    Double,
    Float,
    Int,
    Long,
    Short,
    Boolean
}

impl PrimitiveType {
    pub fn as_char(&self) -> u8 {
        match *self {
            PrimitiveType::Byte => b'B',
            PrimitiveType::Char => b'C',
            PrimitiveType::Double => b'D',
            PrimitiveType::Float => b'F',
            PrimitiveType::Int => b'I',
            PrimitiveType::Long => b'J',
            PrimitiveType::Short => b'S',
            PrimitiveType::Boolean => b'Z'
        }
    }

    pub fn new_array_code(&self) -> u8 {
        match *self {
            PrimitiveType::Boolean => 0x04,
            PrimitiveType::Char => 0x05,
            PrimitiveType::Float => 0x06,
            PrimitiveType::Double => 0x07,
            PrimitiveType::Byte => 0x08,
            PrimitiveType::Short => 0x09,
            PrimitiveType::Int => 0x0a,
            PrimitiveType::Long => 0x0b
        }
    }
}

impl fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", char::from(self.as_char()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlatTypeDescriptor {
    Primitive(PrimitiveType),
    Reference(Arc<str>)
}

impl fmt::Display for FlatTypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FlatTypeDescriptor::Primitive(t) => write!(f, "{}", t),
            FlatTypeDescriptor::Reference(ref name) => write!(f, "L{};", name)
        }
    }
}

impl FlatTypeDescriptor {
    pub fn parse(s: &str) -> Option<FlatTypeDescriptor> {
        let (d, l) = FlatTypeDescriptor::parse_partial(s)?;

        if l == s.len() {
            Some(d)
        } else {
            None
        }
    }

    fn parse_partial(s: &str) -> Option<(FlatTypeDescriptor, usize)> {
        match s.as_bytes().get(0) {
            Some(&b'B') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Byte), 1)),
            Some(&b'C') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Char), 1)),
            Some(&b'D') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Double), 1)),
            Some(&b'F') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Float), 1)),
            Some(&b'I') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Int), 1)),
            Some(&b'J') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Long), 1)),
            Some(&b'S') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Short), 1)),
            Some(&b'Z') => Some((FlatTypeDescriptor::Primitive(PrimitiveType::Boolean), 1)),
            Some(&b'L') => {
                let end = s[1..].find(';')?;
                let name = &s[1..(1 + end)];

                Some((FlatTypeDescriptor::Reference(Arc::from(name)), 2 + end))
            },
            _ => None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeDescriptor {
    pub flat: FlatTypeDescriptor,
    pub array_dims: u8
}

impl TypeDescriptor {
    pub fn parse(s: &str) -> Option<TypeDescriptor> {
        let (d, l) = TypeDescriptor::parse_partial(s)?;

        if l == s.len() {
            Some(d)
        } else {
            None
        }
    }

    fn parse_partial(s: &str) -> Option<(TypeDescriptor, usize)> {
        let mut array_dims = 0_u8;

        while s.as_bytes().get(array_dims as usize) == Some(&b'[') {
            array_dims = array_dims.checked_add(1)?;
        };

        let (flat, flat_len) = FlatTypeDescriptor::parse_partial(&s[(array_dims as usize)..])?;

        Some((TypeDescriptor { flat, array_dims }, array_dims as usize + flat_len))
    }

    pub fn needs_dual_slot(&self) -> bool {
        if self.array_dims != 0 {
            return false;
        };

        match self.flat {
            FlatTypeDescriptor::Primitive(PrimitiveType::Double) => true,
            FlatTypeDescriptor::Primitive(PrimitiveType::Long) => true,
            _ => false
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for _ in 0..(self.array_dims) {
            write!(f, "[")?;
        };

        write!(f, "{}", self.flat)?;
        Result::Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub return_type: Option<TypeDescriptor>,
    pub param_types: Vec<TypeDescriptor>
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;

        for p in self.param_types.iter() {
            write!(f, "{}", p)?;
        };

        if let Some(ref return_type) = self.return_type {
            write!(f, "){}", return_type)?;
        } else {
            write!(f, ")V")?;
        };

        Result::Ok(())
    }
}

impl MethodDescriptor {
    pub fn parse(s: &str) -> Option<MethodDescriptor> {
        if s.as_bytes().get(0) != Some(&b'(') {
            return None;
        };

        let mut i = 1;
        let mut param_types = vec![];

        while s.as_bytes().get(i) != Some(&b')') {
            let (param_d, param_len) = TypeDescriptor::parse_partial(&s[i..])?;

            param_types.push(param_d);
            i += param_len;
        };

        i = i + 1;
        let return_type = if &s[i..] == "V" {
            None
        } else {
            let (return_type, return_len) = TypeDescriptor::parse_partial(&s[i..])?;

            if i + return_len != s.len() {
                return None;
            };
            Some(return_type)
        };

        Some(MethodDescriptor { return_type, param_types })
    }

    /// Number of local-variable slots the parameters occupy, not counting
    /// the receiver.
    pub fn param_slots(&self) -> u16 {
        self.param_types.iter()
            .map(|t| if t.needs_dual_slot() { 2 } else { 1 })
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct ConstantFieldref {
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: TypeDescriptor
}

#[derive(Debug, Clone)]
pub struct ConstantMethodref {
    pub owner: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: MethodDescriptor
}

#[derive(Debug, Clone)]
pub struct ConstantInvokeDynamic {
    pub bootstrap_method: u16,
    pub name: Arc<str>,
    pub descriptor: Arc<str>
}

#[derive(Debug, Clone)]
pub enum ConstantPoolEntry {
    Class(Arc<str>),
    Fieldref(ConstantFieldref),
    Methodref(ConstantMethodref),
    InterfaceMethodref(ConstantMethodref),
    String(Arc<str>),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    NameAndType(Arc<str>, Arc<str>),
    Utf8(Arc<str>),
    MethodHandle { kind: u8, reference: u16 },
    MethodType(Arc<str>),
    InvokeDynamic(ConstantInvokeDynamic),
    Empty
}

#[derive(Debug, Clone)]
enum RawConstantPoolEntry {
    Class { name_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    String { string_index: u16 },
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    NameAndType { name_index: u16, type_index: u16 },
    Utf8(Arc<str>),
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Empty
}

impl RawConstantPoolEntry {
    fn needs_next_empty(&self) -> bool {
        match *self {
            RawConstantPoolEntry::Long(_) => true,
            RawConstantPoolEntry::Double(_) => true,
            _ => false
        }
    }
}

/// A field or class constant resolved out of the pool so it can survive a
/// pool rebuild.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantValue {
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    String(Arc<str>)
}

#[derive(Debug, Clone)]
pub struct Field {
    pub flags: FieldFlags,
    pub name: Arc<str>,
    pub descriptor: TypeDescriptor,
    pub constant_value: Option<ConstantValue>,
    pub annotations: Vec<Arc<str>>
}

#[derive(Debug, Clone)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: Option<Arc<str>>
}

#[derive(Debug, Clone)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line: u16
}

#[derive(Debug, Clone)]
pub struct AttributeCode {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Box<[u8]>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub line_numbers: Vec<LineNumberEntry>
}

#[derive(Debug, Clone)]
pub struct Method {
    pub flags: MethodFlags,
    pub name: Arc<str>,
    pub descriptor: MethodDescriptor,
    pub code: Option<AttributeCode>,
    pub annotations: Vec<Arc<str>>
}

#[derive(Debug, Clone)]
pub struct ClassImage {
    pub version: (u16, u16),
    pub flags: ClassFlags,
    pub name: Arc<str>,
    pub super_name: Option<Arc<str>>,
    pub interfaces: Vec<Arc<str>>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub annotations: Vec<Arc<str>>
}

impl ClassImage {
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods.iter()
            .find(|m| m.name.as_ref() == name && m.descriptor.to_string() == descriptor)
    }

    pub fn find_field(&self, name: &str, descriptor: &str) -> Option<&Field> {
        self.fields.iter()
            .find(|f| f.name.as_ref() == name && f.descriptor.to_string() == descriptor)
    }

    pub fn has_annotation(&self, descriptor: &str) -> bool {
        self.annotations.iter().any(|a| a.as_ref() == descriptor)
    }
}

#[derive(Debug)]
pub enum ClassFileReadError {
    Io(io::Error),
    UnsupportedVersion(u16, u16),
    InvalidMagic,
    InvalidFlags,
    InvalidConstantPoolEntry(u16),
    InvalidField(u16),
    InvalidMethod(u16),
    InvalidAttribute(u16)
}

impl From<io::Error> for ClassFileReadError {
    fn from(err: io::Error) -> ClassFileReadError {
        ClassFileReadError::Io(err)
    }
}

impl fmt::Display for ClassFileReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ClassFileReadError::Io(ref err) => write!(f, "i/o error: {}", err),
            ClassFileReadError::UnsupportedVersion(major, minor) => write!(f, "unsupported class file version {}.{}", major, minor),
            ClassFileReadError::InvalidMagic => write!(f, "not a class file"),
            ClassFileReadError::InvalidFlags => write!(f, "invalid access flags"),
            ClassFileReadError::InvalidConstantPoolEntry(i) => write!(f, "invalid constant pool entry {}", i),
            ClassFileReadError::InvalidField(i) => write!(f, "invalid field {}", i),
            ClassFileReadError::InvalidMethod(i) => write!(f, "invalid method {}", i),
            ClassFileReadError::InvalidAttribute(i) => write!(f, "invalid attribute {}", i)
        }
    }
}

fn parse_raw_constant_pool_entry<R: Read>(r: &mut R, i: u16) -> Result<RawConstantPoolEntry, ClassFileReadError> {
    Result::Ok(match r.read_u8()? {
        7 => RawConstantPoolEntry::Class {
            name_index: r.read_u16::<BigEndian>()?
        },
        9 => RawConstantPoolEntry::Fieldref {
            class_index: r.read_u16::<BigEndian>()?,
            name_and_type_index: r.read_u16::<BigEndian>()?
        },
        10 => RawConstantPoolEntry::Methodref {
            class_index: r.read_u16::<BigEndian>()?,
            name_and_type_index: r.read_u16::<BigEndian>()?
        },
        11 => RawConstantPoolEntry::InterfaceMethodref {
            class_index: r.read_u16::<BigEndian>()?,
            name_and_type_index: r.read_u16::<BigEndian>()?
        },
        8 => RawConstantPoolEntry::String {
            string_index: r.read_u16::<BigEndian>()?
        },
        3 => RawConstantPoolEntry::Integer(r.read_i32::<BigEndian>()?),
        4 => RawConstantPoolEntry::Float(r.read_u32::<BigEndian>()?),
        5 => RawConstantPoolEntry::Long(r.read_i64::<BigEndian>()?),
        6 => RawConstantPoolEntry::Double(r.read_u64::<BigEndian>()?),
        12 => RawConstantPoolEntry::NameAndType {
            name_index: r.read_u16::<BigEndian>()?,
            type_index: r.read_u16::<BigEndian>()?
        },
        1 => {
            let len = r.read_u16::<BigEndian>()? as usize;
            let mut data = vec![0; len];

            r.read_exact(&mut data[..])?;
            match cesu8::from_java_cesu8(&data) {
                Result::Ok(val) => RawConstantPoolEntry::Utf8(Arc::from(val.as_ref())),
                Result::Err(_) => {
                    return Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i));
                }
            }
        },
        15 => RawConstantPoolEntry::MethodHandle {
            reference_kind: r.read_u8()?,
            reference_index: r.read_u16::<BigEndian>()?
        },
        16 => RawConstantPoolEntry::MethodType {
            descriptor_index: r.read_u16::<BigEndian>()?
        },
        18 => RawConstantPoolEntry::InvokeDynamic {
            bootstrap_method_attr_index: r.read_u16::<BigEndian>()?,
            name_and_type_index: r.read_u16::<BigEndian>()?
        },
        _ => {
            return Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i))
        }
    })
}

fn parse_raw_constant_pool<R: Read>(r: &mut R) -> Result<Vec<RawConstantPoolEntry>, ClassFileReadError> {
    let n = r.read_u16::<BigEndian>()?;
    let mut constant_pool = vec![];
    let mut skip_next = false;

    constant_pool.reserve_exact(n as usize);
    constant_pool.push(RawConstantPoolEntry::Empty);

    for i in 1..n {
        if skip_next {
            constant_pool.push(RawConstantPoolEntry::Empty);
            skip_next = false;
        } else {
            let entry = parse_raw_constant_pool_entry(r, i)?;

            skip_next = entry.needs_next_empty();
            constant_pool.push(entry);
        };
    };

    Result::Ok(constant_pool)
}

fn resolve_utf8(raw_constant_pool: &[RawConstantPoolEntry], i: u16, utf8_index: u16) -> Result<Arc<str>, ClassFileReadError> {
    match raw_constant_pool.get(utf8_index as usize) {
        Some(&RawConstantPoolEntry::Utf8(ref val)) => Result::Ok(val.clone()),
        _ => Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i))
    }
}

fn resolve_class_name(raw_constant_pool: &[RawConstantPoolEntry], i: u16, class_index: u16) -> Result<Arc<str>, ClassFileReadError> {
    match raw_constant_pool.get(class_index as usize) {
        Some(&RawConstantPoolEntry::Class { name_index }) => resolve_utf8(raw_constant_pool, i, name_index),
        _ => Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i))
    }
}

fn resolve_name_and_type(raw_constant_pool: &[RawConstantPoolEntry], i: u16, nt_index: u16) -> Result<(Arc<str>, Arc<str>), ClassFileReadError> {
    match raw_constant_pool.get(nt_index as usize) {
        Some(&RawConstantPoolEntry::NameAndType { name_index, type_index }) => Result::Ok((
            resolve_utf8(raw_constant_pool, i, name_index)?,
            resolve_utf8(raw_constant_pool, i, type_index)?
        )),
        _ => Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i))
    }
}

fn process_constant_pool(raw_constant_pool: Vec<RawConstantPoolEntry>) -> Result<Vec<ConstantPoolEntry>, ClassFileReadError> {
    let mut constant_pool = vec![];
    constant_pool.reserve_exact(raw_constant_pool.len());

    for (i, raw_entry) in raw_constant_pool.iter().enumerate() {
        let i = i as u16;
        constant_pool.push(match *raw_entry {
            RawConstantPoolEntry::Class { name_index } => ConstantPoolEntry::Class(
                resolve_utf8(&raw_constant_pool, i, name_index)?
            ),
            RawConstantPoolEntry::Fieldref { class_index, name_and_type_index } => ConstantPoolEntry::Fieldref({
                let owner = resolve_class_name(&raw_constant_pool, i, class_index)?;
                let (name, descriptor) = resolve_name_and_type(&raw_constant_pool, i, name_and_type_index)?;
                ConstantFieldref {
                    owner,
                    name,
                    descriptor: if let Some(d) = TypeDescriptor::parse(&descriptor) {
                        d
                    } else {
                        return Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i));
                    }
                }
            }),
            RawConstantPoolEntry::Methodref { class_index, name_and_type_index } => ConstantPoolEntry::Methodref(
                process_methodref(&raw_constant_pool, i, class_index, name_and_type_index)?
            ),
            RawConstantPoolEntry::InterfaceMethodref { class_index, name_and_type_index } => ConstantPoolEntry::InterfaceMethodref(
                process_methodref(&raw_constant_pool, i, class_index, name_and_type_index)?
            ),
            RawConstantPoolEntry::String { string_index } => ConstantPoolEntry::String(
                resolve_utf8(&raw_constant_pool, i, string_index)?
            ),
            RawConstantPoolEntry::Integer(val) => ConstantPoolEntry::Integer(val),
            RawConstantPoolEntry::Float(val) => ConstantPoolEntry::Float(val),
            RawConstantPoolEntry::Long(val) => ConstantPoolEntry::Long(val),
            RawConstantPoolEntry::Double(val) => ConstantPoolEntry::Double(val),
            RawConstantPoolEntry::NameAndType { name_index, type_index } => ConstantPoolEntry::NameAndType(
                resolve_utf8(&raw_constant_pool, i, name_index)?,
                resolve_utf8(&raw_constant_pool, i, type_index)?
            ),
            RawConstantPoolEntry::Utf8(ref val) => ConstantPoolEntry::Utf8(val.clone()),
            RawConstantPoolEntry::MethodHandle { reference_kind, reference_index } => ConstantPoolEntry::MethodHandle {
                kind: reference_kind,
                reference: reference_index
            },
            RawConstantPoolEntry::MethodType { descriptor_index } => ConstantPoolEntry::MethodType(
                resolve_utf8(&raw_constant_pool, i, descriptor_index)?
            ),
            RawConstantPoolEntry::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => ConstantPoolEntry::InvokeDynamic({
                let (name, descriptor) = resolve_name_and_type(&raw_constant_pool, i, name_and_type_index)?;
                ConstantInvokeDynamic {
                    bootstrap_method: bootstrap_method_attr_index,
                    name,
                    descriptor
                }
            }),
            RawConstantPoolEntry::Empty => ConstantPoolEntry::Empty
        });
    };

    Result::Ok(constant_pool)
}

fn process_methodref(raw_constant_pool: &[RawConstantPoolEntry], i: u16, class_index: u16, name_and_type_index: u16) -> Result<ConstantMethodref, ClassFileReadError> {
    let owner = resolve_class_name(raw_constant_pool, i, class_index)?;
    let (name, descriptor) = resolve_name_and_type(raw_constant_pool, i, name_and_type_index)?;

    Result::Ok(ConstantMethodref {
        owner,
        name,
        descriptor: if let Some(d) = MethodDescriptor::parse(&descriptor) {
            d
        } else {
            return Result::Err(ClassFileReadError::InvalidConstantPoolEntry(i));
        }
    })
}

fn pool_utf8(cp: &[ConstantPoolEntry], index: u16, i: u16) -> Result<Arc<str>, ClassFileReadError> {
    match cp.get(index as usize) {
        Some(&ConstantPoolEntry::Utf8(ref val)) => Result::Ok(val.clone()),
        _ => Result::Err(ClassFileReadError::InvalidAttribute(i))
    }
}

fn pool_class_name(cp: &[ConstantPoolEntry], index: u16, i: u16) -> Result<Arc<str>, ClassFileReadError> {
    match cp.get(index as usize) {
        Some(&ConstantPoolEntry::Class(ref name)) => Result::Ok(name.clone()),
        _ => Result::Err(ClassFileReadError::InvalidAttribute(i))
    }
}

// Annotation element_values are skipped structurally; only the annotation
// type descriptors are retained.
fn skip_element_value<R: Read>(r: &mut R, i: u16) -> Result<(), ClassFileReadError> {
    match r.read_u8()? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => {
            r.read_u16::<BigEndian>()?;
        },
        b'e' => {
            r.read_u16::<BigEndian>()?;
            r.read_u16::<BigEndian>()?;
        },
        b'@' => {
            skip_annotation(r, i)?;
        },
        b'[' => {
            let n = r.read_u16::<BigEndian>()?;
            for _ in 0..n {
                skip_element_value(r, i)?;
            };
        },
        _ => {
            return Result::Err(ClassFileReadError::InvalidAttribute(i));
        }
    };

    Result::Ok(())
}

fn skip_annotation<R: Read>(r: &mut R, i: u16) -> Result<u16, ClassFileReadError> {
    let type_index = r.read_u16::<BigEndian>()?;
    let num_pairs = r.read_u16::<BigEndian>()?;

    for _ in 0..num_pairs {
        r.read_u16::<BigEndian>()?;
        skip_element_value(r, i)?;
    };

    Result::Ok(type_index)
}

fn parse_annotations(cp: &[ConstantPoolEntry], data: &[u8], i: u16) -> Result<Vec<Arc<str>>, ClassFileReadError> {
    let mut r = data;
    let num = r.read_u16::<BigEndian>()?;
    let mut annotations = Vec::with_capacity(num as usize);

    for _ in 0..num {
        let type_index = skip_annotation(&mut r, i)?;
        annotations.push(pool_utf8(cp, type_index, i)?);
    };

    Result::Ok(annotations)
}

fn parse_code_attribute<R: Read>(cp: &[ConstantPoolEntry], r: &mut R, i: u16) -> Result<AttributeCode, ClassFileReadError> {
    let max_stack = r.read_u16::<BigEndian>()?;
    let max_locals = r.read_u16::<BigEndian>()?;
    let code_len = r.read_u32::<BigEndian>()?;

    if code_len == 0 || code_len >= 65536 {
        return Result::Err(ClassFileReadError::InvalidAttribute(i));
    };

    let mut code = vec![0_u8; code_len as usize].into_boxed_slice();
    r.read_exact(&mut code)?;

    let exception_table_len = r.read_u16::<BigEndian>()?;
    let mut exception_table = Vec::with_capacity(exception_table_len as usize);

    for _ in 0..exception_table_len {
        let start_pc = r.read_u16::<BigEndian>()?;
        let end_pc = r.read_u16::<BigEndian>()?;
        let handler_pc = r.read_u16::<BigEndian>()?;
        let catch_type = match r.read_u16::<BigEndian>()? {
            0 => None,
            idx => Some(pool_class_name(cp, idx, i)?)
        };

        exception_table.push(ExceptionTableEntry { start_pc, end_pc, handler_pc, catch_type });
    };

    let mut line_numbers = vec![];
    let num_attributes = r.read_u16::<BigEndian>()?;

    for _ in 0..num_attributes {
        let name = pool_utf8(cp, r.read_u16::<BigEndian>()?, i)?;
        let len = r.read_u32::<BigEndian>()? as usize;

        if name.as_ref() == "LineNumberTable" {
            let n = r.read_u16::<BigEndian>()?;

            if len != 2 + (n as usize) * 4 {
                return Result::Err(ClassFileReadError::InvalidAttribute(i));
            };

            for _ in 0..n {
                line_numbers.push(LineNumberEntry {
                    start_pc: r.read_u16::<BigEndian>()?,
                    line: r.read_u16::<BigEndian>()?
                });
            };
        } else {
            // StackMapTable, LocalVariableTable and friends index the old
            // constant pool and cannot survive a pool rebuild.
            let mut data = vec![0_u8; len];
            r.read_exact(&mut data)?;
        };
    };

    Result::Ok(AttributeCode {
        max_stack,
        max_locals,
        code,
        exception_table,
        line_numbers
    })
}

fn resolve_constant_value(cp: &[ConstantPoolEntry], index: u16, i: u16) -> Result<ConstantValue, ClassFileReadError> {
    match cp.get(index as usize) {
        Some(&ConstantPoolEntry::Integer(val)) => Result::Ok(ConstantValue::Integer(val)),
        Some(&ConstantPoolEntry::Float(val)) => Result::Ok(ConstantValue::Float(val)),
        Some(&ConstantPoolEntry::Long(val)) => Result::Ok(ConstantValue::Long(val)),
        Some(&ConstantPoolEntry::Double(val)) => Result::Ok(ConstantValue::Double(val)),
        Some(&ConstantPoolEntry::String(ref val)) => Result::Ok(ConstantValue::String(val.clone())),
        _ => Result::Err(ClassFileReadError::InvalidAttribute(i))
    }
}

fn parse_field<R: Read>(cp: &[ConstantPoolEntry], r: &mut R, i: u16) -> Result<Field, ClassFileReadError> {
    let flags = if let Some(flags) = FieldFlags::from_bits(r.read_u16::<BigEndian>()?) {
        flags
    } else {
        return Result::Err(ClassFileReadError::InvalidField(i));
    };

    let name = pool_utf8(cp, r.read_u16::<BigEndian>()?, i).map_err(|_| ClassFileReadError::InvalidField(i))?;
    let descriptor = pool_utf8(cp, r.read_u16::<BigEndian>()?, i).map_err(|_| ClassFileReadError::InvalidField(i))?;
    let descriptor = if let Some(d) = TypeDescriptor::parse(&descriptor) {
        d
    } else {
        return Result::Err(ClassFileReadError::InvalidField(i));
    };

    let mut constant_value = None;
    let mut annotations = vec![];
    let num_attributes = r.read_u16::<BigEndian>()?;

    for _ in 0..num_attributes {
        let attr_name = pool_utf8(cp, r.read_u16::<BigEndian>()?, i)?;
        let len = r.read_u32::<BigEndian>()? as usize;

        match attr_name.as_ref() {
            "ConstantValue" => {
                if len != 2 {
                    return Result::Err(ClassFileReadError::InvalidAttribute(i));
                };
                constant_value = Some(resolve_constant_value(cp, r.read_u16::<BigEndian>()?, i)?);
            },
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                let mut data = vec![0_u8; len];
                r.read_exact(&mut data)?;
                annotations.extend(parse_annotations(cp, &data, i)?);
            },
            _ => {
                let mut data = vec![0_u8; len];
                r.read_exact(&mut data)?;
            }
        };
    };

    Result::Ok(Field { flags, name, descriptor, constant_value, annotations })
}

fn parse_method<R: Read>(cp: &[ConstantPoolEntry], r: &mut R, i: u16) -> Result<Method, ClassFileReadError> {
    let flags = if let Some(flags) = MethodFlags::from_bits(r.read_u16::<BigEndian>()?) {
        flags
    } else {
        return Result::Err(ClassFileReadError::InvalidMethod(i));
    };

    let name = pool_utf8(cp, r.read_u16::<BigEndian>()?, i).map_err(|_| ClassFileReadError::InvalidMethod(i))?;
    let descriptor = pool_utf8(cp, r.read_u16::<BigEndian>()?, i).map_err(|_| ClassFileReadError::InvalidMethod(i))?;
    let descriptor = if let Some(d) = MethodDescriptor::parse(&descriptor) {
        d
    } else {
        return Result::Err(ClassFileReadError::InvalidMethod(i));
    };

    let mut code = None;
    let mut annotations = vec![];
    let num_attributes = r.read_u16::<BigEndian>()?;

    for _ in 0..num_attributes {
        let attr_name = pool_utf8(cp, r.read_u16::<BigEndian>()?, i)?;
        let len = r.read_u32::<BigEndian>()? as usize;

        match attr_name.as_ref() {
            "Code" => {
                code = Some(parse_code_attribute(cp, r, i)?);
            },
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                let mut data = vec![0_u8; len];
                r.read_exact(&mut data)?;
                annotations.extend(parse_annotations(cp, &data, i)?);
            },
            _ => {
                let mut data = vec![0_u8; len];
                r.read_exact(&mut data)?;
            }
        };
    };

    Result::Ok(Method { flags, name, descriptor, code, annotations })
}

/// Parses a class file into an immutable image together with its resolved
/// constant pool. The pool is needed separately by the bytecode decoder.
pub fn parse_class_file<R: Read>(r: &mut R) -> Result<(ClassImage, Vec<ConstantPoolEntry>), ClassFileReadError> {
    if r.read_u32::<BigEndian>()? != 0xcafebabe {
        return Result::Err(ClassFileReadError::InvalidMagic);
    };

    let version_minor = r.read_u16::<BigEndian>()?;
    let version_major = r.read_u16::<BigEndian>()?;

    if version_major < 45 || version_major > 52 {
        return Result::Err(ClassFileReadError::UnsupportedVersion(version_major, version_minor));
    };

    let constant_pool = process_constant_pool(parse_raw_constant_pool(r)?)?;

    let flags = if let Some(flags) = ClassFlags::from_bits(r.read_u16::<BigEndian>()?) {
        flags
    } else {
        return Result::Err(ClassFileReadError::InvalidFlags);
    };

    let name = pool_class_name(&constant_pool, r.read_u16::<BigEndian>()?, 0)
        .map_err(|_| ClassFileReadError::InvalidConstantPoolEntry(0))?;
    let super_name = match r.read_u16::<BigEndian>()? {
        0 => None,
        idx => Some(pool_class_name(&constant_pool, idx, 0).map_err(|_| ClassFileReadError::InvalidConstantPoolEntry(idx))?)
    };

    let num_interfaces = r.read_u16::<BigEndian>()?;
    let mut interfaces = Vec::with_capacity(num_interfaces as usize);

    for _ in 0..num_interfaces {
        let idx = r.read_u16::<BigEndian>()?;
        interfaces.push(pool_class_name(&constant_pool, idx, 0).map_err(|_| ClassFileReadError::InvalidConstantPoolEntry(idx))?);
    };

    let num_fields = r.read_u16::<BigEndian>()?;
    let mut fields = Vec::with_capacity(num_fields as usize);
    for i in 0..num_fields {
        fields.push(parse_field(&constant_pool, r, i)?);
    };

    let num_methods = r.read_u16::<BigEndian>()?;
    let mut methods = Vec::with_capacity(num_methods as usize);
    for i in 0..num_methods {
        methods.push(parse_method(&constant_pool, r, i)?);
    };

    let mut annotations = vec![];
    let num_attributes = r.read_u16::<BigEndian>()?;
    for i in 0..num_attributes {
        let attr_name = pool_utf8(&constant_pool, r.read_u16::<BigEndian>()?, i)?;
        let len = r.read_u32::<BigEndian>()? as usize;
        let mut data = vec![0_u8; len];

        r.read_exact(&mut data)?;
        match attr_name.as_ref() {
            "RuntimeVisibleAnnotations" | "RuntimeInvisibleAnnotations" => {
                annotations.extend(parse_annotations(&constant_pool, &data, i)?);
            },
            _ => {}
        };
    };

    let image = ClassImage {
        version: (version_major, version_minor),
        flags,
        name,
        super_name,
        interfaces,
        fields,
        methods,
        annotations
    };

    Result::Ok((image, constant_pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{class_file_with_method, empty_class_file};

    #[test]
    fn test_rejects_bad_magic() {
        let bytes = [0_u8, 1, 2, 3];

        match parse_class_file(&mut &bytes[..]) {
            Result::Err(ClassFileReadError::InvalidMagic) => {},
            other => panic!("expected InvalidMagic, got {:?}", other)
        };
    }

    #[test]
    fn test_rejects_future_version() {
        let mut bytes = empty_class_file("com/example/New");
        bytes[6] = 0;
        bytes[7] = 61;

        match parse_class_file(&mut &bytes[..]) {
            Result::Err(ClassFileReadError::UnsupportedVersion(61, 0)) => {},
            other => panic!("expected UnsupportedVersion, got {:?}", other)
        };
    }

    #[test]
    fn test_parses_header() {
        let bytes = empty_class_file("com/example/Empty");
        let (image, _) = parse_class_file(&mut &bytes[..]).unwrap();

        assert_eq!("com/example/Empty", image.name.as_ref());
        assert_eq!(Some("java/lang/Object"), image.super_name.as_deref());
        assert_eq!(0, image.fields.len());
        assert_eq!(0, image.methods.len());
    }

    #[test]
    fn test_parses_method_code() {
        // iconst_0; ireturn
        let bytes = class_file_with_method("com/example/A", "zero", "()I", &[0x03, 0xac]);
        let (image, _) = parse_class_file(&mut &bytes[..]).unwrap();
        let method = image.find_method("zero", "()I").unwrap();
        let code = method.code.as_ref().unwrap();

        assert_eq!(&[0x03, 0xac], code.code.as_ref());
        assert_eq!(1, code.max_stack);
    }

    #[test]
    fn test_type_descriptor_parsing() {
        assert_eq!(None, TypeDescriptor::parse("Lunterminated"));
        assert_eq!(None, TypeDescriptor::parse("II"));

        let d = TypeDescriptor::parse("[[Ljava/lang/String;").unwrap();
        assert_eq!(2, d.array_dims);
        assert_eq!(FlatTypeDescriptor::Reference(std::sync::Arc::from("java/lang/String")), d.flat);

        let d = TypeDescriptor::parse("J").unwrap();
        assert!(d.needs_dual_slot());
    }

    #[test]
    fn test_method_descriptor_parsing() {
        let d = MethodDescriptor::parse("(I[JLjava/lang/Object;)V").unwrap();

        assert_eq!(3, d.param_types.len());
        assert_eq!(None, d.return_type);
        assert_eq!(4, d.param_slots());
        assert_eq!("(I[JLjava/lang/Object;)V", d.to_string());

        assert_eq!(None, MethodDescriptor::parse("()"));
        assert_eq!(None, MethodDescriptor::parse("(V)V"));
    }
}
