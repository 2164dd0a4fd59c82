//! Minimal SPIR-V reader: header validation and the reflection the shader
//! interface checks need (entry points, locations, descriptor slots).

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::format::NumericClass;

pub const MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;
const MAX_MINOR_VERSION: u32 = 6;
const MAX_TYPE_DEPTH: usize = 32;

mod op {
    pub const ENTRY_POINT: u32 = 15;
    pub const TYPE_VOID: u32 = 19;
    pub const TYPE_BOOL: u32 = 20;
    pub const TYPE_INT: u32 = 21;
    pub const TYPE_FLOAT: u32 = 22;
    pub const TYPE_VECTOR: u32 = 23;
    pub const TYPE_MATRIX: u32 = 24;
    pub const TYPE_IMAGE: u32 = 25;
    pub const TYPE_SAMPLER: u32 = 26;
    pub const TYPE_SAMPLED_IMAGE: u32 = 27;
    pub const TYPE_ARRAY: u32 = 28;
    pub const TYPE_RUNTIME_ARRAY: u32 = 29;
    pub const TYPE_STRUCT: u32 = 30;
    pub const TYPE_POINTER: u32 = 32;
    pub const CONSTANT: u32 = 43;
    pub const VARIABLE: u32 = 59;
    pub const DECORATE: u32 = 71;
    pub const MEMBER_DECORATE: u32 = 72;
}

mod decoration {
    pub const BUILT_IN: u32 = 11;
    pub const LOCATION: u32 = 30;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpirvError {
    #[error("module is {0} bytes, not a whole number of words")]
    UnalignedLength(usize),
    #[error("module is {0} words, shorter than the header")]
    TooShort(usize),
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),
    #[error("unsupported version 0x{0:08x}")]
    BadVersion(u32),
    #[error("instruction at word {0} runs past the end of the module")]
    Truncated(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    UniformConstant,
    Input,
    Uniform,
    Output,
    StorageBuffer,
    Other(u32),
}

impl StorageClass {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => StorageClass::UniformConstant,
            1 => StorageClass::Input,
            2 => StorageClass::Uniform,
            3 => StorageClass::Output,
            12 => StorageClass::StorageBuffer,
            other => StorageClass::Other(other),
        }
    }

    fn is_descriptor(self) -> bool {
        matches!(
            self,
            StorageClass::UniformConstant | StorageClass::Uniform | StorageClass::StorageBuffer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionModel {
    Vertex,
    TessellationControl,
    TessellationEvaluation,
    Geometry,
    Fragment,
    GLCompute,
    Other(u32),
}

impl ExecutionModel {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => ExecutionModel::Vertex,
            1 => ExecutionModel::TessellationControl,
            2 => ExecutionModel::TessellationEvaluation,
            3 => ExecutionModel::Geometry,
            4 => ExecutionModel::Fragment,
            5 => ExecutionModel::GLCompute,
            other => ExecutionModel::Other(other),
        }
    }
}

/// Resolved SPIR-V type, compared structurally across modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpirvType {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Box<SpirvType>, count: u32 },
    Matrix { column: Box<SpirvType>, count: u32 },
    /// `length` is `None` for runtime arrays.
    Array { element: Box<SpirvType>, length: Option<u32> },
    Struct(Vec<SpirvType>),
    Image,
    Sampler,
    SampledImage,
    Pointer(Box<SpirvType>),
    Unknown,
}

impl SpirvType {
    /// Numeric class of the innermost scalar, if any.
    pub fn numeric_class(&self) -> Option<NumericClass> {
        match self {
            SpirvType::Int { signed: true, .. } => Some(NumericClass::Sint),
            SpirvType::Int { signed: false, .. } => Some(NumericClass::Uint),
            SpirvType::Float { .. } => Some(NumericClass::Float),
            SpirvType::Vector { component, .. } => component.numeric_class(),
            SpirvType::Matrix { column, .. } => column.numeric_class(),
            SpirvType::Array { element, .. } => element.numeric_class(),
            _ => None,
        }
    }
}

impl fmt::Display for SpirvType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpirvType::Void => f.write_str("void"),
            SpirvType::Bool => f.write_str("bool"),
            SpirvType::Int { width, signed } => {
                write!(f, "{}{}", if *signed { "sint" } else { "uint" }, width)
            }
            SpirvType::Float { width } => write!(f, "float{}", width),
            SpirvType::Vector { component, count } => write!(f, "vec{} of {}", count, component),
            SpirvType::Matrix { column, count } => write!(f, "mat{} of {}", count, column),
            SpirvType::Array {
                element,
                length: Some(length),
            } => write!(f, "arr[{}] of {}", length, element),
            SpirvType::Array { element, length: None } => write!(f, "arr[] of {}", element),
            SpirvType::Struct(members) => {
                f.write_str("struct of (")?;
                for (i, member) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", member)?;
                }
                f.write_str(")")
            }
            SpirvType::Image => f.write_str("image"),
            SpirvType::Sampler => f.write_str("sampler"),
            SpirvType::SampledImage => f.write_str("sampler+image"),
            SpirvType::Pointer(pointee) => write!(f, "ptr to {}", pointee),
            SpirvType::Unknown => f.write_str("unknown"),
        }
    }
}

/// One location-assigned input or output of an entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceVariable {
    pub location: u32,
    pub ty: SpirvType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub name: String,
    pub model: ExecutionModel,
    /// Sorted by location; built-ins excluded.
    pub inputs: Vec<InterfaceVariable>,
    pub outputs: Vec<InterfaceVariable>,
}

/// A module-scope variable bound to a descriptor slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSlot {
    pub set: u32,
    pub binding: u32,
    pub storage: StorageClass,
    pub ty: SpirvType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub version: (u32, u32),
    pub entry_points: Vec<EntryPoint>,
    pub descriptor_slots: Vec<DescriptorSlot>,
}

impl Module {
    pub fn entry_point(&self, name: &str, model: ExecutionModel) -> Option<&EntryPoint> {
        self.entry_points
            .iter()
            .find(|ep| ep.name == name && ep.model == model)
    }
}

/// Split a byte stream into words and check the header. The magic number
/// selects the byte order, so big-endian modules are accepted too.
/// Returns the words in host order and the `(major, minor)` version.
pub fn validate_header(bytes: &[u8]) -> Result<(Vec<u32>, (u32, u32)), SpirvError> {
    if bytes.len() % 4 != 0 {
        return Err(SpirvError::UnalignedLength(bytes.len()));
    }
    let mut words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    if words.len() < HEADER_WORDS {
        return Err(SpirvError::TooShort(words.len()));
    }
    if words[0] == MAGIC.swap_bytes() {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    } else if words[0] != MAGIC {
        return Err(SpirvError::BadMagic(words[0]));
    }
    let version = words[1];
    let major = (version >> 16) & 0xff;
    let minor = (version >> 8) & 0xff;
    if major != 1 || minor > MAX_MINOR_VERSION || version & 0xff00_00ff != 0 {
        return Err(SpirvError::BadVersion(version));
    }
    Ok((words, (major, minor)))
}

#[derive(Debug, Clone)]
enum RawType {
    Void,
    Bool,
    Int(u32, bool),
    Float(u32),
    Vector(u32, u32),
    Matrix(u32, u32),
    Array(u32, u32),
    RuntimeArray(u32),
    Struct(Vec<u32>),
    Pointer(u32),
    Image,
    Sampler,
    SampledImage,
}

#[derive(Debug, Default, Clone, Copy)]
struct Decorations {
    location: Option<u32>,
    binding: Option<u32>,
    set: Option<u32>,
    builtin: bool,
}

struct RawEntryPoint {
    model: ExecutionModel,
    name: String,
    interface: Vec<u32>,
}

struct RawVariable {
    pointer_type: u32,
    storage: StorageClass,
}

/// Parse a module and reflect its interfaces.
pub fn parse(bytes: &[u8]) -> Result<Module, SpirvError> {
    let (words, version) = validate_header(bytes)?;

    let mut entry_points = Vec::new();
    let mut decorations: HashMap<u32, Decorations> = HashMap::new();
    let mut builtin_blocks: HashSet<u32> = HashSet::new();
    let mut types: HashMap<u32, RawType> = HashMap::new();
    let mut constants: HashMap<u32, u32> = HashMap::new();
    let mut variables: Vec<(u32, RawVariable)> = Vec::new();

    let mut offset = HEADER_WORDS;
    while offset < words.len() {
        let word = words[offset];
        let count = (word >> 16) as usize;
        let opcode = word & 0xffff;
        if count == 0 || offset + count > words.len() {
            return Err(SpirvError::Truncated(offset));
        }
        let operands = &words[offset + 1..offset + count];
        offset += count;

        // Operand slices shorter than an opcode requires are skipped.
        match (opcode, operands) {
            (op::ENTRY_POINT, [model, _function, rest @ ..]) => {
                let (name, used) = literal_string(rest);
                entry_points.push(RawEntryPoint {
                    model: ExecutionModel::from_raw(*model),
                    name,
                    interface: rest[used..].to_vec(),
                });
            }
            (op::DECORATE, [target, kind, literals @ ..]) => {
                let entry = decorations.entry(*target).or_default();
                match (*kind, literals.first()) {
                    (decoration::LOCATION, Some(v)) => entry.location = Some(*v),
                    (decoration::BINDING, Some(v)) => entry.binding = Some(*v),
                    (decoration::DESCRIPTOR_SET, Some(v)) => entry.set = Some(*v),
                    (decoration::BUILT_IN, _) => entry.builtin = true,
                    _ => {}
                }
            }
            (op::MEMBER_DECORATE, [structure, _member, decoration::BUILT_IN, ..]) => {
                builtin_blocks.insert(*structure);
            }
            (op::TYPE_VOID, [id]) => {
                types.insert(*id, RawType::Void);
            }
            (op::TYPE_BOOL, [id]) => {
                types.insert(*id, RawType::Bool);
            }
            (op::TYPE_INT, [id, width, signed]) => {
                types.insert(*id, RawType::Int(*width, *signed != 0));
            }
            (op::TYPE_FLOAT, [id, width, ..]) => {
                types.insert(*id, RawType::Float(*width));
            }
            (op::TYPE_VECTOR, [id, component, n]) => {
                types.insert(*id, RawType::Vector(*component, *n));
            }
            (op::TYPE_MATRIX, [id, column, n]) => {
                types.insert(*id, RawType::Matrix(*column, *n));
            }
            (op::TYPE_IMAGE, [id, ..]) => {
                types.insert(*id, RawType::Image);
            }
            (op::TYPE_SAMPLER, [id]) => {
                types.insert(*id, RawType::Sampler);
            }
            (op::TYPE_SAMPLED_IMAGE, [id, _image]) => {
                types.insert(*id, RawType::SampledImage);
            }
            (op::TYPE_ARRAY, [id, element, length]) => {
                types.insert(*id, RawType::Array(*element, *length));
            }
            (op::TYPE_RUNTIME_ARRAY, [id, element]) => {
                types.insert(*id, RawType::RuntimeArray(*element));
            }
            (op::TYPE_STRUCT, [id, members @ ..]) => {
                types.insert(*id, RawType::Struct(members.to_vec()));
            }
            (op::TYPE_POINTER, [id, _storage, pointee]) => {
                types.insert(*id, RawType::Pointer(*pointee));
            }
            (op::CONSTANT, [_ty, id, value, ..]) => {
                constants.insert(*id, *value);
            }
            (op::VARIABLE, [pointer_type, id, storage, ..]) => {
                variables.push((
                    *id,
                    RawVariable {
                        pointer_type: *pointer_type,
                        storage: StorageClass::from_raw(*storage),
                    },
                ));
            }
            _ => {}
        }
    }

    let resolver = TypeResolver {
        types: &types,
        constants: &constants,
    };
    let variable_map: HashMap<u32, &RawVariable> =
        variables.iter().map(|(id, var)| (*id, var)).collect();

    let entry_points = entry_points
        .into_iter()
        .map(|raw| {
            let mut inputs = Vec::new();
            let mut outputs = Vec::new();
            for id in &raw.interface {
                let Some(var) = variable_map.get(id) else {
                    continue;
                };
                let deco = decorations.get(id).copied().unwrap_or_default();
                let pointee = resolver.pointee(var.pointer_type);
                if deco.builtin || pointee.is_some_and(|p| builtin_blocks.contains(&p)) {
                    continue;
                }
                let Some(location) = deco.location else {
                    continue;
                };
                let ty = pointee.map_or(SpirvType::Unknown, |p| resolver.resolve(p, 0));
                let slot = InterfaceVariable { location, ty };
                match var.storage {
                    StorageClass::Input => inputs.push(slot),
                    StorageClass::Output => outputs.push(slot),
                    _ => {}
                }
            }
            inputs.sort_by_key(|v| v.location);
            outputs.sort_by_key(|v| v.location);
            EntryPoint {
                name: raw.name,
                model: raw.model,
                inputs,
                outputs,
            }
        })
        .collect();

    let mut descriptor_slots: Vec<DescriptorSlot> = variables
        .iter()
        .filter(|(_, var)| var.storage.is_descriptor())
        .filter_map(|(id, var)| {
            let deco = decorations.get(id)?;
            let binding = deco.binding?;
            let ty = resolver
                .pointee(var.pointer_type)
                .map_or(SpirvType::Unknown, |p| resolver.resolve(p, 0));
            Some(DescriptorSlot {
                set: deco.set.unwrap_or(0),
                binding,
                storage: var.storage,
                ty,
            })
        })
        .collect();
    descriptor_slots.sort_by_key(|slot| (slot.set, slot.binding));

    Ok(Module {
        version,
        entry_points,
        descriptor_slots,
    })
}

struct TypeResolver<'a> {
    types: &'a HashMap<u32, RawType>,
    constants: &'a HashMap<u32, u32>,
}

impl TypeResolver<'_> {
    fn pointee(&self, pointer_type: u32) -> Option<u32> {
        match self.types.get(&pointer_type) {
            Some(RawType::Pointer(pointee)) => Some(*pointee),
            _ => None,
        }
    }

    fn resolve(&self, id: u32, depth: usize) -> SpirvType {
        if depth > MAX_TYPE_DEPTH {
            return SpirvType::Unknown;
        }
        let next = depth + 1;
        match self.types.get(&id) {
            Some(RawType::Void) => SpirvType::Void,
            Some(RawType::Bool) => SpirvType::Bool,
            Some(RawType::Int(width, signed)) => SpirvType::Int {
                width: *width,
                signed: *signed,
            },
            Some(RawType::Float(width)) => SpirvType::Float { width: *width },
            Some(RawType::Vector(component, count)) => SpirvType::Vector {
                component: Box::new(self.resolve(*component, next)),
                count: *count,
            },
            Some(RawType::Matrix(column, count)) => SpirvType::Matrix {
                column: Box::new(self.resolve(*column, next)),
                count: *count,
            },
            Some(RawType::Array(element, length)) => SpirvType::Array {
                element: Box::new(self.resolve(*element, next)),
                length: Some(self.constants.get(length).copied().unwrap_or(0)),
            },
            Some(RawType::RuntimeArray(element)) => SpirvType::Array {
                element: Box::new(self.resolve(*element, next)),
                length: None,
            },
            Some(RawType::Struct(members)) => {
                SpirvType::Struct(members.iter().map(|m| self.resolve(*m, next)).collect())
            }
            Some(RawType::Pointer(pointee)) => {
                SpirvType::Pointer(Box::new(self.resolve(*pointee, next)))
            }
            Some(RawType::Image) => SpirvType::Image,
            Some(RawType::Sampler) => SpirvType::Sampler,
            Some(RawType::SampledImage) => SpirvType::SampledImage,
            None => SpirvType::Unknown,
        }
    }
}

/// Decode a nul-terminated literal string. Returns the string and the
/// number of words it occupied.
fn literal_string(words: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return (String::from_utf8_lossy(&bytes).into_owned(), i + 1);
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), words.len())
}
