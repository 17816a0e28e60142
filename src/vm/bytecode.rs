//! Bytecode model and its binary serialization.
//!
//! Binary format (all integers little-endian):
//! - Magic: "STRN" (4 bytes)
//! - Version: u32
//! - Operation names: count + strings
//! - Globals size: u32
//! - Data segment: count + tagged items
//! - Functions: count + function data

use std::io::{self, Cursor, Read, Write};

use serde::Serialize;
use thiserror::Error;

use super::ops::Instruction;
use super::primitive::ADDRESS_SIZE;
use super::verifier::VerifyError;

/// Magic bytes for strand bytecode files
pub const MAGIC: &[u8; 4] = b"STRN";

/// Current bytecode format version
pub const VERSION: u32 = 1;

/// Upper bound on speculative preallocation for counts read from input.
const MAX_PREALLOC: usize = 1024;

/// Error type for bytecode operations
#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid opcode: {0:#04x}")]
    InvalidOpcode(u8),
    #[error("invalid data tag: {0:#04x}")]
    InvalidDataTag(u8),
    #[error("{0} trailing bytes after the last function")]
    TrailingBytes(usize),
    #[error("invalid UTF-8 string")]
    InvalidUtf8,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
}

/// A typed constant in the data segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DataItem {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    /// Materialised as an address cell followed by the NUL-terminated text
    /// the cell points at.
    Str(String),
}

impl DataItem {
    const TAG_I8: u8 = 0;
    const TAG_U8: u8 = 1;
    const TAG_I16: u8 = 2;
    const TAG_U16: u8 = 3;
    const TAG_I32: u8 = 4;
    const TAG_U32: u8 = 5;
    const TAG_I64: u8 = 6;
    const TAG_U64: u8 = 7;
    const TAG_F32: u8 = 8;
    const TAG_F64: u8 = 9;
    const TAG_BOOL: u8 = 10;
    const TAG_BYTES: u8 = 11;
    const TAG_STR: u8 = 12;

    /// Bytes this item occupies in the data segment.
    pub fn size(&self) -> usize {
        match self {
            DataItem::I8(_) | DataItem::U8(_) | DataItem::Bool(_) => 1,
            DataItem::I16(_) | DataItem::U16(_) => 2,
            DataItem::I32(_) | DataItem::U32(_) | DataItem::F32(_) => 4,
            DataItem::I64(_) | DataItem::U64(_) | DataItem::F64(_) => 8,
            DataItem::Bytes(bytes) => bytes.len(),
            DataItem::Str(text) => ADDRESS_SIZE + text.len() + 1,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            DataItem::I8(_) => Self::TAG_I8,
            DataItem::U8(_) => Self::TAG_U8,
            DataItem::I16(_) => Self::TAG_I16,
            DataItem::U16(_) => Self::TAG_U16,
            DataItem::I32(_) => Self::TAG_I32,
            DataItem::U32(_) => Self::TAG_U32,
            DataItem::I64(_) => Self::TAG_I64,
            DataItem::U64(_) => Self::TAG_U64,
            DataItem::F32(_) => Self::TAG_F32,
            DataItem::F64(_) => Self::TAG_F64,
            DataItem::Bool(_) => Self::TAG_BOOL,
            DataItem::Bytes(_) => Self::TAG_BYTES,
            DataItem::Str(_) => Self::TAG_STR,
        }
    }
}

/// A function of a [`Module`].
///
/// Parameters and locals are laid out contiguously in declaration order, so
/// `ParamsAddress`/`LocalsAddress` operands are plain byte offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Function {
    pub name: String,
    pub export: bool,
    pub params: Vec<u32>,
    pub result: Option<u32>,
    pub locals: Vec<u32>,
    pub labels: Vec<(String, u32)>,
    pub code: Vec<Instruction>,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            export: false,
            params: Vec::new(),
            result: None,
            locals: Vec::new(),
            labels: Vec::new(),
            code: Vec::new(),
        }
    }

    pub fn exported(mut self) -> Self {
        self.export = true;
        self
    }

    pub fn param(mut self, size: u32) -> Self {
        self.params.push(size);
        self
    }

    pub fn result(mut self, size: u32) -> Self {
        self.result = Some(size);
        self
    }

    pub fn local(mut self, size: u32) -> Self {
        self.locals.push(size);
        self
    }

    /// Mark the position of the next instruction with `name`.
    pub fn label(mut self, name: impl Into<String>) -> Self {
        self.labels.push((name.into(), self.code.len() as u32));
        self
    }

    pub fn emit(mut self, instruction: Instruction) -> Self {
        self.code.push(instruction);
        self
    }

    pub fn emit_all(mut self, instructions: impl IntoIterator<Item = Instruction>) -> Self {
        self.code.extend(instructions);
        self
    }

    pub fn params_size(&self) -> usize {
        self.params.iter().map(|&s| s as usize).sum()
    }

    pub fn result_size(&self) -> usize {
        self.result.unwrap_or(0) as usize
    }

    pub fn locals_size(&self) -> usize {
        self.locals.iter().map(|&s| s as usize).sum()
    }

    /// Instruction index of `label`, if declared.
    pub fn label_pc(&self, label: &str) -> Option<usize> {
        self.labels
            .iter()
            .find(|(name, _)| name == label)
            .map(|&(_, pc)| pc as usize)
    }
}

/// A loaded bytecode artifact. Immutable once loaded and shared by every
/// context started from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Module {
    pub ops: Vec<String>,
    pub globals_size: u32,
    pub data: Vec<DataItem>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an operation name and return its index.
    pub fn op(&mut self, name: &str) -> u32 {
        if let Some(index) = self.ops.iter().position(|op| op == name) {
            return index as u32;
        }
        self.ops.push(name.to_string());
        (self.ops.len() - 1) as u32
    }

    /// Append a data item and return its byte offset in the data segment.
    pub fn data(&mut self, item: DataItem) -> u32 {
        let offset = self.data_size() as u32;
        self.data.push(item);
        offset
    }

    /// Append a function and return its index.
    pub fn function(&mut self, function: Function) -> u32 {
        self.functions.push(function);
        (self.functions.len() - 1) as u32
    }

    pub fn with_globals(mut self, size: u32) -> Self {
        self.globals_size = size;
        self
    }

    pub fn data_size(&self) -> usize {
        self.data.iter().map(DataItem::size).sum()
    }

    pub fn find_function(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    /// Exported function named `name`.
    pub fn find_export(&self, name: &str) -> Option<usize> {
        self.functions
            .iter()
            .position(|f| f.export && f.name == name)
    }

    /// Parse and verify a bytecode buffer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BytecodeError> {
        let module = deserialize(bytes)?;
        super::verifier::verify_module(&module)?;
        Ok(module)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(self)
    }
}

/// Serialize a Module to bytes
pub fn serialize(module: &Module) -> Vec<u8> {
    let mut buf = Vec::new();
    // Writes into a Vec are infallible.
    let _ = write_module(&mut buf, module);
    buf
}

/// Deserialize a Module from bytes without verifying it.
pub fn deserialize(data: &[u8]) -> Result<Module, BytecodeError> {
    let mut cursor = Cursor::new(data);
    let module = read_module(&mut cursor)?;
    let rest = data.len() - cursor.position() as usize;
    if rest != 0 {
        return Err(BytecodeError::TrailingBytes(rest));
    }
    Ok(module)
}

/// Write a Module to a writer
pub fn write_module<W: Write>(w: &mut W, module: &Module) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32(w, VERSION)?;

    write_u32(w, module.ops.len() as u32)?;
    for op in &module.ops {
        write_string(w, op)?;
    }

    write_u32(w, module.globals_size)?;

    write_u32(w, module.data.len() as u32)?;
    for item in &module.data {
        write_data_item(w, item)?;
    }

    write_u32(w, module.functions.len() as u32)?;
    for func in &module.functions {
        write_function(w, func)?;
    }

    Ok(())
}

/// Read a Module from a reader
pub fn read_module<R: Read>(r: &mut R) -> Result<Module, BytecodeError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    if &magic != MAGIC {
        return Err(BytecodeError::InvalidMagic);
    }

    let version = read_u32(r)?;
    if version != VERSION {
        return Err(BytecodeError::UnsupportedVersion(version));
    }

    let op_count = read_count(r)?;
    let mut ops = Vec::with_capacity(op_count.min(MAX_PREALLOC));
    for _ in 0..op_count {
        ops.push(read_string(r)?);
    }

    let globals_size = read_u32(r)?;

    let data_count = read_count(r)?;
    let mut data = Vec::with_capacity(data_count.min(MAX_PREALLOC));
    for _ in 0..data_count {
        data.push(read_data_item(r)?);
    }

    let func_count = read_count(r)?;
    let mut functions = Vec::with_capacity(func_count.min(MAX_PREALLOC));
    for _ in 0..func_count {
        functions.push(read_function(r)?);
    }

    Ok(Module {
        ops,
        globals_size,
        data,
        functions,
    })
}

fn write_data_item<W: Write>(w: &mut W, item: &DataItem) -> io::Result<()> {
    w.write_all(&[item.tag()])?;
    match item {
        DataItem::I8(v) => w.write_all(&v.to_le_bytes()),
        DataItem::U8(v) => w.write_all(&v.to_le_bytes()),
        DataItem::I16(v) => w.write_all(&v.to_le_bytes()),
        DataItem::U16(v) => w.write_all(&v.to_le_bytes()),
        DataItem::I32(v) => w.write_all(&v.to_le_bytes()),
        DataItem::U32(v) => w.write_all(&v.to_le_bytes()),
        DataItem::I64(v) => w.write_all(&v.to_le_bytes()),
        DataItem::U64(v) => w.write_all(&v.to_le_bytes()),
        DataItem::F32(v) => w.write_all(&v.to_le_bytes()),
        DataItem::F64(v) => w.write_all(&v.to_le_bytes()),
        DataItem::Bool(v) => w.write_all(&[*v as u8]),
        DataItem::Bytes(bytes) => {
            write_u32(w, bytes.len() as u32)?;
            w.write_all(bytes)
        }
        DataItem::Str(text) => write_string(w, text),
    }
}

fn read_data_item<R: Read>(r: &mut R) -> Result<DataItem, BytecodeError> {
    let tag = read_u8(r)?;
    let item = match tag {
        DataItem::TAG_I8 => DataItem::I8(i8::from_le_bytes(read_array(r)?)),
        DataItem::TAG_U8 => DataItem::U8(read_u8(r)?),
        DataItem::TAG_I16 => DataItem::I16(i16::from_le_bytes(read_array(r)?)),
        DataItem::TAG_U16 => DataItem::U16(u16::from_le_bytes(read_array(r)?)),
        DataItem::TAG_I32 => DataItem::I32(i32::from_le_bytes(read_array(r)?)),
        DataItem::TAG_U32 => DataItem::U32(read_u32(r)?),
        DataItem::TAG_I64 => DataItem::I64(i64::from_le_bytes(read_array(r)?)),
        DataItem::TAG_U64 => DataItem::U64(u64::from_le_bytes(read_array(r)?)),
        DataItem::TAG_F32 => DataItem::F32(f32::from_le_bytes(read_array(r)?)),
        DataItem::TAG_F64 => DataItem::F64(f64::from_le_bytes(read_array(r)?)),
        DataItem::TAG_BOOL => DataItem::Bool(read_u8(r)? != 0),
        DataItem::TAG_BYTES => {
            let len = read_count(r)?;
            DataItem::Bytes(read_bytes(r, len)?)
        }
        DataItem::TAG_STR => DataItem::Str(read_string(r)?),
        _ => return Err(BytecodeError::InvalidDataTag(tag)),
    };
    Ok(item)
}

fn write_function<W: Write>(w: &mut W, func: &Function) -> io::Result<()> {
    write_string(w, &func.name)?;
    w.write_all(&[func.export as u8])?;

    write_sizes(w, &func.params)?;
    match func.result {
        Some(size) => {
            w.write_all(&[1u8])?;
            write_u32(w, size)?;
        }
        None => {
            w.write_all(&[0u8])?;
            write_u32(w, 0)?;
        }
    }
    write_sizes(w, &func.locals)?;

    write_u32(w, func.labels.len() as u32)?;
    for (name, pc) in &func.labels {
        write_string(w, name)?;
        write_u32(w, *pc)?;
    }

    write_u32(w, func.code.len() as u32)?;
    for instruction in &func.code {
        write_instruction(w, instruction)?;
    }

    Ok(())
}

fn read_function<R: Read>(r: &mut R) -> Result<Function, BytecodeError> {
    let name = read_string(r)?;
    let export = read_u8(r)? != 0;

    let params = read_sizes(r)?;
    let has_result = read_u8(r)? != 0;
    let result_size = read_u32(r)?;
    let result = has_result.then_some(result_size);
    let locals = read_sizes(r)?;

    let label_count = read_count(r)?;
    let mut labels = Vec::with_capacity(label_count.min(MAX_PREALLOC));
    for _ in 0..label_count {
        let label = read_string(r)?;
        labels.push((label, read_u32(r)?));
    }

    let code_len = read_count(r)?;
    let mut code = Vec::with_capacity(code_len.min(MAX_PREALLOC));
    for _ in 0..code_len {
        code.push(read_instruction(r)?);
    }

    Ok(Function {
        name,
        export,
        params,
        result,
        locals,
        labels,
        code,
    })
}

fn write_instruction<W: Write>(w: &mut W, instruction: &Instruction) -> io::Result<()> {
    w.write_all(&[instruction.opcode()])?;
    match instruction {
        Instruction::DataAddress(v)
        | Instruction::ParamsAddress(v)
        | Instruction::LocalsAddress(v)
        | Instruction::GlobalsAddress(v)
        | Instruction::Offset(v)
        | Instruction::Copy(v)
        | Instruction::Call(v)
        | Instruction::Jump(v)
        | Instruction::BranchIf(v) => write_u32(w, *v),
        Instruction::Tuple(sizes) => write_sizes(w, sizes),
        Instruction::OpEnd { op, result } => {
            write_u32(w, *op)?;
            write_u32(w, *result)
        }
        Instruction::ResultAddress
        | Instruction::Reference
        | Instruction::Dereference
        | Instruction::OpBegin
        | Instruction::Param
        | Instruction::Target
        | Instruction::Return => Ok(()),
    }
}

fn read_instruction<R: Read>(r: &mut R) -> Result<Instruction, BytecodeError> {
    let opcode = read_u8(r)?;
    let instruction = match opcode {
        Instruction::DATA_ADDRESS => Instruction::DataAddress(read_u32(r)?),
        Instruction::PARAMS_ADDRESS => Instruction::ParamsAddress(read_u32(r)?),
        Instruction::RESULT_ADDRESS => Instruction::ResultAddress,
        Instruction::LOCALS_ADDRESS => Instruction::LocalsAddress(read_u32(r)?),
        Instruction::GLOBALS_ADDRESS => Instruction::GlobalsAddress(read_u32(r)?),
        Instruction::OFFSET => Instruction::Offset(read_u32(r)?),
        Instruction::REFERENCE => Instruction::Reference,
        Instruction::DEREFERENCE => Instruction::Dereference,
        Instruction::TUPLE => Instruction::Tuple(read_sizes(r)?),
        Instruction::COPY => Instruction::Copy(read_u32(r)?),
        Instruction::OP_BEGIN => Instruction::OpBegin,
        Instruction::PARAM => Instruction::Param,
        Instruction::TARGET => Instruction::Target,
        Instruction::OP_END => {
            let op = read_u32(r)?;
            let result = read_u32(r)?;
            Instruction::OpEnd { op, result }
        }
        Instruction::CALL => Instruction::Call(read_u32(r)?),
        Instruction::JUMP => Instruction::Jump(read_u32(r)?),
        Instruction::BRANCH_IF => Instruction::BranchIf(read_u32(r)?),
        Instruction::RETURN => Instruction::Return,
        _ => return Err(BytecodeError::InvalidOpcode(opcode)),
    };
    Ok(instruction)
}

fn write_sizes<W: Write>(w: &mut W, sizes: &[u32]) -> io::Result<()> {
    write_u32(w, sizes.len() as u32)?;
    for size in sizes {
        write_u32(w, *size)?;
    }
    Ok(())
}

fn read_sizes<R: Read>(r: &mut R) -> Result<Vec<u32>, BytecodeError> {
    let count = read_count(r)?;
    let mut sizes = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        sizes.push(read_u32(r)?);
    }
    Ok(sizes)
}

fn read_array<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N], BytecodeError> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)
        .map_err(|_| BytecodeError::UnexpectedEof)?;
    Ok(buf)
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, BytecodeError> {
    Ok(read_array::<1, _>(r)?[0])
}

fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, BytecodeError> {
    Ok(u32::from_le_bytes(read_array(r)?))
}

fn read_count<R: Read>(r: &mut R) -> Result<usize, BytecodeError> {
    Ok(read_u32(r)? as usize)
}

fn read_bytes<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>, BytecodeError> {
    let mut buf = Vec::with_capacity(len.min(MAX_PREALLOC * 64));
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(BytecodeError::UnexpectedEof);
    }
    Ok(buf)
}

fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32(w, s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, BytecodeError> {
    let len = read_count(r)?;
    let buf = read_bytes(r, len)?;
    String::from_utf8(buf).map_err(|_| BytecodeError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Module {
        let mut module = Module::new().with_globals(16);
        let add = module.op("add");
        let a = module.data(DataItem::I64(2));
        let b = module.data(DataItem::I64(3));
        module.data(DataItem::Str("hi".to_string()));
        module.data(DataItem::Bytes(vec![1, 2, 3]));
        module.function(
            Function::new("main")
                .exported()
                .local(8)
                .label("start")
                .emit(Instruction::OpBegin)
                .emit(Instruction::DataAddress(a))
                .emit(Instruction::DataAddress(b))
                .emit(Instruction::Tuple(vec![8, 8]))
                .emit(Instruction::Param)
                .emit(Instruction::LocalsAddress(0))
                .emit(Instruction::Target)
                .emit(Instruction::OpEnd { op: add, result: 0 })
                .emit(Instruction::Return),
        );
        module
    }

    #[test]
    fn test_roundtrip() {
        let module = sample();
        let bytes = serialize(&module);
        assert_eq!(&bytes[..4], MAGIC);
        let restored = deserialize(&bytes).unwrap();
        assert_eq!(restored, module);
    }

    #[test]
    fn test_data_layout() {
        let module = sample();
        assert_eq!(module.data_size(), 8 + 8 + (8 + 3) + 3);
        assert_eq!(module.functions[0].label_pc("start"), Some(0));
        assert_eq!(module.find_export("main"), Some(0));
        assert_eq!(module.find_export("nope"), None);
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = serialize(&sample());
        bytes[0] = b'X';
        assert!(matches!(deserialize(&bytes), Err(BytecodeError::InvalidMagic)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = serialize(&sample());
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_truncated() {
        let bytes = serialize(&sample());
        for len in [0, 3, 8, bytes.len() / 2, bytes.len() - 1] {
            assert!(
                deserialize(&bytes[..len]).is_err(),
                "prefix of {} bytes should not load",
                len
            );
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = serialize(&sample());
        bytes.push(0);
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_invalid_opcode() {
        let mut module = Module::new();
        module.function(Function::new("main").emit(Instruction::Return));
        let mut bytes = serialize(&module);
        let last = bytes.len() - 1;
        bytes[last] = 0xEE;
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::InvalidOpcode(0xEE))
        ));
    }

    #[test]
    fn test_huge_length_does_not_allocate() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            deserialize(&bytes),
            Err(BytecodeError::UnexpectedEof)
        ));
    }
}
