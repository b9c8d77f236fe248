//! Bytecode images
//!
//! The front end hands the engine a `ModuleImage`: a module name, the names
//! of its private variables, and its main function. Functions nest through
//! the constant pool, so one image carries a whole compilation unit.
//!
//! # Format
//!
//! Images are encoded with bincode inside a small frame:
//!
//! - `MAGIC` (u16) identifies the format
//! - `VERSION` (u8) must match exactly
//! - the module itself
//! - `END_MARKER` (u16) guards against truncated or concatenated input
//!
//! Decoding validates every function's code stream, so the engine never sees
//! an unknown opcode, a truncated operand, or an out-of-range constant.

use crate::opcode::{OpCode, OperandLayout};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const MAGIC: u16 = 6932;
pub const VERSION: u8 = 0;
pub const END_MARKER: u16 = 2942;

/// Error while encoding, decoding or validating an image
#[derive(Debug)]
pub enum ImageError {
    /// Bincode encoding/decoding error (preserves original error for debugging)
    Bincode(Box<bincode::Error>),
    /// Reading or writing the underlying stream failed
    Io(std::io::Error),
    BadMagic(u16),
    UnsupportedVersion(u8),
    MissingEndMarker,
    /// A code byte that is not an opcode
    InvalidOpcode { function: String, offset: usize, byte: u8 },
    /// An operand runs past the end of the code
    TruncatedOperand { function: String, offset: usize },
    /// An operand names a constant that does not exist or has the wrong kind
    BadConstant { function: String, offset: usize, index: usize },
}

impl std::fmt::Display for ImageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageError::Bincode(e) => write!(f, "Bincode error: {}", e),
            ImageError::Io(e) => write!(f, "I/O error: {}", e),
            ImageError::BadMagic(m) => write!(f, "Not a bytecode image (magic {})", m),
            ImageError::UnsupportedVersion(v) => {
                write!(f, "Unsupported image version {} (expected {})", v, VERSION)
            }
            ImageError::MissingEndMarker => write!(f, "Image is missing its end marker"),
            ImageError::InvalidOpcode {
                function,
                offset,
                byte,
            } => write!(f, "Invalid opcode {} at {} in '{}'", byte, offset, function),
            ImageError::TruncatedOperand { function, offset } => {
                write!(f, "Truncated operand at {} in '{}'", offset, function)
            }
            ImageError::BadConstant {
                function,
                offset,
                index,
            } => write!(
                f,
                "Bad constant index {} at {} in '{}'",
                index, offset, function
            ),
        }
    }
}

impl std::error::Error for ImageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImageError::Bincode(e) => Some(e.as_ref()),
            ImageError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bincode::Error> for ImageError {
    fn from(e: bincode::Error) -> Self {
        ImageError::Bincode(Box::new(e))
    }
}

impl From<std::io::Error> for ImageError {
    fn from(e: std::io::Error) -> Self {
        ImageError::Io(e)
    }
}

/// A constant-pool entry before it is loaded into a heap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Fixed(i64),
    Float(f64),
    String(String),
    Function(Box<FunctionImage>),
    /// A field object with optional getter and setter methods
    Field {
        getter: Option<Box<FunctionImage>>,
        setter: Option<Box<FunctionImage>>,
    },
}

/// A compiled function, independent of any heap
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionImage {
    pub name: Option<String>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub vararg: bool,
    pub max_slots: u16,
    pub code: Vec<u8>,
    /// Run-length-encoded (line, byte count) pairs; `None` when stripped
    pub lines: Option<Vec<(u32, u32)>>,
    pub constants: Vec<Constant>,
}

impl FunctionImage {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }

    /// Check that the code stream decodes cleanly against the constant pool
    pub fn validate(&self) -> Result<(), ImageError> {
        let name = || self.display_name().to_string();
        let mut offset = 0;
        while offset < self.code.len() {
            let byte = self.code[offset];
            let op = OpCode::try_from(byte).map_err(|byte| ImageError::InvalidOpcode {
                function: name(),
                offset,
                byte,
            })?;
            let operands = offset + 1;
            let width = match op.layout() {
                OperandLayout::Closure => {
                    let index = self.short_at(operands).ok_or_else(|| {
                        ImageError::TruncatedOperand {
                            function: name(),
                            offset,
                        }
                    })?;
                    match self.constants.get(index) {
                        Some(Constant::Function(f)) => 2 + 2 * f.upvalue_count as usize,
                        _ => {
                            return Err(ImageError::BadConstant {
                                function: name(),
                                offset,
                                index,
                            });
                        }
                    }
                }
                _ => op.operand_len().unwrap_or(0),
            };
            if operands + width > self.code.len() {
                return Err(ImageError::TruncatedOperand {
                    function: name(),
                    offset,
                });
            }
            match self.constant_operand(op, operands) {
                Some(index) if index >= self.constants.len() => {
                    return Err(ImageError::BadConstant {
                        function: name(),
                        offset,
                        index,
                    });
                }
                _ => {}
            }
            offset = operands + width;
        }
        for constant in &self.constants {
            match constant {
                Constant::Function(f) => f.validate()?,
                Constant::Field { getter, setter } => {
                    for accessor in getter.iter().chain(setter.iter()) {
                        accessor.validate()?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn short_at(&self, offset: usize) -> Option<usize> {
        let hi = *self.code.get(offset)?;
        let lo = *self.code.get(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]) as usize)
    }

    /// Constant-pool index named by an instruction, if it names one
    fn constant_operand(&self, op: OpCode, operands: usize) -> Option<usize> {
        match op {
            OpCode::Constant => self.code.get(operands).map(|b| *b as usize),
            OpCode::ConstantLong
            | OpCode::SetGlobal
            | OpCode::GetGlobal
            | OpCode::Class
            | OpCode::StaticField
            | OpCode::Method
            | OpCode::DefineField
            | OpCode::GetSuperMethod
            | OpCode::ReferenceGlobal => self.short_at(operands),
            OpCode::Invoke
            | OpCode::InvokeIgnoring
            | OpCode::InvokeSuper
            | OpCode::InvokeSuperIgnoring => self.short_at(operands + 1),
            _ => None,
        }
    }
}

/// One compilation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub private_names: Vec<String>,
    pub main: FunctionImage,
}

#[derive(Serialize, Deserialize)]
struct Framed {
    magic: u16,
    version: u8,
    module: ModuleImage,
    end: u16,
}

#[derive(Serialize)]
struct FramedRef<'a> {
    magic: u16,
    version: u8,
    module: &'a ModuleImage,
    end: u16,
}

impl ModuleImage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let framed = FramedRef {
            magic: MAGIC,
            version: VERSION,
            module: self,
            end: END_MARKER,
        };
        Ok(bincode::serialize(&framed)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ImageError> {
        // Check the header before attempting a full decode
        let magic: u16 = bincode::deserialize(bytes)?;
        if magic != MAGIC {
            return Err(ImageError::BadMagic(magic));
        }
        let (_, version): (u16, u8) = bincode::deserialize(bytes)?;
        if version != VERSION {
            return Err(ImageError::UnsupportedVersion(version));
        }
        let framed: Framed = bincode::deserialize(bytes)?;
        if framed.end != END_MARKER {
            return Err(ImageError::MissingEndMarker);
        }
        framed.module.main.validate()?;
        Ok(framed.module)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), ImageError> {
        writer.write_all(&self.to_bytes()?)?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, ImageError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ModuleImage {
        ModuleImage {
            name: "main".to_string(),
            private_names: vec!["x".to_string()],
            main: FunctionImage {
                name: Some("main".to_string()),
                arity: 0,
                upvalue_count: 0,
                vararg: false,
                max_slots: 2,
                code: vec![OpCode::Constant as u8, 0, OpCode::Return as u8],
                lines: Some(vec![(1, 3)]),
                constants: vec![Constant::Fixed(42)],
            },
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let image = sample();
        let bytes = image.to_bytes().unwrap();
        assert_eq!(ModuleImage::from_bytes(&bytes).unwrap(), image);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            ModuleImage::from_bytes(&bytes),
            Err(ImageError::BadMagic(_))
        ));
    }

    #[test]
    fn test_truncated_input() {
        let bytes = sample().to_bytes().unwrap();
        let result = ModuleImage::from_bytes(&bytes[..bytes.len() - 3]);
        assert!(matches!(result, Err(ImageError::Bincode(_))));
    }

    #[test]
    fn test_invalid_opcode_is_rejected() {
        let mut image = sample();
        image.main.code = vec![0xEE];
        let bytes = image.to_bytes().unwrap();
        assert!(matches!(
            ModuleImage::from_bytes(&bytes),
            Err(ImageError::InvalidOpcode { byte: 0xEE, .. })
        ));
    }

    #[test]
    fn test_constant_out_of_range() {
        let mut image = sample();
        image.main.code = vec![OpCode::Constant as u8, 9, OpCode::Return as u8];
        assert!(matches!(
            image.main.validate(),
            Err(ImageError::BadConstant { index: 9, .. })
        ));
    }

    #[test]
    fn test_truncated_operand() {
        let mut image = sample();
        image.main.code = vec![OpCode::Jump as u8, 0];
        assert!(matches!(
            image.main.validate(),
            Err(ImageError::TruncatedOperand { offset: 0, .. })
        ));
    }

    #[test]
    fn test_error_display() {
        let err = ImageError::UnsupportedVersion(3);
        assert_eq!(
            err.to_string(),
            "Unsupported image version 3 (expected 0)"
        );
    }
}
