//! Instruction set
//!
//! One byte per opcode, followed by its operands. Operand widths:
//!
//! | Layout | Bytes | Used by |
//! |--------|-------|---------|
//! | `None` | 0 | stack, arithmetic, field and subscript ops |
//! | `Byte` | 1 | short constant/local/private/upvalue indices, call arity |
//! | `Short` | 2 | long indices, names, jump offsets (big-endian) |
//! | `Invoke` | 3 | argument count byte followed by a 2-byte method name |
//! | `Closure` | 2 + 2n | function constant, then one (is-local, index) pair per upvalue |
//!
//! Jump offsets are relative to the first byte after the operand. Forward
//! jumps add, `JumpBack` subtracts.

use std::fmt;

/// Shape of the operands that follow an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLayout {
    None,
    Byte,
    Short,
    Invoke,
    Closure,
}

macro_rules! opcodes {
    ($($(#[$doc:meta])* $name:ident = $text:literal, $layout:ident;)*) => {
        /// Every instruction the engine understands
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum OpCode {
            $($(#[$doc])* $name,)*
        }

        impl OpCode {
            /// Table indexed by the opcode byte
            pub const ALL: &'static [OpCode] = &[$(OpCode::$name,)*];

            /// Mnemonic used by the disassembler
            pub fn name(self) -> &'static str {
                match self {
                    $(OpCode::$name => $text,)*
                }
            }

            pub fn layout(self) -> OperandLayout {
                match self {
                    $(OpCode::$name => OperandLayout::$layout,)*
                }
            }
        }
    };
}

opcodes! {
    Pop = "POP", None;
    /// Duplicate the top of the stack
    Dup = "DUP", None;
    Return = "RETURN", None;
    Constant = "CONSTANT", Byte;
    ConstantLong = "CONSTANT_LONG", Short;
    True = "TRUE", None;
    False = "FALSE", None;
    Null = "NULL", None;
    /// Push a fresh empty array
    Array = "ARRAY", None;
    /// Push a fresh empty map
    Object = "OBJECT", None;
    /// `[to, from]` -> range (the upper bound is pushed first)
    Range = "RANGE", None;
    Negate = "NEGATE", None;
    Not = "NOT", None;
    BitNot = "BIT_NOT", None;
    Add = "ADD", None;
    Subtract = "SUBTRACT", None;
    Multiply = "MULTIPLY", None;
    Power = "POWER", None;
    Divide = "DIVIDE", None;
    FloorDivide = "FLOOR_DIVIDE", None;
    Mod = "MOD", None;
    BitAnd = "BIT_AND", None;
    BitOr = "BIT_OR", None;
    BitXor = "BIT_XOR", None;
    LeftShift = "LEFT_SHIFT", None;
    RightShift = "RIGHT_SHIFT", None;
    Equal = "EQUAL", None;
    Greater = "GREATER", None;
    GreaterEqual = "GREATER_EQUAL", None;
    Less = "LESS", None;
    LessEqual = "LESS_EQUAL", None;
    /// Store the top of the stack in the global named by a string constant
    SetGlobal = "SET_GLOBAL", Short;
    /// Push a global; missing globals read as null
    GetGlobal = "GET_GLOBAL", Short;
    SetLocal = "SET_LOCAL", Byte;
    GetLocal = "GET_LOCAL", Byte;
    SetLocalLong = "SET_LOCAL_LONG", Short;
    GetLocalLong = "GET_LOCAL_LONG", Short;
    SetPrivate = "SET_PRIVATE", Byte;
    GetPrivate = "GET_PRIVATE", Byte;
    SetPrivateLong = "SET_PRIVATE_LONG", Short;
    GetPrivateLong = "GET_PRIVATE_LONG", Short;
    SetUpvalue = "SET_UPVALUE", Byte;
    GetUpvalue = "GET_UPVALUE", Byte;
    /// Pops the condition
    JumpIfFalse = "JUMP_IF_FALSE", Short;
    /// Leaves the tested value on the stack
    JumpIfNull = "JUMP_IF_NULL", Short;
    JumpIfNullPopping = "JUMP_IF_NULL_POPPING", Short;
    Jump = "JUMP", Short;
    JumpBack = "JUMP_BACK", Short;
    /// Jump keeping a falsey left operand, otherwise pop it
    And = "AND", Short;
    /// Jump keeping a truthy left operand, otherwise pop it
    Or = "OR", Short;
    /// Jump keeping a non-null left operand, otherwise pop it
    NullOr = "NULL_OR", Short;
    Closure = "CLOSURE", Closure;
    /// Close upvalues at the top slot, then pop it
    CloseUpvalue = "CLOSE_UPVALUE", None;
    /// Create a class inheriting from `Object` and bind it as a global
    Class = "CLASS", Short;
    /// `[object, name]` -> value
    GetField = "GET_FIELD", None;
    /// `[object, value, name]` -> value
    SetField = "SET_FIELD", None;
    /// Invoke `[]` with one argument
    SubscriptGet = "SUBSCRIPT_GET", None;
    /// Invoke `[]` with two arguments
    SubscriptSet = "SUBSCRIPT_SET", None;
    /// `[array, value]` -> array
    PushArrayElement = "PUSH_ARRAY_ELEMENT", None;
    /// `[map, key, value]` -> map
    PushObjectField = "PUSH_OBJECT_FIELD", None;
    /// `[class, value]` -> class, storing a static field
    StaticField = "STATIC_FIELD", Short;
    /// `[class, method]` -> class
    Method = "METHOD", Short;
    /// `[class, field]` -> class, storing a field object in the method table
    DefineField = "DEFINE_FIELD", Short;
    Invoke = "INVOKE", Invoke;
    InvokeIgnoring = "INVOKE_IGNORING", Invoke;
    /// `[receiver, args.., class]`, dispatching through the given class
    InvokeSuper = "INVOKE_SUPER", Invoke;
    InvokeSuperIgnoring = "INVOKE_SUPER_IGNORING", Invoke;
    /// `[receiver, class]` -> bound method or null
    GetSuperMethod = "GET_SUPER_METHOD", Short;
    /// `[superclass, class]` -> `[superclass, class]`
    Inherit = "INHERIT", None;
    Call = "CALL", Byte;
    /// `[value, class]` -> bool
    Is = "IS", None;
    PopLocals = "POP_LOCALS", Short;
    /// Spread the array held in a local slot into the next call's arguments
    VarArg = "VARARG", Byte;
    ReferenceGlobal = "REFERENCE_GLOBAL", Short;
    ReferencePrivate = "REFERENCE_PRIVATE", Short;
    ReferenceLocal = "REFERENCE_LOCAL", Short;
    ReferenceUpvalue = "REFERENCE_UPVALUE", Byte;
    /// `[instance, name]` -> reference
    ReferenceField = "REFERENCE_FIELD", None;
    /// `[value, reference]` -> value, storing through the reference
    SetReference = "SET_REFERENCE", None;
}

impl OpCode {
    /// Operand bytes for fixed-width layouts; closures depend on their function
    pub fn operand_len(self) -> Option<usize> {
        match self.layout() {
            OperandLayout::None => Some(0),
            OperandLayout::Byte => Some(1),
            OperandLayout::Short => Some(2),
            OperandLayout::Invoke => Some(3),
            OperandLayout::Closure => None,
        }
    }

    /// Operator method name used when an operand is not a number
    pub fn operator_method(self) -> Option<&'static str> {
        let name = match self {
            OpCode::Add => "+",
            OpCode::Subtract => "-",
            OpCode::Multiply => "*",
            OpCode::Power => "**",
            OpCode::Mod => "%",
            OpCode::Divide => "/",
            OpCode::FloorDivide => "#",
            OpCode::BitAnd => "&",
            OpCode::BitOr => "|",
            OpCode::BitXor => "^",
            OpCode::LeftShift => "<<",
            OpCode::RightShift => ">>",
            OpCode::Equal => "==",
            OpCode::Greater => ">",
            OpCode::GreaterEqual => ">=",
            OpCode::Less => "<",
            OpCode::LessEqual => "<=",
            _ => return None,
        };
        Some(name)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        OpCode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
