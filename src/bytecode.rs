//! Decoding of PICA200 vertex-shader instruction words and swizzle
//! descriptors. `decode` is a pure function over a 32-bit word and the
//! swizzle table; both the interpreter and the JIT dispatch off its result.

/// Maximum number of 32-bit instruction words in a shader program.
pub const MAX_PROGRAM_CODE_LENGTH: usize = 512;
/// Maximum number of 32-bit swizzle descriptors.
pub const MAX_SWIZZLE_DATA_LENGTH: usize = 128;

/// Raw selector value meaning "no swizzling": x, y, z, w in order.
pub const IDENTITY_SWIZZLE: u8 = 0x1B;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Add,
    Dp3,
    Dp4,
    Dph,
    Ex2,
    Lg2,
    Mul,
    Lge,
    Slt,
    Flr,
    Max,
    Min,
    Rcp,
    Rsq,
    Mova,
    Mov,
    Dphi,
    Sgei,
    Slti,
    Nop,
    End,
    Break,
    Call,
    Callc,
    Callu,
    Ifu,
    Ifc,
    Loop,
    Emit,
    Sete,
    Jmpc,
    Jmpu,
    Cmp,
    Madi,
    Mad,
}

impl OpCode {
    /// Maps a 6-bit opcode tag to its semantic action. Returns `None` for the
    /// reserved slots. The sixteen MAD encodings and eight MADI encodings
    /// collapse onto their effective opcode here.
    pub fn from_raw(raw: u32) -> Option<OpCode> {
        match raw & 0x3F {
            0x00 => Some(OpCode::Add),
            0x01 => Some(OpCode::Dp3),
            0x02 => Some(OpCode::Dp4),
            0x03 => Some(OpCode::Dph),
            0x05 => Some(OpCode::Ex2),
            0x06 => Some(OpCode::Lg2),
            0x08 => Some(OpCode::Mul),
            0x09 => Some(OpCode::Lge),
            0x0A => Some(OpCode::Slt),
            0x0B => Some(OpCode::Flr),
            0x0C => Some(OpCode::Max),
            0x0D => Some(OpCode::Min),
            0x0E => Some(OpCode::Rcp),
            0x0F => Some(OpCode::Rsq),
            0x12 => Some(OpCode::Mova),
            0x13 => Some(OpCode::Mov),
            0x18 => Some(OpCode::Dphi),
            0x1A => Some(OpCode::Sgei),
            0x1B => Some(OpCode::Slti),
            0x21 => Some(OpCode::Nop),
            0x22 => Some(OpCode::End),
            0x23 => Some(OpCode::Break),
            0x24 => Some(OpCode::Call),
            0x25 => Some(OpCode::Callc),
            0x26 => Some(OpCode::Callu),
            0x27 => Some(OpCode::Ifu),
            0x28 => Some(OpCode::Ifc),
            0x29 => Some(OpCode::Loop),
            0x2A => Some(OpCode::Emit),
            0x2B => Some(OpCode::Sete),
            0x2C => Some(OpCode::Jmpc),
            0x2D => Some(OpCode::Jmpu),
            0x2E | 0x2F => Some(OpCode::Cmp),
            0x30..=0x37 => Some(OpCode::Madi),
            0x38..=0x3F => Some(OpCode::Mad),
            _ => None,
        }
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Add => "add",
            OpCode::Dp3 => "dp3",
            OpCode::Dp4 => "dp4",
            OpCode::Dph => "dph",
            OpCode::Ex2 => "ex2",
            OpCode::Lg2 => "lg2",
            OpCode::Mul => "mul",
            OpCode::Lge => "lge",
            OpCode::Slt => "slt",
            OpCode::Flr => "flr",
            OpCode::Max => "max",
            OpCode::Min => "min",
            OpCode::Rcp => "rcp",
            OpCode::Rsq => "rsq",
            OpCode::Mova => "mova",
            OpCode::Mov => "mov",
            OpCode::Dphi => "dphi",
            OpCode::Sgei => "sgei",
            OpCode::Slti => "slti",
            OpCode::Nop => "nop",
            OpCode::End => "end",
            OpCode::Break => "break",
            OpCode::Call => "call",
            OpCode::Callc => "callc",
            OpCode::Callu => "callu",
            OpCode::Ifu => "ifu",
            OpCode::Ifc => "ifc",
            OpCode::Loop => "loop",
            OpCode::Emit => "emit",
            OpCode::Sete => "sete",
            OpCode::Jmpc => "jmpc",
            OpCode::Jmpu => "jmpu",
            OpCode::Cmp => "cmp",
            OpCode::Madi => "madi",
            OpCode::Mad => "mad",
        }
    }

    /// Opcodes the shader core executes. The rest decode to
    /// `DecodeError::UnhandledOpcode`.
    pub fn is_implemented(self) -> bool {
        !matches!(
            self,
            OpCode::Dph
                | OpCode::Dphi
                | OpCode::Ex2
                | OpCode::Lg2
                | OpCode::Lge
                | OpCode::Slt
                | OpCode::Sgei
                | OpCode::Break
                | OpCode::Emit
                | OpCode::Sete
        )
    }

    /// True for the opcode families whose second source is the wide (7-bit)
    /// operand: the src1/src2 field widths are swapped in the encoding.
    pub fn is_src_inverted(self) -> bool {
        matches!(
            self,
            OpCode::Slti | OpCode::Sgei | OpCode::Dphi | OpCode::Madi
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterType {
    Input,
    Temporary,
    FloatUniform,
}

/// A 7-bit source register reference: v0..v15, r0..r15 or c0..c95.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceRegister(u32);

impl SourceRegister {
    pub fn from_raw(value: u32) -> Self {
        SourceRegister(value & 0x7F)
    }

    pub fn input(index: u32) -> Self {
        SourceRegister(index & 0xF)
    }

    pub fn temporary(index: u32) -> Self {
        SourceRegister(0x10 | (index & 0xF))
    }

    pub fn float_uniform(index: u32) -> Self {
        SourceRegister(0x20 + (index & 0x7F).min(95))
    }

    pub fn register_type(self) -> RegisterType {
        match self.0 {
            0x00..=0x0F => RegisterType::Input,
            0x10..=0x1F => RegisterType::Temporary,
            _ => RegisterType::FloatUniform,
        }
    }

    pub fn index(self) -> usize {
        match self.register_type() {
            RegisterType::Input => self.0 as usize,
            RegisterType::Temporary => self.0 as usize - 0x10,
            RegisterType::FloatUniform => self.0 as usize - 0x20,
        }
    }

    /// Applies an address-register offset. The offset rebases the raw
    /// register number, so a large enough value crosses region boundaries;
    /// this mirrors the hardware's flat register numbering.
    pub fn with_offset(self, offset: i32) -> SourceRegister {
        SourceRegister((self.0 as i32).wrapping_add(offset) as u32)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A 5-bit destination register reference: o0..o15 or r0..r15.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestRegister(u32);

impl DestRegister {
    pub fn from_raw(value: u32) -> Self {
        DestRegister(value & 0x1F)
    }

    pub fn output(index: u32) -> Self {
        DestRegister(index & 0xF)
    }

    pub fn temporary(index: u32) -> Self {
        DestRegister(0x10 | (index & 0xF))
    }

    pub fn is_output(self) -> bool {
        self.0 < 0x10
    }

    pub fn index(self) -> usize {
        (self.0 as usize) & 0x0F
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// One 32-bit swizzle descriptor: destination write-mask, three per-source
/// lane selectors and three negate bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwizzlePattern(pub u32);

impl SwizzlePattern {
    /// Bit 3 is x, bit 0 is w.
    pub fn dest_mask(self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub fn dest_component_enabled(self, component: usize) -> bool {
        self.0 & (0x8 >> component) != 0
    }

    /// The raw 8-bit selector for source slot 1..=3. Component 0's selector
    /// sits in the top two bits; `0x1B` is the identity order.
    pub fn raw_selector(self, src_slot: usize) -> u8 {
        let shift = match src_slot {
            1 => 5,
            2 => 14,
            _ => 23,
        };
        ((self.0 >> shift) & 0xFF) as u8
    }

    /// Which input lane feeds output component `component` of source slot
    /// `src_slot`.
    pub fn selector(self, src_slot: usize, component: usize) -> usize {
        ((self.raw_selector(src_slot) >> (6 - 2 * component)) & 3) as usize
    }

    pub fn negate(self, src_slot: usize) -> bool {
        let bit = match src_slot {
            1 => 4,
            2 => 13,
            _ => 22,
        };
        self.0 & (1 << bit) != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

impl CompareOp {
    /// The two unassigned encodings compare as Equal on both backends.
    pub fn from_raw(raw: u32) -> CompareOp {
        match raw & 7 {
            1 => CompareOp::NotEqual,
            2 => CompareOp::LessThan,
            3 => CompareOp::LessEqual,
            4 => CompareOp::GreaterThan,
            5 => CompareOp::GreaterEqual,
            _ => CompareOp::Equal,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowOp {
    Or,
    And,
    JustX,
    JustY,
}

impl FlowOp {
    fn from_raw(raw: u32) -> FlowOp {
        match raw & 3 {
            0 => FlowOp::Or,
            1 => FlowOp::And,
            2 => FlowOp::JustX,
            _ => FlowOp::JustY,
        }
    }
}

/// Sub-record for the common (single- and two-source) instruction format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CommonOperands {
    pub desc: SwizzlePattern,
    pub src1: SourceRegister,
    pub src2: SourceRegister,
    /// 0 = plain addressing; 1/2 = address registers, 3 = loop counter.
    pub address_register_index: u8,
    pub dest: DestRegister,
    pub compare_x: CompareOp,
    pub compare_y: CompareOp,
    pub inverted: bool,
}

/// Sub-record for the three-source multiply-add format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MadOperands {
    pub desc: SwizzlePattern,
    pub src1: SourceRegister,
    pub src2: SourceRegister,
    pub src3: SourceRegister,
    pub dest: DestRegister,
}

/// Sub-record for the flow-control format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowOperands {
    pub dest_offset: u32,
    pub num_instructions: u32,
    pub refx: bool,
    pub refy: bool,
    pub op: FlowOp,
    pub bool_uniform_id: u8,
    pub int_uniform_id: u8,
}

/// Operand view of a decoded instruction word.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operands {
    Common(CommonOperands),
    Mad(MadOperands),
    FlowControl(FlowOperands),
    NoArgs,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decoded {
    pub opcode: OpCode,
    pub operands: Operands,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    UnhandledOpcode { opcode: u32, word: u32 },
    ReservedOpcode { opcode: u32, word: u32 },
    InvalidOperandDescriptor { id: u32, len: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnhandledOpcode { opcode, word } => {
                write!(f, "unhandled opcode 0x{opcode:02X} (0x{word:08X})")
            }
            DecodeError::ReservedOpcode { opcode, word } => {
                write!(f, "reserved opcode slot 0x{opcode:02X} (0x{word:08X})")
            }
            DecodeError::InvalidOperandDescriptor { id, len } => {
                write!(
                    f,
                    "operand descriptor {id} out of range for swizzle table of length {len}"
                )
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn resolve_swizzle(id: u32, swizzle_data: &[u32]) -> Result<SwizzlePattern, DecodeError> {
    swizzle_data
        .get(id as usize)
        .copied()
        .map(SwizzlePattern)
        .ok_or(DecodeError::InvalidOperandDescriptor {
            id,
            len: swizzle_data.len(),
        })
}

/// Bit-unpacks one shader word against the swizzle table.
pub fn decode(word: u32, swizzle_data: &[u32]) -> Result<Decoded, DecodeError> {
    let raw_opcode = word >> 26;
    let opcode = OpCode::from_raw(raw_opcode).ok_or(DecodeError::ReservedOpcode {
        opcode: raw_opcode,
        word,
    })?;
    if !opcode.is_implemented() {
        return Err(DecodeError::UnhandledOpcode {
            opcode: raw_opcode,
            word,
        });
    }

    let operands = match opcode {
        OpCode::Nop | OpCode::End => Operands::NoArgs,

        OpCode::Call
        | OpCode::Callc
        | OpCode::Callu
        | OpCode::Ifu
        | OpCode::Ifc
        | OpCode::Loop
        | OpCode::Jmpc
        | OpCode::Jmpu => Operands::FlowControl(FlowOperands {
            num_instructions: word & 0xFF,
            dest_offset: (word >> 10) & 0xFFF,
            op: FlowOp::from_raw(word >> 22),
            bool_uniform_id: ((word >> 22) & 0xF) as u8,
            int_uniform_id: ((word >> 22) & 0x3) as u8,
            refy: word & (1 << 24) != 0,
            refx: word & (1 << 25) != 0,
        }),

        OpCode::Mad | OpCode::Madi => {
            let inverted = opcode == OpCode::Madi;
            let desc = resolve_swizzle(word & 0x1F, swizzle_data)?;
            let (src2, src3) = if inverted {
                (
                    SourceRegister::from_raw((word >> 12) & 0x1F),
                    SourceRegister::from_raw((word >> 5) & 0x7F),
                )
            } else {
                (
                    SourceRegister::from_raw((word >> 10) & 0x7F),
                    SourceRegister::from_raw((word >> 5) & 0x1F),
                )
            };
            Operands::Mad(MadOperands {
                desc,
                src1: SourceRegister::from_raw((word >> 17) & 0x7F),
                src2,
                src3,
                dest: DestRegister::from_raw((word >> 24) & 0x1F),
            })
        }

        _ => {
            let inverted = opcode.is_src_inverted();
            let desc = resolve_swizzle(word & 0x7F, swizzle_data)?;
            let (src1, src2) = if inverted {
                (
                    SourceRegister::from_raw((word >> 14) & 0x1F),
                    SourceRegister::from_raw((word >> 7) & 0x7F),
                )
            } else {
                (
                    SourceRegister::from_raw((word >> 12) & 0x7F),
                    SourceRegister::from_raw((word >> 7) & 0x1F),
                )
            };
            Operands::Common(CommonOperands {
                desc,
                src1,
                src2,
                address_register_index: ((word >> 19) & 3) as u8,
                dest: DestRegister::from_raw((word >> 21) & 0x1F),
                compare_y: CompareOp::from_raw(word >> 21),
                compare_x: CompareOp::from_raw(word >> 24),
                inverted,
            })
        }
    };

    Ok(Decoded { opcode, operands })
}
