pub mod builder;
pub mod bytecode;
pub mod disasm;
pub mod float24;
pub mod interpreter;
#[cfg(target_arch = "x86_64")]
pub mod jit;
pub mod runner;
pub mod state;

pub use builder::{ShaderProgramBuilder, SwizzleDesc};
pub use bytecode::{
    decode, CommonOperands, CompareOp, Decoded, DecodeError, DestRegister, FlowOp, FlowOperands,
    MadOperands, OpCode, Operands, RegisterType, SourceRegister, SwizzlePattern,
    IDENTITY_SWIZZLE, MAX_PROGRAM_CODE_LENGTH, MAX_SWIZZLE_DATA_LENGTH,
};
pub use disasm::{disassemble, disassemble_word};
pub use float24::Float24;
pub use interpreter::run_interpreter;
#[cfg(target_arch = "x86_64")]
pub use jit::{
    CompiledShader, CpuCaps, JitCompiler, JitError, JitResult, ShaderEntry,
    CODE_BUFFER_CAPACITY,
};
pub use runner::{JitConfig, ShaderEngine};
pub use state::{
    input_offset, output_offset, semantic, InputVertex, OutputAttributeMap, OutputVertex,
    ShaderConfig, ShaderRegisters, ShaderSetup, UnitState, Vec4, MAX_CALL_STACK_DEPTH,
    OUTPUT_VERTEX_FLOATS,
};
