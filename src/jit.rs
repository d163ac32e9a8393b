//! x86-64 JIT backend. Compiles a shader program into native code with one
//! fixed template per opcode, resolving structured control flow (inline
//! calls, if/else, bounded loops, forward jumps) in a single forward sweep
//! over the instruction stream.

mod code_buffer;
mod emitter;

pub use code_buffer::{BranchCondition, CodeBuffer, FixupBranch, CODE_BUFFER_CAPACITY};

use tracing::error;

use crate::bytecode::{
    decode, CommonOperands, CompareOp, FlowOp, FlowOperands, MadOperands, OpCode, Operands,
    RegisterType, SourceRegister, SwizzlePattern, DestRegister, IDENTITY_SWIZZLE,
    MAX_PROGRAM_CODE_LENGTH,
};
use crate::state::{
    input_offset, output_offset, uniform_b_offset, uniform_f_offset, uniform_i_offset,
    ShaderRegisters, ShaderSetup,
};
use emitter::{
    add_r32_imm8, add_rr32, addps, and_r32_imm32, and_rr32, andps, blendps, cmp_byte_mem_imm8, cmpps,
    cmpss, cvtdq2ps, cvtps2dq, dpps, maxps, minps, mov_r32_mem, mov_r64_imm64, mov_rr32, mov_rr64,
    movaps_load, movaps_load_indexed, movaps_rr, movaps_store, movq_r64_xmm, movsxd, movzx_r32_r8,
    mulps, or_rr32, pop_reg, push_reg, rcpps, ret, roundps, rsqrtps, shl_r32_imm8, shl_r64_imm8,
    shr_r32_imm8, shr_r64_imm8, shufps, sub_r32_imm8, unpckhps, unpcklps, vfmadd213ps,
    xor_r32_imm32, xor_rr64, xorps, Reg, Xmm, RAX, RBX, RBP, RDI, RSI, R10, R11, R12, R13, R14,
    R15, R9, XMM0, XMM1, XMM2, XMM3, XMM4, XMM14, XMM15,
};

// RAX, RBX and the low xmm registers are template-local scratch. Everything
// below keeps its value for the whole function:

/// Pointer to the uniform block.
const UNIFORMS: Reg = R9;
/// The two address offset registers written by MOVA, as byte displacements.
const ADDROFFS_REG_0: Reg = R10;
const ADDROFFS_REG_1: Reg = R11;
/// Loop counter, as a byte displacement into the float uniforms.
const LOOPCOUNT_REG: Reg = R12;
/// Remaining loop iterations.
const LOOPCOUNT: Reg = RSI;
/// Added to LOOPCOUNT_REG after each iteration.
const LOOPINC: Reg = RDI;
/// X-component result of the last CMP.
const COND0: Reg = R13;
/// Y-component result of the last CMP.
const COND1: Reg = R14;
/// Pointer to the register file of the executing unit.
const REGISTERS: Reg = R15;

const SCRATCH: Xmm = XMM0;
const SRC1: Xmm = XMM1;
const SRC2: Xmm = XMM2;
const SRC3: Xmm = XMM3;
const SCRATCH2: Xmm = XMM4;
/// {1.0, 1.0, 1.0, 1.0}
const ONE: Xmm = XMM14;
/// {-0.0, -0.0, -0.0, -0.0}; flips sign bits via XOR.
const NEGBIT: Xmm = XMM15;

// cmpps/cmpss predicates
const CMP_EQ: u8 = 0;
const CMP_LT: u8 = 1;
const CMP_LE: u8 = 2;
const CMP_NEQ: u8 = 4;
const CMP_NLT: u8 = 5;
const CMP_NLE: u8 = 6;

#[repr(C, align(16))]
struct ConstVec([f32; 4]);

static ONE_VEC: ConstVec = ConstVec([1.0; 4]);
static NEGATIVE_ZERO_VEC: ConstVec = ConstVec([-0.0; 4]);

/// Host capabilities the per-opcode templates dispatch on.
#[derive(Clone, Copy, Debug)]
pub struct CpuCaps {
    pub sse4_1: bool,
    pub fma: bool,
}

impl CpuCaps {
    pub fn detect() -> Self {
        CpuCaps {
            sse4_1: is_x86_feature_detected!("sse4.1"),
            fma: is_x86_feature_detected!("fma"),
        }
    }

    /// Baseline SSE2 templates only; used to exercise the fallback paths.
    pub fn baseline() -> Self {
        CpuCaps {
            sse4_1: false,
            fma: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JitError {
    OutOfSpace { needed: usize, capacity: usize },
    BackwardBranch { at: usize, target: usize },
    NestedLoop { at: usize },
    ExecRegion(String),
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::OutOfSpace { needed, capacity } => {
                write!(f, "code buffer full: {needed} more bytes over {capacity}")
            }
            JitError::BackwardBranch { at, target } => {
                write!(f, "backward control flow at offset {at} (target {target})")
            }
            JitError::NestedLoop { at } => write!(f, "nested loop at offset {at}"),
            JitError::ExecRegion(message) => {
                write!(f, "executable region error: {message}")
            }
        }
    }
}

impl std::error::Error for JitError {}

pub type JitResult<T> = Result<T, JitError>;

/// Signature of emitted code. The System V convention is pinned explicitly
/// so the register map holds on every host OS.
pub type ShaderEntry = unsafe extern "sysv64" fn(*mut ShaderRegisters);

/// A compiled program: a function pointer into the compiler's code buffer.
/// Valid until the buffer is cleared.
#[derive(Clone, Copy)]
pub struct CompiledShader {
    entry: ShaderEntry,
    code_len: usize,
}

impl CompiledShader {
    /// # Safety
    /// `registers` must point to a live, 16-byte-aligned register file, the
    /// uniform block captured at compile time must still be at the same
    /// address, and the owning code buffer must not have been cleared.
    pub unsafe fn run(&self, registers: *mut ShaderRegisters) {
        (self.entry)(registers)
    }

    pub fn entry_address(&self) -> usize {
        self.entry as usize
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

pub struct JitCompiler {
    buffer: CodeBuffer,
    caps: CpuCaps,
}

impl JitCompiler {
    pub fn new() -> JitResult<Self> {
        Self::with_caps(CpuCaps::detect())
    }

    pub fn with_caps(caps: CpuCaps) -> JitResult<Self> {
        Ok(JitCompiler {
            buffer: CodeBuffer::new()?,
            caps,
        })
    }

    pub fn caps(&self) -> CpuCaps {
        self.caps
    }

    pub fn used_bytes(&self) -> usize {
        self.buffer.here()
    }

    /// Compiles the program in `setup` starting at `main_offset`. On failure
    /// the buffer cursor is rewound, so no partial shader survives.
    pub fn compile(&mut self, setup: &ShaderSetup, main_offset: usize) -> JitResult<CompiledShader> {
        let start = self.buffer.here();
        let result = Compiler {
            setup,
            buf: &mut self.buffer,
            caps: self.caps,
            looping: false,
        }
        .compile_program(main_offset);

        match result {
            Ok(()) => {
                let code_len = self.buffer.here() - start;
                let entry = unsafe {
                    std::mem::transmute::<*const u8, ShaderEntry>(self.buffer.entry_ptr(start))
                };
                Ok(CompiledShader { entry, code_len })
            }
            Err(err) => {
                self.buffer.rewind(start);
                Err(err)
            }
        }
    }

    /// Invalidates every `CompiledShader` handed out so far. The cache
    /// holding them must already be empty.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

struct Compiler<'a> {
    setup: &'a ShaderSetup,
    buf: &'a mut CodeBuffer,
    caps: CpuCaps,
    looping: bool,
}

fn sse_predicate(op: CompareOp) -> u8 {
    match op {
        CompareOp::Equal => CMP_EQ,
        CompareOp::NotEqual => CMP_NEQ,
        CompareOp::LessThan => CMP_LT,
        CompareOp::LessEqual => CMP_LE,
        CompareOp::GreaterThan => CMP_NLE,
        CompareOp::GreaterEqual => CMP_NLT,
    }
}

impl<'a> Compiler<'a> {
    fn program_len(&self) -> usize {
        self.setup.program_code.len().min(MAX_PROGRAM_CODE_LENGTH)
    }

    fn compile_program(mut self, main_offset: usize) -> JitResult<()> {
        self.compile_prologue()?;

        let mut offset = main_offset;
        while offset < self.program_len() {
            self.compile_next(&mut offset)?;
        }

        // Programs whose END is unreachable fall through to here instead of
        // running off the buffer.
        self.compile_epilogue()
    }

    fn compile_prologue(&mut self) -> JitResult<()> {
        for reg in [RBX, RBP, R12, R13, R14, R15] {
            push_reg(self.buf, reg)?;
        }

        // First argument is the register file.
        mov_rr64(self.buf, REGISTERS, RDI)?;
        mov_r64_imm64(
            self.buf,
            UNIFORMS,
            &self.setup.uniforms as *const _ as u64,
        )?;

        // Address, loop and condition registers start clear.
        for reg in [ADDROFFS_REG_0, ADDROFFS_REG_1, LOOPCOUNT_REG, COND0, COND1] {
            xor_rr64(self.buf, reg, reg)?;
        }

        mov_r64_imm64(self.buf, RAX, ONE_VEC.0.as_ptr() as u64)?;
        movaps_load(self.buf, ONE, RAX, 0)?;
        mov_r64_imm64(self.buf, RAX, NEGATIVE_ZERO_VEC.0.as_ptr() as u64)?;
        movaps_load(self.buf, NEGBIT, RAX, 0)?;
        Ok(())
    }

    fn compile_epilogue(&mut self) -> JitResult<()> {
        for reg in [R15, R14, R13, R12, RBP, RBX] {
            pop_reg(self.buf, reg)?;
        }
        ret(self.buf)
    }

    fn compile_next(&mut self, offset: &mut usize) -> JitResult<()> {
        let word = self.setup.program_code[*offset];
        *offset += 1;

        let decoded = match decode(word, &self.setup.swizzle_data) {
            Ok(decoded) => decoded,
            Err(err) => {
                // No code is emitted for the slot; execution continues.
                error!("{err}");
                return Ok(());
            }
        };

        match (decoded.opcode, decoded.operands) {
            (OpCode::Add, Operands::Common(op)) => self.compile_add(&op),
            (OpCode::Dp3, Operands::Common(op)) => self.compile_dp3(&op),
            (OpCode::Dp4, Operands::Common(op)) => self.compile_dp4(&op),
            (OpCode::Mul, Operands::Common(op)) => self.compile_mul(&op),
            (OpCode::Flr, Operands::Common(op)) => self.compile_flr(&op),
            (OpCode::Max, Operands::Common(op)) => self.compile_max(&op),
            (OpCode::Min, Operands::Common(op)) => self.compile_min(&op),
            (OpCode::Rcp, Operands::Common(op)) => self.compile_rcp(&op),
            (OpCode::Rsq, Operands::Common(op)) => self.compile_rsq(&op),
            (OpCode::Mova, Operands::Common(op)) => self.compile_mova(&op),
            (OpCode::Mov, Operands::Common(op)) => self.compile_mov(&op),
            (OpCode::Slti, Operands::Common(op)) => self.compile_slti(&op),
            (OpCode::Cmp, Operands::Common(op)) => self.compile_cmp(&op),
            (OpCode::Mad | OpCode::Madi, Operands::Mad(op)) => self.compile_mad(&op),
            (OpCode::Nop, _) => Ok(()),
            (OpCode::End, _) => self.compile_epilogue(),
            (OpCode::Call, Operands::FlowControl(op)) => self.compile_call(&op, *offset),
            (OpCode::Callc, Operands::FlowControl(op)) => self.compile_callc(&op, *offset),
            (OpCode::Callu, Operands::FlowControl(op)) => self.compile_callu(&op, *offset),
            (OpCode::Ifu | OpCode::Ifc, Operands::FlowControl(op)) => {
                self.compile_if(decoded.opcode, &op, offset)
            }
            (OpCode::Loop, Operands::FlowControl(op)) => self.compile_loop(&op, offset),
            (OpCode::Jmpc | OpCode::Jmpu, Operands::FlowControl(op)) => {
                self.compile_jmp(decoded.opcode, &op, offset)
            }
            _ => Ok(()),
        }
    }

    fn compile_block(&mut self, offset: &mut usize, stop: usize) -> JitResult<()> {
        let stop = stop.min(self.program_len().saturating_sub(1));
        while *offset <= stop {
            self.compile_next(offset)?;
        }
        Ok(())
    }

    fn source_base(&self, reg: SourceRegister) -> (Reg, i32) {
        if reg.register_type() == RegisterType::FloatUniform {
            (UNIFORMS, uniform_f_offset(reg.index()))
        } else {
            (REGISTERS, input_offset(reg))
        }
    }

    /// Loads and swizzles source slot `src_num` into `dst`. The
    /// offset-bearing slot honours the instruction's address register.
    fn compile_swizzle_src(
        &mut self,
        op: &CommonOperands,
        src_num: usize,
        reg: SourceRegister,
        dst: Xmm,
    ) -> JitResult<()> {
        let (base, disp) = self.source_base(reg);
        let offset_slot = if op.inverted { 2 } else { 1 };

        if src_num == offset_slot && op.address_register_index != 0 {
            let index = match op.address_register_index {
                1 => ADDROFFS_REG_0,
                2 => ADDROFFS_REG_1,
                _ => LOOPCOUNT_REG,
            };
            movaps_load_indexed(self.buf, dst, base, index, disp)?;
        } else {
            movaps_load(self.buf, dst, base, disp)?;
        }

        self.apply_swizzle(op.desc, src_num, dst)
    }

    /// MAD sources never use the address registers, so loading is simpler.
    fn compile_swizzle_src_plain(
        &mut self,
        desc: SwizzlePattern,
        src_num: usize,
        reg: SourceRegister,
        dst: Xmm,
    ) -> JitResult<()> {
        let (base, disp) = self.source_base(reg);
        movaps_load(self.buf, dst, base, disp)?;
        self.apply_swizzle(desc, src_num, dst)
    }

    fn apply_swizzle(&mut self, desc: SwizzlePattern, src_num: usize, dst: Xmm) -> JitResult<()> {
        let selector = desc.raw_selector(src_num);
        if selector != IDENTITY_SWIZZLE {
            // The hardware and shufps number lanes in opposite order.
            let selector = ((selector & 0xC0) >> 6)
                | ((selector & 0x03) << 6)
                | ((selector & 0x0C) << 2)
                | ((selector & 0x30) >> 2);
            shufps(self.buf, dst, dst, selector)?;
        }
        if desc.negate(src_num) {
            xorps(self.buf, dst, NEGBIT)?;
        }
        Ok(())
    }

    /// Stores `src` to the destination register under the write-mask.
    fn compile_dest_enable(
        &mut self,
        desc: SwizzlePattern,
        dest: DestRegister,
        src: Xmm,
    ) -> JitResult<()> {
        let disp = output_offset(dest);
        let mask = desc.dest_mask() as u32;

        if mask == 0xF {
            return movaps_store(self.buf, REGISTERS, disp, src);
        }

        movaps_load(self.buf, SCRATCH, REGISTERS, disp)?;
        if self.caps.sse4_1 {
            // blendps numbers lanes from the low bit up.
            let imm = ((mask & 1) << 3) | ((mask & 8) >> 3) | ((mask & 2) << 1) | ((mask & 4) >> 1);
            blendps(self.buf, SCRATCH, src, imm as u8)?;
        } else {
            movaps_rr(self.buf, SCRATCH2, src)?;
            unpckhps(self.buf, SCRATCH2, SCRATCH)?; // [src.z, dst.z, src.w, dst.w]
            unpcklps(self.buf, SCRATCH, src)?; // [dst.x, src.x, dst.y, src.y]
            let selector = u8::from(desc.dest_component_enabled(0))
                | (if desc.dest_component_enabled(1) { 3 } else { 2 }) << 2
                | (if desc.dest_component_enabled(2) { 0 } else { 1 }) << 4
                | (if desc.dest_component_enabled(3) { 2 } else { 3 }) << 6;
            shufps(self.buf, SCRATCH, SCRATCH2, selector)?;
        }
        movaps_store(self.buf, REGISTERS, disp, SCRATCH)
    }

    fn compile_add(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;
        addps(self.buf, SRC1, SRC2)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_mul(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;
        mulps(self.buf, SRC1, SRC2)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_max(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;
        maxps(self.buf, SRC1, SRC2)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_min(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;
        minps(self.buf, SRC1, SRC2)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_dp3(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;

        if self.caps.sse4_1 {
            dpps(self.buf, SRC1, SRC2, 0x7F)?;
        } else {
            mulps(self.buf, SRC1, SRC2)?;

            movaps_rr(self.buf, SRC2, SRC1)?;
            shufps(self.buf, SRC2, SRC2, 0x55)?; // broadcast y

            movaps_rr(self.buf, SRC3, SRC1)?;
            shufps(self.buf, SRC3, SRC3, 0xAA)?; // broadcast z

            shufps(self.buf, SRC1, SRC1, 0x00)?; // broadcast x
            addps(self.buf, SRC1, SRC2)?;
            addps(self.buf, SRC1, SRC3)?;
        }

        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_dp4(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;

        if self.caps.sse4_1 {
            dpps(self.buf, SRC1, SRC2, 0xFF)?;
        } else {
            mulps(self.buf, SRC1, SRC2)?;

            movaps_rr(self.buf, SRC2, SRC1)?;
            shufps(self.buf, SRC1, SRC1, 0xB1)?; // xyzw -> yxwz
            addps(self.buf, SRC1, SRC2)?;

            movaps_rr(self.buf, SRC2, SRC1)?;
            shufps(self.buf, SRC1, SRC1, 0x1B)?; // xyzw -> wzyx
            addps(self.buf, SRC1, SRC2)?;
        }

        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_flr(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;

        if self.caps.sse4_1 {
            roundps(self.buf, SRC1, SRC1, 1)?; // toward negative infinity
        } else {
            cvtps2dq(self.buf, SRC1, SRC1)?;
            cvtdq2ps(self.buf, SRC1, SRC1)?;
        }

        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_rcp(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        // Fast approximation; coarser than the hardware unit.
        rcpps(self.buf, SRC1, SRC1)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_rsq(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        // Fast approximation; coarser than the hardware unit.
        rsqrtps(self.buf, SRC1, SRC1)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_mov(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_mova(&mut self, op: &CommonOperands) -> JitResult<()> {
        let write_x = op.desc.dest_component_enabled(0);
        let write_y = op.desc.dest_component_enabled(1);
        if !write_x && !write_y {
            return Ok(());
        }

        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;

        // Only the x and y lanes matter.
        cvtps2dq(self.buf, SRC1, SRC1)?;
        movq_r64_xmm(self.buf, RAX, SRC1)?;

        if write_x && write_y {
            movsxd(self.buf, ADDROFFS_REG_0, RAX)?;
            shr_r64_imm8(self.buf, RAX, 32)?;
            movsxd(self.buf, ADDROFFS_REG_1, RAX)?;
            // Scale to a vec4 byte offset.
            shl_r64_imm8(self.buf, ADDROFFS_REG_0, 4)?;
            shl_r64_imm8(self.buf, ADDROFFS_REG_1, 4)?;
        } else if write_x {
            movsxd(self.buf, ADDROFFS_REG_0, RAX)?;
            shl_r64_imm8(self.buf, ADDROFFS_REG_0, 4)?;
        } else {
            shr_r64_imm8(self.buf, RAX, 32)?;
            movsxd(self.buf, ADDROFFS_REG_1, RAX)?;
            shl_r64_imm8(self.buf, ADDROFFS_REG_1, 4)?;
        }
        Ok(())
    }

    fn compile_slti(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;

        // Scalar compare: only the x lane of the result is meaningful.
        cmpss(self.buf, SRC1, SRC2, CMP_LT)?;
        andps(self.buf, SRC1, ONE)?;

        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    fn compile_cmp(&mut self, op: &CommonOperands) -> JitResult<()> {
        self.compile_swizzle_src(op, 1, op.src1, SRC1)?;
        self.compile_swizzle_src(op, 2, op.src2, SRC2)?;

        if op.compare_x == op.compare_y {
            // Compare both components in one go.
            cmpps(self.buf, SRC1, SRC2, sse_predicate(op.compare_x))?;
            movq_r64_xmm(self.buf, COND0, SRC1)?;
            mov_rr64(self.buf, COND1, COND0)?;
        } else {
            movaps_rr(self.buf, SCRATCH, SRC1)?;
            cmpss(self.buf, SCRATCH, SRC2, sse_predicate(op.compare_x))?;
            cmpps(self.buf, SRC1, SRC2, sse_predicate(op.compare_y))?;
            movq_r64_xmm(self.buf, COND0, SCRATCH)?;
            movq_r64_xmm(self.buf, COND1, SRC1)?;
        }

        // Reduce the lane masks to 0/1 via their sign bits.
        shr_r32_imm8(self.buf, COND0, 31)?;
        shr_r64_imm8(self.buf, COND1, 63)?;
        Ok(())
    }

    fn compile_mad(&mut self, op: &MadOperands) -> JitResult<()> {
        self.compile_swizzle_src_plain(op.desc, 1, op.src1, SRC1)?;
        self.compile_swizzle_src_plain(op.desc, 2, op.src2, SRC2)?;
        self.compile_swizzle_src_plain(op.desc, 3, op.src3, SRC3)?;

        if self.caps.fma {
            vfmadd213ps(self.buf, SRC1, SRC2, SRC3)?;
        } else {
            mulps(self.buf, SRC1, SRC2)?;
            addps(self.buf, SRC1, SRC3)?;
        }

        self.compile_dest_enable(op.desc, op.dest, SRC1)
    }

    /// Leaves zero/non-zero in eax (flags set) for the register condition.
    /// NXOR against the reference bits checks equality.
    fn compile_condition(&mut self, op: &FlowOperands) -> JitResult<()> {
        let refx = (op.refx as u32) ^ 1;
        let refy = (op.refy as u32) ^ 1;
        match op.op {
            FlowOp::Or => {
                mov_rr32(self.buf, RAX, COND0)?;
                mov_rr32(self.buf, RBX, COND1)?;
                xor_r32_imm32(self.buf, RAX, refx)?;
                xor_r32_imm32(self.buf, RBX, refy)?;
                or_rr32(self.buf, RAX, RBX)
            }
            FlowOp::And => {
                mov_rr32(self.buf, RAX, COND0)?;
                mov_rr32(self.buf, RBX, COND1)?;
                xor_r32_imm32(self.buf, RAX, refx)?;
                xor_r32_imm32(self.buf, RBX, refy)?;
                and_rr32(self.buf, RAX, RBX)
            }
            FlowOp::JustX => {
                mov_rr32(self.buf, RAX, COND0)?;
                xor_r32_imm32(self.buf, RAX, refx)
            }
            FlowOp::JustY => {
                mov_rr32(self.buf, RAX, COND1)?;
                xor_r32_imm32(self.buf, RAX, refy)
            }
        }
    }

    /// Sets the zero flag from the referenced boolean uniform.
    fn compile_uniform_condition(&mut self, op: &FlowOperands) -> JitResult<()> {
        cmp_byte_mem_imm8(
            self.buf,
            UNIFORMS,
            uniform_b_offset(op.bool_uniform_id as usize),
            0,
        )
    }

    fn check_forward(&self, op: &FlowOperands, next_offset: usize) -> JitResult<usize> {
        let target = op.dest_offset as usize;
        if target < next_offset {
            return Err(JitError::BackwardBranch {
                at: next_offset - 1,
                target,
            });
        }
        Ok(target)
    }

    /// Inline expansion: the called range is compiled in place.
    fn compile_call(&mut self, op: &FlowOperands, next_offset: usize) -> JitResult<()> {
        self.check_forward(op, next_offset)?;
        let mut offset = op.dest_offset as usize;
        let stop = (offset + op.num_instructions as usize).min(self.program_len());
        while offset < stop {
            self.compile_next(&mut offset)?;
        }
        Ok(())
    }

    fn compile_callc(&mut self, op: &FlowOperands, next_offset: usize) -> JitResult<()> {
        self.compile_condition(op)?;
        let skip = self.buf.record_branch(Some(BranchCondition::Zero))?;
        self.compile_call(op, next_offset)?;
        let here = self.buf.here();
        self.buf.patch(skip, here);
        Ok(())
    }

    fn compile_callu(&mut self, op: &FlowOperands, next_offset: usize) -> JitResult<()> {
        self.compile_uniform_condition(op)?;
        let skip = self.buf.record_branch(Some(BranchCondition::Zero))?;
        self.compile_call(op, next_offset)?;
        let here = self.buf.here();
        self.buf.patch(skip, here);
        Ok(())
    }

    fn compile_if(
        &mut self,
        opcode: OpCode,
        op: &FlowOperands,
        offset: &mut usize,
    ) -> JitResult<()> {
        let dest = self.check_forward(op, *offset)?;

        if opcode == OpCode::Ifu {
            self.compile_uniform_condition(op)?;
        } else {
            self.compile_condition(op)?;
        }
        let else_branch = self.buf.record_branch(Some(BranchCondition::Zero))?;

        // True block runs up to the start of the else block.
        self.compile_block(offset, dest.wrapping_sub(1))?;

        if op.num_instructions == 0 {
            let here = self.buf.here();
            self.buf.patch(else_branch, here);
            return Ok(());
        }

        let endif = self.buf.record_branch(None)?;
        let here = self.buf.here();
        self.buf.patch(else_branch, here);

        self.compile_block(offset, dest + op.num_instructions as usize - 1)?;

        let here = self.buf.here();
        self.buf.patch(endif, here);
        Ok(())
    }

    fn compile_loop(&mut self, op: &FlowOperands, offset: &mut usize) -> JitResult<()> {
        let dest = self.check_forward(op, *offset)?;
        if self.looping {
            return Err(JitError::NestedLoop { at: *offset - 1 });
        }
        self.looping = true;

        let uniform = uniform_i_offset(op.int_uniform_id as usize);
        mov_r32_mem(self.buf, LOOPCOUNT, UNIFORMS, uniform)?;
        mov_rr32(self.buf, LOOPCOUNT_REG, LOOPCOUNT)?;
        shr_r32_imm8(self.buf, LOOPCOUNT_REG, 8)?;
        and_r32_imm32(self.buf, LOOPCOUNT_REG, 0xFF)?; // y component is the start
        mov_rr32(self.buf, LOOPINC, LOOPCOUNT)?;
        shr_r32_imm8(self.buf, LOOPINC, 16)?;
        movzx_r32_r8(self.buf, LOOPINC, LOOPINC)?; // z component is the increment
        movzx_r32_r8(self.buf, LOOPCOUNT, LOOPCOUNT)?; // x component is the count
        add_r32_imm8(self.buf, LOOPCOUNT, 1)?; // iterations = x + 1
        // Counter and increment are register indices; scale them to bytes.
        shl_r32_imm8(self.buf, LOOPCOUNT_REG, 4)?;
        shl_r32_imm8(self.buf, LOOPINC, 4)?;

        let loop_start = self.buf.here();

        // dest names the last body instruction, inclusive.
        self.compile_block(offset, dest)?;

        add_rr32(self.buf, LOOPCOUNT_REG, LOOPINC)?;
        sub_r32_imm8(self.buf, LOOPCOUNT, 1)?;
        self.buf
            .branch_to(Some(BranchCondition::NotZero), loop_start)?;

        self.looping = false;
        Ok(())
    }

    /// Skips forward to `dest_offset` when the condition holds.
    fn compile_jmp(
        &mut self,
        opcode: OpCode,
        op: &FlowOperands,
        offset: &mut usize,
    ) -> JitResult<()> {
        let dest = self.check_forward(op, *offset)?;

        if opcode == OpCode::Jmpc {
            self.compile_condition(op)?;
        } else {
            self.compile_uniform_condition(op)?;
        }

        let taken = self.buf.record_branch(Some(BranchCondition::NotZero))?;
        self.compile_block(offset, dest.wrapping_sub(1))?;
        let here = self.buf.here();
        self.buf.patch(taken, here);
        Ok(())
    }
}
