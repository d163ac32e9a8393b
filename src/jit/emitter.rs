//! Byte-level x86-64 instruction encoding. Each function appends one
//! instruction to the code buffer; call sites read like the assembly they
//! produce. Memory operands always use a 32-bit displacement, which keeps
//! the encodings uniform at the cost of a few bytes.

use super::code_buffer::CodeBuffer;
use super::JitResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Reg(pub u8);

pub(crate) const RAX: Reg = Reg(0);
pub(crate) const RBX: Reg = Reg(3);
pub(crate) const RBP: Reg = Reg(5);
pub(crate) const RSI: Reg = Reg(6);
pub(crate) const RDI: Reg = Reg(7);
pub(crate) const R9: Reg = Reg(9);
pub(crate) const R10: Reg = Reg(10);
pub(crate) const R11: Reg = Reg(11);
pub(crate) const R12: Reg = Reg(12);
pub(crate) const R13: Reg = Reg(13);
pub(crate) const R14: Reg = Reg(14);
pub(crate) const R15: Reg = Reg(15);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Xmm(pub u8);

pub(crate) const XMM0: Xmm = Xmm(0);
pub(crate) const XMM1: Xmm = Xmm(1);
pub(crate) const XMM2: Xmm = Xmm(2);
pub(crate) const XMM3: Xmm = Xmm(3);
pub(crate) const XMM4: Xmm = Xmm(4);
pub(crate) const XMM14: Xmm = Xmm(14);
pub(crate) const XMM15: Xmm = Xmm(15);

/// One instruction under construction; no encoding exceeds 16 bytes.
struct Encoding {
    bytes: [u8; 16],
    len: usize,
}

impl Encoding {
    fn new() -> Self {
        Encoding {
            bytes: [0; 16],
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        self.bytes[self.len] = byte;
        self.len += 1;
    }

    fn extend(&mut self, bytes: &[u8]) {
        self.bytes[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let byte = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((rm >> 3) & 1);
        if byte != 0x40 {
            self.push(byte);
        }
    }

    fn rex_forced(&mut self, w: bool, reg: u8, index: u8, rm: u8) {
        let byte = 0x40
            | ((w as u8) << 3)
            | (((reg >> 3) & 1) << 2)
            | (((index >> 3) & 1) << 1)
            | ((rm >> 3) & 1);
        self.push(byte);
    }

    fn modrm(&mut self, mode: u8, reg: u8, rm: u8) {
        self.push((mode << 6) | ((reg & 7) << 3) | (rm & 7));
    }

    /// `[base + disp32]`
    fn mem(&mut self, reg: u8, base: Reg, disp: i32) {
        if base.0 & 7 == 4 {
            // rsp/r12-class bases require a SIB byte with no index
            self.modrm(0b10, reg, 0b100);
            self.push(0x24);
        } else {
            self.modrm(0b10, reg, base.0);
        }
        self.extend(&disp.to_le_bytes());
    }

    /// `[base + index + disp32]`
    fn mem_indexed(&mut self, reg: u8, base: Reg, index: Reg, disp: i32) {
        self.modrm(0b10, reg, 0b100);
        // scale 1
        self.push(((index.0 & 7) << 3) | (base.0 & 7));
        self.extend(&disp.to_le_bytes());
    }

    fn emit(self, buf: &mut CodeBuffer) -> JitResult<()> {
        buf.append(&self.bytes[..self.len])
    }
}

// ---- SSE ----

fn sse_rr(
    buf: &mut CodeBuffer,
    prefix: Option<u8>,
    opcode: &[u8],
    dst: u8,
    src: u8,
    imm: Option<u8>,
) -> JitResult<()> {
    let mut enc = Encoding::new();
    if let Some(prefix) = prefix {
        enc.push(prefix);
    }
    enc.rex(false, dst, 0, src);
    enc.push(0x0F);
    enc.extend(opcode);
    enc.modrm(0b11, dst, src);
    if let Some(imm) = imm {
        enc.push(imm);
    }
    enc.emit(buf)
}

fn sse_mem(
    buf: &mut CodeBuffer,
    prefix: Option<u8>,
    opcode: u8,
    xmm: u8,
    base: Reg,
    disp: i32,
) -> JitResult<()> {
    let mut enc = Encoding::new();
    if let Some(prefix) = prefix {
        enc.push(prefix);
    }
    enc.rex(false, xmm, 0, base.0);
    enc.push(0x0F);
    enc.push(opcode);
    enc.mem(xmm, base, disp);
    enc.emit(buf)
}

/// movaps xmm, [base + disp]
pub(crate) fn movaps_load(buf: &mut CodeBuffer, dst: Xmm, base: Reg, disp: i32) -> JitResult<()> {
    sse_mem(buf, None, 0x28, dst.0, base, disp)
}

/// movaps xmm, [base + index + disp]
pub(crate) fn movaps_load_indexed(
    buf: &mut CodeBuffer,
    dst: Xmm,
    base: Reg,
    index: Reg,
    disp: i32,
) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, dst.0, index.0, base.0);
    enc.push(0x0F);
    enc.push(0x28);
    enc.mem_indexed(dst.0, base, index, disp);
    enc.emit(buf)
}

/// movaps [base + disp], xmm
pub(crate) fn movaps_store(buf: &mut CodeBuffer, base: Reg, disp: i32, src: Xmm) -> JitResult<()> {
    sse_mem(buf, None, 0x29, src.0, base, disp)
}

pub(crate) fn movaps_rr(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x28], dst.0, src.0, None)
}

pub(crate) fn addps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x58], dst.0, src.0, None)
}

pub(crate) fn mulps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x59], dst.0, src.0, None)
}

pub(crate) fn minps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x5D], dst.0, src.0, None)
}

pub(crate) fn maxps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x5F], dst.0, src.0, None)
}

pub(crate) fn andps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x54], dst.0, src.0, None)
}

pub(crate) fn xorps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x57], dst.0, src.0, None)
}

pub(crate) fn unpcklps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x14], dst.0, src.0, None)
}

pub(crate) fn unpckhps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x15], dst.0, src.0, None)
}

pub(crate) fn rcpps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x53], dst.0, src.0, None)
}

pub(crate) fn rsqrtps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x52], dst.0, src.0, None)
}

pub(crate) fn cvtps2dq(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, Some(0x66), &[0x5B], dst.0, src.0, None)
}

pub(crate) fn cvtdq2ps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm) -> JitResult<()> {
    sse_rr(buf, None, &[0x5B], dst.0, src.0, None)
}

pub(crate) fn shufps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, selector: u8) -> JitResult<()> {
    sse_rr(buf, None, &[0xC6], dst.0, src.0, Some(selector))
}

pub(crate) fn cmpps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, predicate: u8) -> JitResult<()> {
    sse_rr(buf, None, &[0xC2], dst.0, src.0, Some(predicate))
}

pub(crate) fn cmpss(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, predicate: u8) -> JitResult<()> {
    sse_rr(buf, Some(0xF3), &[0xC2], dst.0, src.0, Some(predicate))
}

/// dpps xmm, xmm, imm (SSE4.1)
pub(crate) fn dpps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, mask: u8) -> JitResult<()> {
    sse_rr(buf, Some(0x66), &[0x3A, 0x40], dst.0, src.0, Some(mask))
}

/// roundps xmm, xmm, imm (SSE4.1); mode 1 rounds toward negative infinity.
pub(crate) fn roundps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, mode: u8) -> JitResult<()> {
    sse_rr(buf, Some(0x66), &[0x3A, 0x08], dst.0, src.0, Some(mode))
}

/// blendps xmm, xmm, imm (SSE4.1); immediate bit i takes lane i from src.
pub(crate) fn blendps(buf: &mut CodeBuffer, dst: Xmm, src: Xmm, mask: u8) -> JitResult<()> {
    sse_rr(buf, Some(0x66), &[0x3A, 0x0C], dst.0, src.0, Some(mask))
}

/// movq r64, xmm
pub(crate) fn movq_r64_xmm(buf: &mut CodeBuffer, dst: Reg, src: Xmm) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.push(0x66);
    enc.rex_forced(true, src.0, 0, dst.0);
    enc.push(0x0F);
    enc.push(0x7E);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

/// vfmadd213ps dst, mul, add: dst = dst * mul + add (FMA3)
pub(crate) fn vfmadd213ps(buf: &mut CodeBuffer, dst: Xmm, mul: Xmm, add: Xmm) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.push(0xC4);
    // ~R ~X ~B + map 0F38
    enc.push(
        ((!(dst.0 >> 3) & 1) << 7) | (1 << 6) | ((!(add.0 >> 3) & 1) << 5) | 0x02,
    );
    // W=0, ~vvvv = second source, L=0, pp=66
    enc.push(((!mul.0 & 0xF) << 3) | 0x01);
    enc.push(0xA8);
    enc.modrm(0b11, dst.0, add.0);
    enc.emit(buf)
}

// ---- integer ----

pub(crate) fn push_reg(buf: &mut CodeBuffer, reg: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    if reg.0 >= 8 {
        enc.push(0x41);
    }
    enc.push(0x50 + (reg.0 & 7));
    enc.emit(buf)
}

pub(crate) fn pop_reg(buf: &mut CodeBuffer, reg: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    if reg.0 >= 8 {
        enc.push(0x41);
    }
    enc.push(0x58 + (reg.0 & 7));
    enc.emit(buf)
}

pub(crate) fn ret(buf: &mut CodeBuffer) -> JitResult<()> {
    buf.append(&[0xC3])
}

pub(crate) fn mov_rr64(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, src.0, 0, dst.0);
    enc.push(0x89);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn mov_rr32(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, src.0, 0, dst.0);
    enc.push(0x89);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn mov_r64_imm64(buf: &mut CodeBuffer, dst: Reg, imm: u64) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, 0, 0, dst.0);
    enc.push(0xB8 + (dst.0 & 7));
    enc.extend(&imm.to_le_bytes());
    enc.emit(buf)
}

/// mov r32, [base + disp]
pub(crate) fn mov_r32_mem(buf: &mut CodeBuffer, dst: Reg, base: Reg, disp: i32) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, dst.0, 0, base.0);
    enc.push(0x8B);
    enc.mem(dst.0, base, disp);
    enc.emit(buf)
}

pub(crate) fn xor_rr64(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, src.0, 0, dst.0);
    enc.push(0x31);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn xor_r32_imm32(buf: &mut CodeBuffer, dst: Reg, imm: u32) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0x81);
    enc.modrm(0b11, 6, dst.0);
    enc.extend(&imm.to_le_bytes());
    enc.emit(buf)
}

pub(crate) fn and_r32_imm32(buf: &mut CodeBuffer, dst: Reg, imm: u32) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0x81);
    enc.modrm(0b11, 4, dst.0);
    enc.extend(&imm.to_le_bytes());
    enc.emit(buf)
}

pub(crate) fn and_rr32(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, src.0, 0, dst.0);
    enc.push(0x21);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn or_rr32(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, src.0, 0, dst.0);
    enc.push(0x09);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn add_rr32(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, src.0, 0, dst.0);
    enc.push(0x01);
    enc.modrm(0b11, src.0, dst.0);
    enc.emit(buf)
}

pub(crate) fn add_r32_imm8(buf: &mut CodeBuffer, dst: Reg, imm: i8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0x83);
    enc.modrm(0b11, 0, dst.0);
    enc.push(imm as u8);
    enc.emit(buf)
}

pub(crate) fn sub_r32_imm8(buf: &mut CodeBuffer, dst: Reg, imm: i8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0x83);
    enc.modrm(0b11, 5, dst.0);
    enc.push(imm as u8);
    enc.emit(buf)
}

pub(crate) fn shr_r32_imm8(buf: &mut CodeBuffer, dst: Reg, imm: u8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0xC1);
    enc.modrm(0b11, 5, dst.0);
    enc.push(imm);
    enc.emit(buf)
}

pub(crate) fn shr_r64_imm8(buf: &mut CodeBuffer, dst: Reg, imm: u8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, 0, 0, dst.0);
    enc.push(0xC1);
    enc.modrm(0b11, 5, dst.0);
    enc.push(imm);
    enc.emit(buf)
}

pub(crate) fn shl_r64_imm8(buf: &mut CodeBuffer, dst: Reg, imm: u8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, 0, 0, dst.0);
    enc.push(0xC1);
    enc.modrm(0b11, 4, dst.0);
    enc.push(imm);
    enc.emit(buf)
}

pub(crate) fn shl_r32_imm8(buf: &mut CodeBuffer, dst: Reg, imm: u8) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, dst.0);
    enc.push(0xC1);
    enc.modrm(0b11, 4, dst.0);
    enc.push(imm);
    enc.emit(buf)
}

/// movsxd r64, r32
pub(crate) fn movsxd(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(true, dst.0, 0, src.0);
    enc.push(0x63);
    enc.modrm(0b11, dst.0, src.0);
    enc.emit(buf)
}

/// movzx r32, r8 (low byte; rsi/rdi-class sources need a bare REX)
pub(crate) fn movzx_r32_r8(buf: &mut CodeBuffer, dst: Reg, src: Reg) -> JitResult<()> {
    let mut enc = Encoding::new();
    if dst.0 >= 8 || src.0 >= 4 {
        enc.rex_forced(false, dst.0, 0, src.0);
    }
    enc.push(0x0F);
    enc.push(0xB6);
    enc.modrm(0b11, dst.0, src.0);
    enc.emit(buf)
}

/// cmp byte [base + disp], imm8
pub(crate) fn cmp_byte_mem_imm8(
    buf: &mut CodeBuffer,
    base: Reg,
    disp: i32,
    imm: u8,
) -> JitResult<()> {
    let mut enc = Encoding::new();
    enc.rex(false, 0, 0, base.0);
    enc.push(0x80);
    enc.mem(7, base, disp);
    enc.push(imm);
    enc.emit(buf)
}
