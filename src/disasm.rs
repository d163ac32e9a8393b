//! Text disassembly of shader programs, in the form the graphics debugger
//! shows: one line per word with destination mask, source swizzles and
//! flow-control targets spelled out.

use crate::bytecode::{
    decode, CommonOperands, DecodeError, DestRegister, FlowOperands, MadOperands, OpCode,
    Operands, RegisterType, SourceRegister, SwizzlePattern, IDENTITY_SWIZZLE,
};

const COMPONENTS: [char; 4] = ['x', 'y', 'z', 'w'];

fn source_name(reg: SourceRegister) -> String {
    let prefix = match reg.register_type() {
        RegisterType::Input => 'v',
        RegisterType::Temporary => 'r',
        RegisterType::FloatUniform => 'c',
    };
    format!("{prefix}{}", reg.index())
}

fn dest_name(reg: DestRegister) -> String {
    if reg.is_output() {
        format!("o{}", reg.index())
    } else {
        format!("r{}", reg.index())
    }
}

fn source_text(desc: SwizzlePattern, slot: usize, reg: SourceRegister, index_tag: &str) -> String {
    let negate = if desc.negate(slot) { "-" } else { "" };
    let mut text = format!("{negate}{}{index_tag}", source_name(reg));
    if desc.raw_selector(slot) != IDENTITY_SWIZZLE {
        text.push('.');
        for component in 0..4 {
            text.push(COMPONENTS[desc.selector(slot, component)]);
        }
    }
    text
}

fn dest_text(desc: SwizzlePattern, reg: DestRegister) -> String {
    let mut text = dest_name(reg);
    if desc.dest_mask() != 0xF {
        text.push('.');
        for component in 0..4 {
            if desc.dest_component_enabled(component) {
                text.push(COMPONENTS[component]);
            }
        }
    }
    text
}

fn condition_text(op: &FlowOperands) -> String {
    use crate::bytecode::FlowOp;
    let x = format!("{}cc.x", if op.refx { "" } else { "!" });
    let y = format!("{}cc.y", if op.refy { "" } else { "!" });
    match op.op {
        FlowOp::Or => format!("{x} || {y}"),
        FlowOp::And => format!("{x} && {y}"),
        FlowOp::JustX => x,
        FlowOp::JustY => y,
    }
}

fn common_text(opcode: OpCode, op: &CommonOperands) -> String {
    let index_tag = match op.address_register_index {
        1 => "[a0]",
        2 => "[a1]",
        3 => "[aL]",
        _ => "",
    };
    let (tag1, tag2) = if op.inverted { ("", index_tag) } else { (index_tag, "") };
    let src1 = source_text(op.desc, 1, op.src1, tag1);
    match opcode {
        OpCode::Mova => format!("mova  a.{}, {src1}", {
            let mut mask = String::new();
            for component in 0..2 {
                if op.desc.dest_component_enabled(component) {
                    mask.push(COMPONENTS[component]);
                }
            }
            mask
        }),
        OpCode::Cmp => format!(
            "cmp   {src1}, {}, {:?}, {:?}",
            source_text(op.desc, 2, op.src2, tag2),
            op.compare_x,
            op.compare_y
        ),
        OpCode::Mov | OpCode::Flr | OpCode::Rcp | OpCode::Rsq => format!(
            "{:<5} {}, {src1}",
            opcode.mnemonic(),
            dest_text(op.desc, op.dest)
        ),
        _ => format!(
            "{:<5} {}, {src1}, {}",
            opcode.mnemonic(),
            dest_text(op.desc, op.dest),
            source_text(op.desc, 2, op.src2, tag2)
        ),
    }
}

fn mad_text(opcode: OpCode, op: &MadOperands) -> String {
    format!(
        "{:<5} {}, {}, {}, {}",
        opcode.mnemonic(),
        dest_text(op.desc, op.dest),
        source_text(op.desc, 1, op.src1, ""),
        source_text(op.desc, 2, op.src2, ""),
        source_text(op.desc, 3, op.src3, "")
    )
}

fn flow_text(opcode: OpCode, op: &FlowOperands) -> String {
    match opcode {
        OpCode::Call => format!("call  0x{:03X}, num={}", op.dest_offset, op.num_instructions),
        OpCode::Callc => format!(
            "callc ({}), 0x{:03X}, num={}",
            condition_text(op),
            op.dest_offset,
            op.num_instructions
        ),
        OpCode::Callu => format!(
            "callu b{}, 0x{:03X}, num={}",
            op.bool_uniform_id, op.dest_offset, op.num_instructions
        ),
        OpCode::Ifu => format!(
            "ifu   b{}, else=0x{:03X}, num={}",
            op.bool_uniform_id, op.dest_offset, op.num_instructions
        ),
        OpCode::Ifc => format!(
            "ifc   ({}), else=0x{:03X}, num={}",
            condition_text(op),
            op.dest_offset,
            op.num_instructions
        ),
        OpCode::Loop => format!("loop  i{}, last=0x{:03X}", op.int_uniform_id, op.dest_offset),
        OpCode::Jmpc => format!("jmpc  ({}), 0x{:03X}", condition_text(op), op.dest_offset),
        _ => format!("jmpu  b{}, 0x{:03X}", op.bool_uniform_id, op.dest_offset),
    }
}

/// One line of disassembly, without the trailing newline.
pub fn disassemble_word(offset: usize, word: u32, swizzle_data: &[u32]) -> String {
    let body = match decode(word, swizzle_data) {
        Ok(decoded) => match &decoded.operands {
            Operands::Common(op) => common_text(decoded.opcode, op),
            Operands::Mad(op) => mad_text(decoded.opcode, op),
            Operands::FlowControl(op) => flow_text(decoded.opcode, op),
            Operands::NoArgs => decoded.opcode.mnemonic().to_string(),
        },
        Err(DecodeError::UnhandledOpcode { opcode, .. }) => {
            let name = OpCode::from_raw(opcode).map(OpCode::mnemonic).unwrap_or("?");
            format!("{name} (unimplemented)")
        }
        Err(DecodeError::ReservedOpcode { opcode, .. }) => {
            format!(".reserved 0x{opcode:02X}")
        }
        Err(DecodeError::InvalidOperandDescriptor { id, .. }) => {
            format!(".bad-operand-desc {id}")
        }
    };
    format!("0x{offset:03X}   {word:08X}   {body}")
}

/// Disassembles a whole program region.
pub fn disassemble(program_code: &[u32], swizzle_data: &[u32]) -> String {
    let mut out = String::new();
    for (offset, &word) in program_code.iter().enumerate() {
        out.push_str(&disassemble_word(offset, word, swizzle_data));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{ShaderProgramBuilder, SwizzleDesc};
    use crate::bytecode::{DestRegister, SourceRegister};

    #[test]
    fn formats_mov_with_mask_and_swizzle() {
        let mut builder = ShaderProgramBuilder::new();
        builder.mov(
            DestRegister::output(2),
            SourceRegister::input(0),
            SwizzleDesc::mask(0b1110).with_src1(SwizzleDesc::lanes(1, 1, 1, 1), true),
        );
        let (words, swizzles) = builder.finish();
        let line = disassemble_word(0, words[0], &swizzles);
        assert!(line.contains("mov   o2.xyz, -v0.yyyy"), "line was: {line}");
    }

    #[test]
    fn formats_flow_and_unimplemented() {
        let mut builder = ShaderProgramBuilder::new();
        builder.ifu(3, 8, 2);
        builder.end();
        let (mut words, swizzles) = builder.finish();
        words.push(0x05 << 26); // ex2

        let text = disassemble(&words, &swizzles);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].contains("ifu   b3, else=0x008, num=2"), "got: {}", lines[0]);
        assert!(lines[1].contains("end"), "got: {}", lines[1]);
        assert!(lines[2].contains("ex2 (unimplemented)"), "got: {}", lines[2]);
    }

    #[test]
    fn formats_indexed_uniform_load() {
        let mut builder = ShaderProgramBuilder::new();
        builder.mov_indexed(
            DestRegister::output(0),
            SourceRegister::float_uniform(5),
            1,
            SwizzleDesc::default(),
        );
        let (words, swizzles) = builder.finish();
        let line = disassemble_word(0, words[0], &swizzles);
        assert!(line.contains("mov   o0, c5[a0]"), "line was: {line}");
    }
}
