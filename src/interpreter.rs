//! Reference backend. Executes a shader one instruction at a time against
//! the unit state, with structured control flow lowered onto a small call
//! stack. The JIT is required to be observably equivalent to this
//! implementation for every program it accepts.

use tracing::error;

use crate::bytecode::{
    decode, CommonOperands, CompareOp, FlowOp, FlowOperands, MadOperands, OpCode, Operands,
    SourceRegister,
};
use crate::float24::Float24;
use crate::state::{
    CallStackElement, ShaderSetup, UnitState, Vec4, MAX_CALL_STACK_DEPTH,
};

fn lookup_source(setup: &ShaderSetup, state: &UnitState, reg: SourceRegister) -> Vec4 {
    use crate::bytecode::RegisterType;
    match reg.register_type() {
        RegisterType::Input => state
            .registers
            .input
            .get(reg.index())
            .copied()
            .unwrap_or_default(),
        RegisterType::Temporary => state
            .registers
            .temporary
            .get(reg.index())
            .copied()
            .unwrap_or_default(),
        RegisterType::FloatUniform => setup
            .uniforms
            .f
            .get(reg.index())
            .copied()
            .unwrap_or_default(),
    }
}

fn swizzled(raw: Vec4, desc: crate::bytecode::SwizzlePattern, slot: usize) -> Vec4 {
    let mut out = [Float24::ZERO; 4];
    for (component, lane) in out.iter_mut().enumerate() {
        *lane = raw[desc.selector(slot, component)];
    }
    if desc.negate(slot) {
        for lane in &mut out {
            *lane = -*lane;
        }
    }
    out
}

fn compare(op: CompareOp, lhs: Float24, rhs: Float24) -> bool {
    match op {
        CompareOp::Equal => lhs == rhs,
        CompareOp::NotEqual => lhs != rhs,
        CompareOp::LessThan => lhs < rhs,
        CompareOp::LessEqual => lhs <= rhs,
        CompareOp::GreaterThan => lhs > rhs,
        CompareOp::GreaterEqual => lhs >= rhs,
    }
}

fn evaluate_condition(state: &UnitState, refx: bool, refy: bool, op: FlowOp) -> bool {
    let x = refx == state.conditional_code[0];
    let y = refy == state.conditional_code[1];
    match op {
        FlowOp::Or => x || y,
        FlowOp::And => x && y,
        FlowOp::JustX => x,
        FlowOp::JustY => y,
    }
}

fn push_call(
    state: &mut UnitState,
    offset: u32,
    num_instructions: u32,
    return_offset: u32,
    repeat_count: u8,
    loop_increment: u8,
) {
    if state.call_stack.len() >= MAX_CALL_STACK_DEPTH {
        error!("shader call stack exhausted at pc {}", state.program_counter);
        return;
    }
    // -1 so the post-instruction increment lands on the target.
    state.program_counter = offset.wrapping_sub(1);
    state.call_stack.push(CallStackElement {
        final_address: offset.wrapping_add(num_instructions),
        return_address: return_offset,
        repeat_counter: repeat_count,
        loop_increment,
        loop_address: offset,
    });
}

/// Runs the program from `state.program_counter` until END (or until the
/// program counter leaves the program).
pub fn run_interpreter(setup: &ShaderSetup, state: &mut UnitState) {
    loop {
        if let Some(&top) = state.call_stack.last() {
            if state.program_counter == top.final_address {
                state.address_registers[2] =
                    state.address_registers[2].wrapping_add(top.loop_increment as i32);

                if top.repeat_counter == 0 {
                    state.program_counter = top.return_address;
                    state.call_stack.pop();
                } else {
                    if let Some(top) = state.call_stack.last_mut() {
                        top.repeat_counter -= 1;
                    }
                    state.program_counter = top.loop_address;
                }
                continue;
            }
        }

        let pc = state.program_counter as usize;
        let Some(&word) = setup.program_code.get(pc) else {
            error!("program counter {pc} ran past the end of the shader");
            return;
        };
        state.debug.max_offset = state.debug.max_offset.max(state.program_counter + 1);

        let decoded = match decode(word, &setup.swizzle_data) {
            Ok(decoded) => decoded,
            Err(err) => {
                error!("{err}");
                state.program_counter += 1;
                continue;
            }
        };

        let mut exit = false;

        match decoded.operands {
            Operands::Common(CommonOperands {
                desc,
                src1,
                src2,
                address_register_index,
                dest,
                compare_x,
                compare_y,
                inverted,
            }) => {
                state.debug.max_opdesc_id = state.debug.max_opdesc_id.max(1 + (word & 0x7F));

                let address_offset = match address_register_index {
                    0 => 0,
                    index => state.address_registers[index as usize - 1],
                };
                // The offset rebases the wide source slot only.
                let (src1, src2) = if inverted {
                    (src1, src2.with_offset(address_offset))
                } else {
                    (src1.with_offset(address_offset), src2)
                };

                let src1 = swizzled(lookup_source(setup, state, src1), desc, 1);
                let src2 = swizzled(lookup_source(setup, state, src2), desc, 2);

                match decoded.opcode {
                    OpCode::Mova => {
                        for i in 0..2 {
                            if !desc.dest_component_enabled(i) {
                                continue;
                            }
                            // Matches the SSE float->int conversion the JIT emits.
                            state.address_registers[i] =
                                src1[i].to_f32().round_ties_even() as i32;
                        }
                    }
                    OpCode::Cmp => {
                        state.conditional_code[0] = compare(compare_x, src1[0], src2[0]);
                        state.conditional_code[1] = compare(compare_y, src1[1], src2[1]);
                    }
                    opcode => {
                        let mut result = [Float24::ZERO; 4];
                        match opcode {
                            OpCode::Add => {
                                for i in 0..4 {
                                    result[i] = src1[i] + src2[i];
                                }
                            }
                            OpCode::Mul => {
                                for i in 0..4 {
                                    result[i] = src1[i] * src2[i];
                                }
                            }
                            OpCode::Max => {
                                for i in 0..4 {
                                    result[i] = src1[i].max(src2[i]);
                                }
                            }
                            OpCode::Min => {
                                for i in 0..4 {
                                    result[i] = src1[i].min(src2[i]);
                                }
                            }
                            OpCode::Dp3 | OpCode::Dp4 => {
                                let components = if opcode == OpCode::Dp3 { 3 } else { 4 };
                                let mut dot = Float24::ZERO;
                                for i in 0..components {
                                    dot = dot + src1[i] * src2[i];
                                }
                                result = [dot; 4];
                            }
                            OpCode::Flr => {
                                for i in 0..4 {
                                    result[i] = Float24::from_f32(src1[i].to_f32().floor());
                                }
                            }
                            OpCode::Rcp => {
                                for i in 0..4 {
                                    result[i] = Float24::from_f32(1.0 / src1[i].to_f32());
                                }
                            }
                            OpCode::Rsq => {
                                for i in 0..4 {
                                    result[i] =
                                        Float24::from_f32(1.0 / src1[i].to_f32().sqrt());
                                }
                            }
                            OpCode::Mov => {
                                result = src1;
                            }
                            OpCode::Slti => {
                                for i in 0..4 {
                                    result[i] = if src1[i] < src2[i] {
                                        Float24::ONE
                                    } else {
                                        Float24::ZERO
                                    };
                                }
                            }
                            other => {
                                error!(
                                    "unhandled arithmetic instruction {} (0x{word:08X})",
                                    other.mnemonic()
                                );
                            }
                        }

                        let registers = if dest.is_output() {
                            &mut state.registers.output[dest.index()]
                        } else {
                            &mut state.registers.temporary[dest.index()]
                        };
                        for i in 0..4 {
                            if desc.dest_component_enabled(i) {
                                registers[i] = result[i];
                            }
                        }
                    }
                }
            }

            Operands::Mad(MadOperands {
                desc,
                src1,
                src2,
                src3,
                dest,
            }) => {
                state.debug.max_opdesc_id = state.debug.max_opdesc_id.max(1 + (word & 0x1F));

                let src1 = swizzled(lookup_source(setup, state, src1), desc, 1);
                let src2 = swizzled(lookup_source(setup, state, src2), desc, 2);
                let src3 = swizzled(lookup_source(setup, state, src3), desc, 3);

                let registers = if dest.is_output() {
                    &mut state.registers.output[dest.index()]
                } else {
                    &mut state.registers.temporary[dest.index()]
                };
                for i in 0..4 {
                    if desc.dest_component_enabled(i) {
                        registers[i] = src1[i] * src2[i] + src3[i];
                    }
                }
            }

            Operands::FlowControl(FlowOperands {
                dest_offset,
                num_instructions,
                refx,
                refy,
                op,
                bool_uniform_id,
                int_uniform_id,
            }) => {
                let pc = state.program_counter;
                match decoded.opcode {
                    OpCode::Jmpc => {
                        if evaluate_condition(state, refx, refy, op) {
                            state.program_counter = dest_offset.wrapping_sub(1);
                        }
                    }
                    OpCode::Jmpu => {
                        if setup.uniforms.b[bool_uniform_id as usize] {
                            state.program_counter = dest_offset.wrapping_sub(1);
                        }
                    }
                    OpCode::Call => {
                        push_call(state, dest_offset, num_instructions, pc + 1, 0, 0);
                    }
                    OpCode::Callu => {
                        if setup.uniforms.b[bool_uniform_id as usize] {
                            push_call(state, dest_offset, num_instructions, pc + 1, 0, 0);
                        }
                    }
                    OpCode::Callc => {
                        if evaluate_condition(state, refx, refy, op) {
                            push_call(state, dest_offset, num_instructions, pc + 1, 0, 0);
                        }
                    }
                    OpCode::Ifu | OpCode::Ifc => {
                        let taken = if decoded.opcode == OpCode::Ifu {
                            setup.uniforms.b[bool_uniform_id as usize]
                        } else {
                            evaluate_condition(state, refx, refy, op)
                        };
                        if taken {
                            push_call(
                                state,
                                pc + 1,
                                dest_offset.wrapping_sub(pc + 1),
                                dest_offset + num_instructions,
                                0,
                                0,
                            );
                        } else {
                            push_call(
                                state,
                                dest_offset,
                                num_instructions,
                                dest_offset + num_instructions,
                                0,
                                0,
                            );
                        }
                    }
                    OpCode::Loop => {
                        let uniform = setup.uniforms.i[int_uniform_id as usize];
                        state.address_registers[2] = uniform[1] as i32;
                        // dest_offset names the last body instruction, inclusive.
                        push_call(
                            state,
                            pc + 1,
                            dest_offset.wrapping_sub(pc),
                            dest_offset + 1,
                            uniform[0],
                            uniform[2],
                        );
                    }
                    other => {
                        error!(
                            "unhandled flow-control instruction {} (0x{word:08X})",
                            other.mnemonic()
                        );
                    }
                }
            }

            Operands::NoArgs => match decoded.opcode {
                OpCode::End => exit = true,
                OpCode::Nop => {}
                other => {
                    error!("unhandled instruction {} (0x{word:08X})", other.mnemonic());
                }
            },
        }

        state.program_counter += 1;

        if exit {
            return;
        }
    }
}
