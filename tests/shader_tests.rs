use shader::{
    run_interpreter, semantic, CompareOp, DestRegister, FlowOp, InputVertex, JitConfig,
    OutputAttributeMap, ShaderConfig, ShaderEngine, ShaderProgramBuilder, ShaderSetup,
    SourceRegister, SwizzleDesc, UnitState,
};

fn f(value: f32) -> shader::Float24 {
    shader::Float24::from_f32(value)
}

fn vec4(x: f32, y: f32, z: f32, w: f32) -> [shader::Float24; 4] {
    [f(x), f(y), f(z), f(w)]
}

fn raw4(v: [shader::Float24; 4]) -> [f32; 4] {
    [v[0].to_f32(), v[1].to_f32(), v[2].to_f32(), v[3].to_f32()]
}

fn setup_from(builder: ShaderProgramBuilder) -> ShaderSetup {
    let (program_code, swizzle_data) = builder.finish();
    ShaderSetup {
        program_code,
        swizzle_data,
        ..ShaderSetup::default()
    }
}

fn position_config() -> ShaderConfig {
    let mut config = ShaderConfig::default();
    config.output_attributes[0] = OutputAttributeMap {
        map_x: semantic::POSITION_X,
        map_y: semantic::POSITION_Y,
        map_z: semantic::POSITION_Z,
        map_w: semantic::POSITION_W,
    };
    config
}

/// Runs the program on the interpreter and, on x86-64, on the JIT with both
/// detected and baseline capabilities; every backend must produce bit-equal
/// register files.
fn assert_backends_match(setup: &ShaderSetup, init: impl Fn(&mut UnitState), label: &str) {
    let mut reference = UnitState::new();
    init(&mut reference);
    reference.program_counter = 0;
    run_interpreter(setup, &mut reference);

    #[cfg(target_arch = "x86_64")]
    {
        use shader::{CpuCaps, JitCompiler};

        for caps in [CpuCaps::detect(), CpuCaps::baseline()] {
            let mut jit = JitCompiler::with_caps(caps).expect("jit should initialise");
            let compiled = jit
                .compile(setup, 0)
                .unwrap_or_else(|err| panic!("{label}: compile failed: {err}"));

            let mut state = UnitState::new();
            init(&mut state);
            unsafe { compiled.run(&mut state.registers) };

            for slot in 0..16 {
                for lane in 0..4 {
                    let expected = reference.registers.output[slot][lane].to_f32().to_bits();
                    let actual = state.registers.output[slot][lane].to_f32().to_bits();
                    assert_eq!(
                        actual, expected,
                        "{label}: output o{slot}.{lane} differs (sse4_1={}, fma={})",
                        caps.sse4_1, caps.fma
                    );
                    let expected = reference.registers.temporary[slot][lane].to_f32().to_bits();
                    let actual = state.registers.temporary[slot][lane].to_f32().to_bits();
                    assert_eq!(
                        actual, expected,
                        "{label}: temporary r{slot}.{lane} differs (sse4_1={}, fma={})",
                        caps.sse4_1, caps.fma
                    );
                }
            }
        }
    }
}

#[test]
fn passthrough_shader_produces_expected_vertex() {
    let mut builder = ShaderProgramBuilder::new();
    builder.mov(
        DestRegister::output(0),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let setup = setup_from(builder);
    let config = position_config();

    let mut engine = ShaderEngine::new();
    engine.setup(&setup, &config);

    let mut state = UnitState::new();
    let mut input = InputVertex::default();
    input.attr[0] = vec4(1.0, 2.0, 3.0, 4.0);
    let vertex = engine.run(&setup, &config, &mut state, &input, 1);

    assert_eq!(
        [
            vertex.pos[0].to_f32(),
            vertex.pos[1].to_f32(),
            vertex.pos[2].to_f32(),
            vertex.pos[3].to_f32()
        ],
        [1.0, 2.0, 3.0, 4.0]
    );
    for channel in vertex.color {
        assert_eq!(channel.to_f32().to_bits(), 0.0f32.to_bits());
    }
}

#[test]
fn saturated_colour_is_clamped_per_channel() {
    let mut builder = ShaderProgramBuilder::new();
    builder.mov(
        DestRegister::output(1),
        SourceRegister::float_uniform(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.f[0] = vec4(-3.0, 0.5, -0.25, 2.0);

    let mut config = ShaderConfig::default();
    config.output_attributes[1] = OutputAttributeMap {
        map_x: semantic::COLOR_R,
        map_y: semantic::COLOR_G,
        map_z: semantic::COLOR_B,
        map_w: semantic::COLOR_A,
    };

    let mut engine = ShaderEngine::new();
    engine.setup(&setup, &config);
    let mut state = UnitState::new();
    let vertex = engine.run(&setup, &config, &mut state, &InputVertex::default(), 0);

    assert_eq!(vertex.color[0].to_f32(), 1.0);
    assert_eq!(vertex.color[1].to_f32(), 0.5);
    assert_eq!(vertex.color[2].to_f32(), 0.25);
    assert_eq!(vertex.color[3].to_f32(), 1.0);
}

#[test]
fn conditional_uniform_branch_selects_either_arm() {
    // if b0 { o0 = c0 } else { o0 = c1 }
    let build = || {
        let mut builder = ShaderProgramBuilder::new();
        builder.ifu(0, 3, 1);
        builder.mov(
            DestRegister::output(0),
            SourceRegister::float_uniform(0),
            SwizzleDesc::default(),
        );
        builder.nop();
        builder.mov(
            DestRegister::output(0),
            SourceRegister::float_uniform(1),
            SwizzleDesc::default(),
        );
        builder.end();
        builder.finish()
    };

    for (flag, expected) in [(true, [1.0f32; 4]), (false, [2.0f32; 4])] {
        let (program_code, swizzle_data) = build();
        let mut setup = ShaderSetup {
            program_code,
            swizzle_data,
            ..ShaderSetup::default()
        };
        setup.uniforms.f[0] = vec4(1.0, 1.0, 1.0, 1.0);
        setup.uniforms.f[1] = vec4(2.0, 2.0, 2.0, 2.0);
        setup.uniforms.b[0] = flag;

        let config = position_config();
        let mut engine = ShaderEngine::new();
        engine.setup(&setup, &config);
        let mut state = UnitState::new();
        let vertex = engine.run(&setup, &config, &mut state, &InputVertex::default(), 0);
        assert_eq!(
            [
                vertex.pos[0].to_f32(),
                vertex.pos[1].to_f32(),
                vertex.pos[2].to_f32(),
                vertex.pos[3].to_f32()
            ],
            expected,
            "b0 = {flag}"
        );
    }
}

#[test]
fn arithmetic_templates_match_across_backends() {
    let mut builder = ShaderProgramBuilder::new();
    builder.add(
        DestRegister::temporary(0),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.mul(
        DestRegister::temporary(1),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.max(
        DestRegister::temporary(2),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.min(
        DestRegister::temporary(3),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.dp3(
        DestRegister::output(1),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.dp4(
        DestRegister::output(2),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.flr(
        DestRegister::output(3),
        SourceRegister::input(2),
        SwizzleDesc::default(),
    );
    builder.mad(
        DestRegister::output(4),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SourceRegister::input(2),
        SwizzleDesc::default(),
    );
    builder.end();
    let setup = setup_from(builder);

    assert_backends_match(
        &setup,
        |state| {
            state.registers.input[0] = vec4(1.0, 2.0, 3.0, 4.0);
            state.registers.input[1] = vec4(5.0, -6.0, 7.0, -8.0);
            state.registers.input[2] = vec4(2.0, -3.0, 9.0, 0.0);
        },
        "arithmetic templates",
    );
}

#[test]
fn swizzle_identity_matches_explicit_identity() {
    // A selector spelled out as x,y,z,w must behave exactly like the
    // implicit identity (which skips the shuffle entirely).
    let explicit = SwizzleDesc::default().with_src1(SwizzleDesc::lanes(0, 1, 2, 3), false);
    for desc in [SwizzleDesc::default(), explicit] {
        let mut builder = ShaderProgramBuilder::new();
        builder.mov(DestRegister::output(0), SourceRegister::input(0), desc);
        builder.end();
        let setup = setup_from(builder);
        assert_backends_match(
            &setup,
            |state| {
                state.registers.input[0] = vec4(4.0, 3.0, 2.0, 1.0);
            },
            "swizzle identity",
        );
    }
}

#[test]
fn swizzles_negation_and_masks_match_across_backends() {
    let mut builder = ShaderProgramBuilder::new();
    builder.mov(
        DestRegister::output(0),
        SourceRegister::input(0),
        SwizzleDesc::default().with_src1(SwizzleDesc::lanes(3, 2, 1, 0), true),
    );
    builder.mov(
        DestRegister::output(1),
        SourceRegister::input(0),
        SwizzleDesc::mask(0b1010),
    );
    builder.mov(
        DestRegister::output(2),
        SourceRegister::input(0),
        SwizzleDesc::mask(0b0001).with_src1(SwizzleDesc::lanes(0, 0, 0, 0), false),
    );
    builder.end();
    let setup = setup_from(builder);

    assert_backends_match(
        &setup,
        |state| {
            state.registers.input[0] = vec4(1.0, -2.0, 3.0, -4.0);
            state.registers.output[1] = vec4(9.0, 9.0, 9.0, 9.0);
        },
        "swizzle and mask",
    );
}

#[test]
fn compare_and_conditional_flow_match_across_backends() {
    let mut builder = ShaderProgramBuilder::new();
    // cc = (v0.x < v1.x, v0.y >= v1.y)
    builder.cmp(
        SourceRegister::input(0),
        SourceRegister::input(1),
        CompareOp::LessThan,
        CompareOp::GreaterEqual,
        SwizzleDesc::default(),
    );
    // if cc.x { r0 = v0 } else { r0 = v1 }
    builder.ifc(FlowOp::JustX, true, false, 4, 1);
    builder.mov(
        DestRegister::temporary(0),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.nop();
    builder.mov(
        DestRegister::temporary(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    // jmpc over the marker mov when cc.y holds
    let jmp_target = 7;
    builder.jmpc(FlowOp::JustY, false, true, jmp_target);
    builder.mov(
        DestRegister::temporary(1),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let setup = setup_from(builder);

    for (a, b) in [((1.0, 5.0), (2.0, 3.0)), ((4.0, 1.0), (2.0, 3.0))] {
        assert_backends_match(
            &setup,
            move |state| {
                state.registers.input[0] = vec4(a.0, a.1, 0.0, 0.0);
                state.registers.input[1] = vec4(b.0, b.1, 0.0, 0.0);
            },
            "compare and conditional flow",
        );
    }
}

#[test]
fn slti_x_lane_matches_across_backends() {
    let mut builder = ShaderProgramBuilder::new();
    builder.slti(
        DestRegister::temporary(0),
        SourceRegister::input(0),
        SourceRegister::float_uniform(0),
        SwizzleDesc::mask(0b1000),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.f[0] = vec4(3.0, 0.0, 0.0, 0.0);

    for x in [1.0, 5.0] {
        assert_backends_match(
            &setup,
            move |state| {
                state.registers.input[0] = vec4(x, 0.0, 0.0, 0.0);
            },
            "slti x lane",
        );
    }
}

#[test]
fn call_inlines_and_matches_across_backends() {
    let mut builder = ShaderProgramBuilder::new();
    builder.call(2, 2); // subroutine at 2..=3
    builder.end();
    builder.add(
        DestRegister::temporary(0),
        SourceRegister::input(0),
        SourceRegister::input(1),
        SwizzleDesc::default(),
    );
    builder.mov(
        DestRegister::output(0),
        SourceRegister::temporary(0),
        SwizzleDesc::default(),
    );
    let setup = setup_from(builder);

    assert_backends_match(
        &setup,
        |state| {
            state.registers.input[0] = vec4(1.0, 2.0, 3.0, 4.0);
            state.registers.input[1] = vec4(10.0, 20.0, 30.0, 40.0);
        },
        "call inline",
    );
}

#[test]
fn callu_and_jmpu_match_across_backends() {
    let build = || {
        let mut builder = ShaderProgramBuilder::new();
        builder.callu(0, 4, 1); // conditionally run the add at 4
        builder.jmpu(1, 3); // skip the marker mov when b1 holds
        builder.mov(
            DestRegister::temporary(1),
            SourceRegister::input(0),
            SwizzleDesc::default(),
        );
        builder.end();
        builder.add(
            DestRegister::temporary(0),
            SourceRegister::input(0),
            SourceRegister::input(1),
            SwizzleDesc::default(),
        );
        builder.finish()
    };

    for flags in [(false, false), (true, false), (false, true), (true, true)] {
        let (program_code, swizzle_data) = build();
        let mut setup = ShaderSetup {
            program_code,
            swizzle_data,
            ..ShaderSetup::default()
        };
        setup.uniforms.b[0] = flags.0;
        setup.uniforms.b[1] = flags.1;

        assert_backends_match(
            &setup,
            |state| {
                state.registers.input[0] = vec4(1.0, 1.0, 1.0, 1.0);
                state.registers.input[1] = vec4(2.0, 2.0, 2.0, 2.0);
            },
            "callu and jmpu",
        );
    }
}

#[test]
fn bounded_loop_accumulates_and_indexes() {
    // loop i0 { r1 = c[0 + aL]; r0 += r1 } with i0 = (count 3, start 0, inc 1)
    let mut builder = ShaderProgramBuilder::new();
    builder.loop_(0, 2);
    builder.mov_indexed(
        DestRegister::temporary(1),
        SourceRegister::float_uniform(0),
        3,
        SwizzleDesc::default(),
    );
    builder.add(
        DestRegister::temporary(0),
        SourceRegister::temporary(0),
        SourceRegister::temporary(1),
        SwizzleDesc::default(),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.i[0] = [3, 0, 1, 0];
    for index in 0..4 {
        let value = (index + 1) as f32;
        setup.uniforms.f[index] = vec4(value, value, value, value);
    }

    assert_backends_match(&setup, |_| {}, "bounded loop");

    // The four iterations read c0..c3: 1 + 2 + 3 + 4.
    let mut state = UnitState::new();
    state.program_counter = 0;
    run_interpreter(&setup, &mut state);
    assert_eq!(raw4(state.registers.temporary[0]), [10.0, 10.0, 10.0, 10.0]);
}

#[test]
fn plain_loop_runs_count_plus_one_times() {
    let mut builder = ShaderProgramBuilder::new();
    builder.loop_(0, 1);
    builder.add(
        DestRegister::temporary(0),
        SourceRegister::temporary(0),
        SourceRegister::float_uniform(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.i[0] = [4, 0, 1, 0];
    setup.uniforms.f[0] = vec4(1.0, 1.0, 1.0, 1.0);

    assert_backends_match(&setup, |_| {}, "plain loop");

    let mut state = UnitState::new();
    state.program_counter = 0;
    run_interpreter(&setup, &mut state);
    assert_eq!(raw4(state.registers.temporary[0]), [5.0, 5.0, 5.0, 5.0]);
}

#[test]
fn mova_then_indexed_load_reads_rebased_uniform() {
    // mova a0.x, c0.x; o0 = c[a0.x + 5]
    let mut builder = ShaderProgramBuilder::new();
    builder.mova(SourceRegister::float_uniform(0), SwizzleDesc::mask(0b1000));
    builder.mov_indexed(
        DestRegister::output(0),
        SourceRegister::float_uniform(5),
        1,
        SwizzleDesc::default(),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.f[0] = vec4(2.0, 0.0, 0.0, 0.0);
    setup.uniforms.f[7] = vec4(11.0, 12.0, 13.0, 14.0);

    assert_backends_match(&setup, |_| {}, "mova indexed load");

    let mut state = UnitState::new();
    state.program_counter = 0;
    run_interpreter(&setup, &mut state);
    assert_eq!(raw4(state.registers.output[0]), [11.0, 12.0, 13.0, 14.0]);
}

#[test]
fn mova_writes_both_address_registers() {
    // a0 = v0.x, a1 = v0.y, then read through each.
    let mut builder = ShaderProgramBuilder::new();
    builder.mova(SourceRegister::input(0), SwizzleDesc::mask(0b1100));
    builder.mov_indexed(
        DestRegister::output(0),
        SourceRegister::float_uniform(0),
        1,
        SwizzleDesc::default(),
    );
    builder.mov_indexed(
        DestRegister::output(1),
        SourceRegister::float_uniform(0),
        2,
        SwizzleDesc::default(),
    );
    builder.end();
    let mut setup = setup_from(builder);
    setup.uniforms.f[3] = vec4(3.0, 3.0, 3.0, 3.0);
    setup.uniforms.f[6] = vec4(6.0, 6.0, 6.0, 6.0);

    assert_backends_match(
        &setup,
        |state| {
            state.registers.input[0] = vec4(3.0, 6.0, 0.0, 0.0);
        },
        "mova both registers",
    );
}

#[test]
fn interpreter_serves_draws_when_jit_is_disabled() {
    let mut builder = ShaderProgramBuilder::new();
    builder.mov(
        DestRegister::output(0),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let setup = setup_from(builder);
    let config = position_config();

    let mut engine = ShaderEngine::with_config(JitConfig {
        enabled: false,
        ..JitConfig::default()
    });
    engine.setup(&setup, &config);
    assert!(engine.active_entry().is_none());

    let mut state = UnitState::new();
    let mut input = InputVertex::default();
    input.attr[0] = vec4(5.0, 6.0, 7.0, 8.0);
    let vertex = engine.run(&setup, &config, &mut state, &input, 1);
    assert_eq!(vertex.pos[0].to_f32(), 5.0);
    assert_eq!(vertex.pos[3].to_f32(), 8.0);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn engine_and_interpreter_agree_on_full_pipeline_output() {
    let mut builder = ShaderProgramBuilder::new();
    builder.dp4(
        DestRegister::output(0),
        SourceRegister::input(0),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.mov(
        DestRegister::output(1),
        SourceRegister::input(0),
        SwizzleDesc::default(),
    );
    builder.end();
    let setup = setup_from(builder);

    let mut config = position_config();
    config.output_attributes[1] = OutputAttributeMap {
        map_x: semantic::COLOR_R,
        map_y: semantic::COLOR_G,
        map_z: semantic::COLOR_B,
        map_w: semantic::COLOR_A,
    };

    let mut input = InputVertex::default();
    input.attr[0] = vec4(1.0, 2.0, 3.0, 4.0);

    let mut jit_engine = ShaderEngine::new();
    jit_engine.setup(&setup, &config);
    assert!(jit_engine.active_entry().is_some());
    let mut state = UnitState::new();
    let jit_vertex = jit_engine.run(&setup, &config, &mut state, &input, 1);

    let mut soft_engine = ShaderEngine::with_config(JitConfig {
        enabled: false,
        ..JitConfig::default()
    });
    soft_engine.setup(&setup, &config);
    let mut state = UnitState::new();
    let soft_vertex = soft_engine.run(&setup, &config, &mut state, &input, 1);

    for index in 0..shader::OUTPUT_VERTEX_FLOATS {
        assert_eq!(
            jit_vertex.as_floats()[index].to_f32().to_bits(),
            soft_vertex.as_floats()[index].to_f32().to_bits(),
            "output float {index} differs between backends"
        );
    }
}
