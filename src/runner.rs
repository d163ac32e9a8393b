//! Shader engine: memoises compiled programs by content and marshals one
//! vertex at a time through whichever backend serves the draw.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use tracing::{debug, error, trace};

use crate::float24::Float24;
use crate::interpreter::run_interpreter;
use crate::state::{
    semantic, InputVertex, OutputVertex, ShaderConfig, ShaderSetup, UnitState,
    OUTPUT_VERTEX_FLOATS,
};

#[cfg(target_arch = "x86_64")]
use crate::jit::{CompiledShader, CpuCaps, JitCompiler};

fn jit_supported() -> bool {
    cfg!(target_arch = "x86_64") && (cfg!(unix) || cfg!(windows))
}

#[derive(Clone, Copy, Debug)]
pub struct JitConfig {
    pub enabled: bool,
    #[cfg(target_arch = "x86_64")]
    pub caps: CpuCaps,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            enabled: jit_supported(),
            #[cfg(target_arch = "x86_64")]
            caps: CpuCaps::detect(),
        }
    }
}

fn hash64<T: Hash + ?Sized>(data: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

/// Content fingerprint of a (program, swizzle table, entry point) triple.
fn fingerprint(setup: &ShaderSetup, main_offset: u32) -> u64 {
    hash64(&setup.program_code[..])
        ^ hash64(&setup.swizzle_data[..])
        ^ hash64(&main_offset)
}

/// One engine serves one GPU state block: compiled code captures the address
/// of `ShaderSetup::uniforms`, so the setup handed to `setup`/`run` must stay
/// put for the engine's lifetime. The engine itself is single-threaded; the
/// caller quiesces draws around `setup` and `shutdown`.
pub struct ShaderEngine {
    config: JitConfig,
    #[cfg(target_arch = "x86_64")]
    jit: Option<JitCompiler>,
    #[cfg(target_arch = "x86_64")]
    cache: HashMap<u64, CompiledShader>,
    #[cfg(target_arch = "x86_64")]
    active: Option<CompiledShader>,
}

impl Default for ShaderEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderEngine {
    pub fn new() -> Self {
        Self::with_config(JitConfig::default())
    }

    pub fn with_config(config: JitConfig) -> Self {
        ShaderEngine {
            config,
            #[cfg(target_arch = "x86_64")]
            jit: None,
            #[cfg(target_arch = "x86_64")]
            cache: HashMap::new(),
            #[cfg(target_arch = "x86_64")]
            active: None,
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Per-draw preparation: adopts a cached shader for the current program
    /// or compiles it. Idempotent for unchanged state. A failed compile
    /// downgrades the draw to the interpreter.
    pub fn setup(&mut self, setup: &ShaderSetup, config: &ShaderConfig) {
        #[cfg(target_arch = "x86_64")]
        {
            if !self.config.enabled {
                self.active = None;
                return;
            }

            if self.jit.is_none() {
                match JitCompiler::with_caps(self.config.caps) {
                    Ok(jit) => self.jit = Some(jit),
                    Err(err) => {
                        error!("shader jit unavailable: {err}");
                        self.config.enabled = false;
                        self.active = None;
                        return;
                    }
                }
            }

            let key = fingerprint(setup, config.main_offset);
            if let Some(&shader) = self.cache.get(&key) {
                self.active = Some(shader);
                return;
            }

            let Some(jit) = self.jit.as_mut() else {
                return;
            };
            match jit.compile(setup, config.main_offset as usize) {
                Ok(shader) => {
                    debug!(
                        "compiled shader {key:016X}: {} bytes at 0x{:X}",
                        shader.code_len(),
                        shader.entry_address()
                    );
                    self.cache.insert(key, shader);
                    self.active = Some(shader);
                }
                Err(err) => {
                    error!("shader compile failed, using interpreter: {err}");
                    self.active = None;
                }
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (setup, config);
        }
    }

    /// Runs the shader for one vertex and extracts the output.
    pub fn run(
        &mut self,
        setup: &ShaderSetup,
        config: &ShaderConfig,
        state: &mut UnitState,
        input: &InputVertex,
        num_attributes: usize,
    ) -> OutputVertex {
        state.program_counter = config.main_offset;
        state.debug.max_offset = 0;
        state.debug.max_opdesc_id = 0;
        state.call_stack.clear();
        state.conditional_code = [false, false];

        for attribute in 0..num_attributes.min(16) {
            let register = (config.input_register_map[attribute] & 0xF) as usize;
            state.registers.input[register] = input.attr[attribute];
        }

        let mut used_jit = false;
        #[cfg(target_arch = "x86_64")]
        if self.config.enabled {
            if let Some(shader) = self.active {
                unsafe { shader.run(&mut state.registers) };
                used_jit = true;
            }
        }
        if !used_jit {
            run_interpreter(setup, state);
        }

        // Seven output slots are consumed; hardware behaviour for the rest
        // is unexplored. Unmapped floats stay +0.0 so later interpolation
        // never sees denormals.
        let mut ret = OutputVertex::default();
        for (slot, map) in config.output_attributes.iter().enumerate() {
            let semantics = [map.map_x, map.map_y, map.map_z, map.map_w];
            for (component, &index) in semantics.iter().enumerate() {
                if index != semantic::INVALID && (index as usize) < OUTPUT_VERTEX_FLOATS {
                    ret.as_floats_mut()[index as usize] = state.registers.output[slot][component];
                }
            }
        }

        // The hardware takes the absolute value and saturates vertex colours
        // before interpolation.
        for channel in ret.color.iter_mut() {
            *channel = Float24::from_f32(channel.to_f32().abs().min(1.0));
        }

        trace!(
            "output vertex: pos ({:.2}, {:.2}, {:.2}, {:.2}), col ({:.2}, {:.2}, {:.2}, {:.2})",
            ret.pos[0].to_f32(),
            ret.pos[1].to_f32(),
            ret.pos[2].to_f32(),
            ret.pos[3].to_f32(),
            ret.color[0].to_f32(),
            ret.color[1].to_f32(),
            ret.color[2].to_f32(),
            ret.color[3].to_f32(),
        );

        ret
    }

    /// Entry address of the shader the engine would dispatch to, if any.
    pub fn active_entry(&self) -> Option<usize> {
        #[cfg(target_arch = "x86_64")]
        {
            self.active.map(|shader| shader.entry_address())
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            None
        }
    }

    /// Drops every cached shader and releases the code region for reuse.
    /// The cache empties before the buffer clears; the reverse order would
    /// leave dangling entries.
    pub fn shutdown(&mut self) {
        #[cfg(target_arch = "x86_64")]
        {
            self.active = None;
            self.cache.clear();
            if let Some(jit) = self.jit.as_mut() {
                jit.clear();
            }
        }
    }

    pub fn dump_text(&self) -> String {
        let mut out = String::new();
        out.push_str("shader engine:\n");
        out.push_str(&format!("  jit enabled: {}\n", self.config.enabled));
        #[cfg(target_arch = "x86_64")]
        {
            out.push_str(&format!("  cached shaders: {}\n", self.cache.len()));
            let mut keys: Vec<u64> = self.cache.keys().copied().collect();
            keys.sort_unstable();
            for key in keys {
                if let Some(shader) = self.cache.get(&key) {
                    out.push_str(&format!(
                        "  shader#{key:016X} entry=0x{:X} code_bytes={}\n",
                        shader.entry_address(),
                        shader.code_len()
                    ));
                }
            }
            if let Some(jit) = self.jit.as_ref() {
                out.push_str(&format!("  code buffer used: {} bytes\n", jit.used_bytes()));
            }
        }
        out
    }
}
