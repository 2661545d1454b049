// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

/// Slot indices must fit in the index bits of `abi::ThreadId`.
const MAX_THREAD_SLOTS: usize = 1 << 10;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct KernelConfig {
    max_threads: usize,
    priority_bits: u8,
    kernel_priority: u8,
    int_required_stack: usize,
    #[serde(default)]
    wfi_idle: bool,
}

impl KernelConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_threads < 2 || self.max_threads > MAX_THREAD_SLOTS {
            return Err(format!(
                "max-threads must be in 2..={MAX_THREAD_SLOTS}, got {}",
                self.max_threads
            ));
        }
        if !(1..=8).contains(&self.priority_bits) {
            return Err(format!(
                "priority-bits must be in 1..=8, got {}",
                self.priority_bits
            ));
        }
        let levels = 1u16 << self.priority_bits;
        if self.kernel_priority == 0
            || u16::from(self.kernel_priority) >= levels
        {
            return Err(format!(
                "kernel-priority must be in 1..{levels}, got {}",
                self.kernel_priority
            ));
        }
        if self.int_required_stack % 8 != 0 {
            return Err(format!(
                "int-required-stack must be a multiple of 8, got {}",
                self.int_required_stack
            ));
        }
        Ok(())
    }

    /// Converts a priority level into the value the NVIC/BASEPRI registers
    /// hold, with the implemented bits left-aligned.
    fn mask(&self, level: u8) -> u32 {
        u32::from(level) << (8 - self.priority_bits)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=KERN_CONFIG");
    let path = match env::var_os("KERN_CONFIG") {
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(env::var("CARGO_MANIFEST_DIR")?)
            .join("kernel.toml"),
    };
    println!("cargo:rerun-if-changed={}", path.display());

    let text = std::fs::read_to_string(&path)?;
    let config: KernelConfig = toml::from_str(&text)?;
    config.validate()?;

    generate_consts(&config)
}

fn generate_consts(
    config: &KernelConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("no OUT_DIR")?);
    let mut file = File::create(out.join("consts.rs"))?;
    let lowest = (1u16 << config.priority_bits) - 1;

    writeln!(file, "// See build.rs and kernel.toml for details")?;
    writeln!(file, "pub const MAX_THREADS: usize = {};", config.max_threads)?;
    writeln!(
        file,
        "pub const PRIORITY_BITS: u8 = {};",
        config.priority_bits
    )?;
    writeln!(
        file,
        "pub const KERNEL_PRIORITY: u8 = {};",
        config.kernel_priority
    )?;
    writeln!(
        file,
        "pub const BASEPRI_KERNEL: u32 = {:#x};",
        config.mask(config.kernel_priority)
    )?;
    writeln!(file, "pub const BASEPRI_USER: u32 = 0;")?;
    writeln!(
        file,
        "pub const SVCALL_PRIORITY: u8 = {:#x};",
        config.mask(config.kernel_priority - 1)
    )?;
    writeln!(
        file,
        "pub const PENDSV_PRIORITY: u8 = {:#x};",
        config.mask(lowest as u8)
    )?;
    writeln!(
        file,
        "pub const INT_REQUIRED_STACK: usize = {};",
        config.int_required_stack
    )?;
    writeln!(file, "pub const WFI_IDLE: bool = {};", config.wfi_idle)?;
    Ok(())
}
