// Build script: wire in the bare-metal linker script for RISC-V targets.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=linker.ld");

    let target = env::var("TARGET").unwrap_or_default();
    if target.starts_with("riscv64") {
        let dir = env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{}/linker.ld", dir);
    }
}
