// Architecture support

pub mod riscv64;

pub use riscv64::*;
