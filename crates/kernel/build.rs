fn main() {
    let target_arch = std::env::var("CARGO_CFG_TARGET_ARCH").expect("failed to get target arch");
    println!("cargo:rustc-link-arg=-Tcrates/kernel/linker/{target_arch}.ld");
    println!("cargo:rerun-if-changed=crates/kernel/linker/{target_arch}.ld");
}
