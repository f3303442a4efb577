fn main() {
    // The linker script only applies to the freestanding image; hosted
    // builds (tests) use the host toolchain untouched.
    if std::env::var("CARGO_CFG_TARGET_ARCH").as_deref() == Ok("x86") {
        let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
        println!("cargo:rustc-link-arg=-T{manifest_dir}/kernel.ld");
    }

    println!("cargo:rerun-if-changed=kernel.ld");
}
