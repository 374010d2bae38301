fn main() {
    // The Limine-protocol linker script lives at the workspace root so the
    // boot image tooling can find it next to the kernel binary.
    let script_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/../build");
    println!("cargo:rustc-link-search=native={script_dir}");
    println!("cargo:rustc-link-arg=-Tlinker.ld");
    println!("cargo:rerun-if-changed={script_dir}/linker.ld");
}
