//! Build script for hwpoint-core
//!
//! Checks the toolchain before compilation:
//! - Minimum Rust version (`mem::offset_of!` and `iter::repeat_n` need 1.82)
//! - Whether the ptrace backend is built for this target

fn main()
{
    println!("cargo:rerun-if-changed=build.rs");

    // Check minimum Rust version
    match rustc_version::version() {
        Ok(rustc_version) => {
            let min_rust_version = rustc_version::Version::new(1, 82, 0);
            if rustc_version < min_rust_version {
                panic!(
                    "hwpoint-core requires Rust {} or newer, found {}",
                    min_rust_version, rustc_version
                );
            }
        }
        // If we can't get version (e.g., in some build environments), just warn
        Err(_) => println!("cargo:warning=could not verify Rust version"),
    }

    let os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let native = os == "linux" && matches!(arch.as_str(), "aarch64" | "powerpc64");
    let backends = if native { "sim,linux" } else { "sim" };
    println!("cargo:rustc-env=HWPOINT_BACKENDS={backends}");
}
