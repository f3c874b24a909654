//! Build script for osm-nbd.
//!
//! Locates the system `libnbd` via `pkg-config` — unlike a vendored FFI
//! target, libnbd is expected to already be installed on the conversion
//! host alongside nbdkit and VDDK (see spec §Glossary: conversion host),
//! so there is nothing to download here.
//!
//! With the `regenerate` feature, bindings are produced from the
//! system `libnbd.h` via bindgen. Without it, the pre-generated bindings
//! committed in `src/bindings.rs` are used as-is.

// Build scripts legitimately use stderr for diagnostics and expect/panic
// for unrecoverable failures.
#![allow(clippy::expect_used, clippy::panic, clippy::print_stderr)]

fn main() {
    println!("cargo:rerun-if-env-changed=OSM_NBD_NO_PKG_CONFIG");

    if std::env::var("DOCS_RS").is_ok() {
        return;
    }

    let lib = pkg_config::Config::new()
        .atleast_version("1.4")
        .probe("libnbd");

    match lib {
        Ok(lib) => {
            for path in &lib.link_paths {
                println!("cargo:rustc-link-search=native={}", path.display());
            }
            #[cfg(feature = "regenerate")]
            regenerate(&lib);
        }
        Err(e) => {
            // Don't fail the build: the delta-sync path is only exercised
            // at runtime on a conversion host where libnbd is guaranteed
            // present; other binaries in the workspace don't touch it.
            println!("cargo:warning=osm-nbd: pkg-config could not find libnbd ({e}); linking against -lnbd directly");
            println!("cargo:rustc-link-lib=nbd");
        }
    }
}

#[cfg(feature = "regenerate")]
fn regenerate(lib: &pkg_config::Library) {
    let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR not set"));

    let mut builder = bindgen::Builder::default()
        .header_contents("wrapper.h", "#include <libnbd.h>")
        .allowlist_function("nbd_.*")
        .allowlist_type("nbd_.*")
        .blocklist_function("nbd_.*_callback")
        .size_t_is_usize(true);

    for path in &lib.include_paths {
        builder = builder.clang_arg(format!("-I{}", path.display()));
    }

    let bindings = builder.generate().expect("failed to generate libnbd bindings");

    bindings
        .write_to_file(out_dir.join("bindings.rs"))
        .expect("failed to write generated bindings");

    println!(
        "cargo:rustc-env=OSM_NBD_GENERATED_BINDINGS={}",
        out_dir.join("bindings.rs").display()
    );
}
