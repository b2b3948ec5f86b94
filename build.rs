//! Build script for devmem.
//!
//! Reports the enabled features and a few hints for release builds.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DEBUG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LOG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");

    let debug_enabled = env::var("CARGO_FEATURE_DEBUG").is_ok();
    let parking_lot_enabled = env::var("CARGO_FEATURE_PARKING_LOT").is_ok();
    let log_enabled = env::var("CARGO_FEATURE_LOG").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();

    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let is_release = profile == "release";

    // =========================================================================
    // Feature-specific diagnostics
    // =========================================================================

    if debug_enabled {
        emit_info("Debug features enabled");
        emit_note("New staging memory is poisoned with 0xCD");
        if is_release {
            emit_warning("Debug features enabled in release build!");
            emit_note("Poisoning touches every byte of each staging allocation.");
        }
    }

    if parking_lot_enabled {
        emit_info("Using parking_lot for map locks");
    }

    if log_enabled {
        emit_info("Diagnostics and operation traces go to the log crate");
    } else if diagnostics_enabled {
        emit_info("Diagnostics printed to stderr in release builds");
    }

    // =========================================================================
    // Release build recommendations
    // =========================================================================

    if is_release && !parking_lot_enabled {
        emit_note("Tip: Consider enabling 'parking_lot' for cheaper map locks:");
        emit_note("  devmem = { version = \"0.3\", features = [\"parking_lot\"] }");
    }

    check_target_features();
}

// =============================================================================
// Diagnostic emission helpers
// =============================================================================

fn emit_info(msg: &str) {
    println!("cargo:warning=[devmem] {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[devmem]    {}", msg);
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[devmem] warning: {}", msg);
}

fn check_target_features() {
    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("wasm") {
        emit_warning("WebAssembly target detected");
        emit_note("HostDevice works on WASM but the map lock never contends there.");
    }
}
