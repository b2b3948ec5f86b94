//! Byte quantities for device capacity, staging granularity, and stats output.

const UNIT: usize = 1024;
const SUFFIXES: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

/// `n` KiB in bytes.
#[inline]
pub const fn kb(n: usize) -> usize {
    n * UNIT
}

/// `n` MiB in bytes.
#[inline]
pub const fn mb(n: usize) -> usize {
    kb(n) * UNIT
}

/// Render a byte count in the largest binary unit that keeps the value at least 1.
pub fn format_bytes(bytes: usize) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= UNIT as f64 && unit + 1 < SUFFIXES.len() {
        value /= UNIT as f64;
        unit += 1;
    }
    match unit {
        0 => format!("{bytes} B"),
        _ => format!("{value:.2} {}", SUFFIXES[unit]),
    }
}
