//! PostgreSQL memory-size parsing
//!
//! postgresql.conf memory settings use binary multiples with the suffixes
//! `B`, `kB`, `MB`, `GB` and `TB` (1 kB = 1024 B). We validate `shared_buffers`
//! and `work_mem` with this before any value is pushed to the server.

use anyhow::{anyhow, Result};

/// Parse a PostgreSQL memory size into bytes.
///
/// Examples:
/// - "128MB" → 134,217,728 bytes
/// - "1GB" → 1,073,741,824 bytes
/// - "512kB" → 524,288 bytes
/// - "1.5GB" → 1,610,612,736 bytes
pub fn parse_pg_memory(input: &str) -> Result<u64> {
    let input = input.trim();

    let suffix_start = input
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| anyhow!("Memory size needs a unit (kB, MB, GB, TB): {}", input))?;

    let number_part = &input[..suffix_start];
    let suffix = input[suffix_start..].trim();

    if number_part.is_empty() {
        return Err(anyhow!("No number found in: {}", input));
    }

    let value: f64 = number_part
        .parse()
        .map_err(|_| anyhow!("Invalid number: {}", number_part))?;

    let multiplier = parse_unit(suffix)?;
    Ok((value * multiplier as f64).round() as u64)
}

/// Unit to byte multiplier. PostgreSQL is case sensitive here (`kB`, not `KB`),
/// but the upper-case spelling is common in scripts so we accept both.
fn parse_unit(suffix: &str) -> Result<u64> {
    match suffix {
        "B" => Ok(1),
        "kB" | "KB" => Ok(1 << 10),
        "MB" => Ok(1 << 20),
        "GB" => Ok(1 << 30),
        "TB" => Ok(1 << 40),
        _ => Err(anyhow!(
            "Unknown memory unit: {}. Supported: B, kB, MB, GB, TB",
            suffix
        )),
    }
}

/// Memory size expressed in whole MiB (for labels and sorting).
pub fn to_mib(input: &str) -> Result<u64> {
    Ok(parse_pg_memory(input)? >> 20)
}
