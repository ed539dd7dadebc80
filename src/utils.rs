//! Byte-level helpers shared by the brick engine

use crate::error::{Result, VdsError};
use crate::types::Element;

/// Convert raw bytes to typed data
pub fn bytes_to_typed_data<T: Element>(bytes: &[u8]) -> Result<Vec<T>> {
    if bytes.len() % std::mem::size_of::<T>() != 0 {
        return Err(VdsError::InvalidFormat(
            "Byte length not aligned with data type size".to_string(),
        ));
    }

    Ok(bytemuck::pod_collect_to_vec(bytes))
}

const CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { (c >> 1) ^ 0xEDB8_8320 } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// CRC-32 (IEEE) of a decoded brick
pub fn calculate_checksum(data: &[u8]) -> u32 {
    !data.iter().fold(u32::MAX, |crc, &byte| {
        CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    calculate_checksum(data) == expected
}

/// Human-readable byte count, binary units
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

/// Relative path of a brick file
pub fn brick_path(channel: usize, lod_level: usize, index: usize) -> String {
    format!("bricks/ch{}/lod{}/{:08}.brick", channel, lod_level, index)
}
