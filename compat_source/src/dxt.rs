use std::fmt;

use crate::bytes::read_u16_le;

// S3TC block decoding into packed little-endian RGB565.

pub const DXT1_BLOCK_BYTES: usize = 8;
pub const DXT5_BLOCK_BYTES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DxtError {
    SourceTooShort { needed: usize, actual: usize },
    OutputTooShort { needed: usize, actual: usize },
}

impl fmt::Display for DxtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DxtError::SourceTooShort { needed, actual } => {
                write!(f, "dxt source too short: need {} bytes, have {}", needed, actual)
            }
            DxtError::OutputTooShort { needed, actual } => {
                write!(f, "dxt output too short: need {} bytes, have {}", needed, actual)
            }
        }
    }
}

impl std::error::Error for DxtError {}

/// Bytes of RGB565 output for a `width` x `height` image.
pub fn rgb565_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 2
}

/// Decodes a DXT1 (or DXT1 one-bit-alpha) image. Transparent texels come out
/// black; there is no alpha channel in the output.
pub fn unpack_dxt1(src: &[u8], width: u32, height: u32, out: &mut [u8]) -> Result<(), DxtError> {
    unpack_blocks(src, width, height, out, DXT1_BLOCK_BYTES, |block| {
        decode_color_block(block, true)
    })
}

/// Decodes a DXT5 image. The alpha half of each block is skipped.
pub fn unpack_dxt5(src: &[u8], width: u32, height: u32, out: &mut [u8]) -> Result<(), DxtError> {
    unpack_blocks(src, width, height, out, DXT5_BLOCK_BYTES, |block| {
        decode_color_block(&block[8..16], false)
    })
}

/// Alpha values of the 16 texels of a DXT5 alpha block, row-major.
pub fn unpack_dxt5_alpha(block: &[u8; 8]) -> [u8; 16] {
    let a0 = u32::from(block[0]);
    let a1 = u32::from(block[1]);
    let mut levels = [0u8; 8];
    levels[0] = a0 as u8;
    levels[1] = a1 as u8;
    if a0 > a1 {
        for (i, level) in levels.iter_mut().enumerate().skip(2) {
            let i = i as u32;
            *level = (((8 - i) * a0 + (i - 1) * a1) / 7) as u8;
        }
    } else {
        for (i, level) in levels.iter_mut().enumerate().take(6).skip(2) {
            let i = i as u32;
            *level = (((6 - i) * a0 + (i - 1) * a1) / 5) as u8;
        }
        levels[6] = 0;
        levels[7] = 255;
    }

    let mut bits = 0u64;
    for (i, byte) in block[2..8].iter().enumerate() {
        bits |= u64::from(*byte) << (8 * i);
    }
    let mut alpha = [0u8; 16];
    for (texel, value) in alpha.iter_mut().enumerate() {
        let index = ((bits >> (3 * texel)) & 0x7) as usize;
        *value = levels[index];
    }
    alpha
}

fn unpack_blocks<F>(
    src: &[u8],
    width: u32,
    height: u32,
    out: &mut [u8],
    block_bytes: usize,
    decode: F,
) -> Result<(), DxtError>
where
    F: Fn(&[u8]) -> [u16; 16],
{
    let width = width as usize;
    let height = height as usize;
    let blocks_x = width.div_ceil(4).max(1);
    let blocks_y = height.div_ceil(4).max(1);
    let needed = blocks_x * blocks_y * block_bytes;
    if src.len() < needed {
        return Err(DxtError::SourceTooShort {
            needed,
            actual: src.len(),
        });
    }
    let out_needed = width * height * 2;
    if out.len() < out_needed {
        return Err(DxtError::OutputTooShort {
            needed: out_needed,
            actual: out.len(),
        });
    }

    for (index, block) in src[..needed].chunks_exact(block_bytes).enumerate() {
        let bx = (index % blocks_x) * 4;
        let by = (index / blocks_x) * 4;
        let texels = decode(block);
        for row in 0..4 {
            let y = by + row;
            if y >= height {
                break;
            }
            for col in 0..4 {
                let x = bx + col;
                if x >= width {
                    break;
                }
                let at = (y * width + x) * 2;
                out[at..at + 2].copy_from_slice(&texels[row * 4 + col].to_le_bytes());
            }
        }
    }
    Ok(())
}

fn decode_color_block(block: &[u8], allow_three_color: bool) -> [u16; 16] {
    let c0 = read_u16_le(&block[0..2]);
    let c1 = read_u16_le(&block[2..4]);
    let palette = if !allow_three_color || c0 > c1 {
        [c0, c1, blend565(c0, c1, 2, 1, 3), blend565(c0, c1, 1, 2, 3)]
    } else {
        [c0, c1, blend565(c0, c1, 1, 1, 2), 0]
    };
    let mut texels = [0u16; 16];
    for row in 0..4 {
        let bits = block[4 + row];
        for col in 0..4 {
            let index = (bits >> (col * 2)) & 0x3;
            texels[row * 4 + col] = palette[index as usize];
        }
    }
    texels
}

/// `(w0*a + w1*b) / div` per channel, computed in 5:6:5 space.
fn blend565(a: u16, b: u16, w0: u32, w1: u32, div: u32) -> u16 {
    let channel = |shift: u32, mask: u32| {
        let ca = (u32::from(a) >> shift) & mask;
        let cb = (u32::from(b) >> shift) & mask;
        ((w0 * ca + w1 * cb) / div) << shift
    };
    (channel(11, 0x1f) | channel(5, 0x3f) | channel(0, 0x1f)) as u16
}
