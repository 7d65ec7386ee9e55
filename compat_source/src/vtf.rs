use std::fmt;

use crate::bytes::{read_f32_le, read_i32_le, read_u16_le, read_u32_le, read_vec3};

// Valve Texture Format header and image-size arithmetic.

pub const SIGNATURE: &[u8; 4] = b"VTF\0";
/// Bytes needed to read every fixed header field up to and including the
/// 7.3 resource count.
pub const HEADER_PREFIX_LEN: usize = 80;

const RESOURCE_ENTRY_LEN: usize = 8;
const MAX_RESOURCES: usize = 32;
const RESOURCE_TAG_HIGHRES: [u8; 3] = [0x30, 0, 0];

#[derive(Debug)]
pub enum VtfError {
    InvalidSignature,
    Truncated,
    InvalidDimensions { width: u32, height: u32 },
    UnknownFormat(i32),
    TooManyResources(usize),
}

impl fmt::Display for VtfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VtfError::InvalidSignature => write!(f, "invalid vtf signature"),
            VtfError::Truncated => write!(f, "vtf data is truncated"),
            VtfError::InvalidDimensions { width, height } => {
                write!(f, "invalid vtf dimensions: {}x{}", width, height)
            }
            VtfError::UnknownFormat(value) => write!(f, "unknown vtf image format {}", value),
            VtfError::TooManyResources(count) => {
                write!(f, "vtf declares too many resources: {}", count)
            }
        }
    }
}

impl std::error::Error for VtfError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    None,
    Rgba8888,
    Abgr8888,
    Rgb888,
    Bgr888,
    Rgb565,
    I8,
    Ia88,
    P8,
    A8,
    Rgb888Bluescreen,
    Bgr888Bluescreen,
    Argb8888,
    Bgra8888,
    Dxt1,
    Dxt3,
    Dxt5,
    Bgrx8888,
    Bgr565,
    Bgrx5551,
    Bgra4444,
    Dxt1OneBitAlpha,
    Bgra5551,
    Uv88,
    Uvwq8888,
    Rgba16161616F,
    Rgba16161616,
    Uvlx8888,
}

impl ImageFormat {
    pub fn from_raw(value: i32) -> Result<Self, VtfError> {
        let format = match value {
            -1 => ImageFormat::None,
            0 => ImageFormat::Rgba8888,
            1 => ImageFormat::Abgr8888,
            2 => ImageFormat::Rgb888,
            3 => ImageFormat::Bgr888,
            4 => ImageFormat::Rgb565,
            5 => ImageFormat::I8,
            6 => ImageFormat::Ia88,
            7 => ImageFormat::P8,
            8 => ImageFormat::A8,
            9 => ImageFormat::Rgb888Bluescreen,
            10 => ImageFormat::Bgr888Bluescreen,
            11 => ImageFormat::Argb8888,
            12 => ImageFormat::Bgra8888,
            13 => ImageFormat::Dxt1,
            14 => ImageFormat::Dxt3,
            15 => ImageFormat::Dxt5,
            16 => ImageFormat::Bgrx8888,
            17 => ImageFormat::Bgr565,
            18 => ImageFormat::Bgrx5551,
            19 => ImageFormat::Bgra4444,
            20 => ImageFormat::Dxt1OneBitAlpha,
            21 => ImageFormat::Bgra5551,
            22 => ImageFormat::Uv88,
            23 => ImageFormat::Uvwq8888,
            24 => ImageFormat::Rgba16161616F,
            25 => ImageFormat::Rgba16161616,
            26 => ImageFormat::Uvlx8888,
            other => return Err(VtfError::UnknownFormat(other)),
        };
        Ok(format)
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::None => "None",
            ImageFormat::Rgba8888 => "RGBA8888",
            ImageFormat::Abgr8888 => "ABGR8888",
            ImageFormat::Rgb888 => "RGB888",
            ImageFormat::Bgr888 => "BGR888",
            ImageFormat::Rgb565 => "RGB565",
            ImageFormat::I8 => "I8",
            ImageFormat::Ia88 => "IA88",
            ImageFormat::P8 => "P8",
            ImageFormat::A8 => "A8",
            ImageFormat::Rgb888Bluescreen => "RGB888_BLUESCREEN",
            ImageFormat::Bgr888Bluescreen => "BGR888_BLUESCREEN",
            ImageFormat::Argb8888 => "ARGB8888",
            ImageFormat::Bgra8888 => "BGRA8888",
            ImageFormat::Dxt1 => "DXT1",
            ImageFormat::Dxt3 => "DXT3",
            ImageFormat::Dxt5 => "DXT5",
            ImageFormat::Bgrx8888 => "BGRX8888",
            ImageFormat::Bgr565 => "BGR565",
            ImageFormat::Bgrx5551 => "BGRX5551",
            ImageFormat::Bgra4444 => "BGRA4444",
            ImageFormat::Dxt1OneBitAlpha => "DXT1_ONEBITALPHA",
            ImageFormat::Bgra5551 => "BGRA5551",
            ImageFormat::Uv88 => "UV88",
            ImageFormat::Uvwq8888 => "UVWQ8888",
            ImageFormat::Rgba16161616F => "RGBA16161616F",
            ImageFormat::Rgba16161616 => "RGBA16161616",
            ImageFormat::Uvlx8888 => "UVLX8888",
        }
    }

    /// Bytes per 4x4 block for block-compressed formats.
    pub fn block_bytes(self) -> Option<usize> {
        match self {
            ImageFormat::Dxt1 | ImageFormat::Dxt1OneBitAlpha => Some(8),
            ImageFormat::Dxt3 | ImageFormat::Dxt5 => Some(16),
            _ => None,
        }
    }

    pub fn bits_per_pixel(self) -> usize {
        match self {
            ImageFormat::None => 0,
            ImageFormat::Rgba8888
            | ImageFormat::Abgr8888
            | ImageFormat::Argb8888
            | ImageFormat::Bgra8888
            | ImageFormat::Bgrx8888
            | ImageFormat::Uvwq8888
            | ImageFormat::Uvlx8888 => 32,
            ImageFormat::Rgb565
            | ImageFormat::Bgr565
            | ImageFormat::Bgrx5551
            | ImageFormat::Bgra5551
            | ImageFormat::Bgra4444
            | ImageFormat::Ia88
            | ImageFormat::Uv88 => 16,
            ImageFormat::Rgb888
            | ImageFormat::Bgr888
            | ImageFormat::Rgb888Bluescreen
            | ImageFormat::Bgr888Bluescreen => 24,
            ImageFormat::I8 | ImageFormat::P8 | ImageFormat::A8 => 8,
            ImageFormat::Dxt1 | ImageFormat::Dxt1OneBitAlpha => 4,
            ImageFormat::Dxt3 | ImageFormat::Dxt5 => 8,
            ImageFormat::Rgba16161616F | ImageFormat::Rgba16161616 => 64,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Size in bytes of one `width` x `height` image (one frame, one mip).
pub fn image_size(format: ImageFormat, width: u32, height: u32) -> usize {
    let width = width.max(1) as usize;
    let height = height.max(1) as usize;
    match format.block_bytes() {
        Some(block) => width.div_ceil(4) * height.div_ceil(4) * block,
        None => width * height * format.bits_per_pixel() / 8,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VtfHeader {
    pub version: [u32; 2],
    pub header_size: u32,
    pub width: u32,
    pub height: u32,
    pub flags: u32,
    pub frames: u32,
    pub first_frame: u32,
    pub reflectivity: [f32; 3],
    pub bumpmap_scale: f32,
    pub hires_format: ImageFormat,
    pub mipmap_count: u32,
    pub lores_format: ImageFormat,
    pub lores_width: u32,
    pub lores_height: u32,
    /// Explicit hi-res data offset from a 7.3+ resource dictionary.
    pub hires_resource_offset: Option<u32>,
}

impl VtfHeader {
    pub fn mip_width(&self, mip: u32) -> u32 {
        self.width.checked_shr(mip).unwrap_or(0).max(1)
    }

    pub fn mip_height(&self, mip: u32) -> u32 {
        self.height.checked_shr(mip).unwrap_or(0).max(1)
    }

    pub fn mip_size(&self, mip: u32) -> usize {
        image_size(self.hires_format, self.mip_width(mip), self.mip_height(mip))
    }

    /// Offset of the first hi-res byte: after the header and the low-res
    /// thumbnail, unless a resource entry says otherwise.
    pub fn hires_offset(&self) -> u64 {
        if let Some(offset) = self.hires_resource_offset {
            return u64::from(offset);
        }
        let lores = if self.lores_format == ImageFormat::None {
            0
        } else {
            image_size(self.lores_format, self.lores_width, self.lores_height)
        };
        u64::from(self.header_size) + lores as u64
    }

    /// Offset of frame 0 of `mip`. The chain is stored smallest mip first,
    /// each mip holding every frame.
    pub fn mip_offset(&self, mip: u32) -> u64 {
        let frames = u64::from(self.frames.max(1));
        let mut cursor = self.hires_offset();
        for smaller in (mip + 1..self.mipmap_count).rev() {
            cursor += self.mip_size(smaller) as u64 * frames;
        }
        cursor
    }

    /// Total bytes of the hi-res chain across all mips and frames.
    pub fn chain_size(&self) -> u64 {
        let frames = u64::from(self.frames.max(1));
        (0..self.mipmap_count)
            .map(|mip| self.mip_size(mip) as u64 * frames)
            .sum()
    }
}

/// Parses the fixed header from the first bytes of a file. `data` must hold
/// at least [`HEADER_PREFIX_LEN`] bytes, or the whole file if it is shorter.
pub fn parse_header(data: &[u8]) -> Result<VtfHeader, VtfError> {
    if data.len() < 4 {
        return Err(VtfError::Truncated);
    }
    if &data[0..4] != SIGNATURE {
        return Err(VtfError::InvalidSignature);
    }
    if data.len() < 64 {
        return Err(VtfError::Truncated);
    }

    let version = [read_u32_le(&data[4..8]), read_u32_le(&data[8..12])];
    let header_size = read_u32_le(&data[12..16]);
    let width = u32::from(read_u16_le(&data[16..18]));
    let height = u32::from(read_u16_le(&data[18..20]));
    if width == 0 || height == 0 {
        return Err(VtfError::InvalidDimensions { width, height });
    }
    let flags = read_u32_le(&data[20..24]);
    let frames = u32::from(read_u16_le(&data[24..26]));
    let first_frame = u32::from(read_u16_le(&data[26..28]));
    let reflectivity = read_vec3(&data[32..44]);
    let bumpmap_scale = read_f32_le(&data[48..52]);
    let hires_format = ImageFormat::from_raw(read_i32_le(&data[52..56]))?;
    let mipmap_count = u32::from(data[56]);
    let lores_format = ImageFormat::from_raw(read_i32_le(&data[57..61]))?;
    let lores_width = u32::from(data[61]);
    let lores_height = u32::from(data[62]);

    let mut hires_resource_offset = None;
    if version[0] == 7 && version[1] >= 3 {
        if data.len() < HEADER_PREFIX_LEN {
            return Err(VtfError::Truncated);
        }
        let count = read_u32_le(&data[68..72]) as usize;
        if count > MAX_RESOURCES {
            return Err(VtfError::TooManyResources(count));
        }
        for index in 0..count {
            let base = HEADER_PREFIX_LEN + index * RESOURCE_ENTRY_LEN;
            // Entries past what the caller handed us cannot be inspected;
            // the computed layout is used instead.
            let Some(entry) = data.get(base..base + RESOURCE_ENTRY_LEN) else {
                break;
            };
            if entry[0..3] == RESOURCE_TAG_HIGHRES {
                hires_resource_offset = Some(read_u32_le(&entry[4..8]));
            }
        }
    }

    Ok(VtfHeader {
        version,
        header_size,
        width,
        height,
        flags,
        frames,
        first_frame,
        reflectivity,
        bumpmap_scale,
        hires_format,
        mipmap_count: mipmap_count.max(1),
        lores_format,
        lores_width,
        lores_height,
        hires_resource_offset,
    })
}

/// Number of header bytes worth reading up front so that a 7.3+ resource
/// dictionary can be inspected by [`parse_header`].
pub fn header_read_len(resource_count: usize) -> usize {
    HEADER_PREFIX_LEN + resource_count.min(MAX_RESOURCES) * RESOURCE_ENTRY_LEN
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) struct HeaderSpec {
        pub version_minor: u32,
        pub width: u16,
        pub height: u16,
        pub frames: u16,
        pub hires_format: i32,
        pub mipmap_count: u8,
        pub lores_format: i32,
        pub lores_width: u8,
        pub lores_height: u8,
    }

    impl Default for HeaderSpec {
        fn default() -> Self {
            Self {
                version_minor: 2,
                width: 16,
                height: 16,
                frames: 1,
                hires_format: 13,
                mipmap_count: 5,
                lores_format: -1,
                lores_width: 0,
                lores_height: 0,
            }
        }
    }

    pub(crate) fn header_bytes(spec: &HeaderSpec) -> Vec<u8> {
        let mut data = vec![0u8; HEADER_PREFIX_LEN];
        data[0..4].copy_from_slice(SIGNATURE);
        data[4..8].copy_from_slice(&7u32.to_le_bytes());
        data[8..12].copy_from_slice(&spec.version_minor.to_le_bytes());
        data[12..16].copy_from_slice(&(HEADER_PREFIX_LEN as u32).to_le_bytes());
        data[16..18].copy_from_slice(&spec.width.to_le_bytes());
        data[18..20].copy_from_slice(&spec.height.to_le_bytes());
        data[24..26].copy_from_slice(&spec.frames.to_le_bytes());
        data[52..56].copy_from_slice(&spec.hires_format.to_le_bytes());
        data[56] = spec.mipmap_count;
        data[57..61].copy_from_slice(&spec.lores_format.to_le_bytes());
        data[61] = spec.lores_width;
        data[62] = spec.lores_height;
        data
    }
}
