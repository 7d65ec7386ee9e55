use std::fmt;
use std::io::{self, Read, SeekFrom};

use compat_source::dxt::{self, DxtError};
use compat_source::vtf::{self, ImageFormat, VtfError};

use crate::arena::{Arena, ArenaError};
use crate::cache::Texture;
use crate::resolver::ResourceStream;

#[derive(Debug)]
pub enum TextureError {
    Io(io::Error),
    Signature,
    Header(VtfError),
    UnsupportedFormat(ImageFormat),
    Truncated,
    Decode(DxtError),
    TempMemory(ArenaError),
    Memory(ArenaError),
}

impl fmt::Display for TextureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureError::Io(err) => write!(f, "io error: {}", err),
            TextureError::Signature => write!(f, "not a vtf file"),
            TextureError::Header(err) => write!(f, "bad vtf header: {}", err),
            TextureError::UnsupportedFormat(format) => {
                write!(f, "unsupported pixel format {}", format)
            }
            TextureError::Truncated => write!(f, "texture data is truncated"),
            TextureError::Decode(err) => write!(f, "decode failed: {}", err),
            TextureError::TempMemory(err) => write!(f, "scratch memory: {}", err),
            TextureError::Memory(err) => write!(f, "persistent memory: {}", err),
        }
    }
}

impl std::error::Error for TextureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TextureError::Io(err) => Some(err),
            TextureError::Header(err) => Some(err),
            TextureError::Decode(err) => Some(err),
            TextureError::TempMemory(err) | TextureError::Memory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for TextureError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            TextureError::Truncated
        } else {
            TextureError::Io(err)
        }
    }
}

impl From<VtfError> for TextureError {
    fn from(err: VtfError) -> Self {
        match err {
            VtfError::InvalidSignature => TextureError::Signature,
            VtfError::Truncated => TextureError::Truncated,
            other => TextureError::Header(other),
        }
    }
}

pub fn is_supported(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Dxt1 | ImageFormat::Dxt1OneBitAlpha | ImageFormat::Dxt5
    )
}

/// Reads one mip of a VTF stream, decodes it to RGB565 and stores the pixels
/// in `persistent`. Every temporary buffer lives in `scratch`, which is back
/// at its entry mark when this returns.
pub fn load_vtf(
    stream: &mut dyn ResourceStream,
    mip_bias: u32,
    persistent: &mut Arena,
    scratch: &mut Arena,
) -> Result<Texture, TextureError> {
    let mark = scratch.mark();
    let result = decode_into(stream, mip_bias, persistent, scratch);
    scratch.release_to(mark);
    result
}

fn decode_into(
    stream: &mut dyn ResourceStream,
    mip_bias: u32,
    persistent: &mut Arena,
    scratch: &mut Arena,
) -> Result<Texture, TextureError> {
    let file_len = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(0))?;

    let prefix_len = (vtf::header_read_len(usize::MAX) as u64).min(file_len) as usize;
    let prefix = scratch
        .allocate(prefix_len)
        .map_err(TextureError::TempMemory)?;
    stream.read_exact(scratch.bytes_mut(prefix))?;
    let header = vtf::parse_header(scratch.bytes(prefix))?;

    if !is_supported(header.hires_format) {
        return Err(TextureError::UnsupportedFormat(header.hires_format));
    }

    let mip = mip_bias.min(header.mipmap_count - 1);
    let width = header.mip_width(mip);
    let height = header.mip_height(mip);
    let offset = header.mip_offset(mip);
    let size = header.mip_size(mip);
    if offset + size as u64 > file_len {
        return Err(TextureError::Truncated);
    }

    let compressed = scratch.allocate(size).map_err(TextureError::TempMemory)?;
    stream.seek(SeekFrom::Start(offset))?;
    stream.read_exact(scratch.bytes_mut(compressed))?;

    let decoded = scratch
        .allocate(dxt::rgb565_len(width, height))
        .map_err(TextureError::TempMemory)?;
    {
        let Some((src, out)) = scratch.split_pair(compressed, decoded) else {
            return Err(TextureError::Truncated);
        };
        let decode = match header.hires_format {
            ImageFormat::Dxt5 => dxt::unpack_dxt5,
            _ => dxt::unpack_dxt1,
        };
        decode(src, width, height, out).map_err(TextureError::Decode)?;
    }

    let pixels = persistent
        .push_bytes(scratch.bytes(decoded))
        .map_err(TextureError::Memory)?;
    Ok(Texture {
        width,
        height,
        format: header.hires_format,
        pixels,
    })
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::test_support::{header, solid_dxt1};
    use super::*;

    fn arenas() -> (Arena, Arena) {
        (Arena::new("persistent", 4096), Arena::new("scratch", 4096))
    }

    #[test]
    fn decodes_dxt1_into_persistent() {
        let (mut persistent, mut scratch) = arenas();
        let mut stream = Cursor::new(solid_dxt1(8, 4, 0xf800));
        let texture =
            load_vtf(&mut stream, 0, &mut persistent, &mut scratch).expect("texture loads");
        assert_eq!((texture.width, texture.height), (8, 4));
        assert_eq!(texture.format, ImageFormat::Dxt1);
        let pixels = persistent.bytes(texture.pixels);
        assert_eq!(pixels.len(), 8 * 4 * 2);
        assert!(pixels.chunks_exact(2).all(|p| p == [0x00, 0xf8]));
        assert_eq!(scratch.used(), 0);
    }

    #[test]
    fn mip_bias_selects_smaller_level() {
        let (mut persistent, mut scratch) = arenas();
        // 8x8 with two mips: the 4x4 mip (one red block) is stored first.
        let mut data = header(8, 8, 13, 2);
        data.extend_from_slice(&[0x00, 0xf8, 0, 0, 0, 0, 0, 0]);
        for _ in 0..4 {
            data.extend_from_slice(&[0x1f, 0x00, 0, 0, 0, 0, 0, 0]);
        }
        let texture = load_vtf(&mut Cursor::new(data.clone()), 1, &mut persistent, &mut scratch)
            .expect("mip 1");
        assert_eq!((texture.width, texture.height), (4, 4));
        assert_eq!(&persistent.bytes(texture.pixels)[0..2], &[0x00, 0xf8]);

        let texture = load_vtf(&mut Cursor::new(data), 9, &mut persistent, &mut scratch)
            .expect("clamped");
        assert_eq!(texture.width, 4);

        let mut data = header(8, 8, 13, 2);
        data.extend_from_slice(&[0u8; 8]);
        data.extend_from_slice(&[0x1f, 0x00, 0, 0, 0, 0, 0, 0].repeat(4));
        let texture = load_vtf(&mut Cursor::new(data), 0, &mut persistent, &mut scratch)
            .expect("mip 0");
        assert_eq!(&persistent.bytes(texture.pixels)[0..2], &[0x1f, 0x00]);
    }

    #[test]
    fn unsupported_format_is_reported() {
        let (mut persistent, mut scratch) = arenas();
        let mut data = header(4, 4, 24, 1);
        data.extend_from_slice(&[0u8; 128]);
        let err = load_vtf(&mut Cursor::new(data), 0, &mut persistent, &mut scratch)
            .expect_err("rgba16f is not decoded");
        assert!(matches!(
            err,
            TextureError::UnsupportedFormat(ImageFormat::Rgba16161616F)
        ));
        assert_eq!(scratch.used(), 0);
    }

    #[test]
    fn truncated_and_bad_signature() {
        let (mut persistent, mut scratch) = arenas();
        let mut data = solid_dxt1(8, 8, 0);
        data.truncate(data.len() - 1);
        let err = load_vtf(&mut Cursor::new(data), 0, &mut persistent, &mut scratch)
            .expect_err("truncated");
        assert!(matches!(err, TextureError::Truncated));

        let err = load_vtf(
            &mut Cursor::new(b"PNG\0 not a texture".to_vec()),
            0,
            &mut persistent,
            &mut scratch,
        )
        .expect_err("signature");
        assert!(matches!(err, TextureError::Signature));
        assert_eq!(persistent.used(), 0);
    }

    #[test]
    fn scratch_exhaustion_is_temp_memory() {
        let mut persistent = Arena::new("persistent", 1 << 16);
        let mut scratch = Arena::new("scratch", 512);
        let data = solid_dxt1(64, 64, 0);
        let err = load_vtf(&mut Cursor::new(data), 0, &mut persistent, &mut scratch)
            .expect_err("scratch too small");
        assert!(matches!(err, TextureError::TempMemory(_)));
        assert_eq!(scratch.used(), 0);
        assert_eq!(persistent.used(), 0);
    }
}
