#![no_main]

use compat_source::{dxt, vtf};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(header) = vtf::parse_header(data) else {
        return;
    };
    let mip = header.mipmap_count - 1;
    let width = header.mip_width(mip);
    let height = header.mip_height(mip);
    if dxt::rgb565_len(width, height) > 1 << 24 {
        return;
    }
    let offset = header.mip_offset(mip) as usize;
    let Some(src) = data.get(offset..) else {
        return;
    };
    let mut out = vec![0u8; dxt::rgb565_len(width, height)];
    match header.hires_format {
        vtf::ImageFormat::Dxt1 | vtf::ImageFormat::Dxt1OneBitAlpha => {
            let _ = dxt::unpack_dxt1(src, width, height, &mut out);
        }
        vtf::ImageFormat::Dxt5 => {
            let _ = dxt::unpack_dxt5(src, width, height, &mut out);
        }
        _ => {}
    }
});
