use std::fmt;
use std::marker::PhantomData;

use crate::bytes::{
    read_f32_le, read_i16_le, read_i32_le, read_u16_le, read_u32_le, read_vec3, read_vec4,
};

// Source engine BSP (VBSP v19-21) header, lump directory and record layouts.

pub const MAGIC: &[u8; 4] = b"VBSP";
pub const LUMP_COUNT: usize = 64;
pub const HEADER_LEN: usize = 8 + LUMP_COUNT * 16 + 4;
pub const SUPPORTED_VERSIONS: [u32; 3] = [19, 20, 21];

const MAX_LUMP_ELEMENTS: usize = 4_000_000;

pub const SURF_SKY2D: i32 = 0x0002;
pub const SURF_SKY: i32 = 0x0004;
pub const SURF_TRIGGER: i32 = 0x0040;
pub const SURF_NODRAW: i32 = 0x0080;
pub const SURF_HINT: i32 = 0x0100;
pub const SURF_SKIP: i32 = 0x0200;
pub const SURF_NOLIGHT: i32 = 0x0400;

/// Surface flags whose faces never produce visible geometry.
pub const SURF_INVISIBLE: i32 =
    SURF_SKY2D | SURF_SKY | SURF_TRIGGER | SURF_NODRAW | SURF_HINT | SURF_SKIP;

#[derive(Debug)]
pub enum VbspError {
    InvalidHeader,
    Truncated,
    UnsupportedVersion(u32),
    LumpOutOfBounds {
        lump: LumpType,
    },
    InvalidLumpSize {
        lump: LumpType,
        size: u32,
        stride: u32,
    },
    LumpTooLarge {
        lump: LumpType,
        count: usize,
    },
}

impl fmt::Display for VbspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VbspError::InvalidHeader => write!(f, "invalid vbsp header"),
            VbspError::Truncated => write!(f, "vbsp data is truncated"),
            VbspError::UnsupportedVersion(version) => {
                write!(f, "unsupported vbsp version {}", version)
            }
            VbspError::LumpOutOfBounds { lump } => {
                write!(f, "vbsp lump out of bounds: {}", lump.name())
            }
            VbspError::InvalidLumpSize { lump, size, stride } => write!(
                f,
                "vbsp lump has invalid size: {} (size {}, stride {})",
                lump.name(),
                size,
                stride
            ),
            VbspError::LumpTooLarge { lump, count } => {
                write!(f, "vbsp lump is too large: {} (count {})", lump.name(), count)
            }
        }
    }
}

impl std::error::Error for VbspError {}

/// The lumps this crate knows how to interpret. Indices match the on-disk
/// directory slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LumpType {
    Entities = 0,
    Planes = 1,
    TexData = 2,
    Vertexes = 3,
    Visibility = 4,
    Nodes = 5,
    TexInfo = 6,
    Faces = 7,
    Lighting = 8,
    Leafs = 10,
    Edges = 12,
    SurfEdges = 13,
    Models = 14,
    DispInfo = 26,
    PakFile = 40,
    TexDataStringData = 43,
    TexDataStringTable = 44,
    LightingHdr = 53,
}

impl LumpType {
    pub const ALL: [LumpType; 18] = [
        LumpType::Entities,
        LumpType::Planes,
        LumpType::TexData,
        LumpType::Vertexes,
        LumpType::Visibility,
        LumpType::Nodes,
        LumpType::TexInfo,
        LumpType::Faces,
        LumpType::Lighting,
        LumpType::Leafs,
        LumpType::Edges,
        LumpType::SurfEdges,
        LumpType::Models,
        LumpType::DispInfo,
        LumpType::PakFile,
        LumpType::TexDataStringData,
        LumpType::TexDataStringTable,
        LumpType::LightingHdr,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            LumpType::Entities => "entities",
            LumpType::Planes => "planes",
            LumpType::TexData => "texdata",
            LumpType::Vertexes => "vertexes",
            LumpType::Visibility => "visibility",
            LumpType::Nodes => "nodes",
            LumpType::TexInfo => "texinfo",
            LumpType::Faces => "faces",
            LumpType::Lighting => "lighting",
            LumpType::Leafs => "leafs",
            LumpType::Edges => "edges",
            LumpType::SurfEdges => "surfedges",
            LumpType::Models => "models",
            LumpType::DispInfo => "dispinfo",
            LumpType::PakFile => "pakfile",
            LumpType::TexDataStringData => "texdata_string_data",
            LumpType::TexDataStringTable => "texdata_string_table",
            LumpType::LightingHdr => "lighting_hdr",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Lump {
    pub offset: u32,
    pub length: u32,
    pub version: u32,
    pub fourcc: [u8; 4],
}

impl Lump {
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// LZMA-compressed lumps carry their uncompressed size in the fourCC.
    pub fn is_compressed(&self) -> bool {
        self.fourcc != [0; 4]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VbspHeader {
    pub version: u32,
    pub lumps: [Lump; LUMP_COUNT],
    pub map_revision: u32,
}

impl VbspHeader {
    pub fn lump(&self, lump: LumpType) -> Lump {
        self.lumps[lump.index()]
    }
}

/// Parses the fixed 1036-byte header. `file_len` is the size of the whole
/// file; every lump must lie inside it.
pub fn parse_header(data: &[u8], file_len: u64) -> Result<VbspHeader, VbspError> {
    if data.len() < 8 {
        return Err(VbspError::Truncated);
    }
    if &data[0..4] != MAGIC {
        return Err(VbspError::InvalidHeader);
    }
    let version = read_u32_le(&data[4..8]);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(VbspError::UnsupportedVersion(version));
    }
    if data.len() < HEADER_LEN {
        return Err(VbspError::Truncated);
    }

    let mut lumps = [Lump::default(); LUMP_COUNT];
    for (i, lump) in lumps.iter_mut().enumerate() {
        let base = 8 + i * 16;
        let offset = read_u32_le(&data[base..base + 4]);
        let length = read_u32_le(&data[base + 4..base + 8]);
        let version = read_u32_le(&data[base + 8..base + 12]);
        let fourcc = [
            data[base + 12],
            data[base + 13],
            data[base + 14],
            data[base + 15],
        ];
        *lump = Lump {
            offset,
            length,
            version,
            fourcc,
        };
    }

    for lump_type in LumpType::ALL {
        let lump = lumps[lump_type.index()];
        let end = u64::from(lump.offset) + u64::from(lump.length);
        if end > file_len {
            return Err(VbspError::LumpOutOfBounds { lump: lump_type });
        }
    }

    let map_revision = read_u32_le(&data[HEADER_LEN - 4..HEADER_LEN]);
    Ok(VbspHeader {
        version,
        lumps,
        map_revision,
    })
}

/// A fixed-stride record inside a lump.
pub trait Record: Sized {
    const STRIDE: usize;
    fn parse(chunk: &[u8]) -> Self;
}

/// Typed, zero-copy view over a lump's bytes.
#[derive(Debug, Clone, Copy)]
pub struct Records<'a, T> {
    bytes: &'a [u8],
    _marker: PhantomData<T>,
}

impl<'a, T: Record> Records<'a, T> {
    pub fn new(lump: LumpType, bytes: &'a [u8]) -> Result<Self, VbspError> {
        if bytes.len() % T::STRIDE != 0 {
            return Err(VbspError::InvalidLumpSize {
                lump,
                size: bytes.len() as u32,
                stride: T::STRIDE as u32,
            });
        }
        let count = bytes.len() / T::STRIDE;
        if count > MAX_LUMP_ELEMENTS {
            return Err(VbspError::LumpTooLarge { lump, count });
        }
        Ok(Self {
            bytes,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / T::STRIDE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::STRIDE)?;
        let chunk = self.bytes.get(start..start.checked_add(T::STRIDE)?)?;
        Some(T::parse(chunk))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a
    where
        T: 'a,
    {
        self.bytes.chunks_exact(T::STRIDE).map(T::parse)
    }
}

impl Record for [f32; 3] {
    const STRIDE: usize = 12;

    fn parse(chunk: &[u8]) -> Self {
        read_vec3(chunk)
    }
}

impl Record for i32 {
    const STRIDE: usize = 4;

    fn parse(chunk: &[u8]) -> Self {
        read_i32_le(chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: [f32; 3],
    pub dist: f32,
    pub kind: i32,
}

impl Record for Plane {
    const STRIDE: usize = 20;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            normal: read_vec3(&chunk[0..12]),
            dist: read_f32_le(&chunk[12..16]),
            kind: read_i32_le(&chunk[16..20]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub v: [u16; 2],
}

impl Record for Edge {
    const STRIDE: usize = 4;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            v: [read_u16_le(&chunk[0..2]), read_u16_le(&chunk[2..4])],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Face {
    pub plane: u16,
    pub side: u8,
    pub on_node: u8,
    pub first_edge: i32,
    pub num_edges: i16,
    pub tex_info: i16,
    pub disp_info: i16,
    pub fog_volume: i16,
    pub styles: [u8; 4],
    pub light_offset: i32,
    pub area: f32,
    pub lightmap_mins: [i32; 2],
    pub lightmap_size: [i32; 2],
    pub original_face: i32,
    pub num_prims: u16,
    pub first_prim: u16,
    pub smoothing_groups: u32,
}

impl Face {
    /// Luxel dimensions of this face's lightmap, if it has one.
    pub fn lightmap_extent(&self) -> Option<(u32, u32)> {
        if self.light_offset < 0 || self.lightmap_size[0] < 0 || self.lightmap_size[1] < 0 {
            return None;
        }
        Some((
            self.lightmap_size[0] as u32 + 1,
            self.lightmap_size[1] as u32 + 1,
        ))
    }
}

impl Record for Face {
    const STRIDE: usize = 56;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            plane: read_u16_le(&chunk[0..2]),
            side: chunk[2],
            on_node: chunk[3],
            first_edge: read_i32_le(&chunk[4..8]),
            num_edges: read_i16_le(&chunk[8..10]),
            tex_info: read_i16_le(&chunk[10..12]),
            disp_info: read_i16_le(&chunk[12..14]),
            fog_volume: read_i16_le(&chunk[14..16]),
            styles: [chunk[16], chunk[17], chunk[18], chunk[19]],
            light_offset: read_i32_le(&chunk[20..24]),
            area: read_f32_le(&chunk[24..28]),
            lightmap_mins: [read_i32_le(&chunk[28..32]), read_i32_le(&chunk[32..36])],
            lightmap_size: [read_i32_le(&chunk[36..40]), read_i32_le(&chunk[40..44])],
            original_face: read_i32_le(&chunk[44..48]),
            num_prims: read_u16_le(&chunk[48..50]),
            first_prim: read_u16_le(&chunk[50..52]),
            smoothing_groups: read_u32_le(&chunk[52..56]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexInfo {
    pub texture_vecs: [[f32; 4]; 2],
    pub lightmap_vecs: [[f32; 4]; 2],
    pub flags: i32,
    pub tex_data: i32,
}

impl Record for TexInfo {
    const STRIDE: usize = 72;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            texture_vecs: [read_vec4(&chunk[0..16]), read_vec4(&chunk[16..32])],
            lightmap_vecs: [read_vec4(&chunk[32..48]), read_vec4(&chunk[48..64])],
            flags: read_i32_le(&chunk[64..68]),
            tex_data: read_i32_le(&chunk[68..72]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TexData {
    pub reflectivity: [f32; 3],
    pub name_string_table_id: i32,
    pub width: i32,
    pub height: i32,
    pub view_width: i32,
    pub view_height: i32,
}

impl Record for TexData {
    const STRIDE: usize = 32;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            reflectivity: read_vec3(&chunk[0..12]),
            name_string_table_id: read_i32_le(&chunk[12..16]),
            width: read_i32_le(&chunk[16..20]),
            height: read_i32_le(&chunk[20..24]),
            view_width: read_i32_le(&chunk[24..28]),
            view_height: read_i32_le(&chunk[28..32]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Model {
    pub mins: [f32; 3],
    pub maxs: [f32; 3],
    pub origin: [f32; 3],
    pub head_node: i32,
    pub first_face: i32,
    pub num_faces: i32,
}

impl Record for Model {
    const STRIDE: usize = 48;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            mins: read_vec3(&chunk[0..12]),
            maxs: read_vec3(&chunk[12..24]),
            origin: read_vec3(&chunk[24..36]),
            head_node: read_i32_le(&chunk[36..40]),
            first_face: read_i32_le(&chunk[40..44]),
            num_faces: read_i32_le(&chunk[44..48]),
        }
    }
}

/// One lightmap sample: 8-bit mantissas sharing a signed power-of-two exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorRgbExp32 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub exponent: i8,
}

impl ColorRgbExp32 {
    pub fn to_rgb8(self) -> [u8; 3] {
        let scale = 2f32.powi(i32::from(self.exponent));
        let channel = |value: u8| (f32::from(value) * scale).clamp(0.0, 255.0) as u8;
        [channel(self.r), channel(self.g), channel(self.b)]
    }

    pub fn to_rgb565(self) -> u16 {
        let [r, g, b] = self.to_rgb8();
        pack_rgb565(r, g, b)
    }
}

impl Record for ColorRgbExp32 {
    const STRIDE: usize = 4;

    fn parse(chunk: &[u8]) -> Self {
        Self {
            r: chunk[0],
            g: chunk[1],
            b: chunk[2],
            exponent: chunk[3] as i8,
        }
    }
}

pub fn pack_rgb565(r: u8, g: u8, b: u8) -> u16 {
    (u16::from(r >> 3) << 11) | (u16::from(g >> 2) << 5) | u16::from(b >> 3)
}

/// Looks up a NUL-terminated name in the texdata string data lump.
pub fn texdata_string(string_data: &[u8], offset: i32) -> Option<&str> {
    let start = usize::try_from(offset).ok()?;
    let tail = string_data.get(start..)?;
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    std::str::from_utf8(&tail[..end]).ok()
}

/// Resolves a surfedge into the index of the vertex it starts at.
pub fn surfedge_vertex(edges: &Records<'_, Edge>, surfedge: i32) -> Option<u16> {
    if surfedge >= 0 {
        edges.get(surfedge as usize).map(|edge| edge.v[0])
    } else {
        let index = surfedge.checked_neg()? as usize;
        edges.get(index).map(|edge| edge.v[1])
    }
}
