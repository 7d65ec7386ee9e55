use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, SeekFrom};

use compat_source::entities::{self, Entity, EntityError, CLASS_CHANGELEVEL, CLASS_LANDMARK};
use compat_source::vbsp::{
    self, ColorRgbExp32, Edge, Face, LumpType, Model, Plane, Record, Records, TexData, TexInfo,
    VbspError, VbspHeader, HEADER_LEN, SURF_INVISIBLE, SURF_NOLIGHT,
};
use compat_source::vtf::ImageFormat;

use crate::arena::{Arena, ArenaError, ArenaRange};
use crate::cache::{MaterialId, Texture, TextureId};
use crate::context::LoadContext;
use crate::logging;
use crate::materials::resolve_material;
use crate::resolver::{normalize_name, ResourceStream};

/// position, normal, lightmap uv, base texture uv; all little-endian f32.
pub const VERTEX_STRIDE: usize = 40;
/// Indices are 16-bit, so draws address the vertex buffer in windows.
pub const MAX_WINDOW_VERTICES: u32 = 1 << 16;
pub const MAX_ATLAS_SIZE: u32 = 4096;
const WHITE_LUXEL: u16 = 0xffff;

#[derive(Debug)]
pub enum LoadError {
    FileOpen(String),
    FileFormat(String),
    Memory(ArenaError),
    TempMemory(ArenaError),
    Capabilities(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::FileOpen(message) => write!(f, "cannot open: {}", message),
            LoadError::FileFormat(message) => write!(f, "bad file: {}", message),
            LoadError::Memory(err) => write!(f, "out of persistent memory: {}", err),
            LoadError::TempMemory(err) => write!(f, "out of scratch memory: {}", err),
            LoadError::Capabilities(message) => write!(f, "unsupported: {}", message),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Memory(err) | LoadError::TempMemory(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for LoadError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            LoadError::FileFormat("unexpected end of file".to_string())
        } else {
            LoadError::FileOpen(err.to_string())
        }
    }
}

impl From<VbspError> for LoadError {
    fn from(err: VbspError) -> Self {
        LoadError::FileFormat(err.to_string())
    }
}

impl From<EntityError> for LoadError {
    fn from(err: EntityError) -> Self {
        LoadError::FileFormat(format!("entities: {}", err))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl Aabb {
    pub fn empty() -> Self {
        Self {
            min: [f32::MAX; 3],
            max: [f32::MIN; 3],
        }
    }

    pub fn is_valid(&self) -> bool {
        (0..3).all(|axis| self.min[axis] <= self.max[axis])
    }

    pub fn include(&mut self, point: [f32; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(point[axis]);
            self.max[axis] = self.max[axis].max(point[axis]);
        }
    }

    pub fn translated(&self, offset: [f32; 3]) -> Self {
        Self {
            min: add3(self.min, offset),
            max: add3(self.max, offset),
        }
    }
}

/// One draw call: `count` indices starting at `start`, each relative to
/// vertex `vbo_offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BspDraw {
    pub material: MaterialId,
    pub vbo_offset: u32,
    pub start: u32,
    pub count: u32,
}

/// Renderable geometry of one level. Buffers live in the persistent arena.
#[derive(Clone, Debug, PartialEq)]
pub struct BspModel {
    pub aabb: Aabb,
    pub vertices: ArenaRange,
    pub vertex_count: u32,
    pub indices: ArenaRange,
    pub index_count: u32,
    pub detailed: Vec<BspDraw>,
    pub coarse: Vec<BspDraw>,
    pub lightmap: TextureId,
}

impl BspModel {
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapLink {
    pub map: String,
    pub landmark: String,
}

/// Landmarks a level defines and the levels it leads to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapLinks {
    pub landmarks: HashMap<String, [f32; 3]>,
    /// Destination maps in entity order, each listed once.
    pub maps: Vec<MapLink>,
}

impl MapLinks {
    pub fn from_entities(entities: &[Entity]) -> Self {
        let mut links = MapLinks::default();
        for entity in entities {
            let Some(classname) = entity.classname() else {
                continue;
            };
            if classname.eq_ignore_ascii_case(CLASS_LANDMARK) {
                let (Some(name), Some(origin)) = (entity.get("targetname"), entity.origin())
                else {
                    logging::debug("info_landmark without targetname or origin");
                    continue;
                };
                links.landmarks.entry(name.to_string()).or_insert(origin);
            } else if classname.eq_ignore_ascii_case(CLASS_CHANGELEVEL) {
                let (Some(map), Some(landmark)) = (entity.get("map"), entity.get("landmark"))
                else {
                    logging::debug("trigger_changelevel without map or landmark");
                    continue;
                };
                let map = normalize_name(map);
                if map.is_empty() || links.maps.iter().any(|link| link.map == map) {
                    continue;
                }
                links.maps.push(MapLink {
                    map,
                    landmark: landmark.to_string(),
                });
            }
        }
        links
    }

    pub fn landmark(&self, name: &str) -> Option<[f32; 3]> {
        self.landmarks.get(name).copied()
    }
}

/// Parses a VBSP stream into renderable geometry plus its link table.
/// Materials and textures referenced by the level are resolved into the
/// cache and stay there. Scratch is released to its entry mark whether or
/// not the parse succeeds. If building the geometry fails, the persistent
/// arena is rolled back to where it stood after material resolution and no
/// lightmap is registered.
pub fn parse_level(
    stream: &mut dyn ResourceStream,
    ctx: &mut LoadContext<'_>,
) -> Result<(BspModel, MapLinks), LoadError> {
    let mark = ctx.scratch.mark();
    let result = parse_level_inner(stream, ctx);
    ctx.scratch.release_to(mark);
    result
}

fn parse_level_inner(
    stream: &mut dyn ResourceStream,
    ctx: &mut LoadContext<'_>,
) -> Result<(BspModel, MapLinks), LoadError> {
    let file_len = stream.seek(SeekFrom::End(0))?;
    stream.seek(SeekFrom::Start(0))?;
    let mut header_bytes = [0u8; HEADER_LEN];
    let read = read_up_to(stream, &mut header_bytes)?;
    let header = vbsp::parse_header(&header_bytes[..read], file_len)?;

    let entity_lump = read_lump(stream, &header, LumpType::Entities, ctx.scratch)?;
    let links = {
        let raw = ctx.scratch.bytes(entity_lump);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let text = String::from_utf8_lossy(&raw[..end]);
        MapLinks::from_entities(&entities::parse_entities(&text)?)
    };

    let names = read_material_names(stream, &header, ctx.scratch)?;
    let materials: Vec<MaterialId> = names
        .iter()
        .map(|name| resolve_material(ctx, name))
        .collect();

    let geometry_mark = ctx.persistent.mark();
    let geometry = match build_geometry(stream, &header, ctx, &materials) {
        Ok(geometry) => geometry,
        Err(err) => {
            ctx.persistent.release_to(geometry_mark);
            return Err(err);
        }
    };
    let lightmap = ctx.cache.add_texture(geometry.atlas);
    let model = BspModel {
        aabb: geometry.aabb,
        vertices: geometry.vertices,
        vertex_count: geometry.vertex_count,
        indices: geometry.indices,
        index_count: geometry.index_count,
        detailed: geometry.detailed,
        coarse: geometry.coarse,
        lightmap,
    };
    Ok((model, links))
}

/// Level geometry whose lightmap is not yet registered with the cache.
struct Geometry {
    aabb: Aabb,
    vertices: ArenaRange,
    vertex_count: u32,
    indices: ArenaRange,
    index_count: u32,
    detailed: Vec<BspDraw>,
    coarse: Vec<BspDraw>,
    atlas: Texture,
}

fn build_geometry(
    stream: &mut dyn ResourceStream,
    header: &VbspHeader,
    ctx: &mut LoadContext<'_>,
    materials: &[MaterialId],
) -> Result<Geometry, LoadError> {
    let lumps_mark = ctx.scratch.mark();
    let lumps = GeometryLumps::read(stream, header, ctx.scratch)?;
    let lump_block = ctx.scratch.range_since(lumps_mark);
    let face_capacity = lumps.faces.len() / Face::STRIDE;
    let work = ctx
        .scratch
        .allocate(FaceTables::bytes_for(face_capacity))
        .map_err(LoadError::TempMemory)?;
    let (lump_bytes, work_bytes) = ctx
        .scratch
        .split_pair(lump_block, work)
        .ok_or_else(|| format_error("geometry lumps overlap the face tables".to_string()))?;
    let views = lumps.views(lump_bytes, lump_block.offset())?;
    let mut tables = FaceTables::new(work_bytes, face_capacity);

    plan_faces(
        &views,
        materials,
        ctx.cache.placeholder_material(),
        &mut tables.plans,
        tables.sort,
    )?;
    let plan_count = tables.plans.len();
    let layout = pack_atlas(
        |index| FacePlan::from_row(tables.plans.get(index)).lightmap,
        plan_count,
        &mut tables.rects,
        &mut tables.slots,
        tables.sort,
    )?;
    let atlas = write_atlas(&layout, &tables.plans, &tables.slots, &views, ctx.persistent)?;
    let draws = plan_draws(&tables.plans, &mut tables.placements)?;
    let coarse = build_coarse(&draws.detailed, ctx.settings.coarse_min_indices);

    let vertices = ctx
        .persistent
        .allocate(draws.total_vertices as usize * VERTEX_STRIDE)
        .map_err(LoadError::Memory)?;
    let indices = ctx
        .persistent
        .allocate(draws.total_indices as usize * 2)
        .map_err(LoadError::Memory)?;

    let mut aabb = Aabb::empty();
    {
        let mut vertex_out = VertexWriter::new(ctx.persistent.bytes_mut(vertices));
        for index in 0..plan_count {
            let plan = FacePlan::from_row(tables.plans.get(index));
            let face = planned_face(&views, plan.face)?;
            let slot = atlas_slot(&tables.slots, index);
            for k in 0..plan.corners as usize {
                let position = face.corner(&views, k)?;
                aabb.include(position);
                let tex_uv = [
                    project(position, face.texture_vecs[0]),
                    project(position, face.texture_vecs[1]),
                ];
                let lightmap_uv = match (face.lightmap, slot) {
                    (Some(lm), Some((x, y))) => {
                        let s = project(position, face.lightmap_vecs[0]) - lm.mins[0];
                        let t = project(position, face.lightmap_vecs[1]) - lm.mins[1];
                        [
                            (x as f32 + s + 0.5) / layout.width as f32,
                            (y as f32 + t + 0.5) / layout.height as f32,
                        ]
                    }
                    _ => layout.white_uv(),
                };
                vertex_out.push(position, face.normal, lightmap_uv, tex_uv);
            }
        }
    }
    {
        let out = ctx.persistent.bytes_mut(indices);
        let mut cursor = 0;
        for index in 0..plan_count {
            let corners = FacePlan::from_row(tables.plans.get(index)).corners;
            let [first_vertex, vbo_offset] = tables.placements.get(index);
            let base = first_vertex - vbo_offset;
            for i in 1..corners - 1 {
                for corner in [0, i, i + 1] {
                    let value = (base + corner) as u16;
                    out[cursor..cursor + 2].copy_from_slice(&value.to_le_bytes());
                    cursor += 2;
                }
            }
        }
    }

    if !aabb.is_valid() {
        if let Some(world) = views.models.get(0) {
            aabb = Aabb {
                min: world.mins,
                max: world.maxs,
            };
        }
    }

    logging::debug(format!(
        "level: {} faces, {} vertices, {} indices, {} detailed / {} coarse draws, lightmap {}x{}",
        plan_count,
        draws.total_vertices,
        draws.total_indices,
        draws.detailed.len(),
        coarse.len(),
        layout.width,
        layout.height
    ));

    Ok(Geometry {
        aabb,
        vertices,
        vertex_count: draws.total_vertices,
        indices,
        index_count: draws.total_indices,
        detailed: draws.detailed,
        coarse,
        atlas,
    })
}

fn read_up_to(stream: &mut dyn ResourceStream, buf: &mut [u8]) -> Result<usize, LoadError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(filled)
}

fn read_lump(
    stream: &mut dyn ResourceStream,
    header: &VbspHeader,
    lump: LumpType,
    scratch: &mut Arena,
) -> Result<ArenaRange, LoadError> {
    let entry = header.lump(lump);
    if entry.is_empty() {
        return Ok(ArenaRange::default());
    }
    if entry.is_compressed() {
        return Err(LoadError::Capabilities(format!(
            "lump {} is compressed",
            lump.name()
        )));
    }
    let range = scratch
        .allocate(entry.length as usize)
        .map_err(LoadError::TempMemory)?;
    stream.seek(SeekFrom::Start(u64::from(entry.offset)))?;
    stream.read_exact(scratch.bytes_mut(range))?;
    Ok(range)
}

fn read_material_names(
    stream: &mut dyn ResourceStream,
    header: &VbspHeader,
    scratch: &mut Arena,
) -> Result<Vec<String>, LoadError> {
    let texdata = read_lump(stream, header, LumpType::TexData, scratch)?;
    let table = read_lump(stream, header, LumpType::TexDataStringTable, scratch)?;
    let strings = read_lump(stream, header, LumpType::TexDataStringData, scratch)?;
    let texdata = Records::<TexData>::new(LumpType::TexData, scratch.bytes(texdata))?;
    let table = Records::<i32>::new(LumpType::TexDataStringTable, scratch.bytes(table))?;
    let strings = scratch.bytes(strings);
    let names = texdata
        .iter()
        .map(|entry| {
            usize::try_from(entry.name_string_table_id)
                .ok()
                .and_then(|index| table.get(index))
                .and_then(|offset| vbsp::texdata_string(strings, offset))
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    Ok(names)
}

struct GeometryLumps {
    planes: ArenaRange,
    vertexes: ArenaRange,
    texinfo: ArenaRange,
    faces: ArenaRange,
    lighting: ArenaRange,
    edges: ArenaRange,
    surfedges: ArenaRange,
    models: ArenaRange,
}

struct GeometryViews<'a> {
    planes: Records<'a, Plane>,
    vertexes: Records<'a, [f32; 3]>,
    texinfo: Records<'a, TexInfo>,
    faces: Records<'a, Face>,
    lighting: &'a [u8],
    edges: Records<'a, Edge>,
    surfedges: Records<'a, i32>,
    models: Records<'a, Model>,
}

impl GeometryLumps {
    fn read(
        stream: &mut dyn ResourceStream,
        header: &VbspHeader,
        scratch: &mut Arena,
    ) -> Result<Self, LoadError> {
        Ok(Self {
            planes: read_lump(stream, header, LumpType::Planes, scratch)?,
            vertexes: read_lump(stream, header, LumpType::Vertexes, scratch)?,
            texinfo: read_lump(stream, header, LumpType::TexInfo, scratch)?,
            faces: read_lump(stream, header, LumpType::Faces, scratch)?,
            lighting: read_lump(stream, header, LumpType::Lighting, scratch)?,
            edges: read_lump(stream, header, LumpType::Edges, scratch)?,
            surfedges: read_lump(stream, header, LumpType::SurfEdges, scratch)?,
            models: read_lump(stream, header, LumpType::Models, scratch)?,
        })
    }

    /// Typed views over `block`, the scratch bytes starting at offset `base`
    /// that hold every lump read by [`GeometryLumps::read`].
    fn views<'a>(&self, block: &'a [u8], base: usize) -> Result<GeometryViews<'a>, LoadError> {
        let bytes = move |range: ArenaRange| -> &'a [u8] {
            if range.is_empty() {
                return &[];
            }
            let start = range.offset() - base;
            &block[start..start + range.len()]
        };
        Ok(GeometryViews {
            planes: Records::new(LumpType::Planes, bytes(self.planes))?,
            vertexes: Records::new(LumpType::Vertexes, bytes(self.vertexes))?,
            texinfo: Records::new(LumpType::TexInfo, bytes(self.texinfo))?,
            faces: Records::new(LumpType::Faces, bytes(self.faces))?,
            lighting: bytes(self.lighting),
            edges: Records::new(LumpType::Edges, bytes(self.edges))?,
            surfedges: Records::new(LumpType::SurfEdges, bytes(self.surfedges))?,
            models: Records::new(LumpType::Models, bytes(self.models))?,
        })
    }
}

/// Marks an atlas slot that holds no rectangle.
const NO_SLOT: u32 = u32::MAX;

fn table_bytes(rows: usize, columns: usize) -> usize {
    rows * columns * 4
}

/// Rows of `N` little-endian u32 values laid over scratch memory.
struct RowTable<'a, const N: usize> {
    bytes: &'a mut [u8],
    len: usize,
}

impl<'a, const N: usize> RowTable<'a, N> {
    const STRIDE: usize = N * 4;

    fn new(bytes: &'a mut [u8]) -> Self {
        Self { bytes, len: 0 }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.bytes.len() / Self::STRIDE
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn push(&mut self, row: [u32; N]) -> Result<(), LoadError> {
        if self.len == self.capacity() {
            return Err(format_error(format!(
                "more than {} rows for a face table",
                self.capacity()
            )));
        }
        self.len += 1;
        self.set(self.len - 1, row);
        Ok(())
    }

    fn get(&self, index: usize) -> [u32; N] {
        let at = index * Self::STRIDE;
        decode_row(&self.bytes[at..at + Self::STRIDE])
    }

    fn set(&mut self, index: usize, row: [u32; N]) {
        let at = index * Self::STRIDE;
        for (value, out) in row
            .iter()
            .zip(self.bytes[at..at + Self::STRIDE].chunks_exact_mut(4))
        {
            out.copy_from_slice(&value.to_le_bytes());
        }
    }

    /// Stable bottom-up merge sort. `temp` must hold at least `len` rows.
    fn sort_by_key<K: Ord>(&mut self, temp: &mut [u8], key: impl Fn(&[u32; N]) -> K) {
        let used = self.len * Self::STRIDE;
        let mut sorted_in_temp = false;
        let mut width = 1;
        while width < self.len {
            if sorted_in_temp {
                merge_runs::<N, K>(&temp[..used], &mut self.bytes[..used], width, &key);
            } else {
                merge_runs::<N, K>(&self.bytes[..used], &mut temp[..used], width, &key);
            }
            sorted_in_temp = !sorted_in_temp;
            width *= 2;
        }
        if sorted_in_temp {
            self.bytes[..used].copy_from_slice(&temp[..used]);
        }
    }
}

fn decode_row<const N: usize>(bytes: &[u8]) -> [u32; N] {
    let mut row = [0u32; N];
    for (value, chunk) in row.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    row
}

/// One merge pass: neighbouring sorted runs of `width` rows in `src` are
/// merged into `dst`. Ties take the left run first.
fn merge_runs<const N: usize, K: Ord>(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    key: &impl Fn(&[u32; N]) -> K,
) {
    let stride = N * 4;
    let rows = src.len() / stride;
    let row_key = |index: usize| key(&decode_row::<N>(&src[index * stride..(index + 1) * stride]));
    let mut start = 0;
    while start < rows {
        let mid = (start + width).min(rows);
        let end = (start + 2 * width).min(rows);
        let (mut left, mut right) = (start, mid);
        for out in start..end {
            let take_left = right >= end || (left < mid && row_key(left) <= row_key(right));
            let from = if take_left {
                left += 1;
                left - 1
            } else {
                right += 1;
                right - 1
            };
            dst[out * stride..(out + 1) * stride]
                .copy_from_slice(&src[from * stride..(from + 1) * stride]);
        }
        start = end;
    }
}

/// Working tables for one level, carved from a single scratch allocation
/// sized by the face lump.
struct FaceTables<'a> {
    plans: RowTable<'a, 5>,
    /// Row 0 is the white luxel, row `i + 1` the atlas position of plan `i`.
    slots: RowTable<'a, 2>,
    /// (slot row, width, height) of every rectangle to pack.
    rects: RowTable<'a, 3>,
    /// (first vertex, window base) per plan.
    placements: RowTable<'a, 2>,
    sort: &'a mut [u8],
}

impl<'a> FaceTables<'a> {
    fn bytes_for(faces: usize) -> usize {
        let rows = faces + 1;
        table_bytes(rows, 5) * 2 + table_bytes(rows, 3) + table_bytes(rows, 2) * 2
    }

    /// `bytes` must be at least [`FaceTables::bytes_for`]`(faces)` long.
    fn new(bytes: &'a mut [u8], faces: usize) -> Self {
        let rows = faces + 1;
        let (plans, rest) = bytes.split_at_mut(table_bytes(rows, 5));
        let (slots, rest) = rest.split_at_mut(table_bytes(rows, 2));
        let (rects, rest) = rest.split_at_mut(table_bytes(rows, 3));
        let (placements, sort) = rest.split_at_mut(table_bytes(rows, 2));
        Self {
            plans: RowTable::new(plans),
            slots: RowTable::new(slots),
            rects: RowTable::new(rects),
            placements: RowTable::new(placements),
            sort,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct FaceLightmap {
    width: u32,
    height: u32,
    sample_offset: usize,
    mins: [f32; 2],
}

/// A drawable face, in the order its vertices are written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FacePlan {
    material: MaterialId,
    face: u32,
    corners: u32,
    lightmap: Option<(u32, u32)>,
}

impl FacePlan {
    fn to_row(self) -> [u32; 5] {
        let (width, height) = self.lightmap.unwrap_or((0, 0));
        [
            self.material.index() as u32,
            self.face,
            self.corners,
            width,
            height,
        ]
    }

    fn from_row(row: [u32; 5]) -> Self {
        Self {
            material: MaterialId::from_raw(row[0]),
            face: row[1],
            corners: row[2],
            lightmap: (row[3] > 0).then_some((row[3], row[4])),
        }
    }
}

/// What the vertex writer needs from a face, looked up from the lumps.
#[derive(Clone, Copy, Debug)]
struct FaceInfo {
    tex_data: i32,
    normal: [f32; 3],
    first_edge: usize,
    num_edges: usize,
    texture_vecs: [[f32; 4]; 2],
    lightmap_vecs: [[f32; 4]; 2],
    lightmap: Option<FaceLightmap>,
}

impl FaceInfo {
    fn corner(&self, views: &GeometryViews<'_>, k: usize) -> Result<[f32; 3], LoadError> {
        views
            .surfedges
            .get(self.first_edge + k)
            .and_then(|surfedge| vbsp::surfedge_vertex(&views.edges, surfedge))
            .and_then(|index| views.vertexes.get(usize::from(index)))
            .ok_or_else(|| format_error(format!("face edge {} out of range", self.first_edge + k)))
    }
}

fn format_error(message: String) -> LoadError {
    LoadError::FileFormat(message)
}

/// Looks up face `face_index`. `None` for faces that are never drawn:
/// displacements, invisible surfaces and faces with fewer than three edges.
fn face_info(views: &GeometryViews<'_>, face_index: usize) -> Result<Option<FaceInfo>, LoadError> {
    let Some(face) = views.faces.get(face_index) else {
        return Err(format_error(format!("face {} out of range", face_index)));
    };
    if face.num_edges < 3 || face.disp_info >= 0 || face.tex_info < 0 {
        return Ok(None);
    }
    let tex_info = views
        .texinfo
        .get(face.tex_info as usize)
        .ok_or_else(|| format_error(format!("face {} texinfo out of range", face_index)))?;
    if tex_info.flags & SURF_INVISIBLE != 0 {
        return Ok(None);
    }
    let plane = views
        .planes
        .get(usize::from(face.plane))
        .ok_or_else(|| format_error(format!("face {} plane out of range", face_index)))?;
    let normal = if face.side != 0 {
        [-plane.normal[0], -plane.normal[1], -plane.normal[2]]
    } else {
        plane.normal
    };
    let first_edge = usize::try_from(face.first_edge)
        .map_err(|_| format_error(format!("face {} first edge", face_index)))?;
    Ok(Some(FaceInfo {
        tex_data: tex_info.tex_data,
        normal,
        first_edge,
        num_edges: face.num_edges as usize,
        texture_vecs: tex_info.texture_vecs,
        lightmap_vecs: tex_info.lightmap_vecs,
        lightmap: face_lightmap(&face, &tex_info, views.lighting.len()),
    }))
}

fn planned_face(views: &GeometryViews<'_>, face: u32) -> Result<FaceInfo, LoadError> {
    face_info(views, face as usize)?
        .ok_or_else(|| format_error(format!("face {} is not drawable", face)))
}

/// Writes the drawable faces of the world model into `plans`, stably sorted
/// by material. Every corner is checked here so later passes over the same
/// faces cannot fail on bad edge data.
fn plan_faces(
    views: &GeometryViews<'_>,
    materials: &[MaterialId],
    placeholder: MaterialId,
    plans: &mut RowTable<'_, 5>,
    sort: &mut [u8],
) -> Result<(), LoadError> {
    let world = views
        .models
        .get(0)
        .ok_or_else(|| format_error("map has no world model".to_string()))?;
    let first = usize::try_from(world.first_face)
        .map_err(|_| format_error(format!("world model first face {}", world.first_face)))?;
    let count = usize::try_from(world.num_faces)
        .map_err(|_| format_error(format!("world model face count {}", world.num_faces)))?;
    let end = first
        .checked_add(count)
        .filter(|end| *end <= views.faces.len())
        .ok_or_else(|| format_error("world model faces out of range".to_string()))?;

    plans.clear();
    let mut skipped = 0usize;
    for face_index in first..end {
        let Some(info) = face_info(views, face_index)? else {
            skipped += 1;
            continue;
        };
        for k in 0..info.num_edges {
            info.corner(views, k)?;
        }
        let material = usize::try_from(info.tex_data)
            .ok()
            .and_then(|index| materials.get(index).copied())
            .unwrap_or(placeholder);
        let plan = FacePlan {
            material,
            face: face_index as u32,
            corners: info.num_edges as u32,
            lightmap: info.lightmap.map(|lm| (lm.width, lm.height)),
        };
        plans.push(plan.to_row())?;
    }
    if skipped > 0 {
        logging::debug(format!("level: skipped {} non-drawable faces", skipped));
    }
    plans.sort_by_key(sort, |row| row[0]);
    Ok(())
}

fn face_lightmap(face: &Face, tex_info: &TexInfo, lighting_len: usize) -> Option<FaceLightmap> {
    if tex_info.flags & SURF_NOLIGHT != 0 || face.styles[0] == 255 {
        return None;
    }
    let (width, height) = face.lightmap_extent()?;
    if width > MAX_ATLAS_SIZE || height > MAX_ATLAS_SIZE {
        return None;
    }
    let sample_offset = usize::try_from(face.light_offset).ok()?;
    let bytes = width as usize * height as usize * ColorRgbExp32::STRIDE;
    if sample_offset.checked_add(bytes)? > lighting_len {
        return None;
    }
    Some(FaceLightmap {
        width,
        height,
        sample_offset,
        mins: [
            face.lightmap_mins[0] as f32,
            face.lightmap_mins[1] as f32,
        ],
    })
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct AtlasLayout {
    width: u32,
    height: u32,
    white: (u32, u32),
}

impl AtlasLayout {
    fn white_uv(&self) -> [f32; 2] {
        [
            (self.white.0 as f32 + 0.5) / self.width as f32,
            (self.white.1 as f32 + 0.5) / self.height as f32,
        ]
    }
}

/// Atlas position of plan `index`, if it has a lightmap.
fn atlas_slot(slots: &RowTable<'_, 2>, index: usize) -> Option<(u32, u32)> {
    let [x, y] = slots.get(index + 1);
    (x != NO_SLOT).then_some((x, y))
}

/// Shelf-packs the lightmap rectangle of each of `count` faces plus one
/// white luxel, leaving positions in `slots`. The width doubles until the
/// atlas is no taller than it is wide or the width limit is reached.
fn pack_atlas(
    sizes: impl Fn(usize) -> Option<(u32, u32)>,
    count: usize,
    rects: &mut RowTable<'_, 3>,
    slots: &mut RowTable<'_, 2>,
    sort: &mut [u8],
) -> Result<AtlasLayout, LoadError> {
    rects.clear();
    rects.push([0, 1, 1])?;
    for index in 0..count {
        if let Some((w, h)) = sizes(index) {
            rects.push([index as u32 + 1, w, h])?;
        }
    }
    rects.sort_by_key(sort, |row| (Reverse(row[2]), Reverse(row[1])));

    let mut area = 0u64;
    let mut widest = 1u32;
    for index in 0..rects.len() {
        let [_, w, h] = rects.get(index);
        area += u64::from(w) * u64::from(h);
        widest = widest.max(w);
    }
    let mut width = widest
        .max((area as f64).sqrt().ceil() as u32)
        .next_power_of_two();
    if width > MAX_ATLAS_SIZE {
        return Err(LoadError::Capabilities(format!(
            "lightmap needs an atlas wider than {}",
            MAX_ATLAS_SIZE
        )));
    }

    loop {
        slots.clear();
        for _ in 0..=count {
            slots.push([NO_SLOT, NO_SLOT])?;
        }
        let (mut x, mut y, mut shelf) = (0u32, 0u32, 0u32);
        for index in 0..rects.len() {
            let [slot, w, h] = rects.get(index);
            if x + w > width {
                y += shelf;
                x = 0;
                shelf = 0;
            }
            slots.set(slot as usize, [x, y]);
            x += w;
            shelf = shelf.max(h);
        }
        let height = y + shelf;
        if height <= width || width >= MAX_ATLAS_SIZE {
            if height > MAX_ATLAS_SIZE {
                return Err(LoadError::Capabilities(format!(
                    "lightmap does not fit a {0}x{0} atlas",
                    MAX_ATLAS_SIZE
                )));
            }
            let [white_x, white_y] = slots.get(0);
            return Ok(AtlasLayout {
                width,
                height,
                white: (white_x, white_y),
            });
        }
        width *= 2;
    }
}

fn write_atlas(
    layout: &AtlasLayout,
    plans: &RowTable<'_, 5>,
    slots: &RowTable<'_, 2>,
    views: &GeometryViews<'_>,
    persistent: &mut Arena,
) -> Result<Texture, LoadError> {
    let pixels = persistent
        .allocate(layout.width as usize * layout.height as usize * 2)
        .map_err(LoadError::Memory)?;
    let out = persistent.bytes_mut(pixels);
    let stride = layout.width as usize;
    let mut put = |x: u32, y: u32, value: u16| {
        let at = (y as usize * stride + x as usize) * 2;
        out[at..at + 2].copy_from_slice(&value.to_le_bytes());
    };
    put(layout.white.0, layout.white.1, WHITE_LUXEL);
    for index in 0..plans.len() {
        let Some((x, y)) = atlas_slot(slots, index) else {
            continue;
        };
        let plan = FacePlan::from_row(plans.get(index));
        let Some(lm) = planned_face(views, plan.face)?.lightmap else {
            continue;
        };
        for t in 0..lm.height {
            for s in 0..lm.width {
                let at = lm.sample_offset
                    + (t as usize * lm.width as usize + s as usize) * ColorRgbExp32::STRIDE;
                let sample = ColorRgbExp32::parse(&views.lighting[at..at + ColorRgbExp32::STRIDE]);
                put(x + s, y + t, sample.to_rgb565());
            }
        }
    }
    Ok(Texture {
        width: layout.width,
        height: layout.height,
        format: ImageFormat::Rgb565,
        pixels,
    })
}

#[derive(Clone, Debug, PartialEq)]
struct DrawPlan {
    detailed: Vec<BspDraw>,
    total_vertices: u32,
    total_indices: u32,
}

/// Assigns vertex windows and index ranges to material-sorted plans and
/// records each plan's (first vertex, window base) in `placements`. A
/// detailed draw is a run of one material inside one window.
fn plan_draws(
    plans: &RowTable<'_, 5>,
    placements: &mut RowTable<'_, 2>,
) -> Result<DrawPlan, LoadError> {
    let too_big = || LoadError::Capabilities("level geometry exceeds 32-bit buffers".to_string());
    let mut plan = DrawPlan {
        detailed: Vec::new(),
        total_vertices: 0,
        total_indices: 0,
    };
    placements.clear();
    let mut window_base = 0u32;
    for index in 0..plans.len() {
        let FacePlan {
            material, corners, ..
        } = FacePlan::from_row(plans.get(index));
        if plan.total_vertices - window_base + corners > MAX_WINDOW_VERTICES {
            window_base = plan.total_vertices;
        }
        let index_count = (corners - 2) * 3;
        match plan.detailed.last_mut() {
            Some(draw) if draw.material == material && draw.vbo_offset == window_base => {
                draw.count += index_count;
            }
            _ => plan.detailed.push(BspDraw {
                material,
                vbo_offset: window_base,
                start: plan.total_indices,
                count: index_count,
            }),
        }
        placements.push([plan.total_vertices, window_base])?;
        plan.total_vertices = plan.total_vertices.checked_add(corners).ok_or_else(too_big)?;
        plan.total_indices = plan
            .total_indices
            .checked_add(index_count)
            .ok_or_else(too_big)?;
    }
    Ok(plan)
}

/// Merges neighbouring detailed draws of the same window into batches of at
/// least `min_indices` indices. Each batch takes the material that
/// contributes the most indices to it.
fn build_coarse(detailed: &[BspDraw], min_indices: u32) -> Vec<BspDraw> {
    let mut coarse: Vec<BspDraw> = Vec::new();
    let mut best = 0u32;
    for draw in detailed {
        if let Some(batch) = coarse.last_mut() {
            let mergeable = batch.vbo_offset == draw.vbo_offset
                && batch.start + batch.count == draw.start
                && batch.count < min_indices;
            if mergeable {
                batch.count += draw.count;
                if draw.count > best {
                    best = draw.count;
                    batch.material = draw.material;
                }
                continue;
            }
        }
        coarse.push(*draw);
        best = draw.count;
    }
    coarse
}

struct VertexWriter<'a> {
    out: &'a mut [u8],
    cursor: usize,
}

impl<'a> VertexWriter<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, cursor: 0 }
    }

    fn push(&mut self, position: [f32; 3], normal: [f32; 3], lightmap: [f32; 2], texture: [f32; 2]) {
        for value in position
            .into_iter()
            .chain(normal)
            .chain(lightmap)
            .chain(texture)
        {
            self.out[self.cursor..self.cursor + 4].copy_from_slice(&value.to_le_bytes());
            self.cursor += 4;
        }
    }
}

fn project(point: [f32; 3], axis: [f32; 4]) -> f32 {
    point[0] * axis[0] + point[1] * axis[1] + point[2] * axis[2] + axis[3]
}

pub(crate) fn add3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub(crate) fn sub3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Reads vertex `index` back out of a vertex buffer.
pub fn read_vertex(vertices: &[u8], index: usize) -> Option<[f32; 10]> {
    let bytes = vertices.get(index * VERTEX_STRIDE..(index + 1) * VERTEX_STRIDE)?;
    let mut out = [0f32; 10];
    for (value, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(out)
}


#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::test_support::{MapBuilder, Quad, SKY};
    use super::*;
    use crate::cache::ResourceCache;
    use crate::context::LoadSettings;
    use crate::resolver::{MemoryResolver, ResourceKind};
    use crate::texture::test_support::solid_dxt1;

    struct Fixture {
        resolver: MemoryResolver,
        cache: ResourceCache,
        persistent: Arena,
        scratch: Arena,
        settings: LoadSettings,
    }

    impl Fixture {
        fn new(persistent: usize, scratch: usize) -> Self {
            let mut persistent = Arena::new("persistent", persistent);
            let cache = ResourceCache::new(&mut persistent).expect("cache");
            Self {
                resolver: MemoryResolver::new(),
                cache,
                persistent,
                scratch: Arena::new("scratch", scratch),
                settings: LoadSettings::default(),
            }
        }

        fn parse(&mut self, data: Vec<u8>) -> Result<(BspModel, MapLinks), LoadError> {
            let mut ctx = LoadContext {
                resolver: &self.resolver,
                cache: &mut self.cache,
                persistent: &mut self.persistent,
                scratch: &mut self.scratch,
                settings: self.settings,
            };
            parse_level(&mut Cursor::new(data), &mut ctx)
        }
    }

    fn material(index: u32) -> MaterialId {
        MaterialId::from_raw(index)
    }

    /// Runs `plan_draws` over (material, corner count) plans and returns
    /// each plan's (first vertex, window base).
    fn draws_for(faces: &[(MaterialId, u32)]) -> (DrawPlan, Vec<[u32; 2]>) {
        let mut buf = vec![0u8; FaceTables::bytes_for(faces.len())];
        let mut tables = FaceTables::new(&mut buf, faces.len());
        for (face, &(material, corners)) in faces.iter().enumerate() {
            let plan = FacePlan {
                material,
                face: face as u32,
                corners,
                lightmap: None,
            };
            tables.plans.push(plan.to_row()).expect("row");
        }
        let plan = plan_draws(&tables.plans, &mut tables.placements).expect("plan");
        let placements = (0..tables.placements.len())
            .map(|index| tables.placements.get(index))
            .collect();
        (plan, placements)
    }

    fn pack(
        sizes: &[Option<(u32, u32)>],
    ) -> Result<(AtlasLayout, Vec<Option<(u32, u32)>>), LoadError> {
        let mut buf = vec![0u8; FaceTables::bytes_for(sizes.len())];
        let mut tables = FaceTables::new(&mut buf, sizes.len());
        let layout = pack_atlas(
            |index| sizes[index],
            sizes.len(),
            &mut tables.rects,
            &mut tables.slots,
            tables.sort,
        )?;
        let slots = (0..sizes.len())
            .map(|index| atlas_slot(&tables.slots, index))
            .collect();
        Ok((layout, slots))
    }

    fn sample_map() -> MapBuilder {
        MapBuilder::new()
            .landmark("hall", [64.0, 0.0, 0.0])
            .change_level("c1a1", "hall")
            .quad(Quad::new([0.0, 0.0, 0.0], 64.0, "brick/wall"))
            .quad(Quad::new([64.0, 0.0, 0.0], 32.0, "dev/floor"))
            .quad(Quad::new([0.0, 64.0, 8.0], 64.0, "brick/wall"))
    }

    #[test]
    fn parses_synthetic_level() {
        let mut fixture = Fixture::new(1 << 20, 1 << 20);
        fixture
            .resolver
            .insert(ResourceKind::Texture, "brick/wall", solid_dxt1(4, 4, 0xf800));
        let (model, links) = fixture.parse(sample_map().build()).expect("level parses");

        assert_eq!(model.vertex_count, 12);
        assert_eq!(model.index_count, 18);
        assert_eq!(model.triangle_count(), 6);
        assert_eq!(model.detailed.len(), 2);
        assert_eq!(model.aabb.min, [0.0, 0.0, 0.0]);
        assert_eq!(model.aabb.max, [96.0, 128.0, 8.0]);
        assert_eq!(links.landmark("hall"), Some([64.0, 0.0, 0.0]));
        assert_eq!(
            links.maps,
            vec![MapLink {
                map: "c1a1".to_string(),
                landmark: "hall".to_string()
            }]
        );

        let brick = fixture.cache.get_material("brick/wall").expect("brick");
        let wall_draw = model
            .detailed
            .iter()
            .find(|draw| draw.material == brick)
            .expect("brick draw");
        assert_eq!(wall_draw.count, 12);
        assert_eq!(model.coarse.len(), 1);
        assert_eq!(model.coarse[0].count, 18);
        assert_eq!(model.coarse[0].material, brick);
        assert_eq!(fixture.scratch.used(), 0);

        let vertices = fixture.persistent.bytes(model.vertices);
        let first = read_vertex(vertices, 0).expect("vertex 0");
        assert_eq!(&first[3..6], &[0.0, 0.0, 1.0]);
        for index in 0..model.vertex_count as usize {
            let vertex = read_vertex(vertices, index).expect("vertex");
            assert!((0.0..=1.0).contains(&vertex[6]) && (0.0..=1.0).contains(&vertex[7]));
        }

        let indices = fixture.persistent.bytes(model.indices);
        assert!(indices
            .chunks_exact(2)
            .all(|pair| (u16::from_le_bytes([pair[0], pair[1]]) as u32) < model.vertex_count));

        let lightmap = fixture.cache.texture(model.lightmap).expect("lightmap");
        assert_eq!(lightmap.format, ImageFormat::Rgb565);
        assert!(lightmap.width.is_power_of_two());
        assert!(lightmap.height <= lightmap.width);
    }

    #[test]
    fn skips_invisible_and_displacement_faces() {
        let mut sky = Quad::new([0.0, 0.0, 0.0], 64.0, "tools/skybox");
        sky.flags = SKY;
        let mut disp = Quad::new([0.0, 0.0, 0.0], 64.0, "nature/blend");
        disp.displacement = true;
        let mut unlit = Quad::new([128.0, 0.0, 0.0], 16.0, "dev/unlit");
        unlit.lit = false;
        let map = MapBuilder::new().quad(sky).quad(disp).quad(unlit).build();

        let mut fixture = Fixture::new(1 << 20, 1 << 20);
        let (model, _) = fixture.parse(map).expect("level parses");
        assert_eq!(model.vertex_count, 4);
        assert_eq!(model.detailed.len(), 1);
        assert_eq!(model.aabb.min, [128.0, 0.0, 0.0]);

        let lightmap = *fixture.cache.texture(model.lightmap).expect("lightmap");
        assert_eq!((lightmap.width, lightmap.height), (1, 1));
        assert_eq!(fixture.persistent.bytes(lightmap.pixels), &[0xff, 0xff]);
        let vertex = read_vertex(fixture.persistent.bytes(model.vertices), 0).expect("vertex");
        assert_eq!(&vertex[6..8], &[0.5, 0.5]);
    }

    #[test]
    fn empty_world_falls_back_to_model_bounds() {
        let mut fixture = Fixture::new(1 << 16, 1 << 16);
        let (model, links) = fixture.parse(MapBuilder::new().build()).expect("parses");
        assert_eq!(model.vertex_count, 0);
        assert!(model.detailed.is_empty() && model.coarse.is_empty());
        assert_eq!(model.aabb.min, [-1.0; 3]);
        assert!(links.maps.is_empty());
    }

    #[test]
    fn rejects_bad_files() {
        let mut fixture = Fixture::new(1 << 16, 1 << 16);
        let err = fixture.parse(b"IBSP".to_vec()).expect_err("wrong magic");
        assert!(matches!(err, LoadError::FileFormat(_)));

        let mut data = sample_map().build();
        data.truncate(data.len() - 8);
        let err = fixture.parse(data).expect_err("lump past end");
        assert!(matches!(err, LoadError::FileFormat(_)));

        let mut data = sample_map().build();
        let base = 8 + LumpType::Faces.index() * 16;
        let length = u32::from_le_bytes([data[base + 4], data[base + 5], data[base + 6], data[base + 7]]);
        data[base + 4..base + 8].copy_from_slice(&(length - 1).to_le_bytes());
        let err = fixture.parse(data).expect_err("partial face record");
        assert!(matches!(err, LoadError::FileFormat(_)));
        assert_eq!(fixture.scratch.used(), 0);
    }

    #[test]
    fn compressed_lumps_are_unsupported() {
        let mut data = sample_map().build();
        let base = 8 + LumpType::Faces.index() * 16;
        data[base + 12..base + 16].copy_from_slice(&100u32.to_le_bytes());
        let mut fixture = Fixture::new(1 << 20, 1 << 20);
        let err = fixture.parse(data).expect_err("lzma lump");
        assert!(matches!(err, LoadError::Capabilities(_)));
    }

    #[test]
    fn arena_exhaustion_is_reported() {
        let data = sample_map().build();
        let mut fixture = Fixture::new(1 << 20, 256);
        let err = fixture.parse(data.clone()).expect_err("scratch too small");
        assert!(matches!(err, LoadError::TempMemory(_)));
        assert_eq!(fixture.scratch.used(), 0);

        let mut fixture = Fixture::new(64, 1 << 20);
        let err = fixture.parse(data).expect_err("persistent too small");
        assert!(matches!(err, LoadError::Memory(_)));
        assert_eq!(fixture.scratch.used(), 0);
    }

    #[test]
    fn map_links_keep_first_occurrence() {
        let text = r#"
{ "classname" "info_landmark" "targetname" "a" "origin" "1 2 3" }
{ "classname" "info_landmark" "targetname" "a" "origin" "9 9 9" }
{ "classname" "trigger_changelevel" "map" "C1A1" "landmark" "a" }
{ "classname" "trigger_changelevel" "map" "c1a1" "landmark" "b" }
{ "classname" "trigger_changelevel" "map" "c1a2" }
{ "classname" "trigger_changelevel" "map" "c1a0" "landmark" "z" }
"#;
        let entities = entities::parse_entities(text).expect("entities");
        let links = MapLinks::from_entities(&entities);
        assert_eq!(links.landmark("a"), Some([1.0, 2.0, 3.0]));
        let maps: Vec<(&str, &str)> = links
            .maps
            .iter()
            .map(|link| (link.map.as_str(), link.landmark.as_str()))
            .collect();
        assert_eq!(maps, vec![("c1a1", "a"), ("c1a0", "z")]);
    }

    #[test]
    fn draws_split_at_vertex_windows() {
        let faces = vec![
            (material(1), 40_000),
            (material(1), 30_000),
            (material(2), 4),
            (material(2), 4),
        ];
        let (plan, placements) = draws_for(&faces);
        assert_eq!(plan.total_vertices, 70_008);
        assert_eq!(
            plan.detailed,
            vec![
                BspDraw {
                    material: material(1),
                    vbo_offset: 0,
                    start: 0,
                    count: 39_998 * 3,
                },
                BspDraw {
                    material: material(1),
                    vbo_offset: 40_000,
                    start: 39_998 * 3,
                    count: 29_998 * 3,
                },
                BspDraw {
                    material: material(2),
                    vbo_offset: 40_000,
                    start: (39_998 + 29_998) * 3,
                    count: 12,
                },
            ]
        );
        assert_eq!(placements.len(), faces.len());
        for [first_vertex, vbo_offset] in placements {
            assert!(first_vertex - vbo_offset < MAX_WINDOW_VERTICES);
        }
    }

    #[test]
    fn coarse_covers_same_indices_as_detailed() {
        let mut faces = Vec::new();
        for index in 0..40u32 {
            for _ in 0..(index % 7 + 1) {
                faces.push((material(index), 3 + index % 5));
            }
        }
        for _ in 0..20 {
            faces.push((material(99), 30_000));
        }
        let (plan, _) = draws_for(&faces);
        for min_indices in [1, 16, 4096, u32::MAX] {
            let coarse = build_coarse(&plan.detailed, min_indices);
            assert!(coarse.len() <= plan.detailed.len());
            let covered = |draws: &[BspDraw]| {
                let mut ranges: Vec<(u32, u32, u32)> = draws
                    .iter()
                    .map(|draw| (draw.vbo_offset, draw.start, draw.start + draw.count))
                    .collect();
                ranges.sort();
                ranges
            };
            let detailed = covered(&plan.detailed);
            let merged = covered(&coarse);
            let total = |ranges: &[(u32, u32, u32)]| ranges.iter().map(|r| r.2 - r.1).sum::<u32>();
            assert_eq!(total(&detailed), total(&merged));
            for draw in &coarse {
                let inside: u32 = plan
                    .detailed
                    .iter()
                    .filter(|d| d.start >= draw.start && d.start + d.count <= draw.start + draw.count)
                    .inspect(|d| assert_eq!(d.vbo_offset, draw.vbo_offset))
                    .map(|d| d.count)
                    .sum();
                assert_eq!(inside, draw.count);
            }
        }
        assert_eq!(build_coarse(&plan.detailed, 1), plan.detailed);
    }

    #[test]
    fn coarse_material_is_largest_contributor() {
        let detailed = [
            BspDraw {
                material: material(1),
                vbo_offset: 0,
                start: 0,
                count: 6,
            },
            BspDraw {
                material: material(2),
                vbo_offset: 0,
                start: 6,
                count: 30,
            },
            BspDraw {
                material: material(3),
                vbo_offset: 0,
                start: 36,
                count: 9,
            },
        ];
        let coarse = build_coarse(&detailed, 100);
        assert_eq!(coarse.len(), 1);
        assert_eq!(coarse[0].material, material(2));
        assert_eq!(coarse[0].count, 45);
    }

    #[test]
    fn atlas_rectangles_do_not_overlap() {
        let sizes: Vec<Option<(u32, u32)>> = (0..50u32)
            .map(|i| if i % 5 == 0 { None } else { Some((1 + i % 17, 1 + i % 9)) })
            .collect();
        let (layout, slots) = pack(&sizes).expect("fits");
        assert!(layout.width.is_power_of_two());
        let mut rects = vec![(layout.white.0, layout.white.1, 1, 1)];
        for (size, slot) in sizes.iter().zip(&slots) {
            assert_eq!(size.is_some(), slot.is_some());
            if let (Some((w, h)), Some((x, y))) = (size, slot) {
                assert!(x + w <= layout.width && y + h <= layout.height);
                rects.push((*x, *y, *w, *h));
            }
        }
        for (i, a) in rects.iter().enumerate() {
            for b in &rects[i + 1..] {
                let apart = a.0 + a.2 <= b.0 || b.0 + b.2 <= a.0 || a.1 + a.3 <= b.1 || b.1 + b.3 <= a.1;
                assert!(apart, "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn atlas_too_large_is_unsupported() {
        let sizes = vec![Some((4096, 4096)), Some((1, 1))];
        assert!(matches!(
            pack(&sizes),
            Err(LoadError::Capabilities(_))
        ));
        let (layout, _) = pack(&[]).expect("white only");
        assert_eq!((layout.width, layout.height), (1, 1));
    }

    #[test]
    fn failed_geometry_rolls_back_persistent_memory() {
        let data = sample_map().build();
        let mut roomy = Fixture::new(1 << 20, 1 << 20);
        let (model, _) = roomy.parse(data.clone()).expect("level parses");
        let atlas = *roomy.cache.texture(model.lightmap).expect("atlas");
        // Room for the cache and the atlas, not for the vertex buffer.
        let capacity = atlas.pixels.offset() + atlas.pixels.len() + 8;
        assert!(capacity < model.vertices.offset() + model.vertices.len());

        let mut fixture = Fixture::new(capacity, 1 << 20);
        let used = fixture.persistent.used();
        let textures = fixture.cache.texture_count();
        let err = fixture.parse(data).expect_err("vertices do not fit");
        assert!(matches!(err, LoadError::Memory(_)));
        assert_eq!(fixture.persistent.used(), used);
        assert_eq!(fixture.cache.texture_count(), textures);
        assert_eq!(fixture.scratch.used(), 0);

        // The space is reusable by a level that fits.
        let (empty, _) = fixture.parse(MapBuilder::new().build()).expect("empty level");
        assert_eq!(fixture.cache.texture_count(), textures + 1);
        assert_eq!(empty.vertex_count, 0);
    }

    #[test]
    fn face_tables_live_in_scratch() {
        let data = sample_map().build();
        // Smallest scratch arena that parses the level.
        let (mut low, mut high) = (0usize, 1usize << 20);
        while low + 1 < high {
            let mid = (low + high) / 2;
            let mut fixture = Fixture::new(1 << 20, mid);
            if fixture.parse(data.clone()).is_ok() {
                high = mid;
            } else {
                low = mid;
            }
        }
        let faces = 3;
        let mut fixture = Fixture::new(1 << 20, high - 1);
        let err = fixture.parse(data).expect_err("one byte short");
        assert!(matches!(err, LoadError::TempMemory(_)));
        assert_eq!(fixture.scratch.used(), 0);
        assert!(high >= FaceTables::bytes_for(faces));
    }

    #[test]
    fn row_sort_is_stable() {
        let rows = [[3, 0], [1, 1], [3, 2], [2, 3], [1, 4], [3, 5], [0, 6]];
        let mut buf = vec![0u8; table_bytes(rows.len(), 2)];
        let mut temp = vec![0u8; table_bytes(rows.len(), 2)];
        let mut table = RowTable::<2>::new(&mut buf);
        for row in rows {
            table.push(row).expect("push");
        }
        assert!(table.push([9, 9]).is_err());
        table.sort_by_key(&mut temp, |row| row[0]);
        let sorted: Vec<[u32; 2]> = (0..table.len()).map(|index| table.get(index)).collect();
        assert_eq!(
            sorted,
            vec![[0, 6], [1, 1], [1, 4], [2, 3], [3, 0], [3, 2], [3, 5]]
        );
    }
}
