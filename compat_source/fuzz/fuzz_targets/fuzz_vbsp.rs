#![no_main]

use compat_source::vbsp::{self, Edge, Face, LumpType, Records, TexInfo};
use libfuzzer_sys::fuzz_target;

fn lump_bytes<'a>(data: &'a [u8], header: &vbsp::VbspHeader, lump: LumpType) -> &'a [u8] {
    let entry = header.lump(lump);
    let start = entry.offset as usize;
    &data[start..start + entry.length as usize]
}

fuzz_target!(|data: &[u8]| {
    let Ok(header) = vbsp::parse_header(data, data.len() as u64) else {
        return;
    };
    let faces = Records::<Face>::new(LumpType::Faces, lump_bytes(data, &header, LumpType::Faces));
    let edges = Records::<Edge>::new(LumpType::Edges, lump_bytes(data, &header, LumpType::Edges));
    let surfedges =
        Records::<i32>::new(LumpType::SurfEdges, lump_bytes(data, &header, LumpType::SurfEdges));
    let texinfo =
        Records::<TexInfo>::new(LumpType::TexInfo, lump_bytes(data, &header, LumpType::TexInfo));
    if let (Ok(faces), Ok(edges), Ok(surfedges), Ok(_texinfo)) = (faces, edges, surfedges, texinfo)
    {
        for face in faces.iter() {
            let _ = face.lightmap_extent();
            let first = face.first_edge.max(0) as usize;
            for i in 0..face.num_edges.max(0) as usize {
                if let Some(surfedge) = surfedges.get(first + i) {
                    let _ = vbsp::surfedge_vertex(&edges, surfedge);
                }
            }
        }
    }
});
