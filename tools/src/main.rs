use std::fs::File;
use std::io::{BufWriter, Cursor};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use compat_source::entities;
use compat_source::vbsp::{self, LumpType, HEADER_LEN};
use compat_source::vtf;
use world_core::arena::Arena;
use world_core::config::{MountSpec, ViewerConfig};
use world_core::level::MapLinks;
use world_core::logging::{self, LogLevel};
use world_core::texture;
use world_core::world::World;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 10;
const EXIT_LOAD: i32 = 11;
const EXIT_BSP: i32 = 12;
const EXIT_VTF: i32 = 13;
const EXIT_IO: i32 = 14;

#[derive(Parser)]
#[command(name = "tools", version, about = "Source level tools CLI")]
struct Cli {
    /// error, warn, info or debug.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the linked world reachable from a start map.
    Link(LinkArgs),
    /// Print the header, lumps and links of a .bsp file.
    Bsp {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Print a .vtf header and optionally write one decoded mip as PNG.
    Vtf(VtfArgs),
}

#[derive(Parser)]
struct LinkArgs {
    #[arg(long, value_name = "PATH", conflicts_with_all = ["dir", "map"])]
    config: Option<PathBuf>,

    /// Game content directory holding maps/ and materials/.
    #[arg(long, value_name = "DIR")]
    dir: Option<PathBuf>,

    #[arg(long)]
    map: Option<String>,

    /// Maximum number of levels to load.
    #[arg(long)]
    depth: Option<usize>,
}

#[derive(Parser)]
struct VtfArgs {
    #[arg(value_name = "FILE")]
    file: PathBuf,

    #[arg(long, default_value_t = 0)]
    mip: u32,

    #[arg(long, value_name = "PNG")]
    png: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    if let Some(level) = cli.log_level.as_deref() {
        match LogLevel::parse(level) {
            Some(level) => logging::set_max_level(level),
            None => {
                eprintln!("unknown log level {}", level);
                std::process::exit(EXIT_USAGE);
            }
        }
    }
    let exit_code = match cli.command {
        Commands::Link(args) => run_link(args),
        Commands::Bsp { file } => run_bsp(&file),
        Commands::Vtf(args) => run_vtf(args),
    };
    std::process::exit(exit_code);
}

fn run_link(args: LinkArgs) -> i32 {
    let mut config = match (args.config, args.dir, args.map) {
        (Some(path), _, _) => match ViewerConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{}", err);
                return EXIT_CONFIG;
            }
        },
        (None, Some(dir), Some(map)) => ViewerConfig {
            start_map: map,
            mounts: vec![MountSpec {
                kind: "dir".to_string(),
                mount_point: String::new(),
                path: dir,
            }],
            ..ViewerConfig::default()
        },
        _ => {
            eprintln!("link needs --config or both --dir and --map");
            return EXIT_USAGE;
        }
    };
    if let Some(depth) = args.depth {
        config.max_levels = depth;
    }
    let validation = config.validate();
    if !validation.is_ok() {
        for error in &validation.errors {
            eprintln!("config: {}", error);
        }
        return EXIT_CONFIG;
    }
    config.apply_log_level();

    let vfs = match config.build_vfs() {
        Ok(vfs) => vfs,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_CONFIG;
        }
    };
    let world = match World::load(&config, &vfs) {
        Ok(world) => world,
        Err(err) => {
            eprintln!("{}", err);
            return EXIT_LOAD;
        }
    };

    println!("levels: {}", world.levels.len());
    for level in world.levels.levels() {
        let [x, y, z] = level.translation();
        let parent = level
            .parent
            .and_then(|id| world.levels.level(id))
            .map_or("-", |parent| parent.name.as_str());
        println!(
            "  {:<24} parent {:<24} at ({:.1}, {:.1}, {:.1})  {} triangles, {} detailed / {} coarse draws",
            level.name,
            parent,
            x,
            y,
            z,
            level.model.triangle_count(),
            level.model.detailed.len(),
            level.model.coarse.len()
        );
    }
    let summary = world.cache_summary();
    println!(
        "cache: {} textures, {} materials",
        summary.textures,
        summary.materials.len()
    );
    for material in &summary.materials {
        println!("  {}", material);
    }
    println!(
        "persistent arena: {} / {} bytes",
        world.persistent.used(),
        world.persistent.capacity()
    );
    EXIT_SUCCESS
}

fn run_bsp(path: &Path) -> i32 {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("read {} failed: {}", path.display(), err);
            return EXIT_IO;
        }
    };
    let header_len = data.len().min(HEADER_LEN);
    let header = match vbsp::parse_header(&data[..header_len], data.len() as u64) {
        Ok(header) => header,
        Err(err) => {
            eprintln!("{}: {}", path.display(), err);
            return EXIT_BSP;
        }
    };

    println!("bsp: {}", path.display());
    println!("version {} revision {}", header.version, header.map_revision);
    println!("{:<22} {:>10} {:>10} {:>4} {}", "lump", "offset", "length", "ver", "lzma");
    for lump_type in LumpType::ALL {
        let lump = header.lump(lump_type);
        println!(
            "{:<22} {:>10} {:>10} {:>4} {}",
            lump_type.name(),
            lump.offset,
            lump.length,
            lump.version,
            if lump.is_compressed() { "yes" } else { "no" }
        );
    }

    let entities_lump = header.lump(LumpType::Entities);
    if entities_lump.is_compressed() {
        println!("entities lump is compressed; links not shown");
        return EXIT_SUCCESS;
    }
    let start = entities_lump.offset as usize;
    let raw = &data[start..start + entities_lump.length as usize];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let text = String::from_utf8_lossy(&raw[..end]);
    let parsed = match entities::parse_entities(&text) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("entities: {}", err);
            return EXIT_BSP;
        }
    };
    let links = MapLinks::from_entities(&parsed);
    println!("entities: {}", parsed.len());

    let mut landmarks: Vec<_> = links.landmarks.iter().collect();
    landmarks.sort_by(|a, b| a.0.cmp(b.0));
    println!("landmarks: {}", landmarks.len());
    for (name, [x, y, z]) in landmarks {
        println!("  {:<24} ({}, {}, {})", name, x, y, z);
    }
    println!("links: {}", links.maps.len());
    for link in &links.maps {
        println!("  -> {:<24} via {}", link.map, link.landmark);
    }
    EXIT_SUCCESS
}

fn run_vtf(args: VtfArgs) -> i32 {
    let data = match std::fs::read(&args.file) {
        Ok(data) => data,
        Err(err) => {
            eprintln!("read {} failed: {}", args.file.display(), err);
            return EXIT_IO;
        }
    };
    let header = match vtf::parse_header(&data) {
        Ok(header) => header,
        Err(err) => {
            eprintln!("{}: {}", args.file.display(), err);
            return EXIT_VTF;
        }
    };

    println!("vtf: {}", args.file.display());
    println!(
        "version 7.{}  {}x{}  format {}  mips {}  frames {}  flags {:#x}",
        header.version[1],
        header.width,
        header.height,
        header.hires_format,
        header.mipmap_count,
        header.frames,
        header.flags
    );
    println!(
        "lowres {} {}x{}  data offset {}",
        header.lores_format,
        header.lores_width,
        header.lores_height,
        header.hires_offset()
    );

    let Some(out) = args.png else {
        return EXIT_SUCCESS;
    };
    let mut persistent = Arena::new("persistent", data.len() * 8 + 64);
    let mut scratch = Arena::new("scratch", data.len() * 8 + 4096);
    let texture = match texture::load_vtf(
        &mut Cursor::new(data),
        args.mip,
        &mut persistent,
        &mut scratch,
    ) {
        Ok(texture) => texture,
        Err(err) => {
            eprintln!("decode failed: {}", err);
            return EXIT_VTF;
        }
    };
    let rgb = expand_rgb565(persistent.bytes(texture.pixels));
    if let Err(err) = write_png(&out, texture.width, texture.height, &rgb) {
        eprintln!("write {} failed: {}", out.display(), err);
        return EXIT_IO;
    }
    println!(
        "wrote {}x{} to {}",
        texture.width,
        texture.height,
        out.display()
    );
    EXIT_SUCCESS
}

fn expand_rgb565(pixels: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(pixels.len() / 2 * 3);
    for pair in pixels.chunks_exact(2) {
        let value = u16::from_le_bytes([pair[0], pair[1]]);
        let r = ((value >> 11) & 0x1f) as u8;
        let g = ((value >> 5) & 0x3f) as u8;
        let b = (value & 0x1f) as u8;
        rgb.push((r << 3) | (r >> 2));
        rgb.push((g << 2) | (g >> 4));
        rgb.push((b << 3) | (b >> 2));
    }
    rgb
}

fn write_png(path: &Path, width: u32, height: u32, rgb: &[u8]) -> Result<(), String> {
    let file = File::create(path).map_err(|err| err.to_string())?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let mut writer = encoder.write_header().map_err(|err| err.to_string())?;
    writer
        .write_image_data(rgb)
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb565_expands_to_full_range() {
        let pixels = [0xffu8, 0xff, 0x00, 0xf8, 0x00, 0x00];
        assert_eq!(expand_rgb565(&pixels), vec![255, 255, 255, 255, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn cli_accepts_link_flags() {
        let cli = Cli::try_parse_from(["tools", "link", "--dir", "hl2", "--map", "c1a0", "--depth", "3"])
            .expect("parse");
        match cli.command {
            Commands::Link(args) => {
                assert_eq!(args.map.as_deref(), Some("c1a0"));
                assert_eq!(args.depth, Some(3));
            }
            _ => panic!("expected link"),
        }
        assert!(Cli::try_parse_from(["tools", "link", "--config", "a.toml", "--map", "x"]).is_err());
    }
}
