use std::fmt;
use std::io::{Read, Seek, SeekFrom};

use crate::arena::{Arena, ArenaRange};
use crate::cache::{Material, MaterialId, TextureId};
use crate::context::LoadContext;
use crate::logging;
use crate::resolver::{normalize_name, ResourceKind, ResourceStream};
use crate::texture::load_vtf;

const MAX_INCLUDE_DEPTH: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmtError {
    UnterminatedString { line: usize },
    UnexpectedToken { line: usize, token: String },
    UnterminatedBlock,
    MissingValue { key: String },
    Empty,
}

impl fmt::Display for VmtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmtError::UnterminatedString { line } => {
                write!(f, "line {}: unterminated string", line)
            }
            VmtError::UnexpectedToken { line, token } => {
                write!(f, "line {}: unexpected {:?}", line, token)
            }
            VmtError::UnterminatedBlock => write!(f, "unterminated block"),
            VmtError::MissingValue { key } => write!(f, "key {:?} has no value", key),
            VmtError::Empty => write!(f, "material has no shader block"),
        }
    }
}

impl std::error::Error for VmtError {}

/// One KeyValues node.
#[derive(Debug, Clone, PartialEq)]
pub enum KvValue {
    Text(String),
    Block(Vec<(String, KvValue)>),
}

#[derive(Debug, PartialEq)]
enum KvToken {
    Open,
    Close,
    Text(String),
}

fn tokenize(text: &str) -> Result<Vec<(KvToken, usize)>, VmtError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    let mut line = 1;
    while let Some((start, ch)) = chars.next() {
        match ch {
            '\n' => line += 1,
            c if c.is_whitespace() || c == '\u{feff}' => {}
            '{' => tokens.push((KvToken::Open, line)),
            '}' => tokens.push((KvToken::Close, line)),
            '/' if matches!(chars.peek(), Some((_, '/'))) => {
                for (_, c) in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' => {
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '"' {
                        closed = true;
                        break;
                    }
                    if c == '\n' {
                        line += 1;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(VmtError::UnterminatedString { line });
                }
                tokens.push((KvToken::Text(value), line));
            }
            _ => {
                let mut end = start + ch.len_utf8();
                while let Some(&(at, c)) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '{' | '}' | '"') {
                        break;
                    }
                    end = at + c.len_utf8();
                    chars.next();
                }
                tokens.push((KvToken::Text(text[start..end].to_string()), line));
            }
        }
    }
    Ok(tokens)
}

fn is_condition(token: Option<&(KvToken, usize)>) -> bool {
    matches!(token, Some((KvToken::Text(text), _)) if text.starts_with('[') && text.ends_with(']'))
}

fn parse_entries<I>(tokens: &mut std::iter::Peekable<I>, nested: bool) -> Result<Vec<(String, KvValue)>, VmtError>
where
    I: Iterator<Item = (KvToken, usize)>,
{
    let mut entries = Vec::new();
    loop {
        let key = match tokens.next() {
            Some((KvToken::Text(key), _)) => key,
            Some((KvToken::Close, line)) => {
                if nested {
                    return Ok(entries);
                }
                return Err(VmtError::UnexpectedToken {
                    line,
                    token: "}".to_string(),
                });
            }
            Some((KvToken::Open, line)) => {
                return Err(VmtError::UnexpectedToken {
                    line,
                    token: "{".to_string(),
                })
            }
            None if nested => return Err(VmtError::UnterminatedBlock),
            None => return Ok(entries),
        };
        let value = match tokens.next() {
            Some((KvToken::Text(value), _)) => KvValue::Text(value),
            Some((KvToken::Open, _)) => KvValue::Block(parse_entries(tokens, true)?),
            _ => return Err(VmtError::MissingValue { key }),
        };
        if is_condition(tokens.peek()) {
            tokens.next();
        }
        entries.push((key, value));
    }
}

/// Parses KeyValues text into its top-level entries.
pub fn parse_keyvalues(text: &str) -> Result<Vec<(String, KvValue)>, VmtError> {
    let tokens = tokenize(text)?;
    parse_entries(&mut tokens.into_iter().peekable(), false)
}

/// The parts of a VMT that matter for rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmtInfo {
    pub shader: String,
    pub base_textures: [Option<String>; 2],
    pub include: Option<String>,
}

pub fn parse_vmt(text: &str) -> Result<VmtInfo, VmtError> {
    let entries = parse_keyvalues(text)?;
    let Some((shader, KvValue::Block(body))) = entries.into_iter().next() else {
        return Err(VmtError::Empty);
    };
    let mut info = VmtInfo {
        shader: shader.to_ascii_lowercase(),
        ..VmtInfo::default()
    };
    collect_textures(&body, &mut info.base_textures);
    for (key, value) in &body {
        match (key.to_ascii_lowercase().as_str(), value) {
            ("include", KvValue::Text(path)) => info.include = Some(path.clone()),
            ("replace" | "insert", KvValue::Block(patch)) => {
                collect_textures(patch, &mut info.base_textures)
            }
            _ => {}
        }
    }
    Ok(info)
}

fn collect_textures(entries: &[(String, KvValue)], out: &mut [Option<String>; 2]) {
    for (key, value) in entries {
        let KvValue::Text(value) = value else {
            continue;
        };
        if key.eq_ignore_ascii_case("$basetexture") {
            out[0] = Some(value.clone());
        } else if key.eq_ignore_ascii_case("$basetexture2") {
            out[1] = Some(value.clone());
        }
    }
}

/// For map-local cubemap patches (`maps/<map>/<name>_<x>_<y>_<z>`) returns
/// the material they were generated from.
pub fn cubemap_patch_base(name: &str) -> Option<&str> {
    let rest = name.strip_prefix("maps/")?;
    let (_, material) = rest.split_once('/')?;
    let mut parts = material.rsplitn(4, '_');
    for _ in 0..3 {
        parts.next()?.parse::<i32>().ok()?;
    }
    let base = parts.next()?;
    if base.is_empty() {
        None
    } else {
        Some(base)
    }
}

fn material_key(name: &str) -> String {
    let key = normalize_name(name);
    let key = key.strip_prefix("materials/").unwrap_or(&key);
    key.strip_suffix(".vmt").unwrap_or(key).to_string()
}

fn texture_key(name: &str) -> String {
    let key = normalize_name(name);
    let key = key.strip_prefix("materials/").unwrap_or(&key);
    key.strip_suffix(".vtf").unwrap_or(key).to_string()
}

/// Reads the whole VMT into scratch and parses it there. Scratch is back at
/// its entry mark on return.
fn read_vmt(ctx: &mut LoadContext<'_>, key: &str) -> Result<Option<VmtInfo>, String> {
    let Some(mut stream) = ctx.resolver.open(key, ResourceKind::Material) else {
        return Ok(None);
    };
    let mark = ctx.scratch.mark();
    let result = match read_into_scratch(stream.as_mut(), ctx.scratch) {
        Ok(range) => parse_vmt(&String::from_utf8_lossy(ctx.scratch.bytes(range)))
            .map_err(|err| format!("material {}: {}", key, err)),
        Err(err) => Err(format!("read material {}: {}", key, err)),
    };
    ctx.scratch.release_to(mark);
    result.map(Some)
}

fn read_into_scratch(
    stream: &mut dyn ResourceStream,
    scratch: &mut Arena,
) -> Result<ArenaRange, String> {
    let len = stream.seek(SeekFrom::End(0)).map_err(|err| err.to_string())?;
    stream
        .seek(SeekFrom::Start(0))
        .map_err(|err| err.to_string())?;
    let len = usize::try_from(len).map_err(|_| format!("{} bytes is too large", len))?;
    let range = scratch.allocate(len).map_err(|err| err.to_string())?;
    stream
        .read_exact(scratch.bytes_mut(range))
        .map_err(|err| err.to_string())?;
    Ok(range)
}

/// Base texture names of `key`, following patch includes. `None` when the
/// VMT does not exist.
fn material_textures(
    ctx: &mut LoadContext<'_>,
    key: &str,
    depth: u32,
) -> Result<Option<[Option<String>; 2]>, String> {
    let Some(info) = read_vmt(ctx, key)? else {
        return Ok(None);
    };
    let mut textures = [None, None];
    if let Some(include) = &info.include {
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(format!("material {}: include chain too deep", key));
        }
        let included = material_key(include);
        match material_textures(ctx, &included, depth + 1)? {
            Some(base) => textures = base,
            None => logging::warn(format!(
                "material {}: included material {} not found",
                key, included
            )),
        }
    }
    for (slot, own) in textures.iter_mut().zip(info.base_textures) {
        if own.is_some() {
            *slot = own;
        }
    }
    Ok(Some(textures))
}

fn find_textures(ctx: &mut LoadContext<'_>, key: &str) -> Result<[Option<String>; 2], String> {
    if let Some(textures) = material_textures(ctx, key, 0)? {
        return Ok(textures);
    }
    if let Some(base) = cubemap_patch_base(key) {
        logging::debug(format!("material {}: using unpatched {}", key, base));
        return find_textures(ctx, base);
    }
    // Without a VMT the material name doubles as its texture name.
    Ok([Some(key.to_string()), None])
}

/// Resolves a material by name, loading its VMT and base textures on first
/// use. Never fails: anything unresolvable maps to the placeholder.
pub fn resolve_material(ctx: &mut LoadContext<'_>, name: &str) -> MaterialId {
    let key = material_key(name);
    if key.is_empty() {
        return ctx.cache.placeholder_material();
    }
    if let Some(id) = ctx.cache.get_material(&key) {
        return id;
    }
    let base_textures = match find_textures(ctx, &key) {
        Ok([first, second]) => [
            first.map(|texture| texture_get(ctx, &texture)),
            second.map(|texture| texture_get(ctx, &texture)),
        ],
        Err(message) => {
            logging::warn(format!("{}; using placeholder", message));
            [Some(ctx.cache.placeholder_texture()), None]
        }
    };
    ctx.cache.put_material(
        &key,
        Material {
            name: key.clone(),
            base_textures,
        },
    )
}

/// Returns the cached texture for `name`, decoding it on a miss. Missing or
/// undecodable textures resolve to the placeholder, and the name is
/// remembered so the failure is only reported once.
pub fn texture_get(ctx: &mut LoadContext<'_>, name: &str) -> TextureId {
    let key = texture_key(name);
    if let Some(id) = ctx.cache.get_texture(&key) {
        return id;
    }
    let placeholder = ctx.cache.placeholder_texture();
    let Some(mut stream) = ctx.resolver.open(&key, ResourceKind::Texture) else {
        logging::warn(format!("texture {} not found; using placeholder", key));
        return ctx.cache.alias_texture(&key, placeholder);
    };
    match load_vtf(
        stream.as_mut(),
        ctx.settings.texture_mip_bias,
        ctx.persistent,
        ctx.scratch,
    ) {
        Ok(texture) => ctx.cache.put_texture(&key, texture),
        Err(err) => {
            logging::warn(format!("texture {}: {}; using placeholder", key, err));
            ctx.cache.alias_texture(&key, placeholder)
        }
    }
}
