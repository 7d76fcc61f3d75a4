// BMD0 model containers: MDL0 sections, the geometry command interpreter,
// per-model render-command lists, and material resolution against TEX0
// dictionaries. Geometry is a command stream mimicking the fixed-function
// GPU FIFO: one 32-bit word carries four opcode bytes, and each opcode's
// operand words follow in dispatch order. Unrecognized opcodes are skipped,
// not fatal; the stream format grew over hardware revisions.

use std::collections::HashMap;
use std::fs::File as OsFile;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt};
use glam::{Mat4, Vec2, Vec3};
use memmap2::MmapOptions;

use crate::dict::{ResourceDict, read_dict};
use crate::error::NitroError;
use crate::nsbtx::{Btx0, Palette, Tex0, Texture};
use crate::render::{GpuHandle, RenderContext};
use crate::util::{cv5_to_8, fixed, sign_extend};

pub const MATRIX_STACK_SLOTS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimitiveType {
    Triangles,
    Quads,
    Tristrips,
    Quadstrips,
    #[default]
    None,
}

impl PrimitiveType {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x03 {
            0 => PrimitiveType::Triangles,
            1 => PrimitiveType::Quads,
            2 => PrimitiveType::Tristrips,
            _ => PrimitiveType::Quadstrips,
        }
    }
}

// Attribute opcodes overwrite fields of a running template, so every pushed
// vertex carries whatever was last set; a vertex whose matrix-id opcode never
// ran keeps slot 0.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
    pub texcoord: Vec2,
    pub matrix_id: u32,
}

impl Default for Vertex {
    fn default() -> Self {
        Vertex {
            position: Vec3::ZERO,
            normal: Vec3::ZERO,
            color: Vec3::ONE,
            texcoord: Vec2::ZERO,
            matrix_id: 0,
        }
    }
}

// A vertex run closed by an end-primitive opcode. Quads arrive already
// triangulated; gpu is set once the primitive is uploaded.
#[derive(Debug, Clone, Default)]
pub struct Primitive {
    pub kind: PrimitiveType,
    pub vertices: Vec<Vertex>,
    pub triangulated: bool,
    pub gpu: Option<GpuHandle>,
}

impl Primitive {
    fn new(kind: PrimitiveType) -> Self {
        Primitive {
            kind,
            ..Primitive::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub primitives: Vec<Primitive>,
}

impl Mesh {
    pub(crate) fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let record_start = cursor.position();
        cursor.read_u16::<LittleEndian>()?; // dummy
        cursor.read_u16::<LittleEndian>()?; // record size
        cursor.read_u32::<LittleEndian>()?;

        let commands_offset = cursor.read_u32::<LittleEndian>()? as u64 + record_start;
        let commands_len = cursor.read_u32::<LittleEndian>()? as u64;

        cursor.seek(SeekFrom::Start(commands_offset))?;
        let primitives = interpret_geometry(cursor, commands_len)
            .context("interpreting geometry command stream")?;
        Ok(Mesh { primitives })
    }

    // Exactly once per primitive, no matter how often this runs.
    pub fn upload(&mut self, ctx: &mut dyn RenderContext) {
        for primitive in &mut self.primitives {
            if primitive.gpu.is_none() {
                primitive.gpu = Some(ctx.upload_primitive(primitive.kind, &primitive.vertices));
            }
        }
    }
}

fn fx16(raw: u32) -> f32 {
    (raw as u16 as i16) as f32 / 4096.0
}

fn fx10(raw: u32, divisor: f32) -> f32 {
    sign_extend(raw & 0x03FF, 10) as f32 / divisor
}

fn interpret_geometry(cursor: &mut Cursor<&[u8]>, len: u64) -> Result<Vec<Primitive>> {
    let end = cursor.position() + len;
    let mut primitives = Vec::new();
    let mut current = Primitive::new(PrimitiveType::None);
    let mut vertex = Vertex::default();

    while cursor.position() < end {
        let mut opcodes = [0u8; 4];
        cursor.read_exact(&mut opcodes)?;

        for opcode in opcodes {
            match opcode {
                // begin primitive
                0x40 => {
                    let mode = cursor.read_u32::<LittleEndian>()?;
                    current = Primitive::new(PrimitiveType::from_bits(mode));
                }

                // end primitive
                0x41 => {
                    let mut closed =
                        std::mem::replace(&mut current, Primitive::new(PrimitiveType::None));
                    if closed.kind == PrimitiveType::Quads {
                        let mut triangulated = Vec::with_capacity(closed.vertices.len() / 4 * 6);
                        for quad in closed.vertices.chunks_exact(4) {
                            triangulated
                                .extend_from_slice(&[quad[0], quad[1], quad[2]]);
                            triangulated
                                .extend_from_slice(&[quad[0], quad[2], quad[3]]);
                        }
                        closed.vertices = triangulated;
                        closed.triangulated = true;
                    }
                    primitives.push(closed);
                }

                // position, two words of 16.12 fixed XYZ
                0x23 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    let b = cursor.read_u32::<LittleEndian>()?;
                    vertex.position = Vec3::new(fx16(a), fx16(a >> 16), fx16(b));
                    current.vertices.push(vertex);
                }

                // position, packed 10-bit XYZ over 64
                0x24 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.position =
                        Vec3::new(fx10(a, 64.0), fx10(a >> 10, 64.0), fx10(a >> 20, 64.0));
                    current.vertices.push(vertex);
                }

                // position, XY only
                0x25 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.position.x = fx16(a);
                    vertex.position.y = fx16(a >> 16);
                    current.vertices.push(vertex);
                }

                // position, XZ only
                0x26 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.position.x = fx16(a);
                    vertex.position.z = fx16(a >> 16);
                    current.vertices.push(vertex);
                }

                // position, YZ only
                0x27 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.position.y = fx16(a);
                    vertex.position.z = fx16(a >> 16);
                    current.vertices.push(vertex);
                }

                // position delta, packed 10-bit over 4096
                0x28 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.position += Vec3::new(
                        fx10(a, 4096.0),
                        fx10(a >> 10, 4096.0),
                        fx10(a >> 20, 4096.0),
                    );
                    current.vertices.push(vertex);
                }

                // normal, packed 10-bit over 1024
                0x21 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.normal =
                        Vec3::new(fx10(a, 1024.0), fx10(a >> 10, 1024.0), fx10(a >> 20, 1024.0));
                }

                // color, 5-bit channels packed B,G,R low to high
                0x20 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.color = Vec3::new(
                        cv5_to_8((a >> 10) as u8 & 0x1F) as f32 / 255.0,
                        cv5_to_8((a >> 5) as u8 & 0x1F) as f32 / 255.0,
                        cv5_to_8(a as u8 & 0x1F) as f32 / 255.0,
                    );
                }

                // texcoord, signed 16-bit over 16
                0x22 => {
                    let a = cursor.read_u32::<LittleEndian>()?;
                    vertex.texcoord = Vec2::new(
                        (a as u16 as i16) as f32 / 16.0,
                        ((a >> 16) as u16 as i16) as f32 / 16.0,
                    );
                }

                // restore matrix: the raw slot becomes the vertex's matrix id
                0x14 => {
                    vertex.matrix_id = cursor.read_u32::<LittleEndian>()?;
                }

                // scale, recognized only to skip its operands
                0x1b => {
                    cursor.seek(SeekFrom::Current(12))?;
                }

                // viewport-ish padding word
                0x30 => {
                    cursor.seek(SeekFrom::Current(4))?;
                }

                0x00 => {}

                other => {
                    log::debug!("skipping unknown geometry opcode {other:#04x}");
                }
            }
        }
    }
    Ok(primitives)
}

#[derive(Debug, Clone, Default)]
pub struct RenderCommand {
    pub opcode: u8,
    pub args: Vec<u8>,
}

impl RenderCommand {
    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let opcode = cursor.read_u8()?;
        let count = match opcode {
            0x02 => 2,
            0x03 => 1,                    // select matrix slot
            0x04 | 0x24 | 0x44 => 1,      // bind material
            0x05 => 1,                    // draw mesh
            0x06 => 1,
            0x26 | 0x46 => 4,
            0x66 => 5,
            0x07 | 0x47 => 1,
            0x08 => 1,
            0x09 => 0, // variable, handled below
            0x00 | 0x01 | 0x0b | 0x2b | 0x40 | 0x80 => 0,
            other => {
                log::debug!("unknown render-command opcode {other:#04x}, assuming no args");
                0
            }
        };
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            args.push(cursor.read_u8()?);
        }

        // skinning command: two fixed bytes, then a declared term list
        if opcode == 0x09 {
            args.push(cursor.read_u8()?);
            let terms = cursor.read_u8()?;
            args.push(terms);
            for _ in 0..terms.min(25) {
                args.push(cursor.read_u8()?);
            }
        }
        Ok(RenderCommand { opcode, args })
    }
}

// Links one dictionary name to a run of material indices stored in a side
// table at index_offset within the materials block.
#[derive(Debug, Clone, Copy, Default)]
struct MaterialPair {
    index_offset: u16,
    material_count: u8,
    #[allow(dead_code)]
    bound: u8,
}

#[derive(Debug, Clone, Default)]
pub struct Material {
    pub diffuse_ambient: u32,
    pub specular_emission: u32,
    pub polygon_attributes: u32,
    pub polygon_attributes_mask: u32,
    pub tex_image_params: u32,
    pub tex_image_params_mask: u32,
    pub texture_palette_base: u16,
    pub flags: u16,
    pub width: u16,
    pub height: u16,
    pub mag_w: f32,
    pub mag_h: f32,
    pub scale_u: f32,
    pub scale_v: f32,
    pub sin_r: f32,
    pub cos_r: f32,
    pub trans_u: f32,
    pub trans_v: f32,
    /// Column-major 3x2 texture-coordinate transform.
    pub tex_matrix: [f32; 6],
    /// Resolved against a texture dictionary after load.
    pub texture_name: String,
    pub palette_name: String,
    /// Set by the rendering collaborator, never interpreted here.
    pub texture: Option<GpuHandle>,
}

impl Material {
    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut material = Material::default();
        cursor.read_u16::<LittleEndian>()?; // item tag
        cursor.read_u16::<LittleEndian>()?; // record size

        material.diffuse_ambient = cursor.read_u32::<LittleEndian>()?;
        material.specular_emission = cursor.read_u32::<LittleEndian>()?;
        material.polygon_attributes = cursor.read_u32::<LittleEndian>()?;
        material.polygon_attributes_mask = cursor.read_u32::<LittleEndian>()?;
        material.tex_image_params = cursor.read_u32::<LittleEndian>()?;
        material.tex_image_params_mask = cursor.read_u32::<LittleEndian>()?;
        material.texture_palette_base = cursor.read_u16::<LittleEndian>()?;
        material.flags = cursor.read_u16::<LittleEndian>()?;
        material.width = cursor.read_u16::<LittleEndian>()?;
        material.height = cursor.read_u16::<LittleEndian>()?;
        material.mag_w = fixed(cursor.read_i32::<LittleEndian>()?);
        material.mag_h = fixed(cursor.read_i32::<LittleEndian>()?);

        // Flag bits mark fields as omitted, leaving the identity defaults.
        material.scale_u = 1.0;
        material.scale_v = 1.0;
        material.cos_r = 1.0;
        if material.flags & 0x0002 == 0 {
            material.scale_u = fixed(cursor.read_i32::<LittleEndian>()?);
            material.scale_v = fixed(cursor.read_i32::<LittleEndian>()?);
        }
        if material.flags & 0x0004 == 0 {
            material.sin_r = fixed(cursor.read_i32::<LittleEndian>()?);
            material.cos_r = fixed(cursor.read_i32::<LittleEndian>()?);
        }
        if material.flags & 0x0008 == 0 {
            material.trans_u = fixed(cursor.read_i32::<LittleEndian>()?);
            material.trans_v = fixed(cursor.read_i32::<LittleEndian>()?);
        }

        let u = 1.0 / material.width as f32;
        let v = 1.0 / material.height as f32;
        let (scale_u, scale_v) = (material.scale_u, material.scale_v);
        let (sin_r, cos_r) = (material.sin_r, material.cos_r);
        material.tex_matrix = [
            u * scale_u * cos_r,
            u * scale_v * -sin_r,
            v * scale_u * sin_r,
            v * scale_v * cos_r,
            scale_u * ((-0.5 * cos_r) - (0.5 * sin_r - 0.5) - material.trans_u),
            scale_v * ((-0.5 * cos_r) + (0.5 * sin_r - 0.5) + material.trans_v) + 1.0,
        ];
        Ok(material)
    }
}

#[derive(Debug, Clone)]
pub struct Model {
    pub meshes: ResourceDict<Mesh>,
    pub materials: ResourceDict<Material>,
    pub render_commands: Vec<RenderCommand>,
    pub up_scale: f32,
    pub down_scale: f32,
    /// Counted, but bone records carry nothing this pipeline consumes.
    pub bone_matrix_count: u8,
    pub bounds_min: [u16; 3],
    pub bounds_max: [u16; 3],
    /// Runtime transform slots; render works on a scratch copy.
    pub matrix_stack: [Mat4; MATRIX_STACK_SLOTS],
}

impl Default for Model {
    fn default() -> Self {
        Model {
            meshes: ResourceDict::default(),
            materials: ResourceDict::default(),
            render_commands: Vec::new(),
            up_scale: 1.0,
            down_scale: 1.0,
            bone_matrix_count: 0,
            bounds_min: [0; 3],
            bounds_max: [0; 3],
            matrix_stack: [Mat4::IDENTITY; MATRIX_STACK_SLOTS],
        }
    }
}

impl Model {
    // model_offset is the record's absolute start; every offset inside is
    // relative to it.
    pub(crate) fn parse(cursor: &mut Cursor<&[u8]>, model_offset: u64) -> Result<Self> {
        let mut model = Model::default();
        cursor.read_u32::<LittleEndian>()?; // record size
        let render_commands_offset = cursor.read_u32::<LittleEndian>()? as u64;
        let materials_offset = cursor.read_u32::<LittleEndian>()? as u64;
        let meshes_offset = cursor.read_u32::<LittleEndian>()? as u64;
        cursor.read_u32::<LittleEndian>()?; // inverse bind matrices

        cursor.seek(SeekFrom::Current(3))?;
        model.bone_matrix_count = cursor.read_u8()?;
        cursor.read_u8()?; // material count, implied by the dictionary
        cursor.read_u8()?; // mesh count, implied by the dictionary
        cursor.seek(SeekFrom::Current(2))?;

        model.up_scale = fixed(cursor.read_i32::<LittleEndian>()?);
        model.down_scale = fixed(cursor.read_i32::<LittleEndian>()?);

        cursor.read_u16::<LittleEndian>()?; // vertex count
        cursor.read_u16::<LittleEndian>()?; // polygon count
        cursor.read_u16::<LittleEndian>()?; // triangle count
        cursor.read_u16::<LittleEndian>()?; // quad count

        for axis in 0..3 {
            model.bounds_min[axis] = cursor.read_u16::<LittleEndian>()?;
        }
        for axis in 0..3 {
            model.bounds_max[axis] =
                model.bounds_min[axis].wrapping_add(cursor.read_u16::<LittleEndian>()?);
        }
        cursor.seek(SeekFrom::Current(8))?;

        let meshes_base = model_offset + meshes_offset;
        cursor.seek(SeekFrom::Start(meshes_base))?;
        model.meshes = read_dict(cursor, |cursor| {
            let offset = cursor.read_u32::<LittleEndian>()? as u64;
            let here = cursor.position();
            cursor.seek(SeekFrom::Start(meshes_base + offset))?;
            let mesh = Mesh::parse(cursor)?;
            cursor.seek(SeekFrom::Start(here))?;
            Ok(mesh)
        })?;

        let materials_base = model_offset + materials_offset;
        cursor.seek(SeekFrom::Start(materials_base))?;
        let texture_pairs_offset = cursor.read_u16::<LittleEndian>()? as u64;
        let palette_pairs_offset = cursor.read_u16::<LittleEndian>()? as u64;

        let read_pairs = |cursor: &mut Cursor<&[u8]>| {
            read_dict(cursor, |cursor| {
                Ok(MaterialPair {
                    index_offset: cursor.read_u16::<LittleEndian>()?,
                    material_count: cursor.read_u8()?,
                    bound: cursor.read_u8()?,
                })
            })
        };
        cursor.seek(SeekFrom::Start(materials_base + texture_pairs_offset))?;
        let texture_pairs = read_pairs(cursor)?;
        cursor.seek(SeekFrom::Start(materials_base + palette_pairs_offset))?;
        let palette_pairs = read_pairs(cursor)?;

        cursor.seek(SeekFrom::Start(materials_base + 4))?;
        model.materials = read_dict(cursor, |cursor| {
            let offset = cursor.read_u32::<LittleEndian>()? as u64;
            let here = cursor.position();
            cursor.seek(SeekFrom::Start(materials_base + offset))?;
            let material = Material::parse(cursor)?;
            cursor.seek(SeekFrom::Start(here))?;
            Ok(material)
        })?;

        // Each pair names a texture (or palette) and points at the indices of
        // the materials that use it.
        let data: &[u8] = cursor.get_ref();
        let mut apply = |pairs: &ResourceDict<MaterialPair>,
                         set: fn(&mut Material, &str)|
         -> Result<()> {
            for (name, pair) in pairs.iter() {
                for j in 0..pair.material_count as u64 {
                    let at = (materials_base + pair.index_offset as u64 + j) as usize;
                    let index = *data.get(at).context("material index table out of range")?;
                    if let Some((_, material)) = model.materials.by_index_mut(index as usize) {
                        set(material, name);
                    }
                }
            }
            Ok(())
        };
        apply(&texture_pairs, |m, name| m.texture_name = name.to_string())?;
        apply(&palette_pairs, |m, name| m.palette_name = name.to_string())?;

        cursor.seek(SeekFrom::Start(model_offset + render_commands_offset))?;
        while cursor.position() < model_offset + materials_offset {
            let command = RenderCommand::parse(cursor)?;
            let end = command.opcode == 0x01;
            model.render_commands.push(command);
            if end {
                break;
            }
        }

        Ok(model)
    }

    pub fn upload(&mut self, ctx: &mut dyn RenderContext) {
        for (_, mesh) in self.meshes.iter_mut() {
            mesh.upload(ctx);
        }
    }

    // Walks the command list against a scratch copy of the matrix stack.
    pub fn render(&self, ctx: &mut dyn RenderContext) {
        let mut stack = self.matrix_stack;
        let mut slot = 0usize;
        for command in &self.render_commands {
            let arg = command.args.first().copied().unwrap_or(0) as usize;
            match command.opcode {
                0x01 => break,
                0x03 => slot = arg % MATRIX_STACK_SLOTS,
                0x04 | 0x24 | 0x44 => {
                    if let Some((_, material)) = self.materials.by_index(arg) {
                        ctx.bind_material(material);
                    }
                }
                0x05 => {
                    if let Some((_, mesh)) = self.meshes.by_index(arg) {
                        ctx.draw_mesh(mesh, &stack[slot], self.up_scale);
                    }
                }
                0x0b => stack[slot] = stack[slot] * self.up_scale,
                0x2b => stack[slot] = stack[slot] * self.down_scale,
                _ => {}
            }
        }
    }
}

pub(crate) fn parse_mdl0(
    cursor: &mut Cursor<&[u8]>,
    section_offset: u32,
) -> Result<ResourceDict<Model>> {
    cursor.read_u32::<LittleEndian>()?; // section size
    read_dict(cursor, |cursor| {
        let offset = cursor.read_u32::<LittleEndian>()? as u64;
        let here = cursor.position();
        let model_offset = section_offset as u64 + offset;
        cursor.seek(SeekFrom::Start(model_offset))?;
        let model = Model::parse(cursor, model_offset)?;
        cursor.seek(SeekFrom::Start(here))?;
        Ok(model)
    })
}

#[derive(Debug, Clone, Default)]
pub struct Nsbmd {
    pub models: ResourceDict<Model>,
    pub textures: ResourceDict<Texture>,
    pub palettes: ResourceDict<Palette>,
    uploaded_pairs: HashMap<(String, String), GpuHandle>,
}

impl Nsbmd {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path)
            .with_context(|| format!("opening model container at {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("memory-mapping {}", path.display()))?;
        Self::from_bytes(&mmap).with_context(|| format!("parsing model container {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut stamp = [0u8; 4];
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"BMD0",
            NitroError::MalformedContainer("missing BMD0 stamp")
        );
        cursor.read_u16::<LittleEndian>()?; // byte-order marker
        cursor.read_u16::<LittleEndian>()?; // version
        cursor.read_u32::<LittleEndian>()?; // file size
        cursor.read_u16::<LittleEndian>()?; // header size
        let section_count = cursor.read_u16::<LittleEndian>()?;

        let mut container = Nsbmd::default();
        for _ in 0..section_count {
            let section_offset = cursor.read_u32::<LittleEndian>()?;
            let next_entry = cursor.position();

            cursor.seek(SeekFrom::Start(section_offset as u64))?;
            cursor.read_exact(&mut stamp)?;
            match &stamp {
                b"MDL0" => {
                    for (name, model) in parse_mdl0(&mut cursor, section_offset)?.iter() {
                        container.models.push(name.clone(), model.clone());
                    }
                }
                b"TEX0" => {
                    let tex0 = Tex0::parse(&mut cursor, section_offset)?;
                    for (name, texture) in tex0.textures.iter() {
                        container.textures.push(name.clone(), texture.clone());
                    }
                    for (name, palette) in tex0.palettes.iter() {
                        container.palettes.push(name.clone(), palette.clone());
                    }
                }
                other => log::warn!(
                    "skipping unrecognized section {:?}",
                    String::from_utf8_lossy(other)
                ),
            }
            cursor.seek(SeekFrom::Start(next_entry))?;
        }
        Ok(container)
    }

    pub fn upload(&mut self, ctx: &mut dyn RenderContext) {
        for (_, model) in self.models.iter_mut() {
            model.upload(ctx);
        }
    }

    // Resolves each material's texture/palette name pair and uploads the
    // decoded pixels once per distinct pair. Materials that already hold a
    // handle are left alone, so the call is re-runnable.
    pub fn attach_textures(&mut self, ctx: &mut dyn RenderContext) {
        let Nsbmd {
            models,
            textures,
            palettes,
            uploaded_pairs,
        } = self;
        for (_, model) in models.iter_mut() {
            for (_, material) in model.materials.iter_mut() {
                if material.texture.is_some() {
                    continue;
                }
                let key = (material.texture_name.clone(), material.palette_name.clone());
                if let Some(&handle) = uploaded_pairs.get(&key) {
                    material.texture = Some(handle);
                    continue;
                }
                let Some(texture) = textures.get(&key.0) else {
                    continue;
                };
                let Some(palette) = palettes.get_mut(&key.1) else {
                    continue;
                };
                let rgba = texture.to_rgba(palette);
                let handle = ctx.upload_texture(&rgba, texture.width, texture.height);
                uploaded_pairs.insert(key, handle);
                material.texture = Some(handle);
            }
        }
    }

    // Swaps in an external texture/palette container and re-resolves every
    // material against it.
    pub fn attach_container(&mut self, ctx: &mut dyn RenderContext, container: &Btx0) {
        self.textures = container.textures.clone();
        self.palettes = container.palettes.clone();
        self.uploaded_pairs.clear();
        for (_, model) in self.models.iter_mut() {
            for (_, material) in model.materials.iter_mut() {
                material.texture = None;
            }
        }
        self.attach_textures(ctx);
    }

    pub fn render(&self, ctx: &mut dyn RenderContext) {
        for (_, model) in self.models.iter() {
            model.render(ctx);
        }
    }
}
