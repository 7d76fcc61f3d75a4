// Convert BMD0 model containers into a JSON description of the decoded
// models plus texture/palette metadata.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nitro_formats::{
    Btx0, Material, Mesh, Model, Nsbmd, NullContext, Primitive, RenderCommand, Texture, Vertex,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Input BMD0 file to convert
    #[arg(long)]
    input: PathBuf,

    /// Optional BTX0 container supplying the textures and palettes
    #[arg(long)]
    textures: Option<PathBuf>,

    /// Output JSON file path
    #[arg(long)]
    output: PathBuf,

    /// Pretty-print the JSON output
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut nsbmd = Nsbmd::open(&args.input)?;

    let mut ctx = NullContext::new();
    if let Some(path) = &args.textures {
        let container = Btx0::open(path)?;
        nsbmd.attach_container(&mut ctx, &container);
    } else {
        nsbmd.attach_textures(&mut ctx);
    }

    let export = ExportContainer::from(&nsbmd);

    if let Some(parent) = args.output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = File::create(&args.output)?;
    let mut writer = BufWriter::new(file);
    if args.pretty {
        serde_json::to_writer_pretty(&mut writer, &export)?;
    } else {
        serde_json::to_writer(&mut writer, &export)?;
    }
    writer.flush()?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct ExportContainer {
    models: Vec<ExportModel>,
    textures: Vec<ExportTexture>,
    palettes: Vec<ExportPalette>,
}

#[derive(Debug, Serialize)]
struct ExportModel {
    name: String,
    up_scale: f32,
    down_scale: f32,
    meshes: Vec<ExportMesh>,
    materials: Vec<ExportMaterial>,
    render_commands: Vec<ExportCommand>,
}

#[derive(Debug, Serialize)]
struct ExportMesh {
    name: String,
    primitives: Vec<ExportPrimitive>,
}

#[derive(Debug, Serialize)]
struct ExportPrimitive {
    kind: String,
    triangulated: bool,
    vertices: Vec<ExportVertex>,
}

#[derive(Debug, Serialize)]
struct ExportVertex {
    position: [f32; 3],
    normal: [f32; 3],
    color: [f32; 3],
    texcoord: [f32; 2],
    matrix_id: u32,
}

#[derive(Debug, Serialize)]
struct ExportMaterial {
    name: String,
    texture: String,
    palette: String,
    tex_matrix: [f32; 6],
    width: u16,
    height: u16,
}

#[derive(Debug, Serialize)]
struct ExportCommand {
    opcode: u8,
    args: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ExportTexture {
    name: String,
    format: String,
    width: u32,
    height: u32,
    color0_transparent: bool,
}

#[derive(Debug, Serialize)]
struct ExportPalette {
    name: String,
    colors: usize,
}

impl From<&Nsbmd> for ExportContainer {
    fn from(nsbmd: &Nsbmd) -> Self {
        ExportContainer {
            models: nsbmd
                .models
                .iter()
                .map(|(name, model)| export_model(name, model))
                .collect(),
            textures: nsbmd
                .textures
                .iter()
                .map(|(name, texture)| export_texture(name, texture))
                .collect(),
            palettes: nsbmd
                .palettes
                .iter()
                .map(|(name, palette)| ExportPalette {
                    name: name.clone(),
                    colors: palette.colors().len(),
                })
                .collect(),
        }
    }
}

fn export_model(name: &str, model: &Model) -> ExportModel {
    ExportModel {
        name: name.to_string(),
        up_scale: model.up_scale,
        down_scale: model.down_scale,
        meshes: model
            .meshes
            .iter()
            .map(|(name, mesh)| export_mesh(name, mesh))
            .collect(),
        materials: model
            .materials
            .iter()
            .map(|(name, material)| export_material(name, material))
            .collect(),
        render_commands: model
            .render_commands
            .iter()
            .map(|command| export_command(command))
            .collect(),
    }
}

fn export_mesh(name: &str, mesh: &Mesh) -> ExportMesh {
    ExportMesh {
        name: name.to_string(),
        primitives: mesh
            .primitives
            .iter()
            .map(|primitive| export_primitive(primitive))
            .collect(),
    }
}

fn export_primitive(primitive: &Primitive) -> ExportPrimitive {
    ExportPrimitive {
        kind: format!("{:?}", primitive.kind),
        triangulated: primitive.triangulated,
        vertices: primitive.vertices.iter().map(export_vertex).collect(),
    }
}

fn export_vertex(vertex: &Vertex) -> ExportVertex {
    ExportVertex {
        position: vertex.position.to_array(),
        normal: vertex.normal.to_array(),
        color: vertex.color.to_array(),
        texcoord: vertex.texcoord.to_array(),
        matrix_id: vertex.matrix_id,
    }
}

fn export_material(name: &str, material: &Material) -> ExportMaterial {
    ExportMaterial {
        name: name.to_string(),
        texture: material.texture_name.clone(),
        palette: material.palette_name.clone(),
        tex_matrix: material.tex_matrix,
        width: material.width,
        height: material.height,
    }
}

fn export_command(command: &RenderCommand) -> ExportCommand {
    ExportCommand {
        opcode: command.opcode,
        args: command.args.clone(),
    }
}

fn export_texture(name: &str, texture: &Texture) -> ExportTexture {
    ExportTexture {
        name: name.to_string(),
        format: format!("{:?}", texture.format),
        width: texture.width,
        height: texture.height,
        color0_transparent: texture.color0_transparent,
    }
}
