pub mod blz;
pub mod dict;
pub mod error;
pub mod fs;
pub mod narc;
pub mod nsbmd;
pub mod nsbtx;
pub mod render;
pub mod rom;
pub mod util;

pub use dict::ResourceDict;
pub use error::NitroError;
pub use fs::{File, Filesystem, Folder, FolderId};
pub use narc::Narc;
pub use nsbmd::{Material, Mesh, Model, Nsbmd, Primitive, PrimitiveType, RenderCommand, Vertex};
pub use nsbtx::{Btx0, Palette, Texture, TextureFormat};
pub use render::{GpuHandle, NullContext, RenderContext};
pub use rom::{Banner, Overlay, Processor, Rom, RomHeader};
