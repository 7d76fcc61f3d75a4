// The seam between decoded model data and whatever draws it. The core never
// owns GPU state: buffers, textures, and draw calls go through a caller
// supplied RenderContext, and the core keeps only the opaque handles.

use glam::Mat4;

use crate::nsbmd::{Material, Mesh, PrimitiveType, Vertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u32);

pub trait RenderContext {
    fn upload_primitive(&mut self, kind: PrimitiveType, vertices: &[Vertex]) -> GpuHandle;

    fn upload_texture(&mut self, rgba: &[u8], width: u32, height: u32) -> GpuHandle;

    fn bind_material(&mut self, material: &Material);

    fn draw_mesh(&mut self, mesh: &Mesh, stack_matrix: &Mat4, up_scale: f32);
}

// Issues handles and draws nothing, so containers can be loaded, uploaded,
// and walked without a GPU.
#[derive(Debug, Default)]
pub struct NullContext {
    next_handle: u32,
    pub primitives_uploaded: usize,
    pub textures_uploaded: usize,
    pub draws: usize,
}

impl NullContext {
    pub fn new() -> Self {
        NullContext::default()
    }

    fn issue(&mut self) -> GpuHandle {
        let handle = GpuHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

impl RenderContext for NullContext {
    fn upload_primitive(&mut self, _kind: PrimitiveType, _vertices: &[Vertex]) -> GpuHandle {
        self.primitives_uploaded += 1;
        self.issue()
    }

    fn upload_texture(&mut self, _rgba: &[u8], _width: u32, _height: u32) -> GpuHandle {
        self.textures_uploaded += 1;
        self.issue()
    }

    fn bind_material(&mut self, _material: &Material) {}

    fn draw_mesh(&mut self, _mesh: &Mesh, _stack_matrix: &Mat4, _up_scale: f32) {
        self.draws += 1;
    }
}
