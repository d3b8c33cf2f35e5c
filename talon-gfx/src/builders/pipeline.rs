use crate::{
    error::Result,
    resource::shader::{ShaderCompiler, ShaderModule, ShaderSource},
    types::*,
    utils::get_pixel_size,
};

use std::{mem::ManuallyDrop, ops::Range, sync::Arc};

use hal::{
    device::Device as _,
    format::Format,
    pso::{
        AttributeDesc, BakedStates, BasePipeline, BlendDesc, BufferIndex, DepthStencilDesc,
        ElemStride, Element, GraphicsPipelineDesc, InputAssemblerDesc, PipelineCreationFlags,
        PrimitiveAssemblerDesc, Rasterizer, Rect, ShaderStageFlags, VertexBufferDesc,
        VertexInputRate, Viewport,
    },
};

#[derive(Debug, Clone)]
pub struct VertexBufferSpec {
    pub attributes: Vec<Format>,
    pub rate: VertexInputRate,
}

impl VertexBufferSpec {
    pub fn as_attribute_desc(&self, binding: BufferIndex) -> Vec<AttributeDesc> {
        let mut v = Vec::with_capacity(self.attributes.len());
        let mut offset = 0;
        for (idx, format) in self.attributes.iter().enumerate() {
            v.push(AttributeDesc {
                location: idx as u32,
                binding,
                element: Element {
                    offset,
                    format: *format,
                },
            });
            offset += get_pixel_size(*format);
        }

        v
    }

    pub fn stride(&self) -> ElemStride {
        self.attributes.iter().fold(0, |x, f| x + get_pixel_size(*f))
    }
}

#[derive(Debug, Clone)]
pub struct VertexPrimitiveAssemblerSpec {
    buffers: Vec<VertexBufferDesc>,
    attributes: Vec<AttributeDesc>,
    input_assembler: InputAssemblerDesc,
}

impl VertexPrimitiveAssemblerSpec {
    pub fn with_buffer(&mut self, bd: VertexBufferSpec) -> &mut Self {
        let idx = self.buffers.len() as u32;
        self.buffers.push(VertexBufferDesc {
            binding: idx,
            stride: bd.stride(),
            rate: bd.rate,
        });

        self.attributes.extend(bd.as_attribute_desc(idx));

        self
    }

    pub fn with_buffers(iad: InputAssemblerDesc, mut bds: Vec<VertexBufferSpec>) -> Self {
        let mut this = VertexPrimitiveAssemblerSpec {
            buffers: vec![],
            attributes: vec![],
            input_assembler: iad,
        };

        for bd in bds.drain(..) {
            this.with_buffer(bd);
        }

        this
    }
}

/// Everything needed to build a [`CompletePipeline`], except the render pass it will be used
/// with (owned separately by a [`crate::render_pass::RenderPassCache`]) and the
/// [`ShaderCompiler`] used to turn `ShaderSource::Text` into bytecode.
#[derive(Builder, Debug)]
#[builder(public)]
pub struct PipelineSpec {
    rasterizer: Rasterizer,
    depth_stencil: DepthStencilDesc,
    blender: BlendDesc,
    primitive_assembler: VertexPrimitiveAssemblerSpec,

    shader_vertex: ShaderSource,
    #[builder(setter(strip_option))]
    shader_fragment: Option<ShaderSource>,

    #[builder(default = "vec![]")]
    push_constants: Vec<(ShaderStageFlags, Range<u32>)>,

    #[builder(default = "false")]
    dynamic_viewport: bool,
    #[builder(default = "false")]
    dynamic_scissor: bool,
}

impl PipelineSpec {
    pub fn build<'b, T: Iterator<Item = &'b DescriptorSetLayoutT>>(
        self,
        device: &mut DeviceT,
        compiler: &mut dyn ShaderCompiler,
        render_pass: Arc<RenderPassT>,
        extent: hal::image::Extent,
        set_layouts: T,
    ) -> Result<CompletePipeline> {
        let subpass = hal::pass::Subpass {
            index: 0,
            main_pass: &*render_pass,
        };

        let vs_module = ShaderModule::new(device, compiler, &self.shader_vertex)?;
        let fs_module = self
            .shader_fragment
            .as_ref()
            .map(|s| ShaderModule::new(device, compiler, s))
            .transpose()?;
        let (vs_entry, fs_entry) = (
            vs_module.as_entry_point(),
            fs_module.as_ref().map(ShaderModule::as_entry_point),
        );

        let layout = unsafe {
            device.create_pipeline_layout(set_layouts, self.push_constants.into_iter())?
        };

        let baked_states = BakedStates {
            viewport: if self.dynamic_viewport {
                None
            } else {
                Some(Viewport {
                    rect: extent.rect(),
                    depth: 0.0..1.0,
                })
            },
            scissor: if self.dynamic_scissor {
                None
            } else {
                Some(extent.rect())
            },
            blend_constants: None,
            depth_bounds: None,
        };

        let primitive_assembler = PrimitiveAssemblerDesc::Vertex {
            buffers: self.primitive_assembler.buffers.as_slice(),
            attributes: self.primitive_assembler.attributes.as_slice(),
            input_assembler: self.primitive_assembler.input_assembler,
            vertex: vs_entry,
            tessellation: None,
            geometry: None,
        };

        let pipeline_desc = GraphicsPipelineDesc {
            label: Some("talon-gfx"),
            rasterizer: self.rasterizer,
            fragment: fs_entry,
            blender: self.blender,
            depth_stencil: self.depth_stencil,
            multisampling: None,
            baked_states,
            layout: &layout,
            subpass,
            flags: PipelineCreationFlags::empty(),
            parent: BasePipeline::None,
            primitive_assembler,
        };

        let pipeline = unsafe { device.create_graphics_pipeline(&pipeline_desc, None)? };

        Ok(CompletePipeline {
            render_pass,
            pipeline_layout: ManuallyDrop::new(layout),
            pipeline: ManuallyDrop::new(pipeline),
            vs_module,
            fs_module,
            render_area: extent.rect(),
        })
    }
}

/// A fully-built graphics pipeline: the `hal` pipeline object, its layout, its shader modules, and
/// a strong reference to the render pass it was built against (so that render pass outlives the
/// pipeline even if its cache entry would otherwise be the only other owner).
pub struct CompletePipeline {
    pub render_pass: Arc<RenderPassT>,
    pub pipeline_layout: ManuallyDrop<PipelineLayoutT>,
    pub pipeline: ManuallyDrop<GraphicsPipelineT>,

    pub vs_module: ShaderModule,
    pub fs_module: Option<ShaderModule>,

    pub render_area: Rect,
}

impl CompletePipeline {
    pub fn deactivate(mut self, device: &mut DeviceT) {
        self.vs_module.deactivate(device);
        if let Some(x) = self.fs_module.take() {
            x.deactivate(device)
        }

        unsafe {
            use core::ptr::read;
            device.destroy_graphics_pipeline(read(&*self.pipeline));
            device.destroy_pipeline_layout(read(&*self.pipeline_layout));
        }
    }
}
