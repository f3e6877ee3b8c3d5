//! Direct3D 11 render backend.
//!
//! Two ways in:
//! - the application uses D3D11: we record into a deferred context on its
//!   device and execute the command list on the immediate context, restoring
//!   the application's state afterwards;
//! - the application uses D3D12: we create a D3D11On12 device on its queue,
//!   wrap the swapchain images as D3D11 textures and keep a fence to drain
//!   the queue before tearing down.

use std::ffi::c_void;
use std::mem;

use windows::core::{s, Interface, IUnknown, PCSTR, PCWSTR};
use windows::Win32::Foundation::CloseHandle;
use windows::Win32::Graphics::Direct3D::Fxc::{D3DCompile, D3DCOMPILE_OPTIMIZATION_LEVEL3};
use windows::Win32::Graphics::Direct3D::{ID3DBlob, D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Direct3D11on12::{D3D11On12CreateDevice, ID3D11On12Device, D3D11_RESOURCE_FLAGS};
use windows::Win32::Graphics::Direct3D12::{
    ID3D12CommandQueue, ID3D12Device, ID3D12Fence, ID3D12Resource, D3D12_FENCE_FLAG_NONE,
    D3D12_RESOURCE_STATES, D3D12_RESOURCE_STATE_RENDER_TARGET,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_FORMAT, DXGI_FORMAT_R16_UINT, DXGI_FORMAT_R32G32_FLOAT, DXGI_FORMAT_R8_UNORM, DXGI_SAMPLE_DESC,
};
use windows::Win32::System::Threading::{CreateEventExW, WaitForSingleObject, CREATE_EVENT, EVENT_ALL_ACCESS, INFINITE};

use bytemuck::{Pod, Zeroable};

use super::mesh::{Eye, MeshVertex};
use super::{PipelineDesc, RenderBackend, SwapchainLayout, VIEW_COUNT};
use crate::error::{OptionExt, PassthroughError, PassthroughResult};

/// Samples the R8 camera image and tints it with the color adjustment.
/// State swapchain images are in when the runtime hands them to us and when
/// we hand them back.
const SWAPCHAIN_IMAGE_STATE: D3D12_RESOURCE_STATES = D3D12_RESOURCE_STATE_RENDER_TARGET;

const PASSTHROUGH_SHADER: &str = r#"
cbuffer EyeConstants : register(b0) {
    float4x4 mvp;
};

cbuffer ColorConstants : register(b1) {
    float4 colorAdjustment;
};

Texture2D cameraImage : register(t0);
SamplerState linearSampler : register(s0);

struct VSInput {
    float2 position : POSITION;
    float2 texcoord : TEXCOORD0;
};

struct PSInput {
    float4 position : SV_Position;
    float2 texcoord : TEXCOORD0;
};

PSInput VSMain(VSInput input) {
    PSInput output;
    output.position = mul(mvp, float4(input.position, 0.0, 1.0));
    output.texcoord = input.texcoord;
    return output;
}

float4 PSMain(PSInput input) : SV_Target {
    float luminance = cameraImage.Sample(linearSampler, input.texcoord).r;
    return float4(luminance * colorAdjustment.rgb, 1.0);
}
"#;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct EyeConstants {
    mvp: [f32; 16],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ColorConstants {
    color_adjustment: [f32; 4],
}

/// D3D12 objects kept alive for the D3D11On12 bridge.
struct D3D12Bridge {
    queue: ID3D12CommandQueue,
    on12: ID3D11On12Device,
    fence: ID3D12Fence,
    fence_value: u64,
}

struct Pipeline {
    vertex_shader: ID3D11VertexShader,
    pixel_shader: ID3D11PixelShader,
    input_layout: ID3D11InputLayout,
    vertex_buffers: [ID3D11Buffer; VIEW_COUNT],
    index_buffers: [ID3D11Buffer; VIEW_COUNT],
    index_counts: [u32; VIEW_COUNT],
    eye_constants: ID3D11Buffer,
    color_constants: ID3D11Buffer,
    sampler: ID3D11SamplerState,
    rasterizer: ID3D11RasterizerState,
}

struct CameraTexture {
    texture: ID3D11Texture2D,
    view: ID3D11ShaderResourceView,
    width: u32,
    height: u32,
}

/// One swapchain image with a render target per array slice.
struct SwapchainTarget {
    /// The D3D11 texture (wrapped when bridged from D3D12).
    texture: ID3D11Texture2D,
    eyes: [ID3D11RenderTargetView; VIEW_COUNT],
}

pub struct D3D11Backend {
    device: ID3D11Device,
    immediate: ID3D11DeviceContext,
    /// Recording context for the application's own D3D11 device.
    deferred: Option<ID3D11DeviceContext>,
    bridge: Option<D3D12Bridge>,

    targets: Vec<SwapchainTarget>,
    layout: Option<SwapchainLayout>,
    pipeline: Option<Pipeline>,
    camera: Option<CameraTexture>,
    current_image: Option<usize>,
}

// COM pointers are only touched from the session's thread.
unsafe impl Send for D3D11Backend {}

impl D3D11Backend {
    /// Backend on the application's D3D11 device.
    ///
    /// # Safety
    /// `device` must be the `ID3D11Device*` from the session's graphics binding.
    pub unsafe fn from_d3d11(device: *mut c_void) -> PassthroughResult<Self> {
        let device = ID3D11Device::from_raw_borrowed(&device)
            .cloned()
            .context("Null D3D11 device in graphics binding")?;
        let immediate = device.GetImmediateContext()?;

        let mut deferred: Option<ID3D11DeviceContext> = None;
        device.CreateDeferredContext(0, Some(&mut deferred))?;

        log::info!("Using the application's D3D11 device");
        Ok(Self::with_device(device, immediate, deferred, None))
    }

    /// Backend on a D3D11On12 device created over the application's D3D12
    /// device and queue.
    ///
    /// # Safety
    /// `device` and `queue` must be the `ID3D12Device*` and
    /// `ID3D12CommandQueue*` from the session's graphics binding.
    pub unsafe fn from_d3d12(device: *mut c_void, queue: *mut c_void) -> PassthroughResult<Self> {
        let device12 = ID3D12Device::from_raw_borrowed(&device)
            .cloned()
            .context("Null D3D12 device in graphics binding")?;
        let queue = ID3D12CommandQueue::from_raw_borrowed(&queue)
            .cloned()
            .context("Null D3D12 command queue in graphics binding")?;

        let queue_unknown: IUnknown = queue.cast()?;
        let mut device11: Option<ID3D11Device> = None;
        let mut immediate: Option<ID3D11DeviceContext> = None;
        D3D11On12CreateDevice(
            &device12,
            D3D11_CREATE_DEVICE_BGRA_SUPPORT.0 as u32,
            None,
            Some(&[Some(queue_unknown)]),
            0,
            Some(&mut device11),
            Some(&mut immediate),
            None,
        )?;
        let device11 = device11.context("D3D11On12CreateDevice returned no device")?;
        let immediate = immediate.context("D3D11On12CreateDevice returned no context")?;
        let on12: ID3D11On12Device = device11.cast()?;

        // Drained on teardown before the wrapped resources go away.
        let fence: ID3D12Fence = device12.CreateFence(0, D3D12_FENCE_FLAG_NONE)?;

        log::info!("Using a D3D11On12 bridge over the application's D3D12 device");
        Ok(Self::with_device(
            device11,
            immediate,
            None,
            Some(D3D12Bridge {
                queue,
                on12,
                fence,
                fence_value: 0,
            }),
        ))
    }

    fn with_device(
        device: ID3D11Device,
        immediate: ID3D11DeviceContext,
        deferred: Option<ID3D11DeviceContext>,
        bridge: Option<D3D12Bridge>,
    ) -> Self {
        Self {
            device,
            immediate,
            deferred,
            bridge,
            targets: Vec::new(),
            layout: None,
            pipeline: None,
            camera: None,
            current_image: None,
        }
    }

    /// Context all our commands are recorded on.
    fn context(&self) -> &ID3D11DeviceContext {
        self.deferred.as_ref().unwrap_or(&self.immediate)
    }

    unsafe fn wrap_texture(&self, native: *mut c_void) -> PassthroughResult<ID3D11Texture2D> {
        match &self.bridge {
            None => ID3D11Texture2D::from_raw_borrowed(&native)
                .cloned()
                .context("Null swapchain texture"),
            Some(bridge) => {
                let resource = ID3D12Resource::from_raw_borrowed(&native)
                    .cloned()
                    .context("Null swapchain resource")?;
                let flags = D3D11_RESOURCE_FLAGS {
                    BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32,
                    ..Default::default()
                };
                let mut wrapped: Option<ID3D11Texture2D> = None;
                bridge.on12.CreateWrappedResource(
                    &resource,
                    &flags,
                    SWAPCHAIN_IMAGE_STATE,
                    SWAPCHAIN_IMAGE_STATE,
                    &mut wrapped,
                )?;
                wrapped.context("CreateWrappedResource returned no texture")
            },
        }
    }

    unsafe fn create_eye_target(
        &self,
        texture: &ID3D11Texture2D,
        format: DXGI_FORMAT,
        slice: u32,
    ) -> PassthroughResult<ID3D11RenderTargetView> {
        let desc = D3D11_RENDER_TARGET_VIEW_DESC {
            Format: format,
            ViewDimension: D3D11_RTV_DIMENSION_TEXTURE2DARRAY,
            Anonymous: D3D11_RENDER_TARGET_VIEW_DESC_0 {
                Texture2DArray: D3D11_TEX2D_ARRAY_RTV {
                    MipSlice: 0,
                    FirstArraySlice: slice,
                    ArraySize: 1,
                },
            },
        };

        let mut rtv: Option<ID3D11RenderTargetView> = None;
        self.device
            .CreateRenderTargetView(texture, Some(&desc), Some(&mut rtv))?;
        rtv.context("CreateRenderTargetView returned no view")
    }

    unsafe fn create_buffer<T: Pod>(&self, data: &[T], bind: D3D11_BIND_FLAG) -> PassthroughResult<ID3D11Buffer> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: bytes.len() as u32,
            Usage: D3D11_USAGE_IMMUTABLE,
            BindFlags: bind.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
            StructureByteStride: 0,
        };
        let init = D3D11_SUBRESOURCE_DATA {
            pSysMem: bytes.as_ptr() as *const _,
            SysMemPitch: 0,
            SysMemSlicePitch: 0,
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        self.device.CreateBuffer(&desc, Some(&init), Some(&mut buffer))?;
        buffer.context("CreateBuffer returned no buffer")
    }

    unsafe fn create_constant_buffer<T: Pod>(&self) -> PassthroughResult<ID3D11Buffer> {
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: mem::size_of::<T>() as u32,
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_CONSTANT_BUFFER.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut buffer: Option<ID3D11Buffer> = None;
        self.device.CreateBuffer(&desc, None, Some(&mut buffer))?;
        buffer.context("CreateBuffer returned no constant buffer")
    }

    unsafe fn write_constants<T: Pod>(&self, buffer: &ID3D11Buffer, value: &T) -> PassthroughResult<()> {
        let context = self.context();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        context.Map(buffer, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))?;

        let bytes = bytemuck::bytes_of(value);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), mapped.pData as *mut u8, bytes.len());

        context.Unmap(buffer, 0);
        Ok(())
    }

    unsafe fn create_camera_texture(&self, width: u32, height: u32) -> PassthroughResult<CameraTexture> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: width,
            Height: height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_R8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DYNAMIC,
            BindFlags: D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: D3D11_CPU_ACCESS_WRITE.0 as u32,
            MiscFlags: 0,
        };

        let mut texture: Option<ID3D11Texture2D> = None;
        self.device.CreateTexture2D(&desc, None, Some(&mut texture))?;
        let texture = texture.context("CreateTexture2D returned no texture")?;

        let mut view: Option<ID3D11ShaderResourceView> = None;
        self.device
            .CreateShaderResourceView(&texture, None, Some(&mut view))?;
        let view = view.context("CreateShaderResourceView returned no view")?;

        log::info!("Created camera texture {}x{}", width, height);
        Ok(CameraTexture {
            texture,
            view,
            width,
            height,
        })
    }

    fn wrapped_resources(&self, index: usize) -> PassthroughResult<[Option<ID3D11Resource>; 1]> {
        let target = self.targets.get(index).context("Swapchain image index out of range")?;
        Ok([Some(target.texture.cast()?)])
    }

    /// Hand a bridged swapchain image back to D3D12.
    fn release_wrapped(&self, index: usize) -> PassthroughResult<()> {
        if let Some(bridge) = &self.bridge {
            let resources = self.wrapped_resources(index)?;
            unsafe {
                bridge.on12.ReleaseWrappedResources(&resources);
                self.immediate.Flush();
            }
        }
        Ok(())
    }
}

impl RenderBackend for D3D11Backend {
    fn api_name(&self) -> &'static str {
        if self.bridge.is_some() {
            "D3D12 (D3D11On12)"
        } else {
            "D3D11"
        }
    }

    fn import_swapchain_images(&mut self, textures: &[*mut c_void], layout: &SwapchainLayout) -> PassthroughResult<()> {
        let format = DXGI_FORMAT(layout.format as i32);

        let mut targets = Vec::with_capacity(textures.len());
        for &native in textures {
            unsafe {
                let texture = self.wrap_texture(native)?;
                let eyes = [
                    self.create_eye_target(&texture, format, 0)?,
                    self.create_eye_target(&texture, format, 1)?,
                ];
                targets.push(SwapchainTarget { texture, eyes });
            }
        }

        log::debug!("Imported {} swapchain images", targets.len());
        self.targets = targets;
        self.layout = Some(*layout);
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> PassthroughResult<()> {
        unsafe {
            let vs_blob = compile_shader(PASSTHROUGH_SHADER, s!("VSMain"), s!("vs_5_0"))?;
            let ps_blob = compile_shader(PASSTHROUGH_SHADER, s!("PSMain"), s!("ps_5_0"))?;
            let vs_bytecode = blob_bytes(&vs_blob);
            let ps_bytecode = blob_bytes(&ps_blob);

            let mut vertex_shader: Option<ID3D11VertexShader> = None;
            self.device
                .CreateVertexShader(vs_bytecode, None, Some(&mut vertex_shader))?;
            let mut pixel_shader: Option<ID3D11PixelShader> = None;
            self.device
                .CreatePixelShader(ps_bytecode, None, Some(&mut pixel_shader))?;

            let input_layout_desc = [
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("POSITION"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 0,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
                D3D11_INPUT_ELEMENT_DESC {
                    SemanticName: s!("TEXCOORD"),
                    SemanticIndex: 0,
                    Format: DXGI_FORMAT_R32G32_FLOAT,
                    InputSlot: 0,
                    AlignedByteOffset: 8,
                    InputSlotClass: D3D11_INPUT_PER_VERTEX_DATA,
                    InstanceDataStepRate: 0,
                },
            ];
            let mut input_layout: Option<ID3D11InputLayout> = None;
            self.device
                .CreateInputLayout(&input_layout_desc, vs_bytecode, Some(&mut input_layout))?;

            let [left, right] = desc.meshes;
            let vertex_buffers = [
                self.create_buffer::<MeshVertex>(&left.vertices, D3D11_BIND_VERTEX_BUFFER)?,
                self.create_buffer::<MeshVertex>(&right.vertices, D3D11_BIND_VERTEX_BUFFER)?,
            ];
            let index_buffers = [
                self.create_buffer::<u16>(&left.indices, D3D11_BIND_INDEX_BUFFER)?,
                self.create_buffer::<u16>(&right.indices, D3D11_BIND_INDEX_BUFFER)?,
            ];

            let eye_constants = self.create_constant_buffer::<EyeConstants>()?;
            let color_constants = self.create_constant_buffer::<ColorConstants>()?;
            let [r, g, b] = desc.color_adjustment;
            self.write_constants(
                &color_constants,
                &ColorConstants {
                    color_adjustment: [r, g, b, 1.0],
                },
            )?;

            let sampler_desc = D3D11_SAMPLER_DESC {
                Filter: D3D11_FILTER_MIN_MAG_MIP_LINEAR,
                AddressU: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressV: D3D11_TEXTURE_ADDRESS_CLAMP,
                AddressW: D3D11_TEXTURE_ADDRESS_CLAMP,
                MipLODBias: 0.0,
                MaxAnisotropy: 1,
                ComparisonFunc: D3D11_COMPARISON_NEVER,
                BorderColor: [0.0, 0.0, 0.0, 0.0],
                MinLOD: 0.0,
                MaxLOD: f32::MAX,
            };
            let mut sampler: Option<ID3D11SamplerState> = None;
            self.device
                .CreateSamplerState(&sampler_desc, Some(&mut sampler))?;

            // The warp may flip triangles near the edges; draw both sides.
            let rasterizer_desc = D3D11_RASTERIZER_DESC {
                FillMode: D3D11_FILL_SOLID,
                CullMode: D3D11_CULL_NONE,
                FrontCounterClockwise: false.into(),
                DepthBias: 0,
                DepthBiasClamp: 0.0,
                SlopeScaledDepthBias: 0.0,
                DepthClipEnable: true.into(),
                ScissorEnable: false.into(),
                MultisampleEnable: false.into(),
                AntialiasedLineEnable: false.into(),
            };
            let mut rasterizer: Option<ID3D11RasterizerState> = None;
            self.device
                .CreateRasterizerState(&rasterizer_desc, Some(&mut rasterizer))?;

            self.pipeline = Some(Pipeline {
                vertex_shader: vertex_shader.context("CreateVertexShader returned no shader")?,
                pixel_shader: pixel_shader.context("CreatePixelShader returned no shader")?,
                input_layout: input_layout.context("CreateInputLayout returned no layout")?,
                vertex_buffers,
                index_buffers,
                index_counts: [left.index_count(), right.index_count()],
                eye_constants,
                color_constants,
                sampler: sampler.context("CreateSamplerState returned no sampler")?,
                rasterizer: rasterizer.context("CreateRasterizerState returned no state")?,
            });
        }

        log::debug!("Passthrough pipeline ready");
        Ok(())
    }

    fn upload_camera_image(&mut self, pixels: &[u8], width: u32, height: u32) -> PassthroughResult<()> {
        let expected = width as usize * height as usize;
        if pixels.len() < expected {
            return Err(PassthroughError::InvalidArgument(format!(
                "Camera image {}x{} with only {} bytes",
                width,
                height,
                pixels.len()
            )));
        }

        unsafe {
            let stale = self
                .camera
                .as_ref()
                .map(|camera| camera.width != width || camera.height != height)
                .unwrap_or(true);
            if stale {
                self.camera = Some(self.create_camera_texture(width, height)?);
            }
            let camera = self.camera.as_ref().context("Camera texture missing")?;

            let context = self.context();
            let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
            context.Map(&camera.texture, 0, D3D11_MAP_WRITE_DISCARD, 0, Some(&mut mapped))?;

            let row = width as usize;
            let dst = mapped.pData as *mut u8;
            for (y, src) in pixels.chunks_exact(row).take(height as usize).enumerate() {
                std::ptr::copy_nonoverlapping(src.as_ptr(), dst.add(y * mapped.RowPitch as usize), row);
            }

            context.Unmap(&camera.texture, 0);
        }
        Ok(())
    }

    fn has_camera_image(&self) -> bool {
        self.camera.is_some()
    }

    fn begin_draw(&mut self, image_index: u32) -> PassthroughResult<()> {
        let index = image_index as usize;
        if index >= self.targets.len() {
            return Err(PassthroughError::InvalidArgument(format!(
                "Swapchain image {} of {}",
                image_index,
                self.targets.len()
            )));
        }

        let pipeline = self.pipeline.as_ref().context("Pipeline not created")?;
        let camera = self.camera.as_ref().context("No camera image")?;
        let layout = self.layout.context("Swapchain not imported")?;

        if let Some(bridge) = &self.bridge {
            let resources = self.wrapped_resources(index)?;
            unsafe { bridge.on12.AcquireWrappedResources(&resources) };
        }

        unsafe {
            let context = self.context();
            context.RSSetViewports(Some(&[D3D11_VIEWPORT {
                TopLeftX: 0.0,
                TopLeftY: 0.0,
                Width: layout.width as f32,
                Height: layout.height as f32,
                MinDepth: 0.0,
                MaxDepth: 1.0,
            }]));
            context.RSSetState(&pipeline.rasterizer);
            context.IASetInputLayout(&pipeline.input_layout);
            context.IASetPrimitiveTopology(D3D11_PRIMITIVE_TOPOLOGY_TRIANGLELIST);
            context.VSSetShader(&pipeline.vertex_shader, None);
            context.VSSetConstantBuffers(0, Some(&[Some(pipeline.eye_constants.clone())]));
            context.PSSetShader(&pipeline.pixel_shader, None);
            context.PSSetConstantBuffers(1, Some(&[Some(pipeline.color_constants.clone())]));
            context.PSSetShaderResources(0, Some(&[Some(camera.view.clone())]));
            context.PSSetSamplers(0, Some(&[Some(pipeline.sampler.clone())]));
        }

        self.current_image = Some(index);
        Ok(())
    }

    fn draw_eye(&mut self, eye: Eye, mvp: &glam::Mat4) -> PassthroughResult<()> {
        let index = self.current_image.context("draw_eye outside begin_draw/end_draw")?;
        let pipeline = self.pipeline.as_ref().context("Pipeline not created")?;
        let rtv = &self.targets[index].eyes[eye.index()];
        let i = eye.index();

        unsafe {
            self.write_constants(
                &pipeline.eye_constants,
                &EyeConstants {
                    mvp: mvp.to_cols_array(),
                },
            )?;

            let context = self.context();
            context.ClearRenderTargetView(rtv, &[0.0, 0.0, 0.0, 1.0]);
            context.OMSetRenderTargets(Some(&[Some(rtv.clone())]), None);

            let stride = mem::size_of::<MeshVertex>() as u32;
            let offset = 0u32;
            context.IASetVertexBuffers(
                0,
                1,
                Some(&Some(pipeline.vertex_buffers[i].clone())),
                Some(&stride),
                Some(&offset),
            );
            context.IASetIndexBuffer(&pipeline.index_buffers[i], DXGI_FORMAT_R16_UINT, 0);
            context.DrawIndexed(pipeline.index_counts[i], 0, 0);
        }
        Ok(())
    }

    fn end_draw(&mut self) -> PassthroughResult<()> {
        let index = self.current_image.take().context("end_draw without begin_draw")?;

        let submitted = unsafe {
            self.context().OMSetRenderTargets(None, None);

            match &self.deferred {
                Some(deferred) => {
                    let mut commands: Option<ID3D11CommandList> = None;
                    deferred
                        .FinishCommandList(false, Some(&mut commands))
                        .map_err(PassthroughError::from)
                        .and_then(|()| commands.context("FinishCommandList returned no list"))
                        .map(|commands| {
                            // Restore the application's pipeline state afterwards.
                            self.immediate.ExecuteCommandList(&commands, true);
                        })
                },
                None => Ok(()),
            }
        };

        // The wrapped image goes back even when submission failed.
        let released = self.release_wrapped(index);
        submitted?;
        released
    }

    fn abort_draw(&mut self) {
        let Some(index) = self.current_image.take() else {
            return;
        };

        unsafe {
            let context = self.context();
            context.OMSetRenderTargets(None, None);
            if let Some(deferred) = &self.deferred {
                deferred.ClearState();
                let mut discarded: Option<ID3D11CommandList> = None;
                if let Err(e) = deferred.FinishCommandList(false, Some(&mut discarded)) {
                    log::warn!("Failed to discard recorded commands: {}", e);
                }
            }
        }

        if let Err(e) = self.release_wrapped(index) {
            log::warn!("Failed to release swapchain image {}: {}", index, e);
        }
    }

    fn wait_idle(&mut self) -> PassthroughResult<()> {
        let Some(bridge) = self.bridge.as_mut() else {
            unsafe { self.immediate.Flush() };
            return Ok(());
        };

        bridge.fence_value += 1;
        let value = bridge.fence_value;
        unsafe {
            bridge.queue.Signal(&bridge.fence, value)?;
            if bridge.fence.GetCompletedValue() < value {
                let event = CreateEventExW(None, PCWSTR::null(), CREATE_EVENT(0), EVENT_ALL_ACCESS.0)?;
                let waited = bridge.fence.SetEventOnCompletion(value, event);
                if waited.is_ok() {
                    WaitForSingleObject(event, INFINITE);
                }
                let _ = CloseHandle(event);
                waited?;
            }
        }
        log::debug!("D3D12 queue drained (fence {})", value);
        Ok(())
    }

    fn release_swapchain_images(&mut self) {
        self.current_image = None;
        self.targets.clear();
        self.layout = None;
    }
}

unsafe fn compile_shader(source: &str, entry_point: PCSTR, target: PCSTR) -> PassthroughResult<ID3DBlob> {
    let mut blob: Option<ID3DBlob> = None;
    let mut errors: Option<ID3DBlob> = None;

    let result = D3DCompile(
        source.as_ptr() as *const _,
        source.len(),
        PCSTR::null(),
        None,
        None,
        entry_point,
        target,
        D3DCOMPILE_OPTIMIZATION_LEVEL3,
        0,
        &mut blob,
        Some(&mut errors),
    );

    if let Err(e) = result {
        let message = errors
            .map(|errors| String::from_utf8_lossy(blob_bytes(&errors)).into_owned())
            .unwrap_or_else(|| e.to_string());
        return Err(PassthroughError::Graphics(format!(
            "Shader compilation failed: {}",
            message
        )));
    }

    blob.context("D3DCompile returned no bytecode")
}

unsafe fn blob_bytes(blob: &ID3DBlob) -> &[u8] {
    std::slice::from_raw_parts(blob.GetBufferPointer() as *const u8, blob.GetBufferSize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_images_return_as_render_targets() {
        assert_eq!(SWAPCHAIN_IMAGE_STATE, D3D12_RESOURCE_STATE_RENDER_TARGET);
    }

    #[test]
    fn test_passthrough_shader_compiles() {
        let vs = unsafe { compile_shader(PASSTHROUGH_SHADER, s!("VSMain"), s!("vs_5_0")) };
        let ps = unsafe { compile_shader(PASSTHROUGH_SHADER, s!("PSMain"), s!("ps_5_0")) };
        assert!(vs.is_ok(), "{:?}", vs.err());
        assert!(ps.is_ok(), "{:?}", ps.err());
    }
}
