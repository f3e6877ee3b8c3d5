//! Per-session passthrough resources.
//!
//! One [`GraphicsResources`] exists per tracked session. It is built when the
//! session is created, connects to the runtime lazily on the first frame
//! (view space, camera, swapchain, pipeline) and draws one passthrough layer
//! per frame.

use std::ptr;
use std::sync::Arc;

use openxr_sys as xr;
use wmr_camera_feed::{CameraFrame, CameraSource, FrameLease};

use super::mesh::{DistortionMesh, Eye};
use super::projection::{self, DepthRange, EyeView};
use super::staging::{copy_untagged_rows, sample_brightness, FrameDecision, FrameFilter};
use super::{GraphicsBinding, PipelineDesc, RenderBackend, SwapchainLayout, XrRuntime, VIEW_COUNT};
use crate::config::LayerConfig;
use crate::error::{OptionExt, PassthroughError, PassthroughResult};

/// Opens the camera source when a session connects.
pub type CameraConnector = Arc<dyn Fn() -> Box<dyn CameraSource> + Send + Sync>;

/// Where the eyes are this frame, taken from the application's own
/// projection layer.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionSource {
    pub space: xr::Space,
    pub views: [EyeView; VIEW_COUNT],
    pub depth: Option<DepthRange>,
}

/// Result of a successful draw: everything needed to submit the layer.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughFrame {
    pub space: xr::Space,
    pub views: [xr::CompositionLayerProjectionView; VIEW_COUNT],
}

pub struct GraphicsResources {
    runtime: Arc<dyn XrRuntime>,
    backend: Box<dyn RenderBackend>,
    camera_connector: CameraConnector,
    config: LayerConfig,

    system: xr::SystemId,
    image_type: xr::StructureType,

    session: xr::Session,
    view_space: xr::Space,
    swapchain: xr::Swapchain,
    layout: Option<SwapchainLayout>,
    camera: Option<Box<dyn CameraSource>>,
    pipeline_ready: bool,
    connected: bool,

    filter: FrameFilter,
    staging: Vec<u8>,
    jitter_seed: u32,
}

impl GraphicsResources {
    pub fn new(
        runtime: Arc<dyn XrRuntime>,
        binding: &GraphicsBinding,
        backend: Box<dyn RenderBackend>,
        camera_connector: CameraConnector,
        config: LayerConfig,
        system: xr::SystemId,
    ) -> Self {
        log::info!("Passthrough graphics using {}", backend.api_name());

        Self {
            runtime,
            backend,
            camera_connector,
            filter: FrameFilter::new(config.frame_filter),
            config,
            system,
            image_type: binding.swapchain_image_type(),
            session: xr::Session::NULL,
            view_space: xr::Space::NULL,
            swapchain: xr::Swapchain::NULL,
            layout: None,
            camera: None,
            pipeline_ready: false,
            connected: false,
            staging: Vec::new(),
            jitter_seed: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn swapchain(&self) -> xr::Swapchain {
        self.swapchain
    }

    pub fn view_space(&self) -> xr::Space {
        self.view_space
    }

    pub fn layout(&self) -> Option<SwapchainLayout> {
        self.layout
    }

    pub fn jitter_seed(&self) -> u32 {
        self.jitter_seed
    }

    /// Create everything needed to draw. Does nothing once connected; after a
    /// partial failure only the missing pieces are created on the next call.
    pub fn connect(&mut self, session: xr::Session) -> PassthroughResult<()> {
        if self.connected {
            return Ok(());
        }
        self.session = session;

        if self.view_space == xr::Space::NULL {
            let info = xr::ReferenceSpaceCreateInfo {
                ty: xr::ReferenceSpaceCreateInfo::TYPE,
                next: ptr::null(),
                reference_space_type: xr::ReferenceSpaceType::VIEW,
                pose_in_reference_space: identity_pose(),
            };
            self.view_space = self.runtime.create_reference_space(session, &info)?;
        }

        if self.camera.is_none() {
            self.camera = Some((self.camera_connector)());
        }

        if self.layout.is_none() {
            self.create_swapchain()?;
        }

        if !self.pipeline_ready {
            let resolution = self.config.mesh_resolution;
            let calibration = &self.config.calibration;
            let meshes = [
                DistortionMesh::build(Eye::Left, resolution, calibration),
                DistortionMesh::build(Eye::Right, resolution, calibration),
            ];
            self.backend.create_pipeline(&PipelineDesc {
                meshes: &meshes,
                color_adjustment: self.config.color_adjustment,
            })?;
            self.pipeline_ready = true;
        }

        self.connected = true;
        log::info!("Passthrough connected to session {:?}", session);
        Ok(())
    }

    fn create_swapchain(&mut self) -> PassthroughResult<()> {
        let formats = self.runtime.enumerate_swapchain_formats(self.session)?;
        let format = *formats
            .first()
            .context("Runtime reported no swapchain formats")?;

        let views = self
            .runtime
            .enumerate_view_configuration_views(self.system, xr::ViewConfigurationType::PRIMARY_STEREO)?;
        let view = views
            .first()
            .context("Runtime reported no views for PRIMARY_STEREO")?;

        let layout = SwapchainLayout {
            format,
            width: view.recommended_image_rect_width,
            height: view.recommended_image_rect_height,
            array_size: VIEW_COUNT as u32,
        };

        let info = xr::SwapchainCreateInfo {
            ty: xr::SwapchainCreateInfo::TYPE,
            next: ptr::null(),
            create_flags: xr::SwapchainCreateFlags::EMPTY,
            usage_flags: xr::SwapchainUsageFlags::COLOR_ATTACHMENT | xr::SwapchainUsageFlags::SAMPLED,
            format: layout.format,
            sample_count: 1,
            width: layout.width,
            height: layout.height,
            face_count: 1,
            array_size: layout.array_size,
            mip_count: 1,
        };

        if self.swapchain == xr::Swapchain::NULL {
            self.swapchain = self.runtime.create_swapchain(self.session, &info)?;
            log::info!(
                "Created passthrough swapchain {}x{} format {} ({} slices)",
                layout.width,
                layout.height,
                layout.format,
                layout.array_size
            );
        }

        let textures = self
            .runtime
            .enumerate_swapchain_images(self.swapchain, self.image_type)?;
        self.backend.import_swapchain_images(&textures, &layout)?;
        self.layout = Some(layout);
        Ok(())
    }

    /// Render the camera image for `display_time`.
    ///
    /// Returns `Ok(None)` when there is nothing to show this frame (no camera
    /// image yet, or no valid eye poses).
    pub fn draw_passthrough_layer(
        &mut self,
        display_time: xr::Time,
        source: Option<&ProjectionSource>,
    ) -> PassthroughResult<Option<PassthroughFrame>> {
        if !self.connected {
            return Err(PassthroughError::NotInitialized);
        }
        let camera = self.camera.as_mut().ok_or(PassthroughError::NotInitialized)?;

        let lease = FrameLease::acquire(camera.as_mut());
        if lease.is_none() && !self.backend.has_camera_image() {
            log::trace!("No camera image yet, skipping passthrough");
            return Ok(None);
        }

        let (views, depth) = match source {
            Some(source) => (source.views, source.depth),
            None => match locate_eye_views(self.runtime.as_ref(), self.session, self.view_space, display_time)? {
                Some(views) => (views, None),
                None => {
                    log::debug!("Eye poses not valid, skipping passthrough");
                    return Ok(None);
                },
            },
        };

        let image_index = self.runtime.acquire_swapchain_image(self.swapchain)?;

        let outcome = self
            .runtime
            .wait_swapchain_image(self.swapchain, xr::Duration::INFINITE)
            .and_then(|()| {
                let staged = stage_camera_frame(
                    lease.as_ref().and_then(|lease| lease.frame()),
                    self.backend.as_mut(),
                    &mut self.filter,
                    &mut self.staging,
                    &self.config,
                );
                drop(lease);
                staged
            })
            .and_then(|()| self.render_eyes(image_index, &views, depth));

        let released = self.runtime.release_swapchain_image(self.swapchain);
        outcome?;
        released?;

        Ok(Some(self.output_frame(&views, source)))
    }

    fn render_eyes(
        &mut self,
        image_index: u32,
        views: &[EyeView; VIEW_COUNT],
        depth: Option<DepthRange>,
    ) -> PassthroughResult<()> {
        self.jitter_seed = self.jitter_seed.wrapping_add(1);
        let jitter = projection::jitter(self.jitter_seed, self.config.jitter_amplitude);
        let depth = depth.unwrap_or(DepthRange {
            near_z: self.config.default_near_z,
            far_z: self.config.default_far_z,
        });

        self.backend.begin_draw(image_index)?;
        for eye in Eye::BOTH {
            let mvp = projection::eye_mvp(eye, views, &self.config.calibration, jitter, depth);
            if let Err(e) = self.backend.draw_eye(eye, &mvp) {
                self.backend.abort_draw();
                return Err(e);
            }
        }
        self.backend.end_draw()
    }

    fn output_frame(&self, views: &[EyeView; VIEW_COUNT], source: Option<&ProjectionSource>) -> PassthroughFrame {
        let (width, height) = self
            .layout
            .map(|layout| (layout.width as i32, layout.height as i32))
            .unwrap_or_default();

        let view = |i: usize| xr::CompositionLayerProjectionView {
            ty: xr::CompositionLayerProjectionView::TYPE,
            next: ptr::null(),
            pose: views[i].pose,
            fov: views[i].fov,
            sub_image: xr::SwapchainSubImage {
                swapchain: self.swapchain,
                image_rect: xr::Rect2Di {
                    offset: xr::Offset2Di { x: 0, y: 0 },
                    extent: xr::Extent2Di { width, height },
                },
                image_array_index: i as u32,
            },
        };

        PassthroughFrame {
            space: source.map(|source| source.space).unwrap_or(self.view_space),
            views: [view(0), view(1)],
        }
    }
}

impl Drop for GraphicsResources {
    fn drop(&mut self) {
        if let Err(e) = self.backend.wait_idle() {
            log::warn!("Failed to wait for GPU idle: {}", e);
        }
        self.backend.release_swapchain_images();

        if self.swapchain != xr::Swapchain::NULL {
            if let Err(e) = self.runtime.destroy_swapchain(self.swapchain) {
                log::warn!("{}", e);
            }
            self.swapchain = xr::Swapchain::NULL;
        }

        if self.view_space != xr::Space::NULL {
            if let Err(e) = self.runtime.destroy_space(self.view_space) {
                log::warn!("{}", e);
            }
            self.view_space = xr::Space::NULL;
        }

        log::debug!("Passthrough graphics released");
    }
}

pub fn identity_pose() -> xr::Posef {
    xr::Posef {
        orientation: xr::Quaternionf {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        },
        position: xr::Vector3f {
            x: 0.0,
            y: 0.0,
            z: 0.0,
        },
    }
}

/// Eye poses relative to `space`, or `None` when tracking is not valid.
fn locate_eye_views(
    runtime: &dyn XrRuntime,
    session: xr::Session,
    space: xr::Space,
    display_time: xr::Time,
) -> PassthroughResult<Option<[EyeView; VIEW_COUNT]>> {
    let info = xr::ViewLocateInfo {
        ty: xr::ViewLocateInfo::TYPE,
        next: ptr::null(),
        view_configuration_type: xr::ViewConfigurationType::PRIMARY_STEREO,
        display_time,
        space,
    };

    let (state, views) = runtime.locate_views(session, &info)?;
    let valid = xr::ViewStateFlags::ORIENTATION_VALID | xr::ViewStateFlags::POSITION_VALID;
    if !state.view_state_flags.contains(valid) {
        return Ok(None);
    }
    if views.len() < VIEW_COUNT {
        return Err(PassthroughError::Runtime {
            call: "xrLocateViews",
            result: xr::Result::ERROR_SIZE_INSUFFICIENT,
        });
    }

    let eye = |i: usize| EyeView {
        pose: views[i].pose,
        fov: views[i].fov,
    };
    Ok(Some([eye(0), eye(1)]))
}

/// Strip, check and upload a new camera frame. Without a frame the previous
/// image stays in place.
fn stage_camera_frame(
    frame: Option<&CameraFrame>,
    backend: &mut dyn RenderBackend,
    filter: &mut FrameFilter,
    staging: &mut Vec<u8>,
    config: &LayerConfig,
) -> PassthroughResult<()> {
    let Some(frame) = frame else {
        return Ok(());
    };
    let (width, height) = (frame.width as usize, frame.height as usize);

    let stripped = sample_brightness(
        frame.bytes(),
        width,
        height,
        &config.tag_layout,
        config.frame_filter.sample_stride,
    )
    .and_then(|brightness| match filter.evaluate(brightness, backend.has_camera_image()) {
        FrameDecision::Reuse => {
            log::debug!(
                "Camera frame {} looks corrupted (brightness {:.1}, baseline {:?}), reusing previous",
                frame,
                brightness,
                filter.baseline()
            );
            Ok(false)
        },
        FrameDecision::Accept => {
            copy_untagged_rows(frame.bytes(), width, height, &config.tag_layout, staging)?;
            Ok(true)
        },
    });

    match stripped {
        Ok(true) => backend.upload_camera_image(staging, frame.width, frame.height),
        Ok(false) => Ok(()),
        // A malformed buffer is skipped like a dark one when there is an older image.
        Err(e) if backend.has_camera_image() => {
            log::warn!("Dropping camera frame {}, reusing previous: {}", frame, e);
            Ok(())
        },
        Err(e) => Err(e),
    }
}
