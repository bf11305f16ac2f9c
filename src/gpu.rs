//! Portable device backend on wgpu.
//!
//! [`WgpuLink`] drives pack/unpack between device buffers and halo staging.
//! The strided region transfers are expressed as per-row buffer copies —
//! wgpu has no rectangular buffer copy — batched into a single submit per
//! verb and completed with a blocking poll. The subregion overwrite path
//! runs the gather/scatter compute kernels from [`crate::gpu_shaders`].
//!
//! User buffers handed to the link must be created with
//! `STORAGE | COPY_SRC | COPY_DST` usage.

use std::marker::PhantomData;
use std::mem;

use wgpu::util::DeviceExt;

use crate::error::{HaloError, Result};
use crate::gpu_shaders;
use crate::region::Region;
use crate::scalar::GpuScalar;

const WORKGROUP_SIZE: u32 = 64;

fn workgroup_count(n: u32) -> u32 {
    n.div_ceil(WORKGROUP_SIZE)
}

// Shader Params layout, padded to 16 bytes for uniform binding.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Params {
    count: u32,
    _pad: [u32; 3],
}

/// Device link for the portable backend: a wgpu device/queue pair plus the
/// compiled gather/scatter pipelines for one element type.
pub struct WgpuLink<T> {
    device: wgpu::Device,
    queue: wgpu::Queue,
    gather_pipeline: wgpu::ComputePipeline,
    scatter_pipeline: wgpu::ComputePipeline,
    _elem: PhantomData<T>,
}

impl<T: GpuScalar> WgpuLink<T> {
    /// Create a link on a fresh high-performance adapter.
    pub fn new() -> Result<Self> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|_| HaloError::Device("no GPU adapter found".into()))?;

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("halocline_gpu"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await
            .map_err(|e| HaloError::Device(format!("failed to get GPU device: {e}")))?;

        Ok(Self::from_device(device, queue))
    }

    /// Adopt an existing device and queue (shared with the application's
    /// own compute work).
    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("halocline_shaders"),
            source: wgpu::ShaderSource::Wgsl(gpu_shaders::shader_source(T::WGSL_TYPE).into()),
        });

        let make_pipeline = |entry_point: &str| -> wgpu::ComputePipeline {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(entry_point),
                layout: None,
                module: &shader_module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let gather_pipeline = make_pipeline("gather_indices");
        let scatter_pipeline = make_pipeline("scatter_indices");

        Self {
            device,
            queue,
            gather_pipeline,
            scatter_pipeline,
            _elem: PhantomData,
        }
    }

    /// Allocate a device-resident staging buffer of `len` elements.
    pub(crate) fn alloc_device_staging(&self, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halo_device_staging"),
            size: (len * mem::size_of::<T>()) as u64,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// Gather the region-covered elements of `buf` into host `staging`.
    pub(crate) fn pack(
        &self,
        regions: &[Region],
        buf: &wgpu::Buffer,
        staging: &mut [T],
    ) -> Result<()> {
        let esize = mem::size_of::<T>() as u64;
        let total = staging.len() as u64 * esize;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halo_readback"),
            size: total,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&Default::default());
        let mut cursor = 0u64;
        for region in regions {
            let row_bytes = region.cols as u64 * esize;
            for r in 0..region.rows {
                let row = region.row_start(r) as u64;
                encoder.copy_buffer_to_buffer(buf, row * esize, &readback, cursor, row_bytes);
                cursor += row_bytes;
            }
        }
        self.queue.submit(Some(encoder.finish()));

        let elements = self.read_buffer(&readback)?;
        staging.copy_from_slice(&elements);
        Ok(())
    }

    /// Scatter host `staging` back into the region-covered elements of
    /// `buf`. Blocks until the writes land.
    pub(crate) fn unpack(
        &self,
        regions: &[Region],
        staging: &[T],
        buf: &wgpu::Buffer,
    ) -> Result<()> {
        let esize = mem::size_of::<T>() as u64;
        let mut cursor = 0usize;
        for region in regions {
            for r in 0..region.rows {
                let row = region.row_start(r) as u64;
                self.queue.write_buffer(
                    buf,
                    row * esize,
                    bytemuck::cast_slice(&staging[cursor..cursor + region.cols]),
                );
                cursor += region.cols;
            }
        }
        self.queue.submit(std::iter::empty());
        self.poll_wait()
    }

    /// Device-to-device gather from `buf` into the device staging window
    /// starting at element `offset`.
    pub(crate) fn pack_resident(
        &self,
        regions: &[Region],
        buf: &wgpu::Buffer,
        staging: &wgpu::Buffer,
        offset: usize,
    ) -> Result<()> {
        let esize = mem::size_of::<T>() as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        let mut cursor = offset as u64 * esize;
        for region in regions {
            let row_bytes = region.cols as u64 * esize;
            for r in 0..region.rows {
                let row = region.row_start(r) as u64;
                encoder.copy_buffer_to_buffer(buf, row * esize, staging, cursor, row_bytes);
                cursor += row_bytes;
            }
        }
        self.queue.submit(Some(encoder.finish()));
        self.poll_wait()
    }

    /// Device-to-device scatter from the device staging window starting at
    /// element `offset` back into `buf`.
    pub(crate) fn unpack_resident(
        &self,
        regions: &[Region],
        staging: &wgpu::Buffer,
        offset: usize,
        buf: &wgpu::Buffer,
    ) -> Result<()> {
        let esize = mem::size_of::<T>() as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        let mut cursor = offset as u64 * esize;
        for region in regions {
            let row_bytes = region.cols as u64 * esize;
            for r in 0..region.rows {
                let row = region.row_start(r) as u64;
                encoder.copy_buffer_to_buffer(staging, cursor, buf, row * esize, row_bytes);
                cursor += row_bytes;
            }
        }
        self.queue.submit(Some(encoder.finish()));
        self.poll_wait()
    }

    /// Whole-buffer device-to-device copy of `len` elements (same-rank
    /// staging handoff).
    pub(crate) fn copy_device(
        &self,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        len: usize,
    ) -> Result<()> {
        let bytes = (len * mem::size_of::<T>()) as u64;
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, bytes);
        self.queue.submit(Some(encoder.finish()));
        self.poll_wait()
    }

    /// Run the gather kernel: returns `buf[indices[i]]` for each `i`.
    pub(crate) fn gather_indices(&self, buf: &wgpu::Buffer, indices: &[usize]) -> Result<Vec<T>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let out = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halo_gather_out"),
            size: indices.len() as u64 * mem::size_of::<T>() as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        self.dispatch(&self.gather_pipeline, buf, &out, indices)?;

        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halo_gather_readback"),
            size: indices.len() as u64 * mem::size_of::<T>() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        encoder.copy_buffer_to_buffer(&out, 0, &readback, 0, out.size());
        self.queue.submit(Some(encoder.finish()));

        self.read_buffer(&readback)
    }

    /// Run the scatter kernel: `buf[indices[i]] = values[i]`.
    pub(crate) fn scatter_indices(
        &self,
        buf: &wgpu::Buffer,
        indices: &[usize],
        values: &[T],
    ) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        let src = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("halo_scatter_src"),
                contents: bytemuck::cast_slice(values),
                usage: wgpu::BufferUsages::STORAGE,
            });
        self.dispatch(&self.scatter_pipeline, &src, buf, indices)?;
        self.poll_wait()
    }

    fn dispatch(
        &self,
        pipeline: &wgpu::ComputePipeline,
        src: &wgpu::Buffer,
        dst: &wgpu::Buffer,
        indices: &[usize],
    ) -> Result<()> {
        let index_data: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let index_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("halo_indices"),
                contents: bytemuck::cast_slice(&index_data),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let params = Params {
            count: indices.len() as u32,
            _pad: [0; 3],
        };
        let params_buf = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bg = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: src.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: dst.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: index_buf.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });
        let mut encoder = self.device.create_command_encoder(&Default::default());
        {
            let mut pass = encoder.begin_compute_pass(&Default::default());
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, Some(&bg), &[]);
            pass.dispatch_workgroups(workgroup_count(indices.len() as u32), 1, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    /// Map a MAP_READ buffer and return its contents as elements.
    fn read_buffer(&self, buffer: &wgpu::Buffer) -> Result<Vec<T>> {
        let slice = buffer.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            let _ = sender.send(r);
        });
        self.poll_wait()?;
        receiver
            .recv()
            .map_err(|_| HaloError::Device("GPU readback channel closed".into()))?
            .map_err(|e| HaloError::Device(format!("GPU buffer map failed: {e:?}")))?;

        let data = slice.get_mapped_range();
        // pod_collect_to_vec copies, so the mapped range's alignment does
        // not constrain the element type.
        let result = bytemuck::pod_collect_to_vec(&data[..]);
        drop(data);
        buffer.unmap();
        Ok(result)
    }

    fn poll_wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| HaloError::Device(format!("GPU poll failed: {e:?}")))?;
        Ok(())
    }
}
