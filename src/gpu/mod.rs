//! Tiled compute dispatcher (GPU backend).
//!
//! Produces the same result set as the host backend by evaluating the
//! predicate and the annulus count on the device. Each tile runs two
//! passes: a fill pass writes the predicate for the tile plus its
//! outer-radius margin, then a count pass sums the mask for every output
//! cell. Matches come back either through an atomic cursor and result
//! buffer (threshold tested on-device) or as a dense per-cell count grid
//! (threshold tested on the host); the two strategies are interchangeable.
//!
//! Tile dispatch is strictly sequential on the host: every tile ends in a
//! blocking buffer map before the next one starts. All device resources
//! are owned by [`GpuSearcher`] and released when it drops, including on
//! error paths.

mod context;
pub use context::GpuContext;

use wgpu::util::DeviceExt;

use crate::error::SearchError;
use crate::geometry::AnnulusMask;
use crate::search::{Cluster, ClusterSink, SearchParams, WorkerId};
use crate::util::ScopeTimer;

/// Square tile edge, in cells. Searches wider than this are decomposed
/// into a raster of tiles, with a final partial tile absorbing the
/// remainder on each axis.
const TILE_WIDTH: i32 = 2048;

/// Hard cap on the mask side; beyond this the mask grid and per-tile
/// margin no longer fit the tiling geometry.
const MAX_MASK_SIDE: i32 = 1024;

/// Workgroup edge used by every kernel. Must match the WGSL source.
const WORKGROUP_EDGE: u32 = 16;

/// How matches leave the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CountStrategy {
    /// Threshold test on-device; matches appended to a result buffer
    /// through an atomic cursor.
    #[default]
    DeviceFilter,
    /// Unfiltered per-cell counts read back; threshold applied on the
    /// host.
    HostFilter,
}

/// Layout must match `TileUniforms` in the WGSL source.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct TileUniforms {
    origin_x: i32,
    origin_z: i32,
    field_width: u32,
    field_height: u32,
    seed_lo: u32,
    seed_hi: u32,
    radius: u32,
    side: u32,
    threshold: i32,
    tile_width: u32,
    tile_height: u32,
    _pad: u32,
}

/// Layout must match `Match` in `count_filter.wgsl`.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuMatch {
    x: i32,
    z: i32,
    count: u32,
    _pad: u32,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// One device dispatch: a rectangle of output cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TileRect {
    x: i32,
    z: i32,
    w: i32,
    h: i32,
}

/// Decompose the search square into full tiles plus a final partial tile
/// on each axis for whatever the edge division leaves over.
fn tile_raster(range: i32, edge: i32) -> Vec<TileRect> {
    let mut tiles = Vec::new();
    let mut z = -range;
    while z < range {
        let h = (range - z).min(edge);
        let mut x = -range;
        while x < range {
            let w = (range - x).min(edge);
            tiles.push(TileRect { x, z, w, h });
            x += w;
        }
        z += h;
    }
    tiles
}

/// Strategy-specific device buffers for one search.
enum Delivery {
    Filtered {
        cursor: wgpu::Buffer,
        matches: wgpu::Buffer,
        staging_cursor: wgpu::Buffer,
        staging: wgpu::Buffer,
        capacity: u32,
    },
    Dense {
        counts: wgpu::Buffer,
        staging: wgpu::Buffer,
    },
}

/// Per-search resources: the uniform buffer, the predicate and mask
/// buffers, and the strategy's delivery buffers, wired into bind groups.
struct SearchBuffers {
    uniforms: wgpu::Buffer,
    fill_group: wgpu::BindGroup,
    count_group: wgpu::BindGroup,
    delivery: Delivery,
}

/// GPU search backend. Compiles its kernels once at construction; per
/// search it uploads the mask, allocates tile-sized buffers, and walks the
/// tile raster.
pub struct GpuSearcher {
    ctx: GpuContext,
    strategy: CountStrategy,
    fill_pipeline: wgpu::ComputePipeline,
    filter_pipeline: wgpu::ComputePipeline,
    grid_pipeline: wgpu::ComputePipeline,
    fill_layout: wgpu::BindGroupLayout,
    filter_layout: wgpu::BindGroupLayout,
    grid_layout: wgpu::BindGroupLayout,
}

impl GpuSearcher {
    /// Compile and link the compute kernels on `ctx`. A compile failure
    /// surfaces as [`SearchError::Kernel`] with the device's diagnostic.
    pub fn new(ctx: GpuContext, strategy: CountStrategy) -> Result<Self, SearchError> {
        let device = &ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);

        let uniforms_src = include_str!("../shaders/tile_uniforms.wgsl");
        let common_src = include_str!("../shaders/count_common.wgsl");
        let fill_src = format!(
            "{uniforms_src}\n{}",
            include_str!("../shaders/field_fill.wgsl")
        );
        let filter_src = format!(
            "{uniforms_src}\n{common_src}\n{}",
            include_str!("../shaders/count_filter.wgsl")
        );
        let grid_src = format!(
            "{uniforms_src}\n{common_src}\n{}",
            include_str!("../shaders/count_grid.wgsl")
        );

        let fill_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("fill_bind_group_layout"),
            entries: &[uniform_entry(0), storage_entry(1, false)],
        });
        let filter_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("filter_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });
        let grid_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("grid_bind_group_layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });

        let build = |label: &str, source: &str, layout: &wgpu::BindGroupLayout, entry: &str| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            let pipeline_layout =
                device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: &[layout],
                    push_constant_ranges: &[],
                });
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some(entry),
                compilation_options: Default::default(),
                cache: None,
            })
        };

        let fill_pipeline = build("field_fill", &fill_src, &fill_layout, "fill_field");
        let filter_pipeline = build("count_filter", &filter_src, &filter_layout, "count_filter");
        let grid_pipeline = build("count_grid", &grid_src, &grid_layout, "count_grid");

        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(SearchError::Kernel(err.to_string()));
        }

        Ok(GpuSearcher {
            ctx,
            strategy,
            fill_pipeline,
            filter_pipeline,
            grid_pipeline,
            fill_layout,
            filter_layout,
            grid_layout,
        })
    }

    pub fn strategy(&self) -> CountStrategy {
        self.strategy
    }

    /// Run the search, delivering every match from the host thread.
    pub fn search(
        &self,
        params: &SearchParams,
        sink: &dyn ClusterSink,
    ) -> Result<(), SearchError> {
        params.validate()?;
        let side = 2 * params.outer_radius + 1;
        if side > MAX_MASK_SIDE {
            return Err(SearchError::MaskTooLarge {
                side,
                limit: MAX_MASK_SIDE,
            });
        }
        let _t = ScopeTimer::new("gpu search");

        let span = params.span();
        let tile_edge = span.min(TILE_WIDTH);
        let tiles_per_axis = (span as u32).div_ceil(TILE_WIDTH as u32);
        log::info!(
            "gpu search: seed {}, span {span}x{span}, {}x{} tiles on {}",
            params.seed,
            tiles_per_axis,
            tiles_per_axis,
            self.ctx.adapter_name
        );

        let bufs = self.allocate(params, tile_edge)?;

        // Raster order over tiles; each tile blocks on its own readback
        // before the next dispatch, so the shared buffers are never
        // touched concurrently.
        for tile in tile_raster(params.range, TILE_WIDTH) {
            self.run_tile(params, &bufs, tile, sink)?;
        }
        Ok(())
    }

    /// Allocate the per-search buffers, sized for the widest tile.
    fn allocate(&self, params: &SearchParams, tile_edge: i32) -> Result<SearchBuffers, SearchError> {
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);

        let r = params.outer_radius as i64;
        let mask = AnnulusMask::new(params.outer_radius, params.inner_radius);
        let grid = mask.as_grid();

        let field_edge = tile_edge as i64 + 2 * r;
        let field_buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("field_buffer"),
            size: (field_edge * field_edge * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });

        let mask_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("mask_buffer"),
            contents: bytemuck::cast_slice(&grid),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let uniforms = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tile_uniforms"),
            size: std::mem::size_of::<TileUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let capacity = (tile_edge * tile_edge) as u32;
        let delivery = match self.strategy {
            CountStrategy::DeviceFilter => {
                let cursor = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("match_cursor"),
                    size: 4,
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                let matches = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("match_buffer"),
                    size: capacity as u64 * std::mem::size_of::<GpuMatch>() as u64,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                let staging_cursor = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging_cursor"),
                    size: 4,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging_matches"),
                    size: capacity as u64 * std::mem::size_of::<GpuMatch>() as u64,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                Delivery::Filtered {
                    cursor,
                    matches,
                    staging_cursor,
                    staging,
                    capacity,
                }
            }
            CountStrategy::HostFilter => {
                let counts = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("count_buffer"),
                    size: capacity as u64 * 4,
                    usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                let staging = device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("staging_counts"),
                    size: capacity as u64 * 4,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                Delivery::Dense { counts, staging }
            }
        };

        let fill_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fill_bind_group"),
            layout: &self.fill_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniforms.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: field_buf.as_entire_binding(),
                },
            ],
        });

        let count_group = match &delivery {
            Delivery::Filtered {
                cursor, matches, ..
            } => device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("filter_bind_group"),
                layout: &self.filter_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: uniforms.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: field_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2,
                        resource: mask_buf.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 3,
                        resource: cursor.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 4,
                        resource: matches.as_entire_binding(),
                    },
                ],
            }),
            Delivery::Dense { counts, .. } => {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("grid_bind_group"),
                    layout: &self.grid_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: uniforms.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: field_buf.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: mask_buf.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 3,
                            resource: counts.as_entire_binding(),
                        },
                    ],
                })
            }
        };

        if let Some(err) = pollster::block_on(self.ctx.device.pop_error_scope()) {
            return Err(SearchError::Device(format!("buffer allocation: {err}")));
        }

        Ok(SearchBuffers {
            uniforms,
            fill_group,
            count_group,
            delivery,
        })
    }

    /// Dispatch and read back one tile. Any validation error the device
    /// reports for the dispatch aborts the remaining tiles.
    fn run_tile(
        &self,
        params: &SearchParams,
        bufs: &SearchBuffers,
        tile: TileRect,
        sink: &dyn ClusterSink,
    ) -> Result<(), SearchError> {
        let device = &self.ctx.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let result = self.dispatch_tile(params, bufs, tile, sink);
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(SearchError::Device(err.to_string()));
        }
        result
    }

    fn dispatch_tile(
        &self,
        params: &SearchParams,
        bufs: &SearchBuffers,
        tile: TileRect,
        sink: &dyn ClusterSink,
    ) -> Result<(), SearchError> {
        let TileRect { x: tx, z: tz, w: tw, h: th } = tile;
        let r = params.outer_radius;
        let uniforms = TileUniforms {
            origin_x: tx - r,
            origin_z: tz - r,
            field_width: (tw + 2 * r) as u32,
            field_height: (th + 2 * r) as u32,
            seed_lo: params.seed as u32,
            seed_hi: ((params.seed as u64) >> 32) as u32,
            radius: r as u32,
            side: (2 * r + 1) as u32,
            threshold: params.threshold,
            tile_width: tw as u32,
            tile_height: th as u32,
            _pad: 0,
        };
        log::debug!("tile ({tx}, {tz}) {tw}x{th}");

        let queue = &self.ctx.queue;
        queue.write_buffer(&bufs.uniforms, 0, bytemuck::bytes_of(&uniforms));
        if let Delivery::Filtered { cursor, .. } = &bufs.delivery {
            queue.write_buffer(cursor, 0, bytemuck::bytes_of(&0u32));
        }

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("tile_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("field_fill_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.fill_pipeline);
            pass.set_bind_group(0, &bufs.fill_group, &[]);
            pass.dispatch_workgroups(
                uniforms.field_width.div_ceil(WORKGROUP_EDGE),
                uniforms.field_height.div_ceil(WORKGROUP_EDGE),
                1,
            );
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("count_pass"),
                timestamp_writes: None,
            });
            let pipeline = match self.strategy {
                CountStrategy::DeviceFilter => &self.filter_pipeline,
                CountStrategy::HostFilter => &self.grid_pipeline,
            };
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bufs.count_group, &[]);
            pass.dispatch_workgroups(
                uniforms.tile_width.div_ceil(WORKGROUP_EDGE),
                uniforms.tile_height.div_ceil(WORKGROUP_EDGE),
                1,
            );
        }
        match &bufs.delivery {
            Delivery::Filtered {
                cursor,
                staging_cursor,
                ..
            } => encoder.copy_buffer_to_buffer(cursor, 0, staging_cursor, 0, 4),
            Delivery::Dense { counts, staging } => {
                encoder.copy_buffer_to_buffer(counts, 0, staging, 0, (tw * th * 4) as u64)
            }
        }
        queue.submit(Some(encoder.finish()));

        match &bufs.delivery {
            Delivery::Filtered {
                matches,
                staging_cursor,
                staging,
                capacity,
                ..
            } => {
                let raw = self.read_back(staging_cursor, 4)?;
                let found = u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]).min(*capacity);
                if found == 0 {
                    return Ok(());
                }

                let bytes = found as u64 * std::mem::size_of::<GpuMatch>() as u64;
                let mut encoder =
                    self.ctx
                        .device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("match_readback"),
                        });
                encoder.copy_buffer_to_buffer(matches, 0, staging, 0, bytes);
                queue.submit(Some(encoder.finish()));

                let raw = self.read_back(staging, bytes)?;
                // The staging copy is byte-aligned; re-collect into an
                // aligned vector before viewing as match records.
                let hits: Vec<GpuMatch> = bytemuck::pod_collect_to_vec(&raw);
                for hit in &hits {
                    sink.on_cluster(
                        Cluster {
                            x: hit.x,
                            z: hit.z,
                            count: hit.count,
                        },
                        WorkerId(0),
                    );
                }
            }
            Delivery::Dense { staging, .. } => {
                let raw = self.read_back(staging, (tw * th * 4) as u64)?;
                let counts: Vec<u32> = bytemuck::pod_collect_to_vec(&raw);
                for gz in 0..th {
                    for gx in 0..tw {
                        let count = counts[(gz * tw + gx) as usize];
                        if params.matches(count) {
                            sink.on_cluster(
                                Cluster {
                                    x: tx + gx,
                                    z: tz + gz,
                                    count,
                                },
                                WorkerId(0),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Block until `bytes` of `staging` are mapped and return a copy.
    fn read_back(&self, staging: &wgpu::Buffer, bytes: u64) -> Result<Vec<u8>, SearchError> {
        let slice = staging.slice(..bytes);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| SearchError::Device(err.to_string()))?;
        rx.recv()
            .map_err(|_| SearchError::Device("map callback dropped".into()))?
            .map_err(|err| SearchError::Device(err.to_string()))?;

        let data = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(data)
    }
}
