//! Host material keys to grid and render material handles.
//!
//! Each snapshot lists the materials it uses. Materials are created the
//! first time a key appears, updated while it keeps appearing, and released
//! once a snapshot stops listing it; released entries leave the map. The
//! default material key always maps to the grid's built-in default
//! material, which is never released. Particle mode registers it even when
//! the snapshot does not list it.

use ahash::AHashMap;
use glam::Vec4;
use plume_kernel::{Grid, GridMaterialHandle, RenderMaterialHandle, RenderMaterialPool, NO_MATERIAL};
use tracing::{debug, warn};

use crate::properties::{MaterialKey, Properties, RenderMaterialKey};

/// Lifecycle of a mapped material during one update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MaterialState {
    /// Listed by the current snapshot
    Created,
    /// Not yet seen in the current snapshot
    PendingRelease,
}

#[derive(Debug)]
struct RenderEntry {
    handle: RenderMaterialHandle,
    state: MaterialState,
}

#[derive(Debug)]
struct MaterialEntry {
    grid: GridMaterialHandle,
    state: MaterialState,
    render: AHashMap<RenderMaterialKey, RenderEntry>,
}

/// Emit material resolution for one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmitMaterials {
    /// Distinct materials referenced by emitters
    pub materials: Vec<GridMaterialHandle>,
    /// Per emitter index into `materials`, or [`NO_MATERIAL`]
    pub indices: Vec<u32>,
}

/// Material mapping of one scene.
#[derive(Debug, Default)]
pub struct MaterialMap {
    entries: AHashMap<MaterialKey, MaterialEntry>,
}

impl MaterialMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Brings grid and render materials in line with `props`.
    pub fn update(&mut self, grid: &mut Grid, pool: &mut RenderMaterialPool, props: &Properties) -> EmitMaterials {
        for entry in self.entries.values_mut() {
            entry.state = MaterialState::PendingRelease;
            for render in entry.render.values_mut() {
                render.state = MaterialState::PendingRelease;
            }
        }

        for (key, material) in &props.materials {
            let entry = self.entries.entry(*key).or_insert_with(|| {
                let handle = if *key == props.default_material_key {
                    grid.default_material()
                } else {
                    grid.create_material(material.grid)
                };
                debug!("Mapped {} to {:?}", key, handle);
                MaterialEntry {
                    grid: handle,
                    state: MaterialState::Created,
                    render: AHashMap::new(),
                }
            });
            entry.state = MaterialState::Created;
            if let Err(e) = grid.set_material_params(entry.grid, material.grid) {
                warn!("Failed to update {key}: {e}");
            }

            for (render_key, params) in &material.render_materials {
                let mut params = params.clone();
                params.material = Some(entry.grid);
                let color_map = resample_color_map(&params.color_map, pool.color_map_resolution());
                let render = entry.render.entry(*render_key).or_insert_with(|| RenderEntry {
                    handle: pool.create(params.clone()),
                    state: MaterialState::Created,
                });
                render.state = MaterialState::Created;
                if let Err(e) = pool.update(render.handle, params) {
                    warn!("Failed to update {render_key}: {e}");
                }
                if let Some(color_map) = color_map {
                    if let Err(e) = pool.set_color_map(render.handle, &color_map) {
                        warn!("Color map of {render_key} rejected: {e}");
                    }
                }
            }
        }

        if props.particle_mode_enabled {
            let entry = self.entries.entry(props.default_material_key).or_insert_with(|| MaterialEntry {
                grid: grid.default_material(),
                state: MaterialState::Created,
                render: AHashMap::new(),
            });
            entry.state = MaterialState::Created;
        }

        let default = grid.default_material();
        self.entries.retain(|key, entry| {
            entry.render.retain(|_, render| {
                let keep = render.state == MaterialState::Created;
                if !keep {
                    pool.release(render.handle);
                }
                keep
            });
            let keep = entry.state == MaterialState::Created;
            if !keep {
                for render in entry.render.values() {
                    pool.release(render.handle);
                }
                if entry.grid != default {
                    grid.release_material(entry.grid);
                }
                debug!("Released {key}");
            }
            keep
        });

        self.resolve_emitters(props)
    }

    fn resolve_emitters(&self, props: &Properties) -> EmitMaterials {
        let mut out = EmitMaterials::default();
        for key in &props.emit_material_keys {
            let handle = key.and_then(|k| self.entries.get(&k)).map(|e| e.grid);
            let index = match handle {
                Some(handle) => match out.materials.iter().position(|m| *m == handle) {
                    Some(i) => i as u32,
                    None => {
                        out.materials.push(handle);
                        (out.materials.len() - 1) as u32
                    },
                },
                None => NO_MATERIAL,
            };
            out.indices.push(index);
        }
        out
    }

    /// Grid material mapped to a key.
    #[must_use]
    pub fn grid_material(&self, key: MaterialKey) -> Option<GridMaterialHandle> {
        self.entries.get(&key).map(|e| e.grid)
    }

    /// Render material mapped to a pair of keys.
    #[must_use]
    pub fn render_material(&self, key: MaterialKey, render: RenderMaterialKey) -> Option<RenderMaterialHandle> {
        self.entries.get(&key)?.render.get(&render).map(|r| r.handle)
    }

    /// Number of mapped materials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Linearly resamples a color map to `resolution` entries.
///
/// Returns `None` for an empty map, which leaves the uploaded map untouched.
fn resample_color_map(source: &[Vec4], resolution: usize) -> Option<Vec<Vec4>> {
    match source.len() {
        0 => None,
        1 => Some(vec![source[0]; resolution]),
        n if n == resolution => Some(source.to_vec()),
        n => Some(
            (0..resolution)
                .map(|i| {
                    let u = if resolution > 1 {
                        i as f32 / (resolution - 1) as f32
                    } else {
                        0.0
                    };
                    let x = u * (n - 1) as f32;
                    let lo = (x.floor() as usize).min(n - 1);
                    let hi = (lo + 1).min(n - 1);
                    source[lo].lerp(source[hi], x - lo as f32)
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::MaterialProperties;
    use plume_kernel::{EmitParams, GridDesc, GridId, RenderMaterialParams, ShapeDesc, DEFAULT_RELEASE_HYSTERESIS};

    fn grid() -> Grid {
        Grid::new(GridId::from_raw(1), GridDesc::default(), DEFAULT_RELEASE_HYSTERESIS).expect("grid")
    }

    fn material_with_render(keys: &[u64]) -> MaterialProperties {
        MaterialProperties {
            render_materials: keys
                .iter()
                .map(|k| (RenderMaterialKey(*k), RenderMaterialParams::default()))
                .collect(),
            ..MaterialProperties::default()
        }
    }

    #[test]
    fn test_create_update_release() {
        let mut grid = grid();
        let mut pool = RenderMaterialPool::new(4);
        let mut map = MaterialMap::new();
        let mut props = Properties::default();
        props.materials = vec![
            (MaterialKey(0), material_with_render(&[1])),
            (MaterialKey(5), material_with_render(&[1, 2])),
        ];

        map.update(&mut grid, &mut pool, &props);
        assert_eq!(map.len(), 2);
        assert_eq!(map.grid_material(MaterialKey(0)), Some(grid.default_material()));
        assert_eq!(grid.materials().len(), 2);
        assert_eq!(pool.len(), 3);

        props.materials.truncate(1);
        map.update(&mut grid, &mut pool, &props);
        assert_eq!(map.len(), 1);
        assert_eq!(grid.materials().len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_render_material_dropped_alone() {
        let mut grid = grid();
        let mut pool = RenderMaterialPool::new(4);
        let mut map = MaterialMap::new();
        let mut props = Properties::default();
        props.materials = vec![(MaterialKey(0), material_with_render(&[1, 2]))];
        map.update(&mut grid, &mut pool, &props);
        let kept = map.render_material(MaterialKey(0), RenderMaterialKey(1));

        props.materials = vec![(MaterialKey(0), material_with_render(&[1]))];
        map.update(&mut grid, &mut pool, &props);
        assert_eq!(map.render_material(MaterialKey(0), RenderMaterialKey(1)), kept);
        assert!(map.render_material(MaterialKey(0), RenderMaterialKey(2)).is_none());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_emitter_indices() {
        let mut grid = grid();
        let mut pool = RenderMaterialPool::new(4);
        let mut map = MaterialMap::new();
        let mut props = Properties::default();
        props.materials = vec![(MaterialKey(3), MaterialProperties::default())];
        let shape = ShapeDesc::Sphere { radius: 1.0 };
        props.push_emitter(shape, EmitParams::default(), Some(MaterialKey(3)));
        props.push_emitter(shape, EmitParams::default(), None);
        props.push_emitter(shape, EmitParams::default(), Some(MaterialKey(3)));
        props.push_emitter(shape, EmitParams::default(), Some(MaterialKey(9)));

        let resolved = map.update(&mut grid, &mut pool, &props);
        assert_eq!(resolved.materials.len(), 1);
        assert_eq!(resolved.indices, vec![0, NO_MATERIAL, 0, NO_MATERIAL]);
    }

    #[test]
    fn test_particle_mode_registers_default() {
        let mut grid = grid();
        let mut pool = RenderMaterialPool::new(4);
        let mut map = MaterialMap::new();
        let props = Properties {
            particle_mode_enabled: true,
            ..Properties::default()
        };
        map.update(&mut grid, &mut pool, &props);
        assert_eq!(map.grid_material(props.default_material_key), Some(grid.default_material()));
        assert_eq!(grid.materials().len(), 1);
    }

    #[test]
    fn test_color_map_resample() {
        let map = resample_color_map(&[Vec4::ZERO, Vec4::ONE], 5).expect("resampled");
        assert_eq!(map.len(), 5);
        assert_eq!(map[2], Vec4::splat(0.5));
        assert!(resample_color_map(&[], 5).is_none());
    }
}
