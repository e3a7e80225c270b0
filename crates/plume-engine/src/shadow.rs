//! Shadow light selection and light-space matrices.
//!
//! Light space looks down +X, the host convention for lights. The shadow
//! view swizzles it so the light looks down +Z, then the projection maps
//! the grid bounds into clip space with depth in `[0, 1]`.

use glam::{Mat4, Vec3, Vec4};
use plume_common::Aabb;
use serde::{Deserialize, Serialize};

/// Kind of light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightType {
    /// Parallel rays
    Directional,
    /// Cone
    Spot,
    /// Omnidirectional
    Point,
    /// Area
    Rect,
}

/// One light of the host scene.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneLight {
    /// Light kind
    pub light_type: LightType,
    /// World to light space, light looking down +X
    pub world_to_light: Mat4,
    /// Spot cone half angle in radians
    pub outer_cone_angle: f32,
    /// Attenuation radius
    pub radius: f32,
    /// Whether the light casts grid shadows
    pub shadow_enabled: bool,
    /// Shadow channel the light serves
    pub shadow_channel: u32,
}

impl SceneLight {
    /// A directional light shining along `direction`.
    #[must_use]
    pub fn directional(direction: Vec3) -> Self {
        Self {
            light_type: LightType::Directional,
            world_to_light: look_along_x(Vec3::ZERO, direction),
            outer_cone_angle: 0.0,
            radius: f32::MAX,
            shadow_enabled: true,
            shadow_channel: 0,
        }
    }

    /// A spot light at `position` shining along `direction`.
    #[must_use]
    pub fn spot(position: Vec3, direction: Vec3, outer_cone_angle: f32, radius: f32) -> Self {
        Self {
            light_type: LightType::Spot,
            world_to_light: look_along_x(position, direction),
            outer_cone_angle,
            radius,
            shadow_enabled: true,
            shadow_channel: 0,
        }
    }
}

/// World to light space for a light at `position` looking along `direction`.
fn look_along_x(position: Vec3, direction: Vec3) -> Mat4 {
    let forward = direction.try_normalize().unwrap_or(Vec3::X);
    let helper = if forward.z.abs() < 0.999 { Vec3::Z } else { Vec3::Y };
    let right = helper.cross(forward).normalize();
    let up = forward.cross(right);
    let light_to_world = Mat4::from_cols(
        forward.extend(0.0),
        right.extend(0.0),
        up.extend(0.0),
        position.extend(1.0),
    );
    light_to_world.inverse()
}

/// Lights visible to a frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LightEnvironment {
    /// Scene lights in priority order
    pub lights: Vec<SceneLight>,
    /// Sun used when no light matches a grid's shadow channel
    pub default_directional: Option<SceneLight>,
}

impl LightEnvironment {
    /// The light shadowing a grid on `shadow_channel`: the first enabled
    /// light on that channel, else the default directional light.
    #[must_use]
    pub fn select_shadow_light(&self, shadow_channel: u32) -> Option<SceneLight> {
        self.lights
            .iter()
            .find(|l| l.shadow_enabled && l.shadow_channel == shadow_channel)
            .copied()
            .or(self.default_directional)
    }
}

/// Light-space frustum fitted around a grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowFrustum {
    /// World to shadow view
    pub view: Mat4,
    /// Shadow view to clip
    pub projection: Mat4,
    /// False when the grid lies outside the light; the update is skipped
    pub valid: bool,
}

/// Swaps light +X forward into view +Z forward.
const LIGHT_SWIZZLE: Mat4 = Mat4::from_cols(
    Vec4::new(0.0, 0.0, 1.0, 0.0),
    Vec4::new(1.0, 0.0, 0.0, 0.0),
    Vec4::new(0.0, 1.0, 0.0, 0.0),
    Vec4::new(0.0, 0.0, 0.0, 1.0),
);

/// Fits a shadow frustum for `light` around `bounds`.
///
/// Only directional and spot lights cast grid shadows.
#[must_use]
pub fn shadow_frustum(light: &SceneLight, bounds: &Aabb, frustum_scale: f32, near_distance: f32) -> Option<ShadowFrustum> {
    let view = LIGHT_SWIZZLE * light.world_to_light;
    match light.light_type {
        LightType::Directional => Some(directional_frustum(view, bounds, frustum_scale)),
        LightType::Spot => Some(spot_frustum(view, bounds, light, near_distance)),
        LightType::Point | LightType::Rect => None,
    }
}

fn directional_frustum(mut view: Mat4, bounds: &Aabb, frustum_scale: f32) -> ShadowFrustum {
    // Centered on the box; rotation only.
    view.w_axis = (-view.transform_vector3(bounds.center())).extend(1.0);

    let extent = bounds.half_size();
    let row = |i: usize| view.row(i).truncate().abs().dot(extent) * frustum_scale;
    let (ex, ey, ez) = (row(0), row(1), row(2));

    let projection = Mat4::from_cols(
        Vec4::new(1.0 / ex, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 1.0 / ey, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 0.5 / ez, 0.0),
        Vec4::new(0.0, 0.0, 0.5, 1.0),
    );
    ShadowFrustum {
        view,
        projection,
        valid: ex > 0.0 && ey > 0.0 && ez > 0.0,
    }
}

/// Corner pairs along the box edges; corner bits are `x << 2 | y << 1 | z`.
const BOX_EDGES: [(usize, usize); 12] = [
    (0, 1),
    (1, 3),
    (3, 2),
    (2, 0),
    (4, 5),
    (5, 7),
    (7, 6),
    (6, 4),
    (0, 4),
    (1, 5),
    (2, 6),
    (3, 7),
];

fn spot_frustum(view: Mat4, bounds: &Aabb, light: &SceneLight, near_distance: f32) -> ShadowFrustum {
    let corners: [Vec3; 8] = std::array::from_fn(|i| {
        view.transform_point3(Vec3::new(
            if i & 4 == 0 { bounds.max.x } else { bounds.min.x },
            if i & 2 == 0 { bounds.max.y } else { bounds.min.y },
            if i & 1 == 0 { bounds.max.z } else { bounds.min.z },
        ))
    });

    let min_z = near_distance.max(f32::EPSILON);
    let max_z = light.radius;
    let tan = light.outer_cone_angle.tan();

    let mut lo = Vec3::splat(f32::MAX);
    let mut hi = Vec3::splat(f32::MIN);
    for c in corners.iter().filter(|c| c.z >= min_z) {
        let p = Vec3::new(c.x / c.z, c.y / c.z, c.z);
        lo = lo.min(p);
        hi = hi.max(p);
    }
    // Edges crossing the near plane contribute their crossing point.
    for (a, b) in BOX_EDGES {
        let (a, b) = (corners[a], corners[b]);
        let da = a.z - min_z;
        let db = min_z - b.z;
        if da * db > 0.0 {
            let crossing = a * (db / (a.z - b.z)) + b * (da / (a.z - b.z));
            let p = Vec3::new(crossing.x / min_z, crossing.y / min_z, min_z);
            lo = lo.min(p);
            hi = hi.max(p);
        }
    }

    let light_lo = Vec3::new(-tan, -tan, min_z);
    let light_hi = Vec3::new(tan, tan, max_z);
    let mut lo = lo.clamp(light_lo, light_hi);
    let mut hi = hi.clamp(light_lo, light_hi);
    let valid = hi.cmpgt(lo).all();
    if !valid {
        lo = light_lo;
        hi = light_hi;
    }

    let x_sum = hi.x + lo.x;
    let y_sum = hi.y + lo.y;
    let xf = 1.0 / (hi.x - lo.x);
    let yf = 1.0 / (hi.y - lo.y);
    let zf = hi.z / (hi.z - lo.z);
    let projection = Mat4::from_cols(
        Vec4::new(2.0 * xf, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 2.0 * yf, 0.0, 0.0),
        Vec4::new(-x_sum * xf, -y_sum * yf, zf, 1.0),
        Vec4::new(0.0, 0.0, -lo.z * zf, 0.0),
    );
    ShadowFrustum { view, projection, valid }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn in_clip(frustum: &ShadowFrustum, p: Vec3) -> bool {
        let c = (frustum.projection * frustum.view).project_point3(p);
        c.x.abs() <= 1.0 + 1e-4 && c.y.abs() <= 1.0 + 1e-4 && (-1e-4..=1.0 + 1e-4).contains(&c.z)
    }

    #[test]
    fn test_select_prefers_matching_channel() {
        let mut other = SceneLight::directional(Vec3::NEG_Z);
        other.shadow_channel = 1;
        let spot = SceneLight::spot(Vec3::Z * 5.0, Vec3::NEG_Z, 0.5, 20.0);
        let env = LightEnvironment {
            lights: vec![other, spot],
            default_directional: Some(SceneLight::directional(Vec3::NEG_Y)),
        };
        assert_eq!(env.select_shadow_light(0).map(|l| l.light_type), Some(LightType::Spot));
        assert_eq!(env.select_shadow_light(1), Some(other));
        assert_eq!(env.select_shadow_light(7), env.default_directional);
    }

    #[test]
    fn test_point_lights_cast_no_grid_shadow() {
        let light = SceneLight {
            light_type: LightType::Point,
            ..SceneLight::directional(Vec3::X)
        };
        let bounds = Aabb::from_center_half_size(Vec3::ZERO, Vec3::ONE);
        assert!(shadow_frustum(&light, &bounds, 1.0, 0.1).is_none());
    }

    #[test]
    fn test_spot_behind_light_is_invalid() {
        let light = SceneLight::spot(Vec3::ZERO, Vec3::X, 0.5, 10.0);
        let bounds = Aabb::from_center_half_size(Vec3::new(-5.0, 0.0, 0.0), Vec3::ONE);
        let frustum = shadow_frustum(&light, &bounds, 1.0, 0.1).expect("spot");
        assert!(!frustum.valid);
    }

    #[test]
    fn test_spot_encloses_box_in_cone() {
        let light = SceneLight::spot(Vec3::ZERO, Vec3::X, 0.8, 50.0);
        let bounds = Aabb::from_center_half_size(Vec3::new(10.0, 0.0, 0.0), Vec3::ONE);
        let frustum = shadow_frustum(&light, &bounds, 1.0, 0.1).expect("spot");
        assert!(frustum.valid);
        assert!(in_clip(&frustum, bounds.center()));
        assert!(in_clip(&frustum, bounds.min));
        assert!(in_clip(&frustum, bounds.max));
    }

    proptest! {
        #[test]
        fn prop_directional_encloses_box(
            dir in prop::array::uniform3(-1.0f32..1.0),
            center in prop::array::uniform3(-50.0f32..50.0),
            half in prop::array::uniform3(0.1f32..10.0),
        ) {
            let dir = Vec3::from(dir);
            prop_assume!(dir.length() > 0.1);
            let light = SceneLight::directional(dir);
            let bounds = Aabb::from_center_half_size(Vec3::from(center), Vec3::from(half));
            let frustum = shadow_frustum(&light, &bounds, 1.0, 0.1).expect("directional");
            prop_assert!(frustum.valid);
            for i in 0..8 {
                let corner = Vec3::new(
                    if i & 1 == 0 { bounds.min.x } else { bounds.max.x },
                    if i & 2 == 0 { bounds.min.y } else { bounds.max.y },
                    if i & 4 == 0 { bounds.min.z } else { bounds.max.z },
                );
                prop_assert!(in_clip(&frustum, corner));
            }
        }
    }
}
