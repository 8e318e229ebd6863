//! Binary little-endian PLY in the gaussian-splat vertex layout, the
//! portable point-cloud format returned by `/ws/generate-3d-view`.

use arch_types::GaussianCloud;

const PROPERTIES: [&str; 17] = [
    "x", "y", "z", "nx", "ny", "nz", "f_dc_0", "f_dc_1", "f_dc_2", "opacity", "scale_0",
    "scale_1", "scale_2", "rot_0", "rot_1", "rot_2", "rot_3",
];

/// Bytes per encoded vertex.
pub const VERTEX_STRIDE: usize = PROPERTIES.len() * 4;

pub fn header(vertex_count: usize) -> String {
    let mut header = String::from("ply\nformat binary_little_endian 1.0\n");
    header.push_str(&format!("element vertex {vertex_count}\n"));
    for property in PROPERTIES {
        header.push_str("property float ");
        header.push_str(property);
        header.push('\n');
    }
    header.push_str("end_header\n");
    header
}

pub fn encode(cloud: &GaussianCloud) -> Vec<u8> {
    let header = header(cloud.len());
    let mut out = Vec::with_capacity(header.len() + cloud.len() * VERTEX_STRIDE);
    out.extend_from_slice(header.as_bytes());

    for point in &cloud.points {
        let normal = [0f32; 3];
        let values = point
            .position
            .iter()
            .chain(normal.iter())
            .chain(point.color_dc.iter())
            .chain(std::iter::once(&point.opacity))
            .chain(point.scale.iter())
            .chain(point.rotation.iter());
        for value in values {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}
