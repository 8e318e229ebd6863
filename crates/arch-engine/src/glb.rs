//! Minimal binary glTF 2.0 writer for vertex-coloured triangle meshes.

use serde_json::json;

const GLB_MAGIC: u32 = 0x4654_6C67;
const CHUNK_JSON: u32 = 0x4E4F_534A;
const CHUNK_BIN: u32 = 0x004E_4942;

/// Float component type / array buffer targets from the glTF spec.
const FLOAT: u32 = 5126;
const UNSIGNED_INT: u32 = 5125;
const ARRAY_BUFFER: u32 = 34962;
const ELEMENT_ARRAY_BUFFER: u32 = 34963;

pub struct TriangleMesh {
    pub positions: Vec<[f32; 3]>,
    /// Linear RGBA per vertex.
    pub colors: Vec<[f32; 4]>,
    pub indices: Vec<u32>,
}

impl TriangleMesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Axis-aligned box with 12 triangles, every vertex coloured `color`.
    pub fn cuboid(min: [f32; 3], max: [f32; 3], color: [f32; 4]) -> Self {
        let positions = (0..8)
            .map(|corner| {
                [
                    if corner & 1 == 0 { min[0] } else { max[0] },
                    if corner & 2 == 0 { min[1] } else { max[1] },
                    if corner & 4 == 0 { min[2] } else { max[2] },
                ]
            })
            .collect();
        #[rustfmt::skip]
        let indices = vec![
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
        ];
        Self {
            positions,
            colors: vec![color; 8],
            indices,
        }
    }
}

/// Serialize `mesh` as a single-node GLB. `extras` is attached to the asset.
pub fn write_glb(mesh: &TriangleMesh, extras: serde_json::Value) -> Vec<u8> {
    let mut bin = Vec::new();
    for p in &mesh.positions {
        for v in p {
            bin.extend_from_slice(&v.to_le_bytes());
        }
    }
    let positions_len = bin.len();
    for c in &mesh.colors {
        for v in c {
            bin.extend_from_slice(&v.to_le_bytes());
        }
    }
    let colors_len = bin.len() - positions_len;
    for i in &mesh.indices {
        bin.extend_from_slice(&i.to_le_bytes());
    }
    let indices_len = bin.len() - positions_len - colors_len;
    pad_to_four(&mut bin, 0);

    let (min, max) = bounds(&mesh.positions);
    let document = json!({
        "asset": { "version": "2.0", "generator": "arch-engine", "extras": extras },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{
            "primitives": [{
                "attributes": { "POSITION": 0, "COLOR_0": 1 },
                "indices": 2,
                "mode": 4
            }]
        }],
        "accessors": [
            { "bufferView": 0, "componentType": FLOAT, "count": mesh.positions.len(),
              "type": "VEC3", "min": min, "max": max },
            { "bufferView": 1, "componentType": FLOAT, "count": mesh.colors.len(), "type": "VEC4" },
            { "bufferView": 2, "componentType": UNSIGNED_INT, "count": mesh.indices.len(), "type": "SCALAR" }
        ],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": positions_len, "target": ARRAY_BUFFER },
            { "buffer": 0, "byteOffset": positions_len, "byteLength": colors_len, "target": ARRAY_BUFFER },
            { "buffer": 0, "byteOffset": positions_len + colors_len, "byteLength": indices_len,
              "target": ELEMENT_ARRAY_BUFFER }
        ],
        "buffers": [{ "byteLength": bin.len() }]
    });

    let mut json_chunk = document.to_string().into_bytes();
    pad_to_four(&mut json_chunk, b' ');

    let total = 12 + 8 + json_chunk.len() + 8 + bin.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_chunk);
    out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_BIN.to_le_bytes());
    out.extend_from_slice(&bin);
    out
}

fn pad_to_four(bytes: &mut Vec<u8>, fill: u8) {
    while bytes.len() % 4 != 0 {
        bytes.push(fill);
    }
}

fn bounds(positions: &[[f32; 3]]) -> ([f32; 3], [f32; 3]) {
    let mut min = [f32::MAX; 3];
    let mut max = [f32::MIN; 3];
    for p in positions {
        for axis in 0..3 {
            min[axis] = min[axis].min(p[axis]);
            max[axis] = max[axis].max(p[axis]);
        }
    }
    if positions.is_empty() {
        return ([0.0; 3], [0.0; 3]);
    }
    (min, max)
}
