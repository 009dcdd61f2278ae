//! Model loading: binary STL, ASCII STL and OBJ.
//!
//! Binary STL layout:
//!
//! ```text
//! UINT8[80]    header
//! UINT32       triangle count
//! foreach triangle
//!     REAL32[3] normal (ignored)
//!     REAL32[3] x3 vertices
//!     UINT16    attribute byte count
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{PreviewError, Result};

const HEADER_SIZE: usize = 80;
const TRIANGLE_SIZE: usize = 50;

/// Indexed triangle mesh with flat coordinate storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// Vertex coordinates, `[x0, y0, z0, x1, ...]` (mm).
    pub vertices: Vec<f32>,
    /// Triangle vertex indices, three per triangle.
    pub indices: Vec<u32>,
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    /// Min corner.
    pub min: [f64; 3],
    /// Max corner.
    pub max: [f64; 3],
}

impl Bounds {
    /// Extent along each axis.
    pub fn size(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }
}

/// Detected input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    /// Binary STL.
    StlBinary,
    /// ASCII STL.
    StlAscii,
    /// Wavefront OBJ.
    Obj,
}

impl Mesh {
    /// Number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn vertex(&self, index: u32) -> [f64; 3] {
        let i = index as usize * 3;
        [
            self.vertices[i] as f64,
            self.vertices[i + 1] as f64,
            self.vertices[i + 2] as f64,
        ]
    }

    /// Iterate triangles as vertex triples.
    pub fn triangles(&self) -> impl Iterator<Item = [[f64; 3]; 3]> + '_ {
        self.indices
            .chunks_exact(3)
            .map(|t| [self.vertex(t[0]), self.vertex(t[1]), self.vertex(t[2])])
    }

    /// Bounding box, or `None` for a mesh without vertices.
    pub fn bounds(&self) -> Option<Bounds> {
        if self.vertices.is_empty() {
            return None;
        }

        let mut min = [f64::MAX; 3];
        let mut max = [f64::MIN; 3];
        for v in self.vertices.chunks_exact(3) {
            for axis in 0..3 {
                let c = v[axis] as f64;
                min[axis] = min[axis].min(c);
                max[axis] = max[axis].max(c);
            }
        }
        Some(Bounds { min, max })
    }

    /// Enclosed volume (mm³) from signed tetrahedra; exact for closed meshes.
    pub fn volume(&self) -> f64 {
        self.triangles()
            .map(|[a, b, c]| dot(a, cross(b, c)) / 6.0)
            .sum::<f64>()
            .abs()
    }

    /// Total surface area (mm²).
    pub fn surface_area(&self) -> f64 {
        self.triangles()
            .map(|[a, b, c]| {
                let n = cross(sub(b, a), sub(c, a));
                dot(n, n).sqrt() / 2.0
            })
            .sum()
    }

    fn push_triangle(&mut self, tri: [[f32; 3]; 3]) {
        let base = (self.vertices.len() / 3) as u32;
        for v in tri {
            self.vertices.extend_from_slice(&v);
        }
        self.indices.extend_from_slice(&[base, base + 1, base + 2]);
    }
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Guess the format from content.
pub fn detect_format(bytes: &[u8]) -> Option<ModelFormat> {
    if bytes.len() >= HEADER_SIZE + 4 {
        let count = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]) as usize;
        // Binary files may also start with "solid"; the exact size settles it.
        if count.checked_mul(TRIANGLE_SIZE).map(|n| n + HEADER_SIZE + 4) == Some(bytes.len()) {
            return Some(ModelFormat::StlBinary);
        }
    }

    let text = std::str::from_utf8(bytes).ok()?;
    let trimmed = text.trim_start();
    if trimmed.starts_with("solid") {
        return Some(ModelFormat::StlAscii);
    }
    if text
        .lines()
        .any(|line| line.trim_start().starts_with("v "))
    {
        return Some(ModelFormat::Obj);
    }
    None
}

/// Parse model bytes in any supported format.
pub fn parse_model(bytes: &[u8]) -> Result<Mesh> {
    let mesh = match detect_format(bytes) {
        Some(ModelFormat::StlBinary) => parse_stl_binary(bytes)?,
        Some(ModelFormat::StlAscii) => parse_stl_ascii(&String::from_utf8_lossy(bytes))?,
        Some(ModelFormat::Obj) => parse_obj(&String::from_utf8_lossy(bytes))?,
        None => return Err(PreviewError::UnknownFormat),
    };
    if mesh.triangle_count() == 0 {
        return Err(PreviewError::EmptyMesh);
    }
    Ok(mesh)
}

fn read_vertex(buf: &[u8]) -> [f32; 3] {
    let f = |o: usize| f32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
    [f(0), f(4), f(8)]
}

/// Parse binary STL.
pub fn parse_stl_binary(bytes: &[u8]) -> Result<Mesh> {
    if bytes.len() < HEADER_SIZE + 4 {
        return Err(PreviewError::Truncated {
            expected: 0,
            got: 0,
        });
    }
    let expected = u32::from_le_bytes([bytes[80], bytes[81], bytes[82], bytes[83]]);
    let body = &bytes[HEADER_SIZE + 4..];

    let mut mesh = Mesh::default();
    let mut got = 0;
    for tri in body.chunks_exact(TRIANGLE_SIZE).take(expected as usize) {
        mesh.push_triangle([
            read_vertex(&tri[12..24]),
            read_vertex(&tri[24..36]),
            read_vertex(&tri[36..48]),
        ]);
        got += 1;
    }
    if got < expected {
        return Err(PreviewError::Truncated { expected, got });
    }
    Ok(mesh)
}

fn parse_coords(parts: &[&str], line: usize) -> Result<[f32; 3]> {
    let malformed = |reason: String| PreviewError::Malformed { line, reason };
    if parts.len() < 3 {
        return Err(malformed(format!("expected 3 coordinates, got {}", parts.len())));
    }
    let mut out = [0.0f32; 3];
    for (slot, text) in out.iter_mut().zip(parts) {
        *slot = text
            .parse()
            .map_err(|_| malformed(format!("bad coordinate `{text}`")))?;
    }
    Ok(out)
}

/// Parse ASCII STL. Facets without exactly three vertices are skipped.
pub fn parse_stl_ascii(text: &str) -> Result<Mesh> {
    let mut mesh = Mesh::default();
    let mut in_loop = false;
    let mut corners: Vec<[f32; 3]> = Vec::with_capacity(3);

    for (n, line) in text.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(keyword) = parts.first() else {
            continue;
        };
        match keyword.to_ascii_lowercase().as_str() {
            "outer" => {
                in_loop = true;
                corners.clear();
            }
            "vertex" if in_loop => corners.push(parse_coords(&parts[1..], n + 1)?),
            "endloop" => in_loop = false,
            "endfacet" => {
                if let [a, b, c] = corners[..] {
                    mesh.push_triangle([a, b, c]);
                }
                corners.clear();
            }
            "endsolid" => break,
            _ => {}
        }
    }
    Ok(mesh)
}

fn obj_index(token: &str, vertex_count: usize, line: usize) -> Result<u32> {
    let raw = token.split('/').next().unwrap_or_default();
    let malformed = |reason: String| PreviewError::Malformed { line, reason };
    let n: i64 = raw
        .parse()
        .map_err(|_| malformed(format!("bad face index `{token}`")))?;
    // OBJ indices are 1-based; negative ones count back from the last vertex.
    let resolved = if n < 0 { vertex_count as i64 + n } else { n - 1 };
    if resolved < 0 || resolved >= vertex_count as i64 {
        return Err(malformed(format!("face index {n} out of range")));
    }
    Ok(resolved as u32)
}

/// Parse Wavefront OBJ. Polygons are fan-triangulated.
pub fn parse_obj(text: &str) -> Result<Mesh> {
    let mut mesh = Mesh::default();
    for (n, line) in text.lines().enumerate() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.first().copied() {
            Some("v") => {
                let v = parse_coords(&parts[1..], n + 1)?;
                mesh.vertices.extend_from_slice(&v);
            }
            Some("f") => {
                let count = mesh.vertices.len() / 3;
                let face = parts[1..]
                    .iter()
                    .map(|t| obj_index(t, count, n + 1))
                    .collect::<Result<Vec<u32>>>()?;
                if face.len() < 3 {
                    return Err(PreviewError::Malformed {
                        line: n + 1,
                        reason: "face needs at least 3 vertices".into(),
                    });
                }
                for i in 1..face.len() - 1 {
                    mesh.indices.extend_from_slice(&[face[0], face[i], face[i + 1]]);
                }
            }
            _ => {}
        }
    }
    Ok(mesh)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Closed axis-aligned box from (0,0,0) to `size`.
    pub(crate) fn box_obj(size: [f64; 3]) -> String {
        let [x, y, z] = size;
        format!(
            "o box\n\
             v 0 0 0\nv {x} 0 0\nv {x} {y} 0\nv 0 {y} 0\n\
             v 0 0 {z}\nv {x} 0 {z}\nv {x} {y} {z}\nv 0 {y} {z}\n\
             f 1 3 2\nf 1 4 3\n\
             f 5 6 7\nf 5 7 8\n\
             f 1 2 6\nf 1 6 5\n\
             f 3 4 8\nf 3 8 7\n\
             f 1 5 8\nf 1 8 4\n\
             f 2 3 7\nf 2 7 6\n"
        )
    }

    pub(crate) fn binary_stl(mesh: &Mesh) -> Vec<u8> {
        let mut data = vec![b' '; HEADER_SIZE];
        data[..5].copy_from_slice(b"solid");
        data.extend_from_slice(&(mesh.triangle_count() as u32).to_le_bytes());
        for tri in mesh.triangles() {
            data.extend_from_slice(&[0u8; 12]);
            for v in tri {
                for c in v {
                    data.extend_from_slice(&(c as f32).to_le_bytes());
                }
            }
            data.extend_from_slice(&0u16.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_obj_box() {
        let mesh = parse_model(box_obj([10.0, 20.0, 5.0]).as_bytes()).unwrap();
        assert_eq!(mesh.triangle_count(), 12);
        let bounds = mesh.bounds().unwrap();
        assert_eq!(bounds.size(), [10.0, 20.0, 5.0]);
        assert_relative_eq!(mesh.volume(), 1000.0, epsilon = 1e-6);
        assert_relative_eq!(mesh.surface_area(), 2.0 * (200.0 + 50.0 + 100.0), epsilon = 1e-6);
    }

    #[test]
    fn test_binary_stl_starting_with_solid() {
        let cube = parse_obj(&box_obj([10.0, 10.0, 10.0])).unwrap();
        let bytes = binary_stl(&cube);
        assert_eq!(detect_format(&bytes), Some(ModelFormat::StlBinary));
        let parsed = parse_model(&bytes).unwrap();
        assert_eq!(parsed.triangle_count(), 12);
        assert_relative_eq!(parsed.volume(), 1000.0, epsilon = 1e-3);
    }

    #[test]
    fn test_truncated_binary() {
        let cube = parse_obj(&box_obj([10.0, 10.0, 10.0])).unwrap();
        let mut bytes = binary_stl(&cube);
        bytes[80] = 13;
        bytes.push(0);
        let err = parse_stl_binary(&bytes).unwrap_err();
        assert_eq!(
            err,
            PreviewError::Truncated {
                expected: 13,
                got: 12
            }
        );
    }

    #[test]
    fn test_ascii_stl() {
        let text = "solid tri\n\
                    facet normal 0 0 1\n  outer loop\n\
                    vertex 0 0 0\n    vertex 1 0 0\n    vertex 0 1 0\n\
                    endloop\nendfacet\nendsolid tri\n";
        let mesh = parse_model(text.as_bytes()).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_relative_eq!(mesh.surface_area(), 0.5);
    }

    #[test]
    fn test_ascii_bad_vertex() {
        let text = "solid x\nfacet normal 0 0 1\nouter loop\nvertex 0 zero 0\n";
        let err = parse_model(text.as_bytes()).unwrap_err();
        assert!(matches!(err, PreviewError::Malformed { line: 4, .. }));
    }

    #[test]
    fn test_empty_solid() {
        let err = parse_model(b"solid nothing\nendsolid nothing\n").unwrap_err();
        assert_eq!(err, PreviewError::EmptyMesh);
    }

    #[test]
    fn test_obj_quad_and_negative_indices() {
        let mesh = parse_obj("v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\nf -4 -3/1 -2//1 -1\n").unwrap();
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
        assert!(parse_obj("v 0 0 0\nf 1 2 3\n").is_err());
    }

    #[test]
    fn test_unknown_format() {
        assert_eq!(parse_model(b"PK\x03\x04zip"), Err(PreviewError::UnknownFormat));
    }
}
