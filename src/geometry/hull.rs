//! Incremental 3D convex hull (quickhull) and enclosed volume.
//!
//! Points are snapped onto an integer lattice scaled to the set's largest
//! coordinate, and every above/below test is an exact `i128` determinant on
//! that lattice. The faces visible from a new apex are collected by walking
//! edge adjacency from the face that owns it, so they always form one patch
//! bounded by one horizon loop.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

pub type Point3 = [f64; 3];

/// Lattice steps spanning the largest absolute coordinate (2^30).
const LATTICE_STEPS: f64 = 1_073_741_824.0;

type Lattice = [i64; 3];
type Wide = [i128; 3];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HullError {
    #[error("at least 4 points are required, got {0}")]
    TooFewPoints(usize),

    /// All points lie on a plane, a line or a single location.
    #[error("point set has no 3D extent")]
    Degenerate,
}

/// Closed triangulated convex hull with outward-facing triangles.
#[derive(Debug, Clone)]
pub struct ConvexHull {
    points: Vec<Point3>,
    faces: Vec<[usize; 3]>,
    interior: Point3,
}

#[derive(Debug)]
struct Face {
    vertices: [usize; 3],
    normal: Wide,
    outside: Vec<usize>,
    alive: bool,
}

impl Face {
    fn new(lattice: &[Lattice], vertices: [usize; 3]) -> Self {
        let [a, b, c] = vertices.map(|i| lattice[i]);
        Self {
            vertices,
            normal: wide_cross(wide_sub(b, a), wide_sub(c, a)),
            outside: Vec::new(),
            alive: true,
        }
    }

    /// Positive above the face, zero on its plane.
    fn height(&self, lattice: &[Lattice], p: usize) -> i128 {
        wide_dot(self.normal, wide_sub(lattice[p], lattice[self.vertices[0]]))
    }

    fn edges(&self) -> [(usize, usize); 3] {
        let [a, b, c] = self.vertices;
        [(a, b), (b, c), (c, a)]
    }
}

/// Working state of one hull construction.
struct Builder<'a> {
    lattice: &'a [Lattice],
    faces: Vec<Face>,
    /// Directed edge to the live face that traverses it.
    owner: HashMap<(usize, usize), usize>,
}

impl Builder<'_> {
    fn add_face(&mut self, vertices: [usize; 3]) -> usize {
        let idx = self.faces.len();
        let face = Face::new(self.lattice, vertices);
        for edge in face.edges() {
            self.owner.insert(edge, idx);
        }
        self.faces.push(face);
        idx
    }

    /// Retires a face and hands back its outside set.
    fn remove_face(&mut self, idx: usize) -> Vec<usize> {
        for edge in self.faces[idx].edges() {
            if self.owner.get(&edge) == Some(&idx) {
                self.owner.remove(&edge);
            }
        }
        let face = &mut self.faces[idx];
        face.alive = false;
        std::mem::take(&mut face.outside)
    }

    fn height(&self, face: usize, p: usize) -> i128 {
        self.faces[face].height(self.lattice, p)
    }

    fn neighbor(&self, (a, b): (usize, usize)) -> Option<usize> {
        self.owner.get(&(b, a)).copied()
    }

    /// Puts `point` in the outside set of the first candidate it is above.
    fn assign(&mut self, point: usize, candidates: &[usize]) {
        if let Some(face) = candidates.iter().copied().find(|&f| self.height(f, point) > 0) {
            self.faces[face].outside.push(point);
        }
    }

    fn furthest_outside(&self, face: usize) -> usize {
        let f = &self.faces[face];
        f.outside
            .iter()
            .copied()
            .max_by_key(|&p| f.height(self.lattice, p))
            .unwrap_or(f.vertices[0])
    }

    /// Faces `apex` is strictly above, reached across shared edges from `seed`.
    fn visible_region(&self, seed: usize, apex: usize) -> Vec<usize> {
        let mut region = vec![seed];
        let mut checked = HashSet::from([seed]);
        let mut stack = vec![seed];

        while let Some(face) = stack.pop() {
            for edge in self.faces[face].edges() {
                let Some(next) = self.neighbor(edge) else {
                    continue;
                };
                if checked.insert(next) && self.height(next, apex) > 0 {
                    region.push(next);
                    stack.push(next);
                }
            }
        }
        region
    }

    /// Edges of the region whose opposite face stays on the hull.
    fn horizon(&self, region: &[usize]) -> Vec<(usize, usize)> {
        let inside: HashSet<usize> = region.iter().copied().collect();
        region
            .iter()
            .flat_map(|&face| self.faces[face].edges())
            .filter(|&edge| !self.neighbor(edge).is_some_and(|n| inside.contains(&n)))
            .collect()
    }

    /// Adds the furthest point above `seed`, returning the faces created.
    fn expand(&mut self, seed: usize) -> Vec<usize> {
        let apex = self.furthest_outside(seed);
        let region = self.visible_region(seed, apex);
        let horizon = self.horizon(&region);

        let mut orphans = Vec::new();
        for &face in &region {
            orphans.extend(self.remove_face(face));
        }

        let created: Vec<usize> = horizon
            .into_iter()
            .map(|(a, b)| self.add_face([a, b, apex]))
            .collect();

        for point in orphans {
            if point != apex {
                self.assign(point, &created);
            }
        }
        created
    }
}

impl ConvexHull {
    /// Builds the hull of `points`.
    ///
    /// # Errors
    ///
    /// Returns error for fewer than 4 points or a set without 3D extent.
    pub fn build(points: &[Point3]) -> Result<Self, HullError> {
        if points.len() < 4 {
            return Err(HullError::TooFewPoints(points.len()));
        }

        let lattice = snap_to_lattice(points)?;
        let simplex = initial_simplex(&lattice)?;
        let interior = scale(
            simplex.iter().fold([0.0; 3], |acc, &i| add(acc, points[i])),
            0.25,
        );

        let mut builder = Builder {
            lattice: &lattice,
            faces: Vec::new(),
            owner: HashMap::new(),
        };

        let [s0, s1, s2, s3] = simplex;
        for ([a, b, c], opposite) in [
            ([s0, s1, s2], s3),
            ([s0, s1, s3], s2),
            ([s0, s2, s3], s1),
            ([s1, s2, s3], s0),
        ] {
            let vertices = if Face::new(&lattice, [a, b, c]).height(&lattice, opposite) > 0 {
                [a, c, b]
            } else {
                [a, b, c]
            };
            builder.add_face(vertices);
        }

        let base = [0, 1, 2, 3];
        for point in (0..points.len()).filter(|i| !simplex.contains(i)) {
            builder.assign(point, &base);
        }

        let mut pending: Vec<usize> = base
            .into_iter()
            .filter(|&f| !builder.faces[f].outside.is_empty())
            .collect();
        while let Some(face) = pending.pop() {
            if !builder.faces[face].alive || builder.faces[face].outside.is_empty() {
                continue;
            }
            let created = builder.expand(face);
            pending.extend(
                created
                    .into_iter()
                    .filter(|&f| !builder.faces[f].outside.is_empty()),
            );
        }

        Ok(Self {
            points: points.to_vec(),
            faces: builder
                .faces
                .into_iter()
                .filter(|f| f.alive)
                .map(|f| f.vertices)
                .collect(),
            interior,
        })
    }

    /// Enclosed volume, in the cube of the input units.
    pub fn volume(&self) -> f64 {
        let o = self.interior;
        let six_v: f64 = self
            .faces
            .iter()
            .map(|&[a, b, c]| {
                let [a, b, c] = [a, b, c].map(|i| sub(self.points[i], o));
                dot(a, cross(b, c))
            })
            .sum();
        six_v.abs() / 6.0
    }

    /// Counter-clockwise triangles seen from outside, as indices into `points`.
    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }
}

/// Hull volume, or 0.0 when no hull exists.
pub fn convex_hull_volume(points: &[Point3]) -> f64 {
    ConvexHull::build(points).map_or(0.0, |hull| hull.volume())
}

fn snap_to_lattice(points: &[Point3]) -> Result<Vec<Lattice>, HullError> {
    let max_abs = points
        .iter()
        .flatten()
        .fold(0.0f64, |m, v| m.max(v.abs()));
    if !max_abs.is_finite() || max_abs <= 0.0 {
        return Err(HullError::Degenerate);
    }

    let step = max_abs / LATTICE_STEPS;
    Ok(points
        .iter()
        .map(|p| p.map(|v| (v / step).round() as i64))
        .collect())
}

fn initial_simplex(lattice: &[Lattice]) -> Result<[usize; 4], HullError> {
    let mut extremes = Vec::with_capacity(6);
    for axis in 0..3 {
        let key = |&i: &usize| lattice[i][axis];
        let indices = 0..lattice.len();
        if let (Some(lo), Some(hi)) = (indices.clone().min_by_key(key), indices.max_by_key(key)) {
            extremes.push(lo);
            extremes.push(hi);
        }
    }

    let mut best = (0, 0, 0i128);
    for (n, &i) in extremes.iter().enumerate() {
        for &j in &extremes[n + 1..] {
            let d = wide_sub(lattice[j], lattice[i]);
            let len2 = wide_dot(d, d);
            if len2 > best.2 {
                best = (i, j, len2);
            }
        }
    }
    let (i0, i1, span) = best;
    if span == 0 {
        return Err(HullError::Degenerate);
    }

    let dir = wide_sub(lattice[i1], lattice[i0]);
    let off_line = |p: usize| wide_cross(dir, wide_sub(lattice[p], lattice[i0]));
    let i2 = (0..lattice.len())
        .max_by(|&a, &b| magnitude(off_line(a)).total_cmp(&magnitude(off_line(b))))
        .unwrap_or(i0);
    if off_line(i2) == [0; 3] {
        return Err(HullError::Degenerate);
    }

    let base = Face::new(lattice, [i0, i1, i2]);
    let i3 = (0..lattice.len())
        .max_by_key(|&p| base.height(lattice, p).abs())
        .unwrap_or(i0);
    if base.height(lattice, i3) == 0 {
        return Err(HullError::Degenerate);
    }

    Ok([i0, i1, i2, i3])
}

fn wide_sub(a: Lattice, b: Lattice) -> Wide {
    [0, 1, 2].map(|k| i128::from(a[k]) - i128::from(b[k]))
}

fn wide_dot(a: Wide, b: Wide) -> i128 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn wide_cross(a: Wide, b: Wide) -> Wide {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Squared length in floating point; the exact value can exceed `i128`.
fn magnitude(v: Wide) -> f64 {
    v.iter().map(|&c| (c as f64) * (c as f64)).sum()
}

fn add(a: Point3, b: Point3) -> Point3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn sub(a: Point3, b: Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn scale(a: Point3, s: f64) -> Point3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn dot(a: Point3, b: Point3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: Point3, b: Point3) -> Point3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
