//! Coarse topology: how trees connect across faces, edges and corners.
//!
//! The forest consumes the connectivity as a fixed lookup API. Transform
//! records are expanded once at construction time; `find_face_transform`
//! and friends are plain table lookups with no arithmetic. Only the
//! constructors needed by the tests and drivers are provided; building
//! general topologies is outside the scope of this crate.

use crate::quadrant::Quadrant;
use crate::types::{Coord, TopIdx};

/// Expanded transform across one inter-tree face.
///
/// The layout mirrors the classic nine-integer face transform: tangential
/// axis permutation with per-axis reversal flags and a two-bit code for
/// the normal direction, `2 * (my_face & 1) + (target_face & 1)`.
#[derive(Clone, Copy, Debug)]
pub struct FaceTransform {
    /// The neighboring tree.
    pub ntree: TopIdx,
    /// The matching face of the neighboring tree.
    pub nface: u8,
    /// Tangential axes of this tree's face; entry `D-1` unused in 2D.
    pub my_tang: [u8; 2],
    /// Normal axis of this tree's face.
    pub my_normal: u8,
    /// Tangential axes of the neighbor's face.
    pub target_tang: [u8; 2],
    /// Normal axis of the neighbor's face.
    pub target_normal: u8,
    /// Tangential coordinate reversal flags.
    pub reverse: [bool; 2],
    /// Normal direction code in `0..=3`.
    pub normal_code: u8,
}

impl FaceTransform {
    /// Map a quadrant of this tree (inside or extended across the shared
    /// face) into the neighboring tree's coordinate system.
    pub fn transform_face<const D: usize>(&self, q: &Quadrant<D>) -> Quadrant<D> {
        debug_assert!(q.is_extended());
        let mh = -Quadrant::<D>::len(q.level);
        let root = Quadrant::<D>::ROOT_LEN;
        let rmh = root + mh;
        let mut coords = [0 as Coord; D];
        for i in 0..D - 1 {
            let my = q.coords[self.my_tang[i] as usize];
            coords[self.target_tang[i] as usize] = if self.reverse[i] { rmh - my } else { my };
        }
        let myn = q.coords[self.my_normal as usize];
        coords[self.target_normal as usize] = match self.normal_code {
            0 => mh - myn,
            1 => myn + root,
            2 => myn - root,
            3 => root + rmh - myn,
            _ => unreachable!(),
        };
        let mut r = Quadrant::new(coords, q.level);
        r.data = q.data;
        r
    }
}

/// One tree reachable across a corner, meeting this tree only there.
#[derive(Clone, Copy, Debug)]
pub struct CornerConnection {
    /// The diagonal neighbor tree.
    pub ntree: TopIdx,
    /// The corner of the neighbor that coincides with ours.
    pub ncorner: u8,
}

/// One tree reachable across an edge (3D), meeting this tree only there.
#[derive(Clone, Copy, Debug)]
pub struct EdgeConnection {
    /// The edge-diagonal neighbor tree.
    pub ntree: TopIdx,
    /// The edge of the neighbor that coincides with ours.
    pub nedge: u8,
    /// Whether the edge coordinate runs in the opposite direction.
    pub reversed: bool,
}

impl EdgeConnection {
    /// Map a quadrant near this tree's edge `my_edge` into the
    /// neighbor's coordinate system.
    ///
    /// The transverse offset across the shared edge line is preserved,
    /// so quadrants outside this tree land inside the neighbor and vice
    /// versa; the mapping is its own inverse.
    pub fn transform_edge<const D: usize>(&self, q: &Quadrant<D>, my_edge: u8) -> Quadrant<D> {
        debug_assert!(D == 3);
        let h = Quadrant::<D>::len(q.level);
        let root = Quadrant::<D>::ROOT_LEN;
        let my_axis = (my_edge / 4) as usize;
        let my_sides = my_edge % 4;
        let n_axis = (self.nedge / 4) as usize;
        let n_sides = self.nedge % 4;
        let u = q.coords[my_axis];
        let mut coords = [0 as Coord; D];
        coords[n_axis] = if self.reversed { root - h - u } else { u };

        // Signed offset across the boundary on each transverse axis;
        // zero means touching the edge from outside.
        let mut offs = [0 as Coord; 2];
        let mut k = 0;
        for a in 0..D {
            if a == my_axis {
                continue;
            }
            offs[k] = if my_sides & (1 << k) != 0 {
                q.coords[a] - root
            } else {
                -(q.coords[a] + h)
            };
            k += 1;
        }
        let mut k = 0;
        for a in 0..D {
            if a == n_axis {
                continue;
            }
            coords[a] = if n_sides & (1 << k) != 0 {
                root - h - offs[k]
            } else {
                offs[k]
            };
            k += 1;
        }
        Quadrant::new(coords, q.level)
    }
}

impl<const D: usize> Quadrant<D> {
    /// Move the quadrant onto the given root corner, keeping its level.
    ///
    /// With `inside` the result touches the corner from within the root;
    /// otherwise it is the diagonal exterior quadrant at the corner.
    pub fn transform_corner(&self, corner: usize, inside: bool) -> Self {
        debug_assert!(corner < Self::NUM_CORNERS);
        let h = Self::len(self.level);
        let (lo, hi) = if inside {
            (0, Self::ROOT_LEN - h)
        } else {
            (-h, Self::ROOT_LEN)
        };
        let mut coords = [0 as Coord; D];
        for (a, c) in coords.iter_mut().enumerate() {
            *c = if corner & (1 << a) != 0 { hi } else { lo };
        }
        Self::new(coords, self.level)
    }

    /// Shift the quadrant until it touches the given root corner from
    /// the inside, keeping its level.
    pub fn shift_corner(&self, corner: usize) -> Self {
        self.transform_corner(corner, true)
    }

    /// Project the quadrant onto the interior band along the given root
    /// edge (3D), keeping its level and edge-parallel position.
    pub fn shift_edge(&self, edge: usize) -> Self {
        debug_assert!(D == 3);
        let h = Self::len(self.level);
        let axis = edge / 4;
        let sides = edge % 4;
        let mut coords = [0 as Coord; D];
        coords[axis] = self.coords[axis];
        let mut k = 0;
        for a in 0..D {
            if a == axis {
                continue;
            }
            coords[a] = if sides & (1 << k) != 0 {
                Self::ROOT_LEN - h
            } else {
                0
            };
            k += 1;
        }
        Self::new(coords, self.level)
    }
}

/// The connectivity graph of the forest's trees.
pub struct Connectivity<const D: usize> {
    num_trees: TopIdx,
    /// Per (tree, face): `None` on the domain boundary.
    face_links: Vec<Option<FaceTransform>>,
    /// Per (tree, corner): trees meeting only at that corner.
    corner_links: Vec<Vec<CornerConnection>>,
    /// Per (tree, edge): trees meeting only at that edge; empty in 2D.
    edge_links: Vec<Vec<EdgeConnection>>,
}

impl<const D: usize> Connectivity<D> {
    const NUM_FACES: usize = 2 * D;
    const NUM_CORNERS: usize = 1 << D;

    /// A single tree whose faces all lie on the domain boundary.
    pub fn unit() -> Self {
        Self {
            num_trees: 1,
            face_links: vec![None; Self::NUM_FACES],
            corner_links: vec![Vec::new(); Self::NUM_CORNERS],
            edge_links: vec![Vec::new(); if D == 3 { 12 } else { 0 }],
        }
    }

    /// An axis-aligned, non-periodic grid of unit trees with identity
    /// orientations, tree index `x + nx * (y + ny * z)`.
    pub fn brick(dims: [usize; D]) -> Self {
        assert!(dims.iter().all(|&n| n > 0));
        let num_trees: usize = dims.iter().product();
        let nedges = if D == 3 { 12 } else { 0 };
        let mut conn = Self {
            num_trees: num_trees as TopIdx,
            face_links: vec![None; num_trees * Self::NUM_FACES],
            corner_links: vec![Vec::new(); num_trees * Self::NUM_CORNERS],
            edge_links: vec![Vec::new(); num_trees * nedges],
        };

        let index_of = |grid: [i64; D]| -> Option<usize> {
            let mut idx = 0usize;
            for a in (0..D).rev() {
                if grid[a] < 0 || grid[a] >= dims[a] as i64 {
                    return None;
                }
                idx = idx * dims[a] + grid[a] as usize;
            }
            Some(idx)
        };
        let grid_of = |mut t: usize| -> [i64; D] {
            let mut grid = [0i64; D];
            for a in 0..D {
                grid[a] = (t % dims[a]) as i64;
                t /= dims[a];
            }
            grid
        };

        for t in 0..num_trees {
            let grid = grid_of(t);

            // Face neighbors, identity orientation.
            for face in 0..Self::NUM_FACES {
                let axis = face / 2;
                let dir: i64 = if face % 2 == 0 { -1 } else { 1 };
                let mut ngrid = grid;
                ngrid[axis] += dir;
                if let Some(ntree) = index_of(ngrid) {
                    let nface = (face ^ 1) as u8;
                    let mut tang = [0u8; 2];
                    let mut k = 0;
                    for a in 0..D {
                        if a != axis {
                            tang[k] = a as u8;
                            k += 1;
                        }
                    }
                    conn.face_links[t * Self::NUM_FACES + face] = Some(FaceTransform {
                        ntree: ntree as TopIdx,
                        nface,
                        my_tang: tang,
                        my_normal: axis as u8,
                        target_tang: tang,
                        target_normal: axis as u8,
                        reverse: [false, false],
                        normal_code: (2 * (face & 1) + (nface as usize & 1)) as u8,
                    });
                }
            }

            // Corner neighbors: the fully diagonal cell only.
            for corner in 0..Self::NUM_CORNERS {
                let mut ngrid = grid;
                for a in 0..D {
                    ngrid[a] += if corner & (1 << a) != 0 { 1 } else { -1 };
                }
                if let Some(ntree) = index_of(ngrid) {
                    conn.corner_links[t * Self::NUM_CORNERS + corner].push(CornerConnection {
                        ntree: ntree as TopIdx,
                        ncorner: (corner ^ (Self::NUM_CORNERS - 1)) as u8,
                    });
                }
            }

            // Edge neighbors (3D): diagonal in the two transverse axes.
            if D == 3 {
                for edge in 0..12 {
                    let axis = edge / 4;
                    let sides = edge % 4;
                    let mut ngrid = grid;
                    let mut k = 0;
                    for a in 0..D {
                        if a == axis {
                            continue;
                        }
                        ngrid[a] += if sides & (1 << k) != 0 { 1 } else { -1 };
                        k += 1;
                    }
                    if let Some(ntree) = index_of(ngrid) {
                        conn.edge_links[t * 12 + edge].push(EdgeConnection {
                            ntree: ntree as TopIdx,
                            nedge: (axis * 4 + (sides ^ 3)) as u8,
                            reversed: false,
                        });
                    }
                }
            }
        }

        conn
    }

    /// Number of trees in the forest.
    pub fn num_trees(&self) -> TopIdx {
        self.num_trees
    }

    /// The transform across `face` of `tree`, `None` on the boundary.
    pub fn find_face_transform(&self, tree: TopIdx, face: usize) -> Option<&FaceTransform> {
        self.face_links[tree as usize * Self::NUM_FACES + face].as_ref()
    }

    /// Trees meeting `tree` only at `corner`.
    pub fn find_corner_transform(&self, tree: TopIdx, corner: usize) -> &[CornerConnection] {
        &self.corner_links[tree as usize * Self::NUM_CORNERS + corner]
    }

    /// Trees meeting `tree` only at `edge` (3D).
    pub fn find_edge_transform(&self, tree: TopIdx, edge: usize) -> &[EdgeConnection] {
        debug_assert!(D == 3);
        &self.edge_links[tree as usize * 12 + edge]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unit_is_all_boundary() {
        let conn = Connectivity::<2>::unit();
        for face in 0..4 {
            assert!(conn.find_face_transform(0, face).is_none());
        }
        for corner in 0..4 {
            assert!(conn.find_corner_transform(0, corner).is_empty());
        }
    }

    #[test]
    fn test_two_trees_face_transform() {
        let conn = Connectivity::<2>::brick([2, 1]);
        assert_eq!(conn.num_trees(), 2);

        let ft = conn.find_face_transform(0, 1).expect("interior face");
        assert_eq!(ft.ntree, 1);
        assert_eq!(ft.nface, 0);

        // A quadrant of tree 0 sticking out across its +x face lands at
        // the -x side of tree 1.
        let h = Quadrant::<2>::len(2);
        let root = Quadrant::<2>::ROOT_LEN;
        let q = Quadrant::<2>::new([root, h], 2);
        let r = ft.transform_face(&q);
        assert_eq!(r, Quadrant::<2>::new([0, h], 2));

        // And the inverse direction maps back out.
        let back = conn.find_face_transform(1, 0).unwrap();
        let s = back.transform_face(&r);
        assert_eq!(s, q);
    }

    #[test]
    fn test_face_transform_of_interior_quadrant() {
        // An inside quadrant touching the shared face becomes an extended
        // quadrant of the neighbor.
        let conn = Connectivity::<2>::brick([2, 1]);
        let ft = conn.find_face_transform(0, 1).unwrap();
        let h = Quadrant::<2>::len(3);
        let root = Quadrant::<2>::ROOT_LEN;
        let q = Quadrant::<2>::new([root - h, 0], 3);
        let r = ft.transform_face(&q);
        assert_eq!(r, Quadrant::<2>::new([-h, 0], 3));
        assert!(r.is_extended());
    }

    #[test]
    fn test_brick_corner_links() {
        let conn = Connectivity::<2>::brick([2, 2]);
        // Tree 0 meets tree 3 only at its corner 3.
        let links = conn.find_corner_transform(0, 3);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].ntree, 3);
        assert_eq!(links[0].ncorner, 0);
        // Its other corners touch the boundary or face neighbors.
        assert!(conn.find_corner_transform(0, 0).is_empty());
        assert!(conn.find_corner_transform(0, 1).is_empty());
    }

    #[test]
    fn test_corner_transform_positions() {
        let q = Quadrant::<2>::new([0, 0], 3);
        let h = Quadrant::<2>::len(3);
        let root = Quadrant::<2>::ROOT_LEN;
        let outer = q.transform_corner(3, false);
        assert_eq!(outer, Quadrant::<2>::new([root, root], 3));
        assert!(!outer.is_inside_root() && outer.is_extended());
        // Shifting touches the corner from the inside.
        let inner = q.shift_corner(3);
        assert_eq!(inner, Quadrant::<2>::new([root - h, root - h], 3));
        assert!(inner.is_valid());
    }

    #[test]
    fn test_brick_3d_edge_links() {
        let conn = Connectivity::<3>::brick([2, 2, 1]);
        // Trees 0 and 3 meet only along a z-aligned edge.
        let links = conn.find_edge_transform(0, 11);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].ntree, 3);
        assert_eq!(links[0].nedge, 8);

        let h = Quadrant::<3>::len(2);
        let root = Quadrant::<3>::ROOT_LEN;
        // A quadrant inside tree 0 hugging the edge maps just outside
        // tree 3, and an outside one maps inside; the map inverts itself.
        let q = Quadrant::<3>::new([root - h, root - h, h], 2);
        let r = links[0].transform_edge(&q, 11);
        assert_eq!(r, Quadrant::<3>::new([-h, -h, h], 2));
        let back = conn.find_edge_transform(3, 8)[0];
        assert_eq!(back.ntree, 0);
        assert_eq!(back.transform_edge(&r, 8), q);

        let outside = Quadrant::<3>::new([root, root, h], 2);
        let inside = links[0].transform_edge(&outside, 11);
        assert_eq!(inside, Quadrant::<3>::new([0, 0, h], 2));
    }
}
