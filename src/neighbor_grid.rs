use glam::{IVec3, Vec3};

const MIN_CELL_SIZE: f32 = 1.0e-3;
const INVALID_INDEX: usize = usize::MAX;
// Keeps a sparse swarm with one far-flung member from allocating a huge table.
const MAX_CELLS: usize = 1 << 20;

/// Uniform 3D bucket grid over the bounding box of the last rebuild.
///
/// Each cell is a singly linked list threaded through `next`, so a rebuild is
/// two passes over the positions and no per-cell allocation.
pub struct NeighborGrid {
    cell_size: f32,
    origin: Vec3,
    dims: IVec3,
    head: Vec<usize>,
    next: Vec<usize>,
    cached: Vec<Vec3>,
}

impl NeighborGrid {
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size: sanitize_cell_size(cell_size),
            origin: Vec3::ZERO,
            dims: IVec3::ONE,
            head: Vec::new(),
            next: Vec::new(),
            cached: Vec::new(),
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn set_cell_size(&mut self, cell_size: f32) {
        self.cell_size = sanitize_cell_size(cell_size);
    }

    /// Rebuild from `positions`; afterwards point `i` is `positions[i]`.
    /// Non-finite positions are kept out of every cell.
    pub fn rebuild(&mut self, positions: &[Vec3]) {
        self.cached.clear();
        self.cached.extend_from_slice(positions);
        self.next.clear();
        self.next.resize(positions.len(), INVALID_INDEX);

        let (min, max) = positions
            .iter()
            .filter(|p| p.is_finite())
            .fold((Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)), |(lo, hi), p| {
                (lo.min(*p), hi.max(*p))
            });

        if min.x > max.x {
            self.origin = Vec3::ZERO;
            self.dims = IVec3::ONE;
            self.head.clear();
            self.head.push(INVALID_INDEX);
            return;
        }

        let extent = max - min;
        self.origin = min;
        if extent.is_finite() {
            let mut cell_size = self.cell_size;
            while cell_count(extent, cell_size) > MAX_CELLS {
                let doubled = cell_size * 2.0;
                if !doubled.is_finite() {
                    break;
                }
                cell_size = doubled;
            }
            self.cell_size = cell_size;
            self.dims = cell_dims(extent, cell_size);
        } else {
            // Bounds wider than f32 can span: one cell holds everything.
            self.dims = IVec3::ONE;
        }

        self.head.clear();
        self.head.resize(volume(self.dims), INVALID_INDEX);

        for (i, position) in positions.iter().enumerate() {
            if !position.is_finite() {
                continue;
            }
            let cell = self.cell_index(self.cell_of(*position));
            self.next[i] = self.head[cell];
            self.head[cell] = i;
        }
    }

    /// Calls `callback(j)` for every other point within `radius` of point `i`.
    pub fn for_each_neighbor<F>(&self, i: usize, radius: f32, mut callback: F)
    where
        F: FnMut(usize),
    {
        let Some(&center) = self.cached.get(i) else {
            return;
        };
        if !center.is_finite() || self.head.is_empty() {
            return;
        }

        let radius = radius.max(0.0);
        let radius_sq = radius * radius;
        let reach = ((radius / self.cell_size).ceil() as i32).min(self.dims.max_element());
        let base = self.cell_of(center);
        let lo = (base - IVec3::splat(reach)).max(IVec3::ZERO);
        let hi = (base + IVec3::splat(reach)).min(self.dims - IVec3::ONE);

        for cz in lo.z..=hi.z {
            for cy in lo.y..=hi.y {
                for cx in lo.x..=hi.x {
                    let mut candidate = self.head[self.cell_index(IVec3::new(cx, cy, cz))];
                    while candidate != INVALID_INDEX {
                        if candidate != i
                            && self.cached[candidate].distance_squared(center) <= radius_sq
                        {
                            callback(candidate);
                        }
                        candidate = self.next[candidate];
                    }
                }
            }
        }
    }

    fn cell_of(&self, position: Vec3) -> IVec3 {
        ((position - self.origin) / self.cell_size)
            .floor()
            .as_ivec3()
            .clamp(IVec3::ZERO, self.dims - IVec3::ONE)
    }

    fn cell_index(&self, cell: IVec3) -> usize {
        let dims = self.dims.as_uvec3();
        (cell.z as usize * dims.y as usize + cell.y as usize) * dims.x as usize + cell.x as usize
    }
}

fn sanitize_cell_size(cell_size: f32) -> f32 {
    if cell_size.is_finite() {
        cell_size.max(MIN_CELL_SIZE)
    } else {
        MIN_CELL_SIZE
    }
}

fn cell_dims(extent: Vec3, cell_size: f32) -> IVec3 {
    let cells = (extent / cell_size).floor() + Vec3::ONE;
    cells.min(Vec3::splat(MAX_CELLS as f32)).as_ivec3().max(IVec3::ONE)
}

fn cell_count(extent: Vec3, cell_size: f32) -> usize {
    volume(cell_dims(extent, cell_size))
}

fn volume(dims: IVec3) -> usize {
    (dims.x as usize)
        .saturating_mul(dims.y as usize)
        .saturating_mul(dims.z as usize)
}

#[cfg(test)]
mod tests {
    use super::NeighborGrid;
    use glam::Vec3;

    fn sorted_neighbors(grid: &NeighborGrid, i: usize, radius: f32) -> Vec<usize> {
        let mut neighbors = Vec::new();
        grid.for_each_neighbor(i, radius, |j| neighbors.push(j));
        neighbors.sort_unstable();
        neighbors
    }

    #[test]
    fn finds_neighbors_in_known_layout() {
        let positions = vec![
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(1.5, 1.2, 0.0),
            Vec3::new(8.0, 8.0, 8.0),
            Vec3::new(2.7, 1.1, 0.5),
        ];

        let mut grid = NeighborGrid::new(2.0);
        grid.rebuild(&positions);

        assert_eq!(sorted_neighbors(&grid, 0, 2.0), vec![1, 3]);
        assert_eq!(sorted_neighbors(&grid, 2, 2.0), Vec::<usize>::new());
    }

    #[test]
    fn checks_across_cell_boundaries() {
        let positions = vec![
            Vec3::new(1.9, 1.0, 1.0),
            Vec3::new(2.1, 1.0, 1.0),
            Vec3::new(5.0, 5.0, 5.0),
        ];

        let mut grid = NeighborGrid::new(2.0);
        grid.rebuild(&positions);

        assert_eq!(sorted_neighbors(&grid, 0, 0.25), vec![1]);
        assert_eq!(sorted_neighbors(&grid, 1, 0.25), vec![0]);
    }

    #[test]
    fn matches_brute_force_on_negative_coordinates() {
        let positions: Vec<Vec3> = (0..40)
            .map(|i| {
                let t = i as f32;
                Vec3::new((t * 7.3).sin() * 50.0 - 20.0, (t * 1.7).cos() * 5.0, t * -3.0)
            })
            .collect();

        let mut grid = NeighborGrid::new(10.0);
        grid.rebuild(&positions);

        for i in 0..positions.len() {
            let expected: Vec<usize> = (0..positions.len())
                .filter(|&j| j != i && positions[j].distance_squared(positions[i]) <= 625.0)
                .collect();
            assert_eq!(sorted_neighbors(&grid, i, 25.0), expected);
        }
    }

    #[test]
    fn skips_non_finite_points() {
        let positions = vec![Vec3::ZERO, Vec3::splat(f32::NAN), Vec3::X];
        let mut grid = NeighborGrid::new(1.0);
        grid.rebuild(&positions);

        assert_eq!(sorted_neighbors(&grid, 0, 5.0), vec![2]);
        assert!(sorted_neighbors(&grid, 1, 5.0).is_empty());
    }

    #[test]
    fn sparse_layout_stays_bounded() {
        let positions = vec![Vec3::ZERO, Vec3::splat(1.0e7)];
        let mut grid = NeighborGrid::new(1.0);
        grid.rebuild(&positions);

        assert!(grid.cell_size() > 1.0);
        assert_eq!(sorted_neighbors(&grid, 0, 2.0e7), vec![1]);
    }

    #[test]
    fn bounds_too_wide_for_f32_collapse_to_one_cell() {
        let positions = vec![
            Vec3::splat(-3.0e38),
            Vec3::splat(3.0e38),
            Vec3::ZERO,
            Vec3::X,
        ];
        let mut grid = NeighborGrid::new(1.0);
        grid.rebuild(&positions);

        assert_eq!(sorted_neighbors(&grid, 2, 5.0), vec![3]);
        assert!(sorted_neighbors(&grid, 0, 5.0).is_empty());
    }
}
