/// Dense ownership map of the board.
///
/// Each cell is either unowned or owned by one agent index. Access outside the
/// board is a programming error and panics; use `is_valid` first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grid {
    pub width: i32,
    pub height: i32,
    /// Flat array of cells, indexed by y * width + x.
    cells: Vec<Option<u8>>,
}

impl Grid {
    /// Create an empty grid with every cell unowned.
    pub fn new(width: i32, height: i32) -> Self {
        assert!(width > 0 && height > 0, "grid dimensions must be positive");
        Grid {
            width,
            height,
            cells: vec![None; (width * height) as usize],
        }
    }

    /// Bounds check only.
    pub fn is_valid(&self, x: i32, y: i32) -> bool {
        x >= 0 && x < self.width && y >= 0 && y < self.height
    }

    pub fn get(&self, x: i32, y: i32) -> Option<usize> {
        self.cells[self.index(x, y)].map(usize::from)
    }

    pub fn set(&mut self, x: i32, y: i32, owner: Option<usize>) {
        let idx = self.index(x, y);
        self.cells[idx] = owner.map(|a| a as u8);
    }

    /// Rewrite every cell owned by `old` to `new`. O(width * height).
    pub fn replace_all(&mut self, old: Option<usize>, new: Option<usize>) {
        let old = old.map(|a| a as u8);
        let new = new.map(|a| a as u8);
        for cell in self.cells.iter_mut().filter(|c| **c == old) {
            *cell = new;
        }
    }

    /// Number of cells owned by `agent`.
    pub fn count_owned(&self, agent: usize) -> usize {
        self.cells
            .iter()
            .filter(|c| c.map(usize::from) == Some(agent))
            .count()
    }

    /// Iterate over all owned cells as (x, y, owner).
    pub fn owned_cells(&self) -> impl Iterator<Item = (i32, i32, usize)> + '_ {
        let width = self.width;
        self.cells.iter().enumerate().filter_map(move |(i, c)| {
            c.map(|owner| (i as i32 % width, i as i32 / width, owner as usize))
        })
    }

    fn index(&self, x: i32, y: i32) -> usize {
        assert!(
            self.is_valid(x, y),
            "grid access out of bounds: ({x}, {y}) on {}x{}",
            self.width,
            self.height
        );
        (y * self.width + x) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_grid_is_empty() {
        let g = Grid::new(30, 20);
        assert_eq!(g.width, 30);
        assert_eq!(g.height, 20);
        assert_eq!(g.owned_cells().count(), 0);
        assert_eq!(g.get(0, 0), None);
        assert_eq!(g.get(29, 19), None);
    }

    #[test]
    fn test_is_valid() {
        let g = Grid::new(30, 20);
        assert!(g.is_valid(0, 0));
        assert!(g.is_valid(29, 19));
        assert!(!g.is_valid(-1, 0));
        assert!(!g.is_valid(0, -1));
        assert!(!g.is_valid(30, 0));
        assert!(!g.is_valid(0, 20));
    }

    #[test]
    fn test_set_and_get() {
        let mut g = Grid::new(30, 20);
        g.set(6, 5, Some(0));
        g.set(24, 14, Some(3));
        assert_eq!(g.get(6, 5), Some(0));
        assert_eq!(g.get(24, 14), Some(3));
        g.set(6, 5, None);
        assert_eq!(g.get(6, 5), None);
    }

    #[test]
    fn test_replace_all_only_touches_owner() {
        let mut g = Grid::new(10, 10);
        g.set(1, 1, Some(0));
        g.set(2, 1, Some(0));
        g.set(5, 5, Some(1));
        g.replace_all(Some(0), None);
        assert_eq!(g.get(1, 1), None);
        assert_eq!(g.get(2, 1), None);
        assert_eq!(g.get(5, 5), Some(1));
        assert_eq!(g.count_owned(0), 0);
        assert_eq!(g.count_owned(1), 1);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut a = Grid::new(10, 10);
        a.set(3, 3, Some(2));
        let mut b = a.clone();
        b.set(4, 4, Some(1));
        assert_eq!(a.get(4, 4), None);
        assert_eq!(b.get(3, 3), Some(2));
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_range_access_panics() {
        let g = Grid::new(10, 10);
        let _ = g.get(10, 0);
    }
}
