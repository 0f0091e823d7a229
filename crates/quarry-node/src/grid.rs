//! Grid geometry checks applied before any move touches state.

use std::collections::HashSet;

use quarry_protocol::Coordinate;

use crate::error::GameError;
use crate::registrar::GridConfig;

/// Pure, stateless board predicates.
pub trait GridValidator: Send + Sync {
    /// In bounds and not a wall.
    fn is_valid_move(&self, coord: Coordinate) -> bool;

    /// At most one orthogonal step from `prev`.
    fn is_not_teleporting(&self, prev: Coordinate, next: Coordinate) -> bool {
        prev.manhattan(next) <= 1
    }
}

/// Rectangular board with wall cells.
#[derive(Debug, Clone)]
pub struct WalledGrid {
    width: i32,
    height: i32,
    walls: HashSet<Coordinate>,
}

impl WalledGrid {
    pub fn new(width: i32, height: i32, walls: impl IntoIterator<Item = Coordinate>) -> Self {
        Self {
            width,
            height,
            walls: walls.into_iter().collect(),
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(config.width, config.height, config.walls.iter().copied())
    }
}

impl GridValidator for WalledGrid {
    fn is_valid_move(&self, coord: Coordinate) -> bool {
        (0..self.width).contains(&coord.x)
            && (0..self.height).contains(&coord.y)
            && !self.walls.contains(&coord)
    }
}

/// Run both predicates; `prev` is `None` when the mover's position is unknown.
pub fn check_move(
    grid: &dyn GridValidator,
    prev: Option<Coordinate>,
    next: Coordinate,
) -> Result<(), GameError> {
    if !grid.is_valid_move(next) {
        return Err(GameError::InvalidMove {
            coord: next,
            reason: "out of bounds or wall",
        });
    }
    if let Some(prev) = prev {
        if !grid.is_not_teleporting(prev, next) {
            return Err(GameError::InvalidMove {
                coord: next,
                reason: "teleport",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> WalledGrid {
        WalledGrid::new(5, 5, [Coordinate::new(2, 2)])
    }

    #[test]
    fn bounds_and_walls() {
        let g = grid();
        assert!(g.is_valid_move(Coordinate::new(0, 0)));
        assert!(g.is_valid_move(Coordinate::new(4, 4)));
        assert!(!g.is_valid_move(Coordinate::new(5, 0)));
        assert!(!g.is_valid_move(Coordinate::new(0, -1)));
        assert!(!g.is_valid_move(Coordinate::new(2, 2)));
    }

    #[test]
    fn teleports_are_rejected() {
        let g = grid();
        let from = Coordinate::new(1, 1);
        assert!(check_move(&g, Some(from), Coordinate::new(1, 2)).is_ok());
        assert!(check_move(&g, Some(from), from).is_ok());
        assert_eq!(
            check_move(&g, Some(from), Coordinate::new(3, 1)),
            Err(GameError::InvalidMove {
                coord: Coordinate::new(3, 1),
                reason: "teleport"
            })
        );
        assert!(check_move(&g, Some(from), Coordinate::new(2, 2)).is_err());
        assert!(check_move(&g, None, Coordinate::new(4, 0)).is_ok());
    }
}
