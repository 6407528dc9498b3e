//! Grid arithmetic for the assembly phase.
//!
//! Pure functions only: grid sizing, segment naming, token thresholds and the
//! bonuses they unlock, and the guide highlight candidate sets.

use mosaic_shared::{
    Difficulty, GridPos, TeamTokens, TokenKind, AVAILABLE_PUZZLE_IMAGES, CHRONOS_TIME_BONUS_SECS,
    CLARITY_PREVIEW_SECS, GRID_BREAKPOINTS, GUIDE_HIGHLIGHT_COVERAGE, INDIVIDUAL_PUZZLE_PIECES,
    MAX_TOKEN_THRESHOLDS, MIN_HIGHLIGHT_CANDIDATES, TOKENS_PER_THRESHOLD,
};
use serde::Serialize;

/// Grid dimension for `count` participants.
///
/// Uses the smallest breakpoint whose range contains `count`, otherwise the
/// ceiling of the square root.
pub fn grid_size(count: usize) -> u32 {
    GRID_BREAKPOINTS
        .iter()
        .find(|(min, max, _)| (*min..=*max).contains(&count))
        .map(|(_, _, size)| *size)
        .unwrap_or_else(|| (count as f64).sqrt().ceil() as u32)
}

/// `segment_b3` names row 1, column 2.
pub fn segment_id(pos: GridPos) -> String {
    let row = (b'a' + (pos.y.clamp(0, 25) as u8)) as char;
    format!("segment_{}{}", row, pos.x + 1)
}

pub fn fragment_id(owner: &str) -> String {
    format!("fragment_{}", owner)
}

pub fn unassigned_fragment_id(slot: usize) -> String {
    format!("fragment_unassigned_{}", slot)
}

pub fn puzzle_image(index: u32) -> String {
    format!("masterpiece_{:03}", index.clamp(1, AVAILABLE_PUZZLE_IMAGES))
}

/// Whole multiples of `divisor` contained in `tokens`.
pub fn thresholds(tokens: u32, divisor: u32) -> u32 {
    if divisor == 0 {
        0
    } else {
        tokens / divisor
    }
}

/// Tokens needed per threshold under a difficulty preset. Never below one.
pub fn tokens_per_threshold(difficulty: Difficulty) -> u32 {
    let scaled = TOKENS_PER_THRESHOLD as f64 * difficulty.modifiers().token_threshold;
    (scaled.round() as u32).max(1)
}

/// Thresholds reached per token type, capped at the per-type maximum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThresholdCounts {
    pub anchor: u32,
    pub chronos: u32,
    pub guide: u32,
    pub clarity: u32,
}

impl ThresholdCounts {
    pub fn from_tokens(tokens: &TeamTokens, difficulty: Difficulty) -> Self {
        let divisor = tokens_per_threshold(difficulty);
        let reached =
            |kind: TokenKind| thresholds(tokens.get(kind), divisor).min(MAX_TOKEN_THRESHOLDS);
        Self {
            anchor: reached(TokenKind::Anchor),
            chronos: reached(TokenKind::Chronos),
            guide: reached(TokenKind::Guide),
            clarity: reached(TokenKind::Clarity),
        }
    }

    /// Fragments that start the assembly already placed and revealed.
    pub fn pre_solved_allowance(&self) -> usize {
        self.anchor.min(INDIVIDUAL_PUZZLE_PIECES - 4) as usize
    }

    pub fn time_bonus_secs(&self) -> u64 {
        self.chronos as u64 * CHRONOS_TIME_BONUS_SECS
    }

    pub fn preview_secs(&self) -> u64 {
        self.clarity as u64 * CLARITY_PREVIEW_SECS
    }

    pub fn highlight_level(&self) -> usize {
        (self.guide as usize).min(GUIDE_HIGHLIGHT_COVERAGE.len() - 1)
    }
}

/// Total assembly time: the scaled base plus the chronos bonus.
pub fn assembly_time_secs(base_secs: u64, difficulty: Difficulty, counts: &ThresholdCounts) -> u64 {
    let scaled = (base_secs as f64 * difficulty.modifiers().time_limit).round() as u64;
    scaled + counts.time_bonus_secs()
}

/// Cells highlighted around `target` at a guide precision level.
///
/// Higher levels cover fewer cells. The target is always first, the set never
/// shrinks below two cells, and cells are added ring by ring outward with
/// orthogonal neighbours before diagonal ones.
pub fn highlight_candidates(target: GridPos, grid_size: u32, level: usize) -> Vec<GridPos> {
    if !target.in_bounds(grid_size) {
        return Vec::new();
    }

    let cells = (grid_size * grid_size) as usize;
    let coverage = GUIDE_HIGHLIGHT_COVERAGE[level.min(GUIDE_HIGHLIGHT_COVERAGE.len() - 1)];
    let wanted = ((cells as f64 * coverage).floor() as usize)
        .max(MIN_HIGHLIGHT_CANDIDATES)
        .min(cells);

    let mut candidates = vec![target];
    let mut radius = 1;
    while candidates.len() < wanted && radius < grid_size as i32 {
        let mut ring: Vec<GridPos> = Vec::new();
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx.abs().max(dy.abs()) != radius {
                    continue;
                }
                let cell = GridPos::new(target.x + dx, target.y + dy);
                if cell.in_bounds(grid_size) {
                    ring.push(cell);
                }
            }
        }
        ring.sort_by_key(|cell| {
            (
                (cell.x - target.x).abs() + (cell.y - target.y).abs(),
                cell.y,
                cell.x,
            )
        });
        for cell in ring {
            if candidates.len() == wanted {
                break;
            }
            candidates.push(cell);
        }
        radius += 1;
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_size_breakpoints() {
        assert_eq!(grid_size(1), 3);
        assert_eq!(grid_size(4), 3);
        assert_eq!(grid_size(9), 3);
        assert_eq!(grid_size(10), 4);
        assert_eq!(grid_size(16), 4);
        assert_eq!(grid_size(17), 5);
        assert_eq!(grid_size(25), 5);
        assert_eq!(grid_size(26), 6);
        assert_eq!(grid_size(49), 7);
        assert_eq!(grid_size(64), 8);
    }

    #[test]
    fn test_grid_size_fallback_agrees_with_square_root() {
        assert_eq!(grid_size(65), 9);
        assert_eq!(grid_size(81), 9);
        assert_eq!(grid_size(82), 10);
        assert_eq!(grid_size(0), 0);
        // Every breakpoint is large enough to hold its players
        for count in 1..=64 {
            let size = grid_size(count) as usize;
            assert!(size * size >= count, "count {}", count);
        }
    }

    #[test]
    fn test_segment_ids() {
        assert_eq!(segment_id(GridPos::new(0, 0)), "segment_a1");
        assert_eq!(segment_id(GridPos::new(2, 1)), "segment_b3");
        assert_eq!(fragment_id("abc"), "fragment_abc");
        assert_eq!(unassigned_fragment_id(2), "fragment_unassigned_2");
        assert_eq!(puzzle_image(7), "masterpiece_007");
    }

    #[test]
    fn test_thresholds_floor_and_monotonic() {
        assert_eq!(thresholds(0, 5), 0);
        assert_eq!(thresholds(4, 5), 0);
        assert_eq!(thresholds(5, 5), 1);
        assert_eq!(thresholds(14, 5), 2);
        assert_eq!(thresholds(14, 0), 0);

        let mut previous = 0;
        for tokens in 0..200 {
            let reached = thresholds(tokens, 7);
            assert!(reached >= previous);
            assert_eq!(reached, tokens / 7);
            previous = reached;
        }
    }

    #[test]
    fn test_tokens_per_threshold_scales_with_difficulty() {
        assert_eq!(tokens_per_threshold(Difficulty::Easy), 4);
        assert_eq!(tokens_per_threshold(Difficulty::Medium), 5);
        assert_eq!(tokens_per_threshold(Difficulty::Hard), 7);
    }

    #[test]
    fn test_threshold_counts_and_bonuses() {
        let tokens = TeamTokens {
            anchor: 12,
            chronos: 100,
            guide: 5,
            clarity: 0,
        };
        let counts = ThresholdCounts::from_tokens(&tokens, Difficulty::Medium);
        assert_eq!(counts.anchor, 2);
        assert_eq!(counts.chronos, MAX_TOKEN_THRESHOLDS);
        assert_eq!(counts.guide, 1);
        assert_eq!(counts.clarity, 0);

        assert_eq!(counts.pre_solved_allowance(), 2);
        assert_eq!(counts.time_bonus_secs(), 100);
        assert_eq!(counts.preview_secs(), 0);
        assert_eq!(counts.highlight_level(), 1);
        assert_eq!(assembly_time_secs(300, Difficulty::Medium, &counts), 400);
        assert_eq!(assembly_time_secs(300, Difficulty::Hard, &counts), 310);
    }

    #[test]
    fn test_highlight_contains_target_and_shrinks() {
        let target = GridPos::new(3, 4);
        let mut previous = usize::MAX;
        for level in 0..GUIDE_HIGHLIGHT_COVERAGE.len() {
            let cells = highlight_candidates(target, 8, level);
            assert_eq!(cells[0], target);
            assert!(cells.len() <= previous);
            assert!(cells.len() >= MIN_HIGHLIGHT_CANDIDATES);
            assert!(cells.iter().all(|c| c.in_bounds(8)));
            previous = cells.len();
        }
        assert_eq!(highlight_candidates(target, 8, 0).len(), 16);
        assert_eq!(highlight_candidates(target, 8, 5).len(), 2);
    }

    #[test]
    fn test_highlight_prefers_orthogonal_neighbour() {
        let cells = highlight_candidates(GridPos::new(1, 1), 3, 5);
        assert_eq!(cells, vec![GridPos::new(1, 1), GridPos::new(1, 0)]);

        // Corner targets still get an in-bounds partner
        let corner = highlight_candidates(GridPos::new(2, 2), 3, 5);
        assert_eq!(corner.len(), 2);
        assert!(corner[1].in_bounds(3));
    }

    #[test]
    fn test_highlight_out_of_bounds_target() {
        assert!(highlight_candidates(GridPos::new(5, 0), 3, 0).is_empty());
    }
}
