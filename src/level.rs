//! Level rule: one level per 1000 XP, starting at level 1.

/// XP needed to advance one level
pub const XP_PER_LEVEL: u64 = 1000;

/// Highest storable level. Reached at `(u32::MAX - 1) * XP_PER_LEVEL` XP
/// (about 4.29e12); larger totals keep this level.
pub const MAX_LEVEL: u32 = u32::MAX;

/// Level for a given XP total: `max(1, floor(xp / 1000) + 1)`, capped at `MAX_LEVEL`
pub fn level_for_xp(xp: u64) -> u32 {
    let level = xp / XP_PER_LEVEL + 1;
    u32::try_from(level).unwrap_or(MAX_LEVEL).max(1)
}

/// XP earned inside the current level
pub fn xp_into_level(xp: u64) -> u64 {
    xp % XP_PER_LEVEL
}

/// XP still missing before the next level
pub fn xp_to_next_level(xp: u64) -> u64 {
    XP_PER_LEVEL - xp_into_level(xp)
}
