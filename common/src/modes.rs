//! Well-known game mode names.
//!
//! Unknown modes are always accepted; they fall back to the default matcher
//! weights, the standard open-set scorer and the default capacity bounds.

pub const DUEL: &str = "duel";
pub const BATTLE: &str = "battle";
pub const CLASSIC: &str = "classic";
pub const BLITZ: &str = "blitz";
pub const TEAM: &str = "team";
pub const MEGA: &str = "mega";
