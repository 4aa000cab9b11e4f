//! Hub firmware log levels
//!
//! The hub packs one 2-bit level per log tag into the 64-bit
//! [`Register::LogLogEnable`](crate::registers::Register::LogLogEnable)
//! register, tag `n` at bits `2n..2n+2`. Operators set them with strings like
//! `LOG_ACCEL=LOG_DEBUG,LOG_POWER=LOG_ERROR`.

/// Log tags, in bit-field order
pub const LOG_TAGS: [&str; 14] = [
    "LOG_GENERAL",
    "LOG_ACCEL",
    "LOG_GYRO",
    "LOG_COMPASS",
    "LOG_PRESSURE",
    "LOG_PEDOMETER",
    "LOG_METS",
    "LOG_LIGHTSENSOR",
    "LOG_FUSION",
    "LOG_POWER",
    "LOG_I2C",
    "LOG_TCMD",
    "LOG_RTC",
    "LOG_GESTURE",
];

/// Log levels, by their 2-bit value
pub const LOG_LEVELS: [&str; 4] = ["LOG_NONE", "LOG_ERROR", "LOG_INFO", "LOG_DEBUG"];

const LEVEL_MASK: u64 = 0b11;

fn is_delimiter(c: char) -> bool {
    matches!(c, '=' | ',' | '\n' | ' ')
}

/// Set `tag` to `level` in the packed word.
///
/// Unknown tags or levels leave `levels` untouched and return `false`.
pub fn update_log_level(levels: &mut u64, tag: &str, level: &str) -> bool {
    let (Some(tag), Some(level)) = (
        LOG_TAGS.iter().position(|&t| t == tag),
        LOG_LEVELS.iter().position(|&l| l == level),
    ) else {
        return false;
    };
    let shift = tag * 2;
    *levels = (*levels & !(LEVEL_MASK << shift)) | ((level as u64) << shift);
    true
}

/// Apply a `TAG=LEVEL[,TAG=LEVEL..]` string to `levels`.
///
/// Tokens are split on `=`, `,`, space and newline and consumed in tag/level
/// pairs. Unrecognized pairs are skipped; a tag with no level after it ends
/// the parse.
pub fn apply_log_levels(mut levels: u64, input: &str) -> u64 {
    let mut tokens = input.split(is_delimiter);
    while let (Some(tag), Some(level)) = (tokens.next(), tokens.next()) {
        if update_log_level(&mut levels, tag, level) {
            debug!("New M4 log levels = {:#x}", levels);
        }
    }
    levels
}

/// Level currently set for `tag`, if the tag is known
pub fn log_level(levels: u64, tag: &str) -> Option<&'static str> {
    let tag = LOG_TAGS.iter().position(|&t| t == tag)?;
    Some(LOG_LEVELS[((levels >> (tag * 2)) & LEVEL_MASK) as usize])
}
