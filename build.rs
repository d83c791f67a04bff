const BOARD_PREFIX: &str = "CARGO_FEATURE_TARGET_BOARD_";

fn main() {
    // The library compiles every BSP, so only the firmware image cares which
    // board was picked.
    if std::env::var_os("CARGO_FEATURE_FIRMWARE").is_none() {
        return;
    }

    let mut boards: Vec<String> = std::env::vars()
        .filter_map(|(name, _)| name.strip_prefix(BOARD_PREFIX).map(board_feature))
        .collect();
    boards.sort();

    match boards.as_slice() {
        [_] => {}
        [] => panic!(
            "the firmware feature needs a board: enable one of target-board-smdk5250, \
             target-board-seaboard or target-board-coreboot"
        ),
        [first, second, ..] => panic!(
            "a firmware image is built for one board, but both {} and {} are enabled",
            first, second
        ),
    }
}

/// Turns the tail of a feature's environment variable back into the
/// feature name.
fn board_feature(suffix: &str) -> String {
    format!("target-board-{}", suffix.to_ascii_lowercase().replace('_', "-"))
}
