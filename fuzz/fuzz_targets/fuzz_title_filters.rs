#![no_main]

use libfuzzer_sys::fuzz_target;
use medley::search::{
    has_episode_marker, has_season_range_marker, normalize_title, title_matches_series,
};

fuzz_target!(|data: (&str, &str)| {
    let (query, title) = data;

    let normalized = normalize_title(title);
    assert_eq!(
        normalize_title(&normalized),
        normalized,
        "normalization must be idempotent"
    );

    // The matchers must accept any input without panicking.
    let _ = title_matches_series(query, title);
    let _ = has_episode_marker(title);
    let _ = has_season_range_marker(title);
});
