use tracing::Level;

/// Install a global `fmt` subscriber at the given level.
///
/// Returns `false` when another global subscriber is already installed, so
/// callers (and tests) can invoke this more than once.
pub fn init_logging(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Parse a level name such as `"debug"`; unknown names fall back to `INFO`
pub fn parse_level(name: &str) -> Level {
    name.parse::<Level>().unwrap_or(Level::INFO)
}
