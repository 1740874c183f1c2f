use git_version::git_version;
use slog::{o, Drain, Level, Logger};

pub const GIT_VERSION: &str = git_version!(
    args = ["--long", "--all", "--always", "--dirty=-modified"],
    fallback = "unknown"
);

/// Builds the process-wide root logger: plain terminal output, async drain,
/// tagged with build/package version the way `haulage`'s `main.rs` does.
pub fn root_logger(verbose: bool) -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();

    let level = if verbose { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(
        drain.fuse(),
        o!("build" => GIT_VERSION, "pkg-version" => env!("CARGO_PKG_VERSION")),
    )
}
