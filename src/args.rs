use duration_string::DurationString;
use gumdrop::Options;

/// Watch git branches, rebuild projects and restart their processes on new commits.
#[derive(Debug, Options)]
pub struct Args {
    /// The configuration file (default: shipwatch.toml).
    #[options(free)]
    pub config: Option<String>,

    /// Poll the remotes with this delay, overriding the configuration.
    ///
    /// Can be a number postfixed with s(econd), m(inutes), h(ours), d(ays)
    #[options(long = "every")]
    pub interval: Option<DurationString>,

    /// Runs an HTTP server on the URL, which allows to poll immediately by calling it.
    #[options(no_short)]
    pub http: Option<String>,

    /// Increase verbosity, can be set multiple times (-v debug, -vv tracing)
    #[options(count)]
    pub verbose: u8,

    /// Only print errors.
    #[options()]
    pub quiet: bool,

    /// Print the current version.
    #[options(short = "V")]
    pub version: bool,

    /// Print this help.
    #[options()]
    pub help: bool,
}

impl Args {
    pub fn config_path(&self) -> &str {
        self.config.as_deref().unwrap_or("shipwatch.toml")
    }
}

pub fn parse_args() -> Args {
    Args::parse_args_default_or_exit()
}
