use confique::Config;

/// Bring-up settings for one recorder instance.
///
/// Integrators can construct this directly or layer it from config files
/// with `confique`:
///
/// ```ignore
/// let cfg = CoreConfig::builder()
///     .env()
///     .file("recorder.toml")
///     .load()?;
/// ```
#[derive(Config, Debug, Clone)]
pub struct CoreConfig {
    /// Instance name; used for the acquisition thread name and as the
    /// initial value of the DIGITIZER_NAME parameter.
    pub name: String,

    /// Whether each channel initially retains its most recent burst for
    /// pull-style consumers.
    #[config(default = true)]
    pub keep_last_bursts: bool,

    /// Initial value of SLEEP_AFTER_BURST in seconds. Normally 0; positive
    /// values slow the read loop down for overflow testing.
    #[config(default = 0.0)]
    pub sleep_after_burst: f64,
}

impl CoreConfig {
    /// Convenience constructor with default policies.
    pub fn new(name: &str) -> Self {
        CoreConfig {
            name: name.to_string(),
            keep_last_bursts: true,
            sleep_after_burst: 0.0,
        }
    }
}
