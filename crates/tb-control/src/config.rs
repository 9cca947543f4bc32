pub const COPY_TIMEOUT_ENV: &str = "TB_VIRT_COPY_TIMEOUT";
pub const COPY_TIMEOUT_SECS_DEFAULT: u64 = 300;

/// Engine tunables shared by the dispatcher and the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Deadline for copies and other bulk in-testbed steps; zero disables it.
    pub copy_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            copy_timeout_secs: COPY_TIMEOUT_SECS_DEFAULT,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(COPY_TIMEOUT_ENV).ok().as_deref())
    }

    pub fn from_env_value(raw: Option<&str>) -> Self {
        let copy_timeout_secs = raw
            .map(str::trim)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(COPY_TIMEOUT_SECS_DEFAULT);
        Self { copy_timeout_secs }
    }

    pub fn with_copy_timeout_secs(mut self, copy_timeout_secs: u64) -> Self {
        self.copy_timeout_secs = copy_timeout_secs;
        self
    }
}
