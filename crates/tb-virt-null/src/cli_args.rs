use clap::{ArgAction, Parser};
use tb_control::{EngineConfig, COPY_TIMEOUT_ENV};

#[derive(Debug, Parser)]
#[command(
    name = "tb-virt-null",
    about = "Testbed control engine that uses the local host as the testbed",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "copy-timeout",
        value_name = "SECONDS",
        help = "Deadline for copyup/copydown and reboot archiving; 0 disables it. Defaults to $TB_VIRT_COPY_TIMEOUT or 300"
    )]
    pub(crate) copy_timeout: Option<u64>,

    #[arg(long, default_value_t = false, help = "Log debug output to stderr")]
    pub(crate) debug: bool,

    #[arg(
        long = "shared-mirror",
        default_value_t = false,
        help = "Advertise the working directory as its own host-side mirror (downtmp-host=)"
    )]
    pub(crate) shared_mirror: bool,

    #[arg(
        long = "capability",
        value_name = "CAPABILITY",
        action = ArgAction::Append,
        help = "Extra capability string to advertise, e.g. revert or reboot. Repeatable"
    )]
    pub(crate) capabilities: Vec<String>,
}

impl Cli {
    pub(crate) fn engine_config(&self) -> EngineConfig {
        match self.copy_timeout {
            Some(secs) => EngineConfig::default().with_copy_timeout_secs(secs),
            None => {
                tracing::debug!("copy timeout from ${COPY_TIMEOUT_ENV}");
                EngineConfig::from_env()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cli_collects_repeated_capabilities() {
        let cli = Cli::try_parse_from([
            "tb-virt-null",
            "--capability",
            "revert",
            "--capability",
            "isolation-machine",
            "--shared-mirror",
        ])
        .expect("parse");
        assert_eq!(cli.capabilities, ["revert", "isolation-machine"]);
        assert!(cli.shared_mirror);
        assert!(!cli.debug);
    }

    #[test]
    fn unit_explicit_copy_timeout_wins() {
        let cli = Cli::try_parse_from(["tb-virt-null", "--copy-timeout", "7"]).expect("parse");
        assert_eq!(cli.engine_config().copy_timeout_secs, 7);
    }

    #[test]
    fn regression_cli_rejects_non_numeric_timeout() {
        assert!(Cli::try_parse_from(["tb-virt-null", "--copy-timeout", "soon"]).is_err());
    }
}
