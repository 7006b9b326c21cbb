use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::daemon::DaemonArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the governor daemon
    Daemon(Box<DaemonArgs>),
    /// Check a policy document without touching any cluster
    #[command(name = "validate-policy")]
    ValidatePolicy(ValidatePolicyArgs),
    /// Print the JSON schema of the policy document
    #[command(name = "policy-schema")]
    PolicySchema,
}

#[derive(Parser)]
pub struct ValidatePolicyArgs {
    #[arg(value_hint = clap::ValueHint::FilePath, help = "Policy document to validate")]
    pub file: PathBuf,

    #[arg(
        long,
        default_value = "1024",
        help = "Memory in MiB kept free on time-sliced devices"
    )]
    pub headroom_mib: u64,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_validate_policy() {
        let cli = Cli::parse_from(["governor", "validate-policy", "/etc/governor/policy.yaml"]);
        match cli.command {
            Commands::ValidatePolicy(args) => {
                assert_eq!(args.file, PathBuf::from("/etc/governor/policy.yaml"));
                assert_eq!(args.headroom_mib, 1024);
            }
            _ => panic!("expected validate-policy"),
        }
    }
}
