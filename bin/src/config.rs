pub mod cli {
    //! Parse from either cli or env var

    /// Default etcd endpoint
    pub static DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";
    /// Default key prefix
    pub static DEFAULT_PREFIX: &str = "/memberctl/";
    /// Default lease ttl in seconds
    pub const DEFAULT_TTL: i64 = 5;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "memberctl-worker";
    /// default log level. Can use this argument or MEMBERSHIP_LOG env var
    pub const DEFAULT_MEMBERSHIP_LOG: &str = "info";

    use std::path::PathBuf;

    use anyhow::{Context, Result};
    pub use clap::Parser;
    use clap::Subcommand;
    use membership::MembershipConfig;

    use super::trace::LogFormat;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "memberctl", bin_name = "memberctl", about, long_about = None)]
    /// parses from cli & environment var. Flags override values from the config file
    pub struct Config {
        /// path to a membership config file (yaml)
        #[clap(short, long, value_parser, env = "MEMBERSHIP_CONFIG_PATH")]
        pub config_path: Option<PathBuf>,
        /// comma separated etcd endpoints
        #[clap(long, env = "MEMBERSHIP_ENDPOINTS", value_delimiter = ',')]
        pub endpoints: Vec<String>,
        /// key prefix members register under
        #[clap(long, env = "MEMBERSHIP_PREFIX")]
        pub prefix: Option<String>,
        /// lease ttl in seconds
        #[clap(long, env = "MEMBERSHIP_TTL")]
        pub ttl: Option<i64>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of cpus
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env = "MEMBERSHIP_LOG", default_value = DEFAULT_MEMBERSHIP_LOG)]
        pub log: String,
        /// log output format
        #[clap(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Standard)]
        pub log_format: LogFormat,
        #[clap(subcommand)]
        pub command: Command,
    }

    /// memberctl subcommands
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// print the leader and every membership change under the prefix
        Watch,
        /// join the group and hold the registration until ctrl-c
        Register {
            /// member name, omit to join in queue mode
            #[clap(long, env = "MEMBERSHIP_NAME")]
            name: Option<String>,
            /// payload stored under the member key
            #[clap(long, env = "MEMBERSHIP_VALUE")]
            value: Option<String>,
        },
    }

    impl Config {
        /// Build the library config: file values first, then flags on top.
        pub fn membership(&self) -> Result<MembershipConfig> {
            let mut membership = match &self.config_path {
                Some(path) => MembershipConfig::parse(path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => MembershipConfig::new(
                    vec![DEFAULT_ENDPOINT.to_owned()],
                    DEFAULT_PREFIX,
                    DEFAULT_TTL,
                ),
            };
            if !self.endpoints.is_empty() {
                membership.endpoints = self.endpoints.clone();
            }
            if let Some(prefix) = &self.prefix {
                membership.prefix = prefix.clone();
            }
            if let Some(ttl) = self.ttl {
                membership.ttl_secs = ttl;
            }
            if let Command::Register { name, value } = &self.command {
                if let Some(name) = name {
                    membership.name = Some(name.clone());
                }
                if let Some(value) = value {
                    membership.value = value.clone();
                }
            }
            membership
                .validate()
                .context("invalid membership configuration")?;
            Ok(membership)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use clap::ValueEnum;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// log as "json", "pretty" or "standard" (unstructured)
    #[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LogFormat {
        /// single line text
        Standard,
        /// one json object per event
        Json,
        /// multi line, human readable
        Pretty,
    }

    /// Configuration for the global subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// Install the global subscriber
        pub fn parse(log: &str, log_frmt: LogFormat) -> Result<Self> {
            // Log level comes from MEMBERSHIP_LOG
            let filter = EnvFilter::try_new(log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("h2=off".parse()?)
                .add_directive("tower=off".parse()?);

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
