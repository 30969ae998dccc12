//! control plane configs
pub mod cli {
    //! Parse from either cli or env var

    /// Default path to the store database
    pub static DEFAULT_STORE_URL: &str = "/var/lib/ofcir/ofcir.db";
    /// Default namespace the control plane operates in
    pub static DEFAULT_NAMESPACE: &str = "ofcir-system";
    /// Default port for the lease API
    pub const DEFAULT_API_PORT: u16 = 8087;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "ofcir-worker";
    /// default log level. Can use this argument or OFCIR_LOG env var
    pub const DEFAULT_OFCIR_LOG: &str = "info";
    /// default resync period (seconds): how often every key is
    /// re-delivered even without watch events
    pub const DEFAULT_RESYNC: u64 = 60;

    use std::time::Duration;

    pub use clap::{Args, Parser};

    /// Flags shared by both binaries. Each binary flattens this into its
    /// own `Parser` struct.
    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct Config {
        /// Path to the store database, use "sqlite::memory:" for in mem db
        #[clap(short, long, value_parser, env, default_value = DEFAULT_STORE_URL)]
        pub store: String,
        /// Namespace holding the pools and resources
        #[clap(long, env, value_parser, default_value = DEFAULT_NAMESPACE)]
        pub namespace: String,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// Number of tokio worker threads, default is num logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_OFCIR_LOG)]
        pub ofcir_log: String,
        /// Resync period in seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RESYNC)]
        pub resync: u64,
    }

    impl Config {
        /// `resync` as a `Duration`
        pub fn resync(&self) -> Duration {
            Duration::from_secs(self.resync)
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use std::str;

    use crate::env::parse_var_with_err;

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for the tracing subscriber
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Make new trace config and install the global subscriber
        pub fn parse(ofcir_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            // Log level comes from OFCIR_LOG
            let filter = EnvFilter::try_new(ofcir_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("sqlx=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
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
                _ => {
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
