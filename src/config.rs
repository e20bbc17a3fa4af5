use clap::Args;

use crate::state::Timestamp;

/// Static profiler settings, fixed for the lifetime of a session.
#[derive(Args, Debug, Clone)]
pub struct ProfilerConfig {
    #[arg(
        long = "serializer",
        default_value = "binary",
        help = "profiling log format: \"binary\" or \"ascii\""
    )]
    pub serializer: String,

    #[arg(
        long = "prof-logfile",
        help = "profiling log filename; '%' is replaced with the node number"
    )]
    pub logfile: Option<String>,

    #[arg(
        long = "prof-footprint",
        default_value_t = 128 << 20,
        help = "buffered profiling bytes before records are flushed early (0 flushes continuously)"
    )]
    pub footprint_threshold: usize,

    #[arg(
        long = "prof-latency",
        default_value_t = 100,
        help = "target time in microseconds spent flushing per over-budget record"
    )]
    pub target_latency: u64,

    #[arg(
        long = "prof-call-threshold",
        default_value_t = 0,
        help = "minimum duration in microseconds for mapper and runtime calls to be recorded"
    )]
    pub call_threshold: u64,

    #[arg(long = "prof-self", help = "also profile the profiler's own meta-tasks")]
    pub self_profile: bool,

    #[arg(
        long = "prof-no-critical",
        help = "skip event graph records used for critical path analysis"
    )]
    pub no_critical_paths: bool,

    #[arg(
        long = "prof-all-critical-arrivals",
        help = "record every barrier arrival, not just the ones on the critical path"
    )]
    pub all_critical_arrivals: bool,
}

impl ProfilerConfig {
    pub fn minimum_call_threshold(&self) -> Timestamp {
        Timestamp::from_us(self.call_threshold)
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            serializer: "binary".to_owned(),
            logfile: None,
            footprint_threshold: 128 << 20,
            target_latency: 100,
            call_threshold: 0,
            self_profile: false,
            no_critical_paths: false,
            all_critical_arrivals: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        profiler: ProfilerConfig,
    }

    #[test]
    fn test_defaults_match() {
        let cli = Cli::parse_from(["test"]);
        let default = ProfilerConfig::default();
        assert_eq!(cli.profiler.serializer, default.serializer);
        assert_eq!(cli.profiler.footprint_threshold, default.footprint_threshold);
        assert_eq!(cli.profiler.target_latency, default.target_latency);
        assert!(!cli.profiler.self_profile);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::parse_from([
            "test",
            "--serializer",
            "ascii",
            "--prof-logfile",
            "prof_%.gz",
            "--prof-footprint",
            "1000",
            "--prof-call-threshold",
            "5",
            "--prof-no-critical",
        ]);
        assert_eq!(cli.profiler.serializer, "ascii");
        assert_eq!(cli.profiler.logfile.as_deref(), Some("prof_%.gz"));
        assert_eq!(cli.profiler.footprint_threshold, 1000);
        assert_eq!(cli.profiler.minimum_call_threshold(), Timestamp(5000));
        assert!(cli.profiler.no_critical_paths);
    }

    #[test]
    fn test_huge_call_threshold() {
        let config = ProfilerConfig {
            call_threshold: u64::MAX / 10,
            ..Default::default()
        };
        assert_eq!(config.minimum_call_threshold(), Timestamp(u64::MAX));

        let max = u64::MAX.to_string();
        let cli = Cli::parse_from(["test", "--prof-call-threshold", max.as_str()]);
        assert_eq!(cli.profiler.minimum_call_threshold(), Timestamp(u64::MAX));
    }
}
