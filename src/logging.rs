use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;
use once_cell::sync::OnceCell;

static RUST_LOG_ONCE: Once = Once::new();
static ACTIVE_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

/// Where the logger's filter comes from, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LevelSource {
    /// Explicit level or `ADC_STREAM_LOG`; `RUST_LOG` is not consulted.
    Fixed(LevelFilter),
    /// Plain `RUST_LOG` directives, parsed by `env_logger`.
    RustLog,
    Default,
}

fn resolve_level(
    explicit: Option<&str>,
    adc_stream_log: Option<&str>,
    rust_log: Option<&str>,
) -> LevelSource {
    if let Some(level) = explicit.and_then(parse_level) {
        return LevelSource::Fixed(level);
    }
    if let Some(level) = adc_stream_log.and_then(parse_level) {
        return LevelSource::Fixed(level);
    }
    match rust_log {
        Some(v) if !v.trim().is_empty() => LevelSource::RustLog,
        _ => LevelSource::Default,
    }
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Initialize stderr logging based on `ADC_STREAM_LOG`/`RUST_LOG`.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init_logging() {
    init_logging_with(None);
}

/// Like [`init_logging`], but an explicit level (e.g. from a CLI flag) wins
/// over the environment.
pub fn init_logging_with(level: Option<&str>) {
    RUST_LOG_ONCE.call_once(|| {
        let adc_stream_log = std::env::var("ADC_STREAM_LOG").ok();
        let rust_log = std::env::var("RUST_LOG").ok();
        let source = resolve_level(level, adc_stream_log.as_deref(), rust_log.as_deref());

        let mut builder = match source {
            LevelSource::Fixed(level) => {
                let mut b = env_logger::Builder::new();
                b.filter_level(level);
                b
            }
            LevelSource::RustLog => env_logger::Builder::from_env(Env::default()),
            LevelSource::Default => {
                let mut b = env_logger::Builder::new();
                b.filter_level(LevelFilter::Info);
                b
            }
        };
        let installed = builder
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .try_init()
            .is_ok();
        if installed {
            let _ = ACTIVE_LEVEL.set(log::max_level());
        }
    });
}

/// Level the logger was installed with, or `None` before initialization.
pub fn active_level() -> Option<LevelFilter> {
    ACTIVE_LEVEL.get().copied()
}
