use std::io;

use anyhow::Context as _;
use camino::Utf8Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Conf;

const MAX_LOG_FILES: usize = 10;
const LOG_FILE_PREFIX: &str = "vchan-host";

pub struct LoggerGuard {
    _file_guard: WorkerGuard,
    _stdio_guard: WorkerGuard,
}

struct LogPathCfg<'a> {
    folder: &'a Utf8Path,
    prefix: &'a str,
}

impl<'a> LogPathCfg<'a> {
    fn from_path(path: &'a Utf8Path) -> anyhow::Result<Self> {
        if path.is_dir() {
            Ok(Self {
                folder: path,
                prefix: LOG_FILE_PREFIX,
            })
        } else {
            Ok(Self {
                folder: path.parent().context("invalid log path (parent)")?,
                prefix: path.file_name().context("invalid log path (file_name)")?,
            })
        }
    }
}

/// Builds the filter from the verbosity profile, extended with the debug directives.
fn build_filter(log_filter: &str, debug_filtering_directives: Option<&str>) -> anyhow::Result<EnvFilter> {
    let env_filter = EnvFilter::try_new(log_filter).context("invalid built-in filtering directives (this is a bug)")?;

    debug_filtering_directives
        .into_iter()
        .flat_map(|directives| directives.split(','))
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .try_fold(env_filter, |env_filter, directive| {
            let directive = directive
                .parse()
                .with_context(|| format!("invalid log directive: {directive}"))?;
            Ok(env_filter.add_directive(directive))
        })
}

pub fn init_log(conf: &Conf) -> anyhow::Result<LoggerGuard> {
    let log_cfg = LogPathCfg::from_path(&conf.log_file)?;

    let file_appender = rolling::Builder::new()
        .rotation(rolling::Rotation::DAILY)
        .filename_prefix(log_cfg.prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_cfg.folder)
        .context("couldn’t create file appender")?;
    let (file_non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_non_blocking).with_ansi(false);

    let (non_blocking_stdio, stdio_guard) = tracing_appender::non_blocking(io::stdout());
    let stdio_layer = fmt::layer().with_writer(non_blocking_stdio);

    let env_filter = build_filter(
        conf.verbosity_profile.to_log_filter(),
        conf.debug.log_directives.as_deref(),
    )?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdio_layer)
        .with(env_filter)
        .try_init()
        .context("failed to set global subscriber")?;

    Ok(LoggerGuard {
        _file_guard: file_guard,
        _stdio_guard: stdio_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_directives_extend_the_profile() {
        let filter = build_filter("info", Some("vchan_manager=trace, vchan_host::loopback=debug,")).unwrap();
        let rendered = filter.to_string();

        assert!(rendered.contains("vchan_manager=trace"));
        assert!(rendered.contains("vchan_host::loopback=debug"));
    }

    #[test]
    fn invalid_debug_directive_is_an_error() {
        assert!(build_filter("info", Some("vchan_manager=loud")).is_err());
    }

    #[test]
    fn log_file_names_a_prefix_unless_it_is_a_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = Utf8Path::from_path(dir.path()).unwrap();

        let cfg = LogPathCfg::from_path(folder).unwrap();
        assert_eq!(LOG_FILE_PREFIX, cfg.prefix);

        let file = folder.join("custom");
        let cfg = LogPathCfg::from_path(&file).unwrap();
        assert_eq!("custom", cfg.prefix);
        assert_eq!(folder, cfg.folder);
    }
}
