use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use tap::prelude::*;
use vchan_manager::{JoinedChannel, ManagerConfig, RemoteChannelId};

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const COMPANY_DIR: &str = "Devolutions";
        const PROGRAM_DIR: &str = "VchanHost";
        const APPLICATION_DIR: &str = "Devolutions\\VchanHost";
    } else if #[cfg(target_os = "macos")] {
        const COMPANY_DIR: &str = "Devolutions";
        const PROGRAM_DIR: &str = "VchanHost";
        const APPLICATION_DIR: &str = "Devolutions VchanHost";
    } else {
        const COMPANY_DIR: &str = "devolutions";
        const PROGRAM_DIR: &str = "vchan-host";
        const APPLICATION_DIR: &str = "vchan-host";
    }
}

const CONF_FILE_NAME: &str = "vchan-host.json";

#[derive(Debug, Clone)]
pub struct Conf {
    pub log_file: Utf8PathBuf,
    pub verbosity_profile: dto::VerbosityProfile,
    /// Shared libraries exporting `VirtualChannelEntryEx`, in registration order
    pub plugins: Vec<Utf8PathBuf>,
    pub manager: ManagerConfig,
    /// Static channels the loopback transport joins at post-connect
    pub static_channels: Vec<JoinedChannel>,
    pub debug: dto::DebugConf,
}

impl Conf {
    pub fn from_conf_file(conf_file: &dto::ConfFile, data_dir: &Utf8Path) -> anyhow::Result<Self> {
        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("vchan-host"))
            .pipe_ref(|path| normalize_data_path(path, data_dir));

        let plugins = conf_file
            .plugins
            .iter()
            .flatten()
            .map(|path| normalize_data_path(path, data_dir))
            .collect();

        let mut names = HashSet::new();
        let mut ids = HashSet::new();

        let static_channels = conf_file
            .static_channels
            .iter()
            .flatten()
            .map(|channel| {
                anyhow::ensure!(
                    vchan_proto::svc::is_valid_static_name(&channel.name),
                    "invalid static channel name: {:?}",
                    channel.name
                );
                anyhow::ensure!(
                    names.insert(channel.name.to_ascii_lowercase()),
                    "static channel {} is listed twice",
                    channel.name
                );
                anyhow::ensure!(ids.insert(channel.id), "channel id {} is assigned twice", channel.id);

                Ok(JoinedChannel::new(channel.name.as_str(), RemoteChannelId::new(channel.id)))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Conf {
            log_file,
            verbosity_profile: conf_file.verbosity_profile.unwrap_or_default(),
            plugins,
            manager: conf_file.manager.clone().unwrap_or_default(),
            static_channels,
            debug: conf_file.debug.clone().unwrap_or_default(),
        })
    }
}

/// Configuration Handle, source of truth for current configuration state
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        Self::init_in(&get_data_dir())
    }

    /// Same as [`ConfHandle::init`], using `data_dir` instead of the default data directory.
    pub fn init_in(data_dir: &Utf8Path) -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new(data_dir)?;
        let conf = Conf::from_conf_file(&conf_file, data_dir).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
            }),
        })
    }

    /// Returns current configuration state (do not hold it forever as it may become outdated)
    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner.conf.read())
    }

    /// Returns current configuration file state (do not hold it forever as it may become outdated)
    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        Arc::clone(&self.inner.conf_file.read())
    }
}

fn save_config(conf: &dto::ConfFile, conf_file_path: &Utf8Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(conf).context("failed JSON serialization of configuration")?;
    std::fs::write(conf_file_path, json).with_context(|| format!("failed to write file at {conf_file_path}"))?;
    Ok(())
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

fn load_conf_file(conf_path: &Utf8Path) -> anyhow::Result<Option<dto::ConfFile>> {
    match File::open(conf_path) {
        Ok(file) => BufReader::new(file)
            .pipe(serde_json::from_reader)
            .map(Some)
            .with_context(|| format!("invalid config file at {conf_path}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(e).context(format!("couldn't open config file at {conf_path}"))),
    }
}

#[allow(clippy::print_stdout)] // Logger is likely not yet initialized at this point, so it’s fine to write to stdout.
fn load_conf_file_or_generate_new(data_dir: &Utf8Path) -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = data_dir.join(CONF_FILE_NAME);

    let conf_file = match load_conf_file(&conf_file_path).context("failed to load configuration")? {
        Some(conf_file) => conf_file,
        None => {
            let defaults = dto::ConfFile::generate_new();
            println!("Write default configuration to {conf_file_path}…");
            save_config(&defaults, &conf_file_path).context("failed to save configuration")?;
            defaults
        }
    };

    Ok(conf_file)
}

pub mod dto {
    use super::*;

    /// Source of truth for host configuration
    ///
    /// This struct represents the JSON file used for configuration as close as possible
    /// and is not trying to be too smart.
    ///
    /// Unstable options are subject to change
    #[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct ConfFile {
        /// Verbosity profile
        #[serde(skip_serializing_if = "Option::is_none")]
        pub verbosity_profile: Option<VerbosityProfile>,

        /// (Unstable) Folder and prefix for log files
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,

        /// Channel plugins to load, relative paths are resolved against the data directory
        #[serde(skip_serializing_if = "Option::is_none")]
        pub plugins: Option<Vec<Utf8PathBuf>>,

        /// Channel manager limits
        #[serde(skip_serializing_if = "Option::is_none")]
        pub manager: Option<ManagerConfig>,

        /// Static channels joined by the loopback transport
        #[serde(skip_serializing_if = "Option::is_none")]
        pub static_channels: Option<Vec<StaticChannelConf>>,

        /// (Unstable) Unsafe debug options for developers
        #[serde(rename = "__debug__", skip_serializing_if = "Option::is_none")]
        pub debug: Option<DebugConf>,

        /// Other unofficial options.
        /// This field is useful so that we can deserialize
        /// and then losslessly serialize back all root keys of the config file.
        #[serde(flatten)]
        pub rest: serde_json::Map<String, serde_json::Value>,
    }

    impl ConfFile {
        pub fn generate_new() -> Self {
            Self {
                verbosity_profile: None,
                log_file: None,
                plugins: None,
                manager: None,
                static_channels: None,
                debug: None,
                rest: serde_json::Map::new(),
            }
        }
    }

    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct StaticChannelConf {
        pub name: String,
        pub id: u16,
    }

    /// Verbosity profile (pre-defined tracing directives)
    #[derive(PartialEq, Eq, Debug, Clone, Copy, Serialize, Deserialize, Default)]
    pub enum VerbosityProfile {
        /// The default profile, mostly info records
        #[default]
        Default,
        /// Recommended profile for developers
        Debug,
        /// Show all traces
        All,
        /// Only show warnings and errors
        Quiet,
    }

    impl VerbosityProfile {
        pub fn to_log_filter(self) -> &'static str {
            match self {
                VerbosityProfile::Default => "info",
                VerbosityProfile::Debug => "info,vchan_host=debug,vchan_manager=debug",
                VerbosityProfile::All => "trace",
                VerbosityProfile::Quiet => "warn",
            }
        }
    }

    /// Unsafe debug options that should only ever be used at development stage
    ///
    /// These options might change or get removed without further notice.
    #[derive(PartialEq, Eq, Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct DebugConf {
        /// Directives string in the same form as the RUST_LOG environment variable
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_directives: Option<String>,
    }

    /// Manual Default trait implementation just to make sure default values are deliberates
    #[allow(clippy::derivable_impls)]
    impl Default for DebugConf {
        fn default() -> Self {
            Self { log_directives: None }
        }
    }
}

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(config_path_env) = std::env::var("VCHAN_HOST_DATA_PATH") {
        Utf8PathBuf::from(config_path_env)
    } else {
        let mut config_path = Utf8PathBuf::new();

        if cfg!(target_os = "windows") {
            let program_data_env = std::env::var("APPDATA").expect("APPDATA env variable should be set on Windows");
            config_path.push(program_data_env);
            config_path.push(COMPANY_DIR);
            config_path.push(PROGRAM_DIR);
        } else if cfg!(target_os = "macos") {
            config_path.push("/Library/Application Support");
            config_path.push(APPLICATION_DIR);
        } else {
            config_path.push("/etc");
            config_path.push(APPLICATION_DIR);
        }

        config_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_file_is_generated_with_defaults() {
        let (_dir, path) = data_dir();

        let handle = ConfHandle::init_in(&path).unwrap();

        assert!(path.join(CONF_FILE_NAME).exists());
        assert_eq!(dto::ConfFile::generate_new(), *handle.get_conf_file());

        let conf = handle.get_conf();
        assert_eq!(path.join("vchan-host"), conf.log_file);
        assert_eq!(ManagerConfig::default(), conf.manager);
        assert!(conf.plugins.is_empty());
        assert!(conf.static_channels.is_empty());
    }

    #[test]
    fn full_file_is_parsed() {
        let (_dir, path) = data_dir();
        std::fs::write(
            path.join(CONF_FILE_NAME),
            r#"{
                "VerbosityProfile": "Debug",
                "Plugins": ["libcliprdr.so", "/opt/plugins/librdpsnd.so"],
                "Manager": { "MaxOpenChannels": 8, "DynamicChannels": false },
                "StaticChannels": [{ "Name": "cliprdr", "Id": 1004 }],
                "__debug__": { "LogDirectives": "vchan_manager::dvc=trace" },
                "SomethingElse": 42
            }"#,
        )
        .unwrap();

        let handle = ConfHandle::init_in(&path).unwrap();
        let conf = handle.get_conf();

        assert_eq!(dto::VerbosityProfile::Debug, conf.verbosity_profile);
        assert_eq!(
            vec![path.join("libcliprdr.so"), Utf8PathBuf::from("/opt/plugins/librdpsnd.so")],
            conf.plugins
        );
        assert_eq!(8, conf.manager.max_open_channels);
        assert!(!conf.manager.dynamic_channels);
        assert_eq!(
            vec![JoinedChannel::new("cliprdr", RemoteChannelId::new(1004))],
            conf.static_channels
        );
        assert_eq!(Some("vchan_manager::dvc=trace"), conf.debug.log_directives.as_deref());
        assert!(handle.get_conf_file().rest.contains_key("SomethingElse"));
    }

    #[test]
    fn duplicate_static_channels_are_rejected() {
        let mut conf_file = dto::ConfFile::generate_new();
        conf_file.static_channels = Some(vec![
            dto::StaticChannelConf {
                name: "cliprdr".to_owned(),
                id: 1004,
            },
            dto::StaticChannelConf {
                name: "CLIPRDR".to_owned(),
                id: 1005,
            },
        ]);

        assert!(Conf::from_conf_file(&conf_file, Utf8Path::new("/data")).is_err());
    }

    #[test]
    fn overlong_static_channel_name_is_rejected() {
        let mut conf_file = dto::ConfFile::generate_new();
        conf_file.static_channels = Some(vec![dto::StaticChannelConf {
            name: "overlong".to_owned(),
            id: 1004,
        }]);

        assert!(Conf::from_conf_file(&conf_file, Utf8Path::new("/data")).is_err());
    }
}
