use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use dlopen::raw::Library;
use vchan_manager::ffi::{VirtualChannelEntryFn, ENTRY_POINT_SYMBOL};
use vchan_manager::{ChannelManager, EntryPoint, InitHandle};

/// Channel plugin loaded from a shared library
///
/// The library must outlive every manager the plugin was registered with.
pub struct PluginLibrary {
    path: Utf8PathBuf,
    entry: VirtualChannelEntryFn,
    // Keeps the code behind `entry` mapped.
    _lib: Library,
}

impl PluginLibrary {
    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let lib = Library::open(path).with_context(|| format!("failed to load plugin library {path}"))?;

        // SAFETY: the symbol is declared by the plugin ABI with the `VirtualChannelEntryFn` signature.
        let entry = unsafe { lib.symbol::<VirtualChannelEntryFn>(ENTRY_POINT_SYMBOL) }
            .with_context(|| format!("{path} does not export {ENTRY_POINT_SYMBOL}"))?;

        debug!(%path, "Plugin library loaded");

        Ok(Self {
            path: path.to_owned(),
            entry,
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn entry_point(&self) -> EntryPoint {
        EntryPoint::Ffi(self.entry)
    }

    pub fn register(&self, manager: &ChannelManager) -> anyhow::Result<InitHandle> {
        let init_handle = manager
            .register(self.entry_point(), None)
            .with_context(|| format!("plugin {} refused to initialize", self.path))?;

        info!(path = %self.path, %init_handle, "Plugin registered");

        Ok(init_handle)
    }
}

/// Loads every library, stopping at the first failure.
pub fn load_all(paths: &[Utf8PathBuf]) -> anyhow::Result<Vec<PluginLibrary>> {
    paths.iter().map(|path| PluginLibrary::load(path)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_an_error() {
        let error = PluginLibrary::load(Utf8Path::new("/nonexistent/libplugin.so"))
            .err()
            .unwrap();

        assert!(format!("{error:#}").contains("/nonexistent/libplugin.so"));
    }

    #[test]
    fn nothing_to_load() {
        assert!(load_all(&[]).unwrap().is_empty());
    }
}
