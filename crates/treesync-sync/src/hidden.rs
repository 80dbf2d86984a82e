//! Hidden-file attribute toggling

use std::io;
use std::path::Path;

/// Marks bookkeeping files as hidden where the platform supports it
pub trait HideFile: Send + Sync {
    /// Set the hidden attribute on `path`
    fn hide(&self, path: &Path) -> io::Result<()>;

    /// Clear the hidden attribute on `path`
    fn unhide(&self, path: &Path) -> io::Result<()>;
}

/// Does nothing; used where there is no hidden attribute
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHide;

impl HideFile for NoopHide {
    fn hide(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn unhide(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// Hidden-attribute support for the current platform
#[cfg(windows)]
pub type PlatformHide = windows_impl::WindowsHide;

/// Hidden-attribute support for the current platform
#[cfg(not(windows))]
pub type PlatformHide = NoopHide;

#[cfg(windows)]
mod windows_impl {
    use super::HideFile;
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{
        GetFileAttributesW, SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN, FILE_FLAGS_AND_ATTRIBUTES,
        INVALID_FILE_ATTRIBUTES,
    };

    /// Toggles `FILE_ATTRIBUTE_HIDDEN`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WindowsHide;

    fn update_attributes(path: &Path, update: impl FnOnce(u32) -> u32) -> io::Result<()> {
        let path_wide: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        let name = PCWSTR(path_wide.as_ptr());

        let attributes = unsafe { GetFileAttributesW(name) };
        if attributes == INVALID_FILE_ATTRIBUTES {
            return Err(io::Error::last_os_error());
        }

        unsafe { SetFileAttributesW(name, FILE_FLAGS_AND_ATTRIBUTES(update(attributes))) }
            .map_err(|e| io::Error::other(e.to_string()))
    }

    impl HideFile for WindowsHide {
        fn hide(&self, path: &Path) -> io::Result<()> {
            update_attributes(path, |attributes| attributes | FILE_ATTRIBUTE_HIDDEN.0)
        }

        fn unhide(&self, path: &Path) -> io::Result<()> {
            update_attributes(path, |attributes| attributes & !FILE_ATTRIBUTE_HIDDEN.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_platform_hide_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".autoupdate");
        std::fs::write(&path, b"{}").unwrap();

        let hider = PlatformHide::default();
        hider.hide(&path).unwrap();
        hider.unhide(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_noop_hide_accepts_missing_paths() {
        let hider: &dyn HideFile = &NoopHide;
        assert!(hider.hide(Path::new("/does/not/exist")).is_ok());
    }
}
