//! Utility functions for identifiers, paths and disk space

use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;

/// Characters allowed in batch and file identifiers
static ID_DISALLOWED: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").ok());

/// Length of the hex digest used for derived identifiers
const HASHED_ID_LEN: usize = 16;

/// Sanitise an identifier for use in file paths and database keys
///
/// Leading/trailing whitespace is trimmed and every character outside
/// `[A-Za-z0-9._-]` becomes `_`. A lone `.` or `..` is rejected (returned empty)
/// so identifiers can never name a parent directory.
///
/// # Examples
///
/// ```
/// use batch_dl::utils::sanitize_id;
///
/// assert_eq!(sanitize_id(" season 1/ep 2 "), "season_1_ep_2");
/// assert_eq!(sanitize_id(".."), "");
/// ```
pub fn sanitize_id(raw: &str) -> String {
    let trimmed = raw.trim();
    let sanitized = match ID_DISALLOWED.as_ref() {
        Some(re) => re.replace_all(trimmed, "_").into_owned(),
        None => trimmed
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect(),
    };
    if sanitized == "." || sanitized == ".." {
        return String::new();
    }
    sanitized
}

/// Stable short identifier derived from arbitrary input
pub fn hashed_id(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(HASHED_ID_LEN);
    for byte in digest.iter() {
        if hex.len() >= HASHED_ID_LEN {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Derive a local file name from the last path segment of a url
///
/// Percent-encoding is decoded and the result sanitised. Falls back to
/// `fallback` when the url has no usable path segment.
///
/// # Examples
///
/// ```
/// use batch_dl::utils::file_name_from_url;
///
/// assert_eq!(file_name_from_url("https://example.com/a/My%20Movie.mkv", "x"), "My_Movie.mkv");
/// assert_eq!(file_name_from_url("https://example.com/", "x"), "x");
/// ```
pub fn file_name_from_url(url: &str, fallback: &str) -> String {
    if let Ok(parsed_url) = url::Url::parse(url)
        && let Some(mut segments) = parsed_url.path_segments()
        && let Some(last_segment) = segments.next_back()
        && !last_segment.is_empty()
    {
        let decoded = urlencoding::decode(last_segment)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| last_segment.to_string());
        let name = sanitize_id(&decoded);
        if !name.is_empty() {
            return name;
        }
    }
    fallback.to_string()
}

/// Free and total space of the filesystem holding a path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskSpace {
    /// Bytes available to unprivileged users
    pub available: u64,
    /// Total size of the filesystem in bytes
    pub total: u64,
}

/// Get available and total disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux/macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn get_disk_space(path: &Path) -> std::io::Result<DiskSpace> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid, null-terminated C string, stat is zero-initialised
        // and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is available blocks for unprivileged users,
            // f_frsize is the fragment size (preferred over f_bsize)
            #[allow(clippy::unnecessary_cast)]
            let frsize = stat.f_frsize as u64;
            #[allow(clippy::unnecessary_cast)]
            Ok(DiskSpace {
                available: (stat.f_bavail as u64).saturating_mul(frsize),
                total: (stat.f_blocks as u64).saturating_mul(frsize),
            })
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is a valid, null-terminated wide string and all output
        // pointers reference live, aligned u64 values read only after success.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(DiskSpace {
                available: free_bytes_available,
                total: total_bytes,
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}
