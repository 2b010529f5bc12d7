//! Memory mappings of a tracee, from `/proc/<pid>/maps`.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::str::{self, FromStr};

use tracing::trace;

use crate::error::Result;
use crate::Pid;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,

    /// Shared (`s`) rather than private copy-on-write (`p`).
    pub shared: bool,
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set, c| if set { c } else { '-' };

        write!(
            f,
            "{}{}{}{}",
            flag(self.read, 'r'),
            flag(self.write, 'w'),
            flag(self.execute, 'x'),
            if self.shared { 's' } else { 'p' },
        )
    }
}

/// One line of `/proc/<pid>/maps`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryMap {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub permissions: Permissions,

    /// Backing file, or pseudo-path such as `[stack]`. `None` for anonymous mappings.
    pub path: Option<PathBuf>,
}

impl MemoryMap {
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(thiserror::Error, Debug, Eq, PartialEq)]
pub enum ParseMapError {
    #[error("Missing field `{0}`")]
    MissingField(&'static str),

    #[error("Bad address range `{0}`")]
    BadRange(String),

    #[error("Bad permissions `{0}`")]
    BadPermissions(String),

    #[error("Bad offset `{0}`")]
    BadOffset(String),

    #[error("Field `{0}` is not UTF-8")]
    NotUtf8(&'static str),
}

impl FromStr for Permissions {
    type Err = ParseMapError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bad = || ParseMapError::BadPermissions(s.to_owned());

        let &[r, w, x, p] = s.as_bytes() else {
            return Err(bad());
        };

        let flag = |byte, set| match byte {
            b'-' => Ok(false),
            b if b == set => Ok(true),
            _ => Err(bad()),
        };

        let shared = match p {
            b's' => true,
            b'p' => false,
            _ => return Err(bad()),
        };

        Ok(Self {
            read: flag(r, b'r')?,
            write: flag(w, b'w')?,
            execute: flag(x, b'x')?,
            shared,
        })
    }
}

impl MemoryMap {
    /// Parse one raw line. The path is kept as bytes, since file names need not be UTF-8.
    // Format: `start-end perms offset dev inode [path]`, where the path may contain spaces.
    pub fn from_bytes(line: &[u8]) -> std::result::Result<Self, ParseMapError> {
        let mut fields = line.splitn(6, |&b| b == b' ');
        let mut next = |name: &'static str| {
            let field = fields.next().filter(|f| !f.is_empty()).ok_or(ParseMapError::MissingField(name))?;
            str::from_utf8(field).map_err(|_| ParseMapError::NotUtf8(name))
        };

        let range = next("range")?;
        let perms = next("perms")?;
        let offset = next("offset")?;
        let _dev = next("dev")?;
        let _inode = next("inode")?;

        let path = fields
            .next()
            .map(|p| {
                let skip = p.iter().take_while(|&&b| b == b' ').count();
                &p[skip..]
            })
            .filter(|p| !p.is_empty())
            .map(|p| PathBuf::from(OsStr::from_bytes(p)));

        let bad_range = || ParseMapError::BadRange(range.to_owned());
        let (start, end) = range.split_once('-').ok_or_else(bad_range)?;
        let start = u64::from_str_radix(start, 16).map_err(|_| bad_range())?;
        let end = u64::from_str_radix(end, 16).map_err(|_| bad_range())?;

        if end < start {
            return Err(bad_range());
        }

        let offset = u64::from_str_radix(offset, 16).map_err(|_| ParseMapError::BadOffset(offset.to_owned()))?;

        Ok(Self {
            start,
            end,
            offset,
            permissions: perms.parse()?,
            path,
        })
    }
}

impl FromStr for MemoryMap {
    type Err = ParseMapError;

    fn from_str(line: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_bytes(line.as_bytes())
    }
}

/// Read the current mappings of `pid`. Lines that fail to parse are skipped.
pub fn read_maps(pid: Pid) -> Result<Vec<MemoryMap>> {
    let raw = fs::read(format!("/proc/{pid}/maps"))?;

    let maps = raw
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .filter_map(|line| match MemoryMap::from_bytes(line) {
            Ok(map) => Some(map),
            Err(err) => {
                trace!(%err, line = %String::from_utf8_lossy(line), "skipping unparsable mapping");
                None
            },
        })
        .collect();

    Ok(maps)
}
